//! Register map loading and lookup.
//!
//! A register map is a JSON document describing every Modbus register of one
//! device type. Registers are grouped into sections (`parameter_registers`,
//! `metering_registers`, `status_registers`, `control_registers`, ...) purely
//! for readability; lookup is by flat register name across all sections.
//!
//! Bitmask registers carry free-text bit descriptions. Descriptions of the
//! form `"... [0: Normal / 1: Fault]"` are parsed into structured
//! alternatives at load time so the data processor never re-parses them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Modbus function codes recognised by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// 0x03 - Read Holding Registers
    ReadHolding,
    /// 0x04 - Read Input Registers
    ReadInput,
    /// 0x06 - Write Single Register
    WriteSingle,
}

impl FunctionCode {
    /// Returns the numeric Modbus function code.
    pub fn as_u8(&self) -> u8 {
        match self {
            FunctionCode::ReadHolding => 0x03,
            FunctionCode::ReadInput => 0x04,
            FunctionCode::WriteSingle => 0x06,
        }
    }

    /// Returns true if the register is swept during a poll.
    pub fn is_readable(&self) -> bool {
        matches!(self, FunctionCode::ReadHolding | FunctionCode::ReadInput)
    }

    /// Returns true if the register accepts single-register writes.
    pub fn is_writable(&self) -> bool {
        matches!(self, FunctionCode::WriteSingle)
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(FunctionCode::ReadHolding),
            0x04 => Some(FunctionCode::ReadInput),
            0x06 => Some(FunctionCode::WriteSingle),
            _ => None,
        }
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.as_u8())
    }
}

/// Register value encoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit value in one register.
    #[default]
    Uint16,
    /// Signed 16-bit value in one register (two's complement).
    Int16,
    /// Unsigned 32-bit value spanning two registers, high word first.
    Uint32,
    /// Signed 32-bit value spanning two registers, high word first.
    Int32,
}

impl DataType {
    /// Combines the raw register words into a signed engineering integer.
    ///
    /// Two-register values combine as `high << 16 | low`; signed types apply
    /// two's-complement conversion.
    pub fn decode(&self, words: &[u16]) -> i64 {
        match self {
            DataType::Uint16 => i64::from(words[0]),
            DataType::Int16 => i64::from(words[0] as i16),
            DataType::Uint32 | DataType::Int32 => {
                let combined = if words.len() >= 2 {
                    (u32::from(words[0]) << 16) | u32::from(words[1])
                } else {
                    u32::from(words[0])
                };
                match self {
                    DataType::Int32 => i64::from(combined as i32),
                    _ => i64::from(combined),
                }
            }
        }
    }
}

/// Whether a register holds a scaled value or a bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterKind {
    /// Scalar value; `scale` and `unit` apply.
    #[default]
    Value,
    /// Bit field; `bits` describes the individual flags.
    Bitmask,
}

/// Structured alternatives parsed from a `"[0: Normal / 1: Fault]"` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitAlternatives {
    /// Interpretation when the bit is clear.
    pub clear: String,
    /// Interpretation when the bit is set.
    pub set: String,
}

/// One bit of a bitmask register.
#[derive(Debug, Clone)]
pub struct BitSpec {
    /// Human description of the flag, as written in the map file.
    pub description: String,
    /// Parsed alternatives, when the description embeds them.
    pub alternatives: Option<BitAlternatives>,
}

/// Static metadata for one Modbus register.
#[derive(Debug, Clone)]
pub struct RegisterSpec {
    /// Register address.
    pub address: u16,
    /// Number of consecutive registers (1 or 2).
    pub register_count: u16,
    /// Modbus function code used to access the register.
    pub function_code: FunctionCode,
    /// On-wire encoding.
    pub data_type: DataType,
    /// Multiplier applied to the raw value to obtain engineering units.
    pub scale: f64,
    /// Engineering unit, e.g. `"%"` or `"V"`.
    pub unit: String,
    /// Value or bitmask.
    pub kind: RegisterKind,
    /// Human description of the register.
    pub description: String,
    /// Bit decoders, populated for bitmask registers.
    pub bits: BTreeMap<u8, BitSpec>,
    /// The section the register was defined in.
    pub section: String,
}

/// On-disk register entry. `function_code` accepts the `"0x03"` string
/// spelling used by the map files as well as a bare integer.
#[derive(Debug, Deserialize)]
struct RawRegisterSpec {
    address: u16,
    #[serde(default = "default_register_count", alias = "registers")]
    register_count: u16,
    function_code: RawFunctionCode,
    #[serde(default)]
    data_type: DataType,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default)]
    unit: String,
    #[serde(default, rename = "type")]
    register_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    bit_definitions: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFunctionCode {
    Text(String),
    Number(u8),
}

fn default_register_count() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

/// Parses a `"[0: Normal / 1: Fault]"` pattern out of a bit description.
///
/// Returns `None` when the description carries no bracketed alternatives, in
/// which case decoding falls back to `active`/`inactive`.
pub fn parse_bit_alternatives(description: &str) -> Option<BitAlternatives> {
    let start = description.find('[')?;
    let end = description.find(']')?;
    if end <= start {
        return None;
    }
    let inner = &description[start + 1..end];
    let mut parts = inner.splitn(2, '/');
    let clear_part = parts.next()?.trim();
    let set_part = parts.next()?.trim();

    let strip_index = |part: &str| -> String {
        match part.split_once(':') {
            Some((_, text)) => text.trim().to_string(),
            None => part.to_string(),
        }
    };

    Some(BitAlternatives {
        clear: strip_index(clear_part),
        set: strip_index(set_part),
    })
}

/// A read-only register map for one device type, indexed by register name.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    registers: BTreeMap<String, RegisterSpec>,
}

impl RegisterMap {
    /// Loads a register map from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::RegisterMap(format!("cannot read map file {}: {e}", path.display()))
        })?;
        let document: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
            Error::RegisterMap(format!("cannot parse map file {}: {e}", path.display()))
        })?;
        Self::from_json(&document)
    }

    /// Builds a register map from an already-parsed JSON document.
    ///
    /// The top level is a mapping of section name to a mapping of register
    /// name to register entry. Non-object top-level entries (file metadata,
    /// comments) are skipped.
    pub fn from_json(document: &serde_json::Value) -> Result<Self> {
        let sections = document
            .as_object()
            .ok_or_else(|| Error::RegisterMap("map document is not an object".into()))?;

        let mut registers = BTreeMap::new();
        for (section, entries) in sections {
            let Some(entries) = entries.as_object() else {
                continue;
            };
            for (name, entry) in entries {
                if !entry.is_object() {
                    continue;
                }
                let raw: RawRegisterSpec =
                    serde_json::from_value(entry.clone()).map_err(|e| {
                        Error::RegisterMap(format!("register '{name}' in '{section}': {e}"))
                    })?;
                let spec = Self::convert(name, section, raw)?;
                registers.insert(name.clone(), spec);
            }
        }

        Ok(Self { registers })
    }

    fn convert(name: &str, section: &str, raw: RawRegisterSpec) -> Result<RegisterSpec> {
        let code = match &raw.function_code {
            RawFunctionCode::Number(n) => FunctionCode::from_u8(*n),
            RawFunctionCode::Text(text) => {
                let trimmed = text.trim();
                let digits = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                    .unwrap_or(trimmed);
                u8::from_str_radix(digits, 16)
                    .ok()
                    .and_then(FunctionCode::from_u8)
            }
        };
        let function_code = code.ok_or_else(|| {
            Error::RegisterMap(format!("register '{name}': unsupported function code"))
        })?;

        let kind = match raw.register_type.as_deref() {
            Some("bitmask") => RegisterKind::Bitmask,
            _ => RegisterKind::Value,
        };

        // Bitmasks are read-only by contract.
        if function_code.is_writable() && kind == RegisterKind::Bitmask {
            return Err(Error::RegisterMap(format!(
                "register '{name}': writable registers cannot be bitmasks"
            )));
        }

        let mut bits = BTreeMap::new();
        for (index, description) in &raw.bit_definitions {
            let bit: u8 = index.parse().map_err(|_| {
                Error::RegisterMap(format!("register '{name}': invalid bit index '{index}'"))
            })?;
            bits.insert(
                bit,
                BitSpec {
                    alternatives: parse_bit_alternatives(description),
                    description: description.clone(),
                },
            );
        }

        Ok(RegisterSpec {
            address: raw.address,
            register_count: raw.register_count.clamp(1, 2),
            function_code,
            data_type: raw.data_type,
            scale: raw.scale,
            unit: raw.unit,
            kind,
            description: raw.description.unwrap_or_else(|| name.to_string()),
            bits,
            section: section.to_string(),
        })
    }

    /// Looks up a register by name.
    pub fn lookup(&self, name: &str) -> Option<&RegisterSpec> {
        self.registers.get(name)
    }

    /// Resolves an address back to a register name.
    ///
    /// Control registers take precedence when several sections define the
    /// same address.
    pub fn find_by_address(&self, address: u16) -> Option<&str> {
        self.registers
            .iter()
            .filter(|(_, spec)| spec.address == address)
            .max_by_key(|(_, spec)| spec.section == "control_registers")
            .map(|(name, _)| name.as_str())
    }

    /// Iterates over all registers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisterSpec)> {
        self.registers.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Number of registers in the map.
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// Returns true if the map holds no registers.
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_map() -> RegisterMap {
        RegisterMap::from_json(&json!({
            "metering_registers": {
                "battery_soc": {
                    "address": 256,
                    "function_code": "0x03",
                    "data_type": "uint16",
                    "scale": 0.1,
                    "unit": "%",
                    "description": "Battery state of charge"
                },
                "rack_current": {
                    "address": 258,
                    "function_code": "0x04",
                    "data_type": "int16",
                    "scale": 0.1,
                    "unit": "A"
                }
            },
            "status_registers": {
                "error_code_2": {
                    "address": 300,
                    "function_code": "0x03",
                    "type": "bitmask",
                    "description": "Error Code 2",
                    "bit_definitions": {
                        "3": "Communication [0: Normal / 1: Fault]",
                        "7": "Reserved"
                    }
                }
            },
            "control_registers": {
                "error_reset": {
                    "address": 400,
                    "function_code": "0x06",
                    "description": "Error reset"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_lookup_by_name() {
        let map = sample_map();
        let spec = map.lookup("battery_soc").unwrap();
        assert_eq!(spec.address, 256);
        assert_eq!(spec.function_code, FunctionCode::ReadHolding);
        assert_eq!(spec.scale, 0.1);
        assert_eq!(spec.unit, "%");
        assert!(map.lookup("missing").is_none());
    }

    #[test]
    fn test_find_by_address() {
        let map = sample_map();
        assert_eq!(map.find_by_address(400), Some("error_reset"));
        assert_eq!(map.find_by_address(258), Some("rack_current"));
        assert_eq!(map.find_by_address(999), None);
    }

    #[test]
    fn test_function_code_spellings() {
        let map = RegisterMap::from_json(&json!({
            "s": {
                "a": { "address": 1, "function_code": 4 },
                "b": { "address": 2, "function_code": "0x06" }
            }
        }))
        .unwrap();
        assert_eq!(map.lookup("a").unwrap().function_code, FunctionCode::ReadInput);
        assert_eq!(map.lookup("b").unwrap().function_code, FunctionCode::WriteSingle);
    }

    #[test]
    fn test_writable_bitmask_rejected() {
        let result = RegisterMap::from_json(&json!({
            "control_registers": {
                "bad": {
                    "address": 1,
                    "function_code": "0x06",
                    "type": "bitmask",
                    "bit_definitions": { "0": "whatever" }
                }
            }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_bit_alternatives_parsing() {
        let alt = parse_bit_alternatives("Cell Over Voltage [0: Normal / 1: Fault]").unwrap();
        assert_eq!(alt.clear, "Normal");
        assert_eq!(alt.set, "Fault");
        assert!(parse_bit_alternatives("Reserved").is_none());
        assert!(parse_bit_alternatives("Oddball [only one part]").is_none());
    }

    #[test]
    fn test_data_type_decoding() {
        assert_eq!(DataType::Uint16.decode(&[750]), 750);
        assert_eq!(DataType::Int16.decode(&[0xFFFE]), -2);
        assert_eq!(DataType::Uint32.decode(&[0x0001, 0x0002]), 0x10002);
        assert_eq!(DataType::Int32.decode(&[0xFFFF, 0xFFFF]), -1);
    }
}
