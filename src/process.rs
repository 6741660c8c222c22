//! Data processing: raw register values to engineering units.
//!
//! [`process`] is a pure function over a raw register sweep and the device's
//! register map. Value registers are scaled and annotated; bitmask registers
//! are decoded bit by bit using the alternatives parsed at map load time.
//! [`derive_fields`] then adds the per-kind computed fields (power, deltas,
//! efficiencies, status summaries). A missing input or a zero divisor simply
//! skips the derived field, it is never an error.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::device::DeviceKind;
use crate::register_map::{RegisterKind, RegisterMap, RegisterSpec};

/// A processed field value: either a scaled number or an interpreted status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Scaled numeric value.
    Number(f64),
    /// Interpreted status text.
    Text(String),
}

impl FieldValue {
    /// Returns the numeric value, if this field is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }
}

/// Decoded state of one bit in a bitmask register.
#[derive(Debug, Clone, Serialize)]
pub struct BitState {
    /// Whether the bit is set.
    pub active: bool,
    /// The bit description from the register map.
    pub description: String,
    /// Interpreted status: the matching alternative phrase when the
    /// description embeds one, `active`/`inactive` otherwise.
    pub status: String,
}

/// One processed register or derived value.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedField {
    /// Scaled value or interpreted status.
    pub value: FieldValue,
    /// Engineering unit.
    pub unit: String,
    /// Human description.
    pub description: String,
    /// The raw register value (or the unrounded input for derived fields).
    pub raw_value: f64,
    /// Field kind: `value`, `bitmask`, `calculated` or `status`.
    pub kind: &'static str,
    /// Per-bit decoding, present on bitmask fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<BTreeMap<String, BitState>>,
    /// Descriptions of the bits currently set, present on bitmask fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_bits: Option<Vec<String>>,
}

impl ProcessedField {
    fn number(value: f64, unit: &str, description: &str, raw: f64, kind: &'static str) -> Self {
        Self {
            value: FieldValue::Number(value),
            unit: unit.to_string(),
            description: description.to_string(),
            raw_value: raw,
            kind,
            bits: None,
            active_bits: None,
        }
    }

    fn status(text: String, description: &str, raw: f64) -> Self {
        Self {
            value: FieldValue::Text(text),
            unit: String::new(),
            description: description.to_string(),
            raw_value: raw,
            kind: "status",
            bits: None,
            active_bits: None,
        }
    }
}

/// Processes a raw register sweep against the register map.
///
/// Registers absent from the map pass through unscaled so that nothing read
/// from the device is silently dropped.
pub fn process(
    raw: &BTreeMap<String, i64>,
    map: &RegisterMap,
) -> BTreeMap<String, ProcessedField> {
    let mut processed = BTreeMap::new();

    for (name, &raw_value) in raw {
        let field = match map.lookup(name) {
            Some(spec) => match spec.kind {
                RegisterKind::Bitmask => decode_bitmask(raw_value, spec),
                RegisterKind::Value => ProcessedField::number(
                    raw_value as f64 * spec.scale,
                    &spec.unit,
                    &spec.description,
                    raw_value as f64,
                    "value",
                ),
            },
            None => ProcessedField::number(raw_value as f64, "", name, raw_value as f64, "value"),
        };
        processed.insert(name.clone(), field);
    }

    processed
}

fn decode_bitmask(raw_value: i64, spec: &RegisterSpec) -> ProcessedField {
    let mut bits = BTreeMap::new();
    let mut active = Vec::new();

    for (&index, bit) in &spec.bits {
        let is_set = raw_value & (1 << index) != 0;
        let status = match &bit.alternatives {
            Some(alt) => {
                if is_set {
                    alt.set.clone()
                } else {
                    alt.clear.clone()
                }
            }
            None => if is_set { "active" } else { "inactive" }.to_string(),
        };
        if is_set {
            active.push(format!("Bit {index}: {}", bit.description));
        }
        bits.insert(
            format!("bit_{index:02}"),
            BitState {
                active: is_set,
                description: bit.description.clone(),
                status,
            },
        );
    }

    ProcessedField {
        value: FieldValue::Number(raw_value as f64),
        unit: String::new(),
        description: spec.description.clone(),
        raw_value: raw_value as f64,
        kind: "bitmask",
        bits: Some(bits),
        active_bits: Some(active),
    }
}

/// Adds the derived fields computed for the given device kind.
pub fn derive_fields(kind: DeviceKind, processed: &mut BTreeMap<String, ProcessedField>) {
    match kind {
        DeviceKind::Bms => derive_bms(processed),
        DeviceKind::Dcdc => derive_dcdc(processed),
        DeviceKind::Pcs => derive_pcs(processed),
    }
}

fn value_of(processed: &BTreeMap<String, ProcessedField>, name: &str) -> Option<f64> {
    processed.get(name).and_then(|field| field.value.as_f64())
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn derive_bms(processed: &mut BTreeMap<String, ProcessedField>) {
    if let (Some(max), Some(min)) = (
        value_of(processed, "battery_cell_max_voltage"),
        value_of(processed, "battery_cell_min_voltage"),
    ) {
        let diff = max - min;
        processed.insert(
            "cell_voltage_diff".into(),
            ProcessedField::number(
                round_to(diff, 3),
                "V",
                "Cell voltage spread (max - min)",
                diff,
                "calculated",
            ),
        );
    }

    if let (Some(max), Some(min)) = (
        value_of(processed, "module_max_temperature"),
        value_of(processed, "module_min_temperature"),
    ) {
        let diff = max - min;
        processed.insert(
            "module_temp_diff".into(),
            ProcessedField::number(
                round_to(diff, 1),
                "°C",
                "Module temperature spread (max - min)",
                diff,
                "calculated",
            ),
        );
    }

    if let (Some(voltage), Some(current)) = (
        value_of(processed, "rack_voltage"),
        value_of(processed, "rack_current"),
    ) {
        let power = voltage * current;
        processed.insert(
            "instantaneous_power".into(),
            ProcessedField::number(
                round_to(power, 2),
                "W",
                "Instantaneous power (rack voltage x rack current)",
                power,
                "calculated",
            ),
        );
    }

    if let Some(soc) = value_of(processed, "battery_soc") {
        let band = if soc >= 80.0 {
            "HIGH"
        } else if soc >= 50.0 {
            "NORMAL"
        } else if soc >= 20.0 {
            "LOW"
        } else {
            "CRITICAL"
        };
        processed.insert(
            "soc_band".into(),
            ProcessedField::status(band.to_string(), "SOC band", soc),
        );
    }

    if let Some(field) = processed.get("battery_system_operation_mode") {
        let mode = field.raw_value as i64;
        let mut flags = Vec::new();
        flags.push(if mode & 0x01 != 0 {
            "initialized"
        } else {
            "initializing"
        });
        if mode & 0x02 != 0 {
            flags.push("charging");
        }
        if mode & 0x04 != 0 {
            flags.push("discharging");
        }
        if mode & 0x08 != 0 {
            flags.push("standby (relay on)");
        }
        processed.insert(
            "system_mode_status".into(),
            ProcessedField::status(flags.join(", "), "System operating mode", mode as f64),
        );
    }

    let mut alarms = 0usize;
    let mut errors = 0usize;
    let mut warnings = 0usize;
    for (name, field) in processed.iter() {
        if field.kind != "bitmask" {
            continue;
        }
        let active = field.active_bits.as_ref().map_or(0, Vec::len);
        let lowered = name.to_lowercase();
        if lowered.contains("alarm") {
            alarms += active;
        } else if lowered.contains("error") {
            errors += active;
        } else if lowered.contains("warning") {
            warnings += active;
        }
    }
    let total = alarms + errors + warnings;
    processed.insert(
        "system_health_summary".into(),
        ProcessedField::status(
            format!("alarms: {alarms}, errors: {errors}, warnings: {warnings}"),
            "System health summary",
            total as f64,
        ),
    );
}

fn derive_dcdc(processed: &mut BTreeMap<String, ProcessedField>) {
    if let (Some(voltage), Some(current)) = (
        value_of(processed, "input_voltage"),
        value_of(processed, "input_current"),
    ) {
        let power = voltage * current;
        processed.insert(
            "calculated_input_power".into(),
            ProcessedField::number(round_to(power, 2), "W", "Input power", power, "calculated"),
        );
    }

    if let (Some(voltage), Some(current)) = (
        value_of(processed, "output_voltage"),
        value_of(processed, "output_current"),
    ) {
        let power = voltage * current;
        processed.insert(
            "calculated_output_power".into(),
            ProcessedField::number(round_to(power, 2), "W", "Output power", power, "calculated"),
        );
    }

    if let (Some(input), Some(output)) = (
        value_of(processed, "calculated_input_power"),
        value_of(processed, "calculated_output_power"),
    ) {
        if input > 0.0 {
            let efficiency = output / input * 100.0;
            processed.insert(
                "calculated_efficiency".into(),
                ProcessedField::number(
                    round_to(efficiency, 2),
                    "%",
                    "Conversion efficiency",
                    efficiency,
                    "calculated",
                ),
            );
        }
    }
}

fn derive_pcs(processed: &mut BTreeMap<String, ProcessedField>) {
    let phases_v = [
        value_of(processed, "ac_voltage_r"),
        value_of(processed, "ac_voltage_s"),
        value_of(processed, "ac_voltage_t"),
    ];
    if let [Some(r), Some(s), Some(t)] = phases_v {
        let avg = (r + s + t) / 3.0;
        processed.insert(
            "avg_ac_voltage".into(),
            ProcessedField::number(
                round_to(avg, 2),
                "V",
                "Three-phase AC voltage average",
                avg,
                "calculated",
            ),
        );
    }

    let phases_i = [
        value_of(processed, "ac_current_r"),
        value_of(processed, "ac_current_s"),
        value_of(processed, "ac_current_t"),
    ];
    if let [Some(r), Some(s), Some(t)] = phases_i {
        let avg = (r.abs() + s.abs() + t.abs()) / 3.0;
        processed.insert(
            "avg_ac_current".into(),
            ProcessedField::number(
                round_to(avg, 2),
                "A",
                "Three-phase AC current average (absolute)",
                avg,
                "calculated",
            ),
        );
    }

    if let (Some(power), Some(voltage)) = (
        value_of(processed, "dc_power"),
        value_of(processed, "dc_voltage"),
    ) {
        if voltage > 0.0 {
            let density = power / voltage;
            processed.insert(
                "power_density".into(),
                ProcessedField::number(round_to(density, 2), "W/V", "Power density", density, "calculated"),
            );
        }
    }

    if let (Some(ac), Some(dc)) = (
        value_of(processed, "ac_power"),
        value_of(processed, "dc_power"),
    ) {
        if dc != 0.0 {
            // Discharge converts DC to AC, charge the other way around.
            let efficiency = if dc > 0.0 {
                ac.abs() / dc * 100.0
            } else {
                dc.abs() / ac.abs() * 100.0
            };
            if efficiency.is_finite() {
                processed.insert(
                    "pcs_efficiency".into(),
                    ProcessedField::number(
                        round_to(efficiency.min(100.0), 2),
                        "%",
                        "Round-trip efficiency",
                        efficiency,
                        "calculated",
                    ),
                );
            }
        }
    }
}
