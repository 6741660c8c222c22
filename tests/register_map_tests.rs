//! Register map loading tests over the public API.

use std::io::Write;

use pms_supervisor::register_map::{FunctionCode, RegisterMap};

const BMS_MAP: &str = r#"
{
    "data_registers": {
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
            "function_code": "0x03",
            "data_type": "int16",
            "scale": 0.1,
            "unit": "A",
            "description": "Rack current"
        }
    },
    "status_registers": {
        "error_code_2": {
            "address": 301,
            "function_code": "0x03",
            "type": "bitmask",
            "description": "Error Code 2",
            "bit_definitions": {
                "0": "Cell Over Voltage [0: Normal / 1: Fault]",
                "3": "Communication [0: Normal / 1: Fault]",
                "15": "Reserved"
            }
        }
    },
    "control_registers": {
        "error_reset": {
            "address": 400,
            "function_code": "0x06",
            "description": "Error reset command"
        }
    }
}
"#;

fn load_map(contents: &str) -> RegisterMap {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    RegisterMap::load(file.path()).unwrap()
}

#[test]
fn test_load_from_file() {
    let map = load_map(BMS_MAP);
    assert_eq!(map.len(), 4);

    // Lookup is flat across sections.
    assert!(map.lookup("battery_soc").is_some());
    assert!(map.lookup("error_code_2").is_some());
    assert!(map.lookup("error_reset").is_some());
}

#[test]
fn test_spec_fields() {
    let map = load_map(BMS_MAP);

    let soc = map.lookup("battery_soc").unwrap();
    assert_eq!(soc.address, 256);
    assert_eq!(soc.function_code, FunctionCode::ReadHolding);
    assert_eq!(soc.scale, 0.1);
    assert_eq!(soc.unit, "%");
    assert!(soc.function_code.is_readable());
    assert!(!soc.function_code.is_writable());

    let reset = map.lookup("error_reset").unwrap();
    assert_eq!(reset.function_code, FunctionCode::WriteSingle);
    assert!(reset.function_code.is_writable());
}

#[test]
fn test_bit_definitions_parsed_at_load() {
    let map = load_map(BMS_MAP);
    let errors = map.lookup("error_code_2").unwrap();

    let comm = &errors.bits[&3];
    let alternatives = comm.alternatives.as_ref().unwrap();
    assert_eq!(alternatives.clear, "Normal");
    assert_eq!(alternatives.set, "Fault");

    // Free-text bits fall back to active/inactive.
    assert!(errors.bits[&15].alternatives.is_none());
}

#[test]
fn test_find_by_address() {
    let map = load_map(BMS_MAP);
    assert_eq!(map.find_by_address(400), Some("error_reset"));
    assert_eq!(map.find_by_address(256), Some("battery_soc"));
    assert_eq!(map.find_by_address(12345), None);
}

#[test]
fn test_unreadable_file_is_error() {
    assert!(RegisterMap::load("/nonexistent/bms_map.json").is_err());
}
