//! Equipment configuration files and bulk operations through the registry.

use std::sync::Arc;

use anyhow::Result;
use labkit_core::types::{ConfigMap, Value};
use labkit_equipment::registry::FileFormat;
use labkit_equipment::transport::SimulatedTransports;
use labkit_equipment::{
    CreationError, EquipmentFactory, EquipmentKind, EquipmentRegistry, EquipmentStatus, IoType, RegistryError,
    RegistryEvent,
};
use tokio_test::{assert_err, assert_ok};

const LAB_JSON: &str = r#"{
    "bench_dmm": {
        "type": "agilent_dmm",
        "config": {"visa_address": "TCPIP::192.168.1.10::INSTR"}
    },
    "bench_psu": {
        "type": "agilent_power_supply",
        "config": {"visa_address": "GPIB0::5::INSTR", "model": "e3648a"}
    },
    "fixture_relays": {
        "type": "kta_relay",
        "config": {"com_port": "COM3", "baud_rate": 9600}
    },
    "inspection_cam": {
        "type": "camera",
        "config": {"camera_index": 0}
    }
}"#;

fn lab() -> (EquipmentRegistry, SimulatedTransports) {
    let transports = SimulatedTransports::new();
    transports.add_multimeter("TCPIP::192.168.1.10::INSTR");
    transports.add_power_supply("GPIB0::5::INSTR", "E3648A", 2);
    transports.add_relay_board("COM3");
    transports.add_camera();
    let registry = EquipmentRegistry::new(EquipmentFactory::new(Arc::new(transports.clone())));
    (registry, transports)
}

#[test]
fn unknown_type_yields_no_equipment() {
    let (registry, _) = lab();
    let result = registry.add("oven", "unknown_type", ConfigMap::new());
    assert!(matches!(
        result,
        Err(RegistryError::Creation(CreationError::UnknownType(ref t))) if t == "unknown_type"
    ));
    assert!(registry.is_empty());
}

#[test]
fn factory_creates_without_io() {
    let (registry, transports) = lab();
    let params: ConfigMap = [("visa_address".to_string(), Value::from("GPIB0::5::INSTR"))]
        .into_iter()
        .collect();

    let psu = assert_ok!(registry.factory().create("agilent_power_supply", "psu", &params));
    assert_eq!(psu.kind(), EquipmentKind::AgilentPowerSupply);
    assert_eq!(psu.as_equipment().io_type(), IoType::Ethernet);
    assert!(!transports.visa("GPIB0::5::INSTR").expect("supply").is_open());

    assert_err!(registry.factory().create("camera", "cam", &ConfigMap::new()));
}

#[test_log::test(tokio::test)]
async fn load_connect_and_report() -> Result<()> {
    let (registry, _) = lab();
    let mut events = registry.subscribe();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("equipment.json");
    std::fs::write(&path, LAB_JSON)?;

    let names = registry.load_file(&path)?;
    assert_eq!(names.len(), 4);
    assert_eq!(registry.len(), 4);
    for _ in 0..4 {
        assert!(matches!(events.recv().await?, RegistryEvent::Added { .. }));
    }

    let summary = registry.connect_all().await?;
    assert!(summary.values().all(|ok| *ok), "{:?}", summary);

    let statuses = registry.statuses().await?;
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["bench_dmm", "bench_psu", "fixture_relays", "inspection_cam"]);
    assert!(statuses.iter().all(|s| s.status == EquipmentStatus::Ready && s.connected));

    let psu = registry.get("bench_psu")?;
    let supply = psu.as_power_supply().expect("power supply");
    assert_eq!(supply.get_output_status().await?.num_channels, 2);

    registry.disconnect_all().await?;
    let statuses = registry.statuses().await?;
    assert!(statuses.iter().all(|s| s.status == EquipmentStatus::Disconnected));
    Ok(())
}

#[tokio::test]
async fn saved_file_reloads_identically() -> Result<()> {
    let (registry, transports) = lab();
    registry.load_str(LAB_JSON, FileFormat::Json)?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("saved.json");
    registry.save_file(&path)?;

    let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    let original: serde_json::Value = serde_json::from_str(LAB_JSON)?;
    assert_eq!(saved, original);

    let reloaded = EquipmentRegistry::new(EquipmentFactory::new(Arc::new(transports)));
    reloaded.load_file(&path)?;
    assert_eq!(reloaded.names()?, registry.names()?);
    Ok(())
}

#[tokio::test]
async fn duplicate_names_are_rejected() -> Result<()> {
    let (registry, _) = lab();
    registry.load_str(LAB_JSON, FileFormat::Json)?;

    let again = registry.load_str(LAB_JSON, FileFormat::Json);
    assert!(matches!(
        again,
        Err(RegistryError::Creation(CreationError::DuplicateName(_)))
    ));
    assert_eq!(registry.len(), 4);
    Ok(())
}

#[test]
fn malformed_file_is_a_file_error() {
    let (registry, _) = lab();
    let result = registry.load_str("{ not json", FileFormat::Json);
    assert!(matches!(result, Err(RegistryError::File(_))));

    let result = registry.load_file("/nonexistent/equipment.toml");
    assert!(matches!(result, Err(RegistryError::File(_))));
}

#[test]
fn remove_of_unknown_name() {
    let (registry, _) = lab();
    let result = tokio_test::block_on(registry.remove("ghost"));
    assert!(matches!(result, Err(RegistryError::NotFound(_))));
}
