use std::sync::Arc;
use std::time::Duration;

use labkit_core::config::ConfigBuilder;
use labkit_core::logging;
use labkit_core::types::{ConfigMap, Value};
use labkit_equipment::transport::SimulatedTransports;
use labkit_equipment::{EquipmentEvent, EquipmentRegistry};

use tokio::time::sleep;
use tracing::info;

const BENCH: &str = r#"{
    "bench_dmm": {"type": "agilent_dmm", "config": {"visa_address": "TCPIP::192.168.1.10::INSTR"}},
    "bench_psu": {"type": "agilent_power_supply", "config": {"visa_address": "GPIB0::5::INSTR", "model": "e3646a"}},
    "fixture_relays": {"type": "kta_relay", "config": {"com_port": "COM3"}}
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // labkit.toml and LABKIT__* variables override the defaults
    let work_dir = std::env::temp_dir().join("labkit_bench");
    std::fs::create_dir_all(&work_dir)?;
    let equipment_file = work_dir.join("equipment.json");
    std::fs::write(&equipment_file, BENCH)?;

    let mut config = ConfigBuilder::new()
        .with_config_file("labkit.toml")
        .with_environment_prefix("LABKIT")
        .build()?;
    config.equipment.config_file = equipment_file.display().to_string();
    config.general.data_dir = work_dir.join("data").display().to_string();
    config.measurement.default_export_format = "csv".to_string();

    logging::init_from_config(&config.logging)?;

    // Simulated instruments standing in for the real bench
    let transports = SimulatedTransports::new();
    let meter = transports.add_multimeter("TCPIP::192.168.1.10::INSTR");
    transports.add_power_supply("GPIB0::5::INSTR", "E3646A", 2);
    transports.add_relay_board("COM3");

    let registry = EquipmentRegistry::from_config(&config, Arc::new(transports)).await?;

    let dmm = registry.get("bench_dmm")?;
    let mut event_rx = dmm.as_equipment().subscribe();

    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                EquipmentEvent::StatusChanged { equipment, from, to } => {
                    info!("{}: {} -> {}", equipment, from, to);
                }
                EquipmentEvent::RecordAdded { equipment, record } => {
                    info!("{}: {} {}", equipment, record.value, record.units);
                }
                other => {
                    info!("Other event received: {:?}", other);
                }
            }
        }
    });

    let summary = registry.connect_all().await?;
    info!("Connected: {:?}", summary);

    // Drive the DUT from the supply through relay 1
    let psu = registry.get("bench_psu")?;
    if let Some(supply) = psu.as_power_supply() {
        supply.set_voltage(1, 5.0).await?;
        supply.set_current_limit(1, 0.5).await?;
        supply.enable_output(true).await?;
    }
    let relays = registry.get("fixture_relays")?;
    if let Some(board) = relays.as_relay() {
        board.set_relay_state(1, true).await?;
    }

    // Sample the meter at 10 Hz for half a second
    let mut rate = ConfigMap::new();
    rate.insert("sample_rate".to_string(), Value::from(10.0));
    dmm.as_equipment().set_config(rate).await?;

    meter.set_reading(4.998);
    dmm.as_equipment().start_measurement().await?;
    sleep(Duration::from_millis(500)).await;
    dmm.as_equipment().stop_measurement().await?;

    let path = registry.export("bench_dmm").await?;
    info!("Exported to {}", path.display());

    for status in registry.statuses().await? {
        info!("{}", serde_json::to_string(&status)?);
    }

    registry.disconnect_all().await?;
    Ok(())
}
