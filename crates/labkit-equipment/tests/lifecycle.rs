//! Lifecycle properties shared by every equipment family, driven through the
//! registry against the simulated bench.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use labkit_core::types::{ConfigMap, Value};
use labkit_equipment::transport::SimulatedTransports;
use labkit_equipment::{
    AnyEquipment, Equipment, EquipmentError, EquipmentFactory, EquipmentRegistry, EquipmentStatus, LoopTiming, MeasurementStart,
};

const DMM: &str = "TCPIP::192.168.1.10::INSTR";
const SUPPLY: &str = "GPIB0::5::INSTR";
const RELAY_PORT: &str = "/dev/ttyUSB0";

fn params(pairs: &[(&str, Value)]) -> ConfigMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// A registry holding one equipment of every family on a fresh bench
fn bench() -> Result<(EquipmentRegistry, SimulatedTransports)> {
    let transports = SimulatedTransports::new();
    transports.add_multimeter(DMM);
    transports.add_power_supply(SUPPLY, "E3646A", 2);
    transports.add_relay_board(RELAY_PORT);
    transports.add_camera();

    let timing = LoopTiming {
        stop_timeout: Duration::from_secs(1),
        min_poll_interval: Duration::from_millis(1),
    };
    let registry = EquipmentRegistry::new(EquipmentFactory::with_timing(Arc::new(transports.clone()), timing));
    registry.add("dmm", "agilent_dmm", params(&[("visa_address", Value::from(DMM))]))?;
    registry.add(
        "psu",
        "agilent_power_supply",
        params(&[("visa_address", Value::from(SUPPLY)), ("model", Value::from("e3646a"))]),
    )?;
    registry.add("relays", "kta_relay", params(&[("com_port", Value::from(RELAY_PORT))]))?;
    registry.add("cam", "camera", params(&[("camera_index", Value::from(0))]))?;
    Ok((registry, transports))
}

fn rate(hz: f64) -> ConfigMap {
    params(&[("sample_rate", Value::from(hz))])
}

#[tokio::test]
async fn disconnected_mutations_fail_without_side_effects() -> Result<()> {
    let (registry, transports) = bench()?;

    for name in registry.names()? {
        let equipment = registry.get(&name)?;
        let equipment = equipment.as_equipment();
        let config_before = equipment.get_config().await;

        assert!(equipment.measure().await.is_err(), "{}", name);
        assert!(equipment.apply_config().await.is_err(), "{}", name);
        assert!(equipment.set_config(rate(5.0)).await.is_err(), "{}", name);
        assert!(equipment.start_measurement().await.is_err(), "{}", name);
        assert!(equipment.reset().await.is_err(), "{}", name);
        assert!(equipment.clear_data().await.is_err(), "{}", name);
        assert!(equipment.self_test().await.is_err(), "{}", name);

        assert_eq!(equipment.status().await, EquipmentStatus::Disconnected, "{}", name);
        assert_eq!(equipment.get_config().await, config_before, "{}", name);
        assert!(equipment.get_measurement_data().await.is_empty(), "{}", name);
        assert!(equipment.status_history().await.is_empty(), "{}", name);
    }

    let supply = transports.visa(SUPPLY).expect("supply on bench");
    assert!(supply.commands().is_empty());
    let board = transports.relay_board(RELAY_PORT).expect("board on bench");
    assert!(board.commands().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn set_config_of_snapshot_is_idempotent() -> Result<()> {
    let (registry, _) = bench()?;
    registry.connect_all().await?;

    for name in registry.names()? {
        let equipment = registry.get(&name)?;
        let equipment = equipment.as_equipment();
        let snapshot = equipment.get_config().await;

        equipment.set_config(snapshot.clone()).await?;
        assert_eq!(equipment.get_config().await, snapshot, "{}", name);
        assert_eq!(equipment.status().await, EquipmentStatus::Ready, "{}", name);
    }
    Ok(())
}

#[tokio::test]
async fn get_config_is_a_copy() -> Result<()> {
    let (registry, _) = bench()?;
    let dmm = registry.get("dmm")?;

    let mut copy = dmm.as_equipment().get_config().await;
    copy.insert("sample_rate".to_string(), Value::from(99.0));
    assert_eq!(
        dmm.as_equipment().get_config().await.get("sample_rate"),
        Some(&Value::Float(1.0))
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn double_start_keeps_one_worker() -> Result<()> {
    let (registry, _) = bench()?;
    let dmm = registry.get("dmm")?;
    let dmm = dmm.as_equipment();
    dmm.connect().await?;
    dmm.set_config(rate(500.0)).await?;

    assert_eq!(dmm.start_measurement().await?, MeasurementStart::Started);
    assert_eq!(dmm.status().await, EquipmentStatus::Measuring);
    assert_eq!(dmm.start_measurement().await?, MeasurementStart::AlreadyRunning);
    assert_eq!(dmm.status().await, EquipmentStatus::Measuring);

    tokio::time::sleep(Duration::from_millis(30)).await;
    dmm.stop_measurement().await?;
    assert_eq!(dmm.status().await, EquipmentStatus::Ready);

    let after_stop = dmm.get_measurement_data().await.len();
    assert!(after_stop > 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(dmm.get_measurement_data().await.len(), after_stop);
    Ok(())
}

#[tokio::test]
async fn stop_when_ready_changes_nothing() -> Result<()> {
    let (registry, _) = bench()?;
    let relays = registry.get("relays")?;
    let relays = relays.as_equipment();
    relays.connect().await?;

    let history = relays.status_history().await;
    relays.stop_measurement().await?;
    relays.stop_measurement().await?;

    assert_eq!(relays.status().await, EquipmentStatus::Ready);
    assert_eq!(relays.status_history().await, history);
    Ok(())
}

#[tokio::test]
async fn measure_while_measuring_appends_in_call_order() -> Result<()> {
    let (registry, transports) = bench()?;
    let dmm = registry.get("dmm")?;
    let dmm = dmm.as_equipment();
    dmm.connect().await?;
    // one sample every 100 s: the worker stays asleep for the whole test
    dmm.set_config(rate(0.01)).await?;
    dmm.start_measurement().await?;

    let meter = transports.visa(DMM).expect("meter on bench");
    for reading in [1.5, 2.5, 3.5] {
        let before = dmm.get_measurement_data().await.len();
        meter.set_reading(reading);
        assert_eq!(dmm.measure().await?, Value::Float(reading));
        assert_eq!(dmm.get_measurement_data().await.len(), before + 1);
    }

    let values: Vec<Value> = dmm
        .get_measurement_data()
        .await
        .into_iter()
        .map(|r| r.value)
        .collect();
    assert_eq!(values, vec![Value::Float(1.5), Value::Float(2.5), Value::Float(3.5)]);
    assert_eq!(dmm.status().await, EquipmentStatus::Measuring);

    dmm.stop_measurement().await?;
    Ok(())
}

#[tokio::test]
async fn relay_rejects_out_of_range_numbers_locally() -> Result<()> {
    let (registry, transports) = bench()?;
    let relays = registry.get("relays")?;
    let board = relays.as_relay().expect("relay board");
    board.connect().await?;

    let sim = transports.relay_board(RELAY_PORT).expect("board on bench");
    let sent = sim.commands().len();
    let relay_count = board
        .get_config()
        .await
        .get("num_relays")
        .and_then(Value::as_integer)
        .expect("num_relays") as usize;

    for relay in [0, relay_count + 1] {
        let err = board.set_relay_state(relay, true).await.unwrap_err();
        assert!(matches!(err, EquipmentError::Validation(_)), "relay {}: {}", relay, err);
    }

    assert_eq!(sim.commands().len(), sent);
    assert_eq!(board.status().await, EquipmentStatus::Ready);
    assert!(sim.relay_states().iter().all(|on| !on));
    Ok(())
}

#[tokio::test]
async fn supply_rejects_voltage_above_range() -> Result<()> {
    let (registry, transports) = bench()?;
    let psu = registry.get("psu")?;
    let supply = psu.as_power_supply().expect("power supply");
    supply.connect().await?;
    supply.set_range(1, "P20V").await?;

    let sim = transports.visa(SUPPLY).expect("supply on bench");
    let sent = sim.commands().len();

    let err = supply.set_voltage(1, 25.0).await.unwrap_err();
    assert!(matches!(err, EquipmentError::Validation(_)), "{}", err);
    assert_eq!(sim.commands().len(), sent);

    let status = supply.get_output_status().await?;
    assert_eq!(status.num_channels, 2);
    assert_eq!(status.channels[0].voltage_set, 0.0);
    assert_eq!(supply.status().await, EquipmentStatus::Ready);

    supply.set_voltage(1, 12.0).await?;
    assert_eq!(supply.get_output_status().await?.channels[0].voltage_set, 12.0);
    Ok(())
}

#[tokio::test]
async fn error_requires_explicit_reconnect() -> Result<()> {
    let (registry, transports) = bench()?;
    let meter = transports.visa(DMM).expect("meter on bench");
    let dmm = registry.get("dmm")?;
    let dmm = dmm.as_equipment();

    meter.faults().set_unreachable(true);
    assert!(dmm.connect().await.is_err());
    assert_eq!(dmm.status().await, EquipmentStatus::Error);
    assert!(dmm.last_error().await.is_some());
    assert!(dmm.measure().await.is_err());

    meter.faults().set_unreachable(false);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(dmm.status().await, EquipmentStatus::Error);

    dmm.connect().await?;
    assert_eq!(dmm.status().await, EquipmentStatus::Ready);
    let history = dmm.status_history().await;
    assert!(history
        .iter()
        .any(|t| t.from == EquipmentStatus::Error && t.to == EquipmentStatus::Connecting));
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_never_lose_records() -> Result<()> {
    let (registry, _) = bench()?;
    let dmm: Arc<AnyEquipment> = registry.get("dmm")?;
    dmm.as_equipment().connect().await?;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let dmm = Arc::clone(&dmm);
            tokio::spawn(async move {
                for _ in 0..5 {
                    dmm.as_equipment().measure().await?;
                    assert_ne!(dmm.as_equipment().status().await, EquipmentStatus::Busy);
                }
                Ok::<_, EquipmentError>(())
            })
        })
        .collect();
    for task in tasks {
        task.await??;
    }

    assert_eq!(dmm.as_equipment().get_measurement_data().await.len(), 40);
    assert_eq!(dmm.as_equipment().status().await, EquipmentStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn removal_forces_safe_shutdown() -> Result<()> {
    let (registry, transports) = bench()?;
    let relays = registry.get("relays")?;
    let board = relays.as_relay().expect("relay board");
    board.connect().await?;
    board.set_relay_state(3, true).await?;
    board.start_measurement().await?;

    let sim = transports.relay_board(RELAY_PORT).expect("board on bench");
    assert!(sim.relay_states()[2]);

    let removed = registry.remove("relays").await?;
    assert_eq!(removed.as_equipment().status().await, EquipmentStatus::Disconnected);
    assert!(!removed.as_equipment().is_measuring().await);
    assert!(sim.relay_states().iter().all(|on| !on));
    assert!(!sim.is_open());
    Ok(())
}
