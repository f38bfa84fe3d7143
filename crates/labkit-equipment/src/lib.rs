/*!
 * LabKit Equipment
 *
 * This crate provides the equipment lifecycle contract shared by every
 * laboratory instrument family: connection state machine, config store,
 * measurement loop, data log and the registry that creates equipment from a
 * logical type name.
 *
 * Instruments never perform I/O themselves. Every primitive goes through a
 * transport session opened by a [`transport::TransportProvider`];
 * [`transport::SimulatedTransports`] provides an in-process bench.
 */

#![warn(missing_docs)]

// Re-export core types
pub use labkit_core::prelude;

pub mod config_store;
pub mod data_log;
pub mod devices;
pub mod equipment;
pub mod error;
pub mod measurement;
pub mod registry;
pub mod status;
pub mod transport;

pub use config_store::{CommonSettings, ConfigStore};
pub use data_log::{DataSnapshot, ExportFormat, MeasurementRecord};
pub use equipment::{Driver, Equipment, EquipmentEvent, Identification, Instrument, IoType, Reading, StatusReport};
pub use error::{CreationError, EquipmentError, RegistryError, TransportError};
pub use measurement::{LoopTiming, MeasurementStart};
pub use registry::{AnyEquipment, EquipmentFactory, EquipmentKind, EquipmentRegistry, RegistryEvent};
pub use status::{EquipmentStatus, StatusTransition};

/// LabKit equipment crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the equipment layer
pub fn init() -> Result<(), labkit_core::error::Error> {
    tracing::info!("LabKit Equipment {} initialized", VERSION);
    Ok(())
}

/// Transport families compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["simulated"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}

/// Logical equipment type names the factory accepts
pub fn available_types() -> Vec<&'static str> {
    registry::EquipmentKind::ALL.iter().map(|k| k.as_str()).collect()
}
