/*!
 * Equipment families.
 *
 * Each family is a [`Driver`](crate::equipment::Driver) plugged into the
 * shared [`Instrument`](crate::equipment::Instrument) lifecycle, plus the
 * family-specific operations as inherent methods.
 */

pub mod camera;
pub mod multimeter;
pub mod power_supply;
pub mod relay;

pub use camera::{Camera, CameraDriver, CameraSettings};
pub use multimeter::{AgilentDmm, DmmDriver, DmmSettings, MeasurementFunction};
pub use power_supply::{AgilentPowerSupply, OutputStatus, PowerSupplyDriver, SupplyModel};
pub use relay::{KtaRelay, RelayDriver, RelaySettings};
