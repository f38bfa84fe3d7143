/*!
 * Transport sessions.
 *
 * Equipment never performs I/O itself; it delegates every primitive to a
 * session opened through a [`TransportProvider`]. Each `connect()` opens a
 * fresh session that the equipment owns exclusively until `disconnect()`
 * closes it.
 */
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportResult;

pub mod imaging;
pub mod serial;
pub mod simulated;
pub mod visa;

#[cfg(feature = "serial")]
pub mod system_serial;

pub use imaging::{CameraInfo, Frame, ImagingSession};
pub use serial::SerialLine;
pub use simulated::SimulatedTransports;
pub use visa::VisaSession;

#[cfg(feature = "serial")]
pub use system_serial::{SystemSerialLine, SystemTransports};

/// Opens transport sessions on behalf of equipment
#[async_trait]
pub trait TransportProvider: Send + Sync + Debug {
    /// Provider name, used in logs
    fn name(&self) -> &'static str;

    /// Open a VISA session to `address`
    async fn open_visa(&self, address: &str, timeout: Duration) -> TransportResult<Box<dyn VisaSession>>;

    /// Create an unopened serial line
    fn serial_line(&self) -> Box<dyn SerialLine>;

    /// Open an imaging-SDK session
    async fn open_imaging(&self) -> TransportResult<Box<dyn ImagingSession>>;
}
