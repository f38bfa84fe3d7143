/*!
 * LabKit Core
 *
 * This crate provides the shared foundation for LabKit: value types,
 * the core error type, application configuration, logging setup and
 * small async utilities used by the equipment layer.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use serde_json;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// LabKit core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("LabKit Core {} initialized", VERSION);
    Ok(())
}
