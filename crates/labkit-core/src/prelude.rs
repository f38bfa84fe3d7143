/*!
 * Prelude module for LabKit Core.
 *
 * This module re-exports commonly used types and functions from the LabKit Core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{ConfigMap, Id, Metadata, Value, ValueKind};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder};

// Re-export utility functions
pub use crate::utils::{join_with_timeout, period_from_rate, JoinOutcome};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
