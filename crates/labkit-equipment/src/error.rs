/*!
 * Error types for equipment, transports and the registry.
 */
use thiserror::Error;

use crate::status::EquipmentStatus;

/// Low-level I/O failure surfaced by a transport session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The channel could not be opened or the peer is unreachable
    #[error("Transport unreachable: {0}")]
    Unreachable(String),

    /// Read or write failed
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// No response within the allotted time
    #[error("Transport timeout: {0}")]
    Timeout(String),

    /// The peer answered with something that could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport delivered a partial result (e.g. an incomplete frame)
    #[error("Incomplete result: {0}")]
    Incomplete(String),

    /// The session has already been closed
    #[error("Session closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(err.to_string()),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                TransportError::Unreachable(err.to_string())
            }
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Error type for equipment contract operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EquipmentError {
    /// The transport is unreachable or identification failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Merging or applying configuration failed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A caller-supplied value is outside its physical range
    #[error("Validation error: {0}")]
    Validation(String),

    /// A measurement failed or returned an incomplete result
    #[error("Measurement error: {0}")]
    Measurement(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The equipment is not connected
    #[error("Equipment not connected")]
    NotConnected,

    /// The operation is not legal in the current status
    #[error("Operation '{operation}' not allowed while {status}")]
    InvalidState {
        /// The rejected operation
        operation: &'static str,
        /// The status at the time of the call
        status: EquipmentStatus,
    },

    /// Writing a data snapshot failed
    #[error("Export error: {0}")]
    Export(String),
}

/// Result type for equipment operations
pub type Result<T> = std::result::Result<T, EquipmentError>;

impl EquipmentError {
    /// Create a new connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        EquipmentError::Connection(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        EquipmentError::Configuration(msg.as_ref().to_string())
    }

    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        EquipmentError::Validation(msg.as_ref().to_string())
    }

    /// Create a new measurement error
    pub fn measurement<S: AsRef<str>>(msg: S) -> Self {
        EquipmentError::Measurement(msg.as_ref().to_string())
    }

    /// Create a new export error
    pub fn export<S: AsRef<str>>(msg: S) -> Self {
        EquipmentError::Export(msg.as_ref().to_string())
    }

    /// Whether this failure means the device can no longer be trusted and
    /// must move the equipment to `Error`.
    ///
    /// Only transport and connection failures qualify. A device that answered
    /// with an unusable result is still reachable, so a measurement error
    /// leaves the status untouched, as do local failures.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, EquipmentError::Connection(_) | EquipmentError::Transport(_))
    }
}

impl From<std::io::Error> for EquipmentError {
    fn from(err: std::io::Error) -> Self {
        EquipmentError::Export(err.to_string())
    }
}

impl From<serde_json::Error> for EquipmentError {
    fn from(err: serde_json::Error) -> Self {
        EquipmentError::Export(err.to_string())
    }
}

impl From<csv::Error> for EquipmentError {
    fn from(err: csv::Error) -> Self {
        EquipmentError::Export(err.to_string())
    }
}

/// Error returned when the factory cannot build an equipment instance
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreationError {
    /// The logical type name is not registered
    #[error("Unknown equipment type: {0}")]
    UnknownType(String),

    /// A parameter required by the type is absent
    #[error("Equipment type '{equipment_type}' requires parameter '{parameter}'")]
    MissingParameter {
        /// The requested type
        equipment_type: String,
        /// The missing parameter
        parameter: String,
    },

    /// A parameter is present but unusable
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// The offending parameter
        parameter: String,
        /// Why it was rejected
        reason: String,
    },

    /// The name is already taken in the registry
    #[error("Equipment named '{0}' already exists")]
    DuplicateName(String),
}

/// Error type for registry management operations
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Creating one of the entries failed
    #[error(transparent)]
    Creation(#[from] CreationError),

    /// No equipment with this name
    #[error("Equipment not found: {0}")]
    NotFound(String),

    /// The equipment configuration file could not be read or written
    #[error("Equipment file error: {0}")]
    File(String),

    /// An operation on a registered equipment failed
    #[error(transparent)]
    Equipment(#[from] EquipmentError),

    /// The application configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// The lock guarding the equipment table was poisoned
    #[error("Registry lock poisoned")]
    LockPoisoned,
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::File(err.to_string())
    }
}

impl From<labkit_core::error::Error> for RegistryError {
    fn from(err: labkit_core::error::Error) -> Self {
        RegistryError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_fault_classification() {
        assert!(EquipmentError::connection("no IDN").is_device_fault());
        assert!(EquipmentError::from(TransportError::Closed).is_device_fault());
        assert!(!EquipmentError::measurement("incomplete").is_device_fault());

        assert!(!EquipmentError::validation("25 V > 20 V").is_device_fault());
        assert!(!EquipmentError::configuration("unknown key").is_device_fault());
        assert!(!EquipmentError::NotConnected.is_device_fault());
    }

    #[test]
    fn test_io_error_mapping() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "late");
        assert!(matches!(TransportError::from(timeout), TransportError::Timeout(_)));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "/dev/ttyUSB9");
        assert!(matches!(TransportError::from(missing), TransportError::Unreachable(_)));
    }

    #[test]
    fn test_messages() {
        let err = EquipmentError::InvalidState {
            operation: "reset",
            status: EquipmentStatus::Measuring,
        };
        assert_eq!(err.to_string(), "Operation 'reset' not allowed while measuring");

        let err = CreationError::MissingParameter {
            equipment_type: "kta_relay".into(),
            parameter: "com_port".into(),
        };
        assert_eq!(
            err.to_string(),
            "Equipment type 'kta_relay' requires parameter 'com_port'"
        );
    }
}
