//! Error types for ring building and ring lookup.

use thiserror::Error;

use crate::device::DeviceId;

/// Result type alias for ring operations.
pub type RingResult<T> = Result<T, RingError>;

/// Error variants for ring operations.
#[derive(Debug, Error)]
pub enum RingError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device was added with an id already held by a live device.
    #[error("Duplicate device id: {id}")]
    DuplicateDevice {
        /// The colliding device id.
        id: DeviceId,
    },

    /// The referenced device id is not a live device.
    #[error("Device not found: {id}")]
    DeviceNotFound {
        /// The missing device id.
        id: DeviceId,
    },

    /// Every 16-bit device id is already in use.
    #[error("Device id space exhausted")]
    DeviceIdExhausted,

    /// A weight-normalized computation ran with a total weight of zero.
    #[error("There are no devices in this ring, or all devices have been deleted")]
    EmptyRing,

    /// The assignment table is inconsistent with the device registry.
    #[error("Ring validation failed: {0}")]
    Validation(String),

    /// A device search string could not be parsed.
    #[error("Invalid search pattern: {pattern:?}")]
    InvalidSearchPattern {
        /// The pattern as supplied by the caller.
        pattern: String,
    },

    /// A serialized ring or builder uses a format version this code cannot read.
    #[error("Unknown ring format version {version}")]
    UnknownFormatVersion {
        /// The version found in the file.
        version: u32,
    },

    /// A serialized ring is truncated or garbled.
    #[error("Corrupt ring data: {reason}")]
    CorruptRing {
        /// Description of the corruption.
        reason: String,
    },

    /// A builder parameter is out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration could not be loaded or is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },
}
