//! Custom error types for the acquisition layer.
//!
//! This module defines the primary error type, [`HalError`], used across the
//! whole crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the small closed set of outcomes a caller can
//! observe: success, argument error, capability not applicable, device
//! closed, I/O error, data error, and capacity error.
//!
//! ## Error policy
//!
//! - **Argument errors** (`Arg`, `NotApplicable`, `DeviceClosed`) are
//!   rejected immediately, before any driver or transport code runs, and
//!   have no side effects.
//! - **Transport errors** (`Io`, `Timeout`) are propagated to the caller.
//!   While a device is acquiring they are fatal for that run and trigger a
//!   cooperative stop of the affected event source.
//! - **Protocol/data errors** (`Data`) are local to one decode attempt: the
//!   offending sample or frame is discarded and logged, acquisition
//!   continues. They only surface to callers from one-shot operations such
//!   as a Modbus transaction.
//! - **Capacity errors** (`Capacity`) are fatal for the consumer that
//!   raised them (for example, VCD identifier space exhaustion).
//!
//! Every fallible operation returns an explicit [`HalResult`]; errors are
//! never used for control flow via panics.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type HalResult<T> = std::result::Result<T, HalError>;

/// Primary error type for the acquisition layer.
#[derive(Error, Debug)]
pub enum HalError {
    /// Invalid argument: bad key, unknown group, missing handle, value out
    /// of range. Rejected before any side effect occurs.
    #[error("Invalid argument: {0}")]
    Arg(String),

    /// The requested config operation is not advertised by the device's
    /// capability table. This is a pure data check; no driver code ran.
    #[error("Operation not applicable to this device or group")]
    NotApplicable,

    /// The device has been closed; no further operations are possible.
    #[error("Device is closed")]
    DeviceClosed,

    /// Transport-level I/O failure (open, read, write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded transport operation did not complete within its timeout.
    #[error("Operation timed out")]
    Timeout,

    /// Malformed or inconsistent data from the device: checksum mismatch,
    /// bad framing, out-of-range field.
    #[error("Data error: {0}")]
    Data(String),

    /// A fixed internal capacity was exhausted.
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// The datafeed channel to the session was closed while a driver still
    /// tried to submit packets.
    #[error("Datafeed channel closed")]
    Feed,
}

impl HalError {
    /// Shorthand for an argument error with a formatted message.
    pub fn arg(msg: impl Into<String>) -> Self {
        HalError::Arg(msg.into())
    }

    /// Shorthand for a data error with a formatted message.
    pub fn data(msg: impl Into<String>) -> Self {
        HalError::Data(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = HalError::arg("no such group 'R9'");
        assert_eq!(err.to_string(), "Invalid argument: no such group 'R9'");
        assert_eq!(
            HalError::NotApplicable.to_string(),
            "Operation not applicable to this device or group"
        );
    }

    #[test]
    fn io_conversion() {
        fn fails() -> HalResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(HalError::Io(_))));
    }
}
