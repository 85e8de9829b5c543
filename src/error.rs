use thiserror::Error;

use crate::types::ConnectionState;

/// Errors that can occur when talking to a BM2 battery monitor
#[derive(Error, Debug)]
pub enum Bm2Error {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No matching device was seen before the scan timeout
    #[error("BM2 device not found: {0}")]
    DeviceNotFound(String),

    /// The transport did not finish connecting in time
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// The device did not acknowledge a write request
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// Closing the transport failed
    #[error("Disconnect error: {0}")]
    DisconnectError(String),

    /// Unsubscribe was requested while no subscription is active
    #[error("Notification channel is not subscribed")]
    NotSubscribed,

    /// The session is in the wrong state for the requested operation
    #[error("Invalid connection state: expected {expected}, found {actual}")]
    InvalidState {
        /// State the operation requires
        expected: ConnectionState,
        /// State the session was actually in
        actual: ConnectionState,
    },

    /// Payload parsing failed
    #[error("Failed to parse payload: {0}")]
    ParseError(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for BM2 operations
pub type Result<T> = std::result::Result<T, Bm2Error>;

impl Bm2Error {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::DeviceNotFound(_)
                | Self::ConnectTimeout { .. }
                | Self::ConnectionFailed(_)
        )
    }

    /// Check if this error is expected noise while tearing a connection down
    #[must_use]
    pub const fn is_benign_cleanup(&self) -> bool {
        matches!(self, Self::NotSubscribed)
    }

    /// Check if processing can simply continue with the next frame or request
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ParseError(_) | Self::ConnectTimeout { .. } | Self::WriteRejected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = Bm2Error::DeviceNotFound("BM2".to_string());
        assert!(not_found.is_connection_error());
        assert!(!not_found.is_recoverable());
        assert!(!not_found.is_benign_cleanup());

        let timeout = Bm2Error::ConnectTimeout { timeout_ms: 10_000 };
        assert!(timeout.is_connection_error());
        assert!(timeout.is_recoverable());

        let parse = Bm2Error::ParseError("short".to_string());
        assert!(!parse.is_connection_error());
        assert!(parse.is_recoverable());
    }

    #[test]
    fn test_only_not_subscribed_is_benign() {
        assert!(Bm2Error::NotSubscribed.is_benign_cleanup());
        assert!(!Bm2Error::DisconnectError("gone".to_string()).is_benign_cleanup());
        assert!(!Bm2Error::WriteRejected("nack".to_string()).is_benign_cleanup());
    }

    #[test]
    fn test_error_display() {
        let error = Bm2Error::InvalidState {
            expected: ConnectionState::Subscribed,
            actual: ConnectionState::Disconnected,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("expected Subscribed"));
        assert!(error_string.contains("found Disconnected"));

        let error = Bm2Error::ConnectTimeout { timeout_ms: 2500 };
        assert_eq!(error.to_string(), "Connection timed out after 2500ms");
    }
}
