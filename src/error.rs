use thiserror::Error;

/// Errors that can occur when working with Domyos bikes
#[derive(Error, Debug)]
pub enum BikeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No matching bike was found during scanning
    #[error("Domyos bike not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The communication service is missing from the GATT table
    #[error("Communication service not found")]
    ServiceNotFound,

    /// A required characteristic is missing from the communication service
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame parsing failed
    #[error("Failed to parse frame: {0}")]
    ParseError(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bike operations
pub type Result<T> = std::result::Result<T, BikeError>;

impl BikeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::ServiceNotFound
                | Self::CharacteristicNotFound(_)
        )
    }

    /// Check if the session can carry on after this error without reconnecting
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ParseError(_) | Self::InvalidParameters(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = BikeError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());

        let missing = BikeError::CharacteristicNotFound("notify".to_string());
        assert!(missing.is_connection_error());

        let timeout_error = BikeError::Timeout { timeout_ms: 300 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let config_error = BikeError::Config("bad".to_string());
        assert!(!config_error.is_connection_error());
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = BikeError::InvalidParameters("resistance out of range".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameters"));
        assert!(error_string.contains("resistance out of range"));

        let timeout = BikeError::Timeout { timeout_ms: 300 };
        assert_eq!(timeout.to_string(), "Operation timed out after 300ms");
    }
}
