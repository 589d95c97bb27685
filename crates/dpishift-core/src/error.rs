//! Error types for dpishift-core
//!
//! Centralized error handling using `thiserror`. Most packet-level failures
//! never leave the engine: they are turned into "pass the original through"
//! decisions by the worker. The variants here exist so that the layers can
//! say *why* they declined.

use thiserror::Error;

/// Main error type for dpishift-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Packet parsing failed
    #[error("Packet parsing error: {message}")]
    PacketParse {
        /// Detailed error message
        message: String,
        /// Offset in packet where error occurred
        offset: Option<usize>,
    },

    /// Packet is too small to process
    #[error("Packet too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall {
        /// Minimum expected size
        expected: usize,
        /// Actual packet size
        actual: usize,
    },

    /// Strategy could not build its plan
    #[error("Strategy '{strategy}' failed: {message}")]
    Strategy {
        /// Name of the strategy that failed
        strategy: &'static str,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Invalid CIDR notation in a target list
    #[error("Invalid CIDR '{cidr}': {reason}")]
    InvalidCidr {
        /// The offending entry
        cidr: String,
        /// Parser message
        reason: String,
    },

    /// Invalid regular expression in a target list
    #[error("Invalid domain regex '{pattern}': {reason}")]
    InvalidRegex {
        /// The offending pattern
        pattern: String,
        /// Compiler message
        reason: String,
    },

    /// Packet send failed
    #[error("Failed to send packet to {dst}: {source}")]
    Send {
        /// Destination address
        dst: std::net::IpAddr,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Hex decoding error
    #[error("Hex decoding error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a packet parse error
    pub fn packet_parse(message: impl Into<String>) -> Self {
        Self::PacketParse {
            message: message.into(),
            offset: None,
        }
    }

    /// Create a packet parse error with offset
    pub fn packet_parse_at(message: impl Into<String>, offset: usize) -> Self {
        Self::PacketParse {
            message: message.into(),
            offset: Some(offset),
        }
    }

    /// Create a truncation error
    pub fn too_small(expected: usize, actual: usize) -> Self {
        Self::PacketTooSmall { expected, actual }
    }

    /// Create a strategy error
    pub fn strategy(strategy: &'static str, message: impl Into<String>) -> Self {
        Self::Strategy {
            strategy,
            message: message.into(),
        }
    }

    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// True for errors caused by malformed or truncated input
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::PacketParse { .. } | Self::PacketTooSmall { .. })
    }
}
