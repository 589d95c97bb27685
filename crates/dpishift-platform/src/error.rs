//! Platform-specific errors

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// NFQUEUE handle could not be opened or bound
    #[error("Queue {queue} unavailable: {source}")]
    QueueBind {
        /// Queue number
        queue: u16,
        /// Underlying netlink error
        #[source]
        source: std::io::Error,
    },

    /// Receiving from a bound queue failed
    #[error("Queue {queue} receive failed: {source}")]
    Recv {
        /// Queue number
        queue: u16,
        /// Underlying netlink error
        #[source]
        source: std::io::Error,
    },

    /// The kernel rejected a verdict
    #[error("Queue {queue} verdict failed: {source}")]
    Verdict {
        /// Queue number
        queue: u16,
        /// Underlying netlink error
        #[source]
        source: std::io::Error,
    },

    /// Raw socket creation or configuration failed
    #[error("Raw {family} socket: {source}")]
    RawSocket {
        /// "IPv4" or "IPv6"
        family: &'static str,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Worker thread could not be started
    #[error("Worker thread: {0}")]
    Thread(String),

    /// Engine error
    #[error(transparent)]
    Core(#[from] dpishift_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Classify a raw socket error, singling out missing privileges
    pub fn raw_socket(family: &'static str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(format!(
                "raw {family} sockets need CAP_NET_RAW (run as root)"
            ))
        } else {
            Self::RawSocket { family, source }
        }
    }

    /// Classify a queue bind error, singling out missing privileges
    pub fn queue_bind(queue: u16, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(format!(
                "binding NFQUEUE {queue} needs CAP_NET_ADMIN (run as root)"
            ))
        } else {
            Self::QueueBind { queue, source }
        }
    }
}

/// Platform result type
pub type Result<T> = std::result::Result<T, PlatformError>;
