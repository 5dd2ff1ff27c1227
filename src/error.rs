/// Unified error handling for the pasarela proxy
///
/// Covers configuration-time failures, per-connection routing and dial
/// failures, health probe failures, and registry invariant violations.

use std::fmt;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for pasarela operations
#[derive(Debug, Error)]
pub enum PasarelaError {
    /// Network-related errors (listener bind, accept)
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No backend is currently active, so a client cannot be routed
    #[error("No active backend")]
    NoActiveBackend,

    /// Dialing the active backend failed
    #[error("Error establishing connection to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Traffic has been administratively disabled
    #[error("Traffic disabled for backend {backend}")]
    TrafficDisabled { backend: String },

    /// A bridge was removed from a registry that does not track it
    #[error("Bridge not found")]
    BridgeNotFound,

    /// Health probe errors
    #[error("Health check failed: {message}")]
    HealthCheck { message: String },

    /// ARP cache inspection or invalidation errors
    #[error("{message}")]
    Arp { message: String },

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for pasarela operations
pub type PasarelaResult<T> = Result<T, PasarelaError>;

impl PasarelaError {
    /// Create a dial error for the given backend address
    pub fn dial<S: Into<String>>(addr: S, source: io::Error) -> Self {
        PasarelaError::Dial {
            addr: addr.into(),
            source,
        }
    }

    /// Create a health check error
    pub fn health_check<S: Into<String>>(message: S) -> Self {
        PasarelaError::HealthCheck {
            message: message.into(),
        }
    }

    /// Create an ARP error
    pub fn arp<S: Into<String>>(message: S) -> Self {
        PasarelaError::Arp {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        PasarelaError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PasarelaError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is transient (the next connection or probe may succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PasarelaError::Network(_)
                | PasarelaError::NoActiveBackend
                | PasarelaError::Dial { .. }
                | PasarelaError::TrafficDisabled { .. }
                | PasarelaError::HealthCheck { .. }
                | PasarelaError::Arp { .. }
                | PasarelaError::Timeout { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PasarelaError::Config(_) => ErrorSeverity::Critical,
            PasarelaError::Internal { .. } => ErrorSeverity::Critical,
            // Removing an untracked bridge is a logic bug
            PasarelaError::BridgeNotFound => ErrorSeverity::Critical,
            PasarelaError::Network(_) => ErrorSeverity::Warning,
            PasarelaError::NoActiveBackend => ErrorSeverity::Warning,
            PasarelaError::Dial { .. } => ErrorSeverity::Warning,
            PasarelaError::Timeout { .. } => ErrorSeverity::Warning,
            PasarelaError::TrafficDisabled { .. } => ErrorSeverity::Info,
            PasarelaError::HealthCheck { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
