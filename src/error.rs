//! Error handling for the passive tap service.

use thiserror::Error;

/// Service error type.
///
/// Variants map to the failure taxonomy of the capture pipeline:
/// configuration defects are fatal at startup, connection errors feed
/// the reconnect loop, and storage errors are logged per destination
/// without propagating.
#[derive(Error, Debug, Clone)]
pub enum TapSrvError {
    /// Configuration load or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Frame or payload structure errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Data handling errors (parsing, conversion)
    #[error("Data error: {0}")]
    Data(String),

    /// Storage destination errors
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for the tap service
pub type Result<T> = std::result::Result<T, TapSrvError>;

impl TapSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        TapSrvError::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        TapSrvError::Io(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        TapSrvError::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TapSrvError::Protocol(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        TapSrvError::Data(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        TapSrvError::Storage(msg.into())
    }
}

impl From<std::io::Error> for TapSrvError {
    fn from(err: std::io::Error) -> Self {
        TapSrvError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for TapSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        TapSrvError::Config(format!("YAML: {err}"))
    }
}

impl From<reqwest::Error> for TapSrvError {
    fn from(err: reqwest::Error) -> Self {
        TapSrvError::Storage(err.to_string())
    }
}
