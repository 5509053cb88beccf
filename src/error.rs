//! Error types for tapvm.

use thiserror::Error;

/// Result type alias using tapvm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tapvm operations.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    /// Failed to read or parse the config file.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// The network configuration cannot produce a usable lease.
    #[error("network configuration error: {0}")]
    Config(String),

    // Interface errors
    /// A kernel networking operation on the tap device failed.
    #[error("interface setup failed: {0}")]
    Interface(String),

    // VM lifecycle errors
    /// Failed to spawn the qemu process.
    #[error("failed to launch qemu: {0}")]
    Launch(String),

    /// The QMP control socket is unreachable or spoke garbage.
    #[error("management channel error: {0}")]
    ManagementChannel(String),

    /// The wait call for the qemu child itself failed.
    #[error("wait for vm process failed: {0}")]
    Reap(std::io::Error),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a network configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an interface error with a message.
    pub fn interface(msg: impl Into<String>) -> Self {
        Self::Interface(msg.into())
    }

    /// Create a launch error with a message.
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a management channel error with a message.
    pub fn management(msg: impl Into<String>) -> Self {
        Self::ManagementChannel(msg.into())
    }
}
