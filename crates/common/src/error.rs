//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The host worker thread has exited and no longer accepts commands
    #[error("USB host stopped")]
    HostStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
