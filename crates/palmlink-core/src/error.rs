//! Error types for palmlink-core
//!
//! Each component has its own error enum; [`Error`] wraps them for callers
//! that drive several components at once (the daemon and the binary).

use thiserror::Error;

pub use crate::channel::ChannelError;
pub use crate::credentials::CredentialsError;
pub use crate::delivery::DeliveryError;
pub use crate::instance_lock::LockError;
pub use crate::pairing::PairingError;
pub use crate::registry::RegistryError;
pub use crate::tunnel::TunnelError;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Client registry failure
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Pairing protocol failure
    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// Secure channel failure
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Delivery queue failure
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Tunnel supervisor failure
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Single-instance lock failure
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Local credentials failure
    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    /// Filesystem watcher failure
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Plain I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests;
