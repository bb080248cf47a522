//! Server module for palmlink
//!
//! # Module Structure
//!
//! - `config`: Configuration structures and validation
//! - `loader`: Configuration loading from files and environment
//! - `shutdown`: Ctrl+C / SIGTERM handling
//! - `init`: Daemon startup and run loop

pub mod config;
mod init;
mod loader;
mod shutdown;

pub use init::run;
pub use loader::load_config;
