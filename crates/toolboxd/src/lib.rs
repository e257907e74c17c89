//! Supervision of per-container environment filesystems.
//!
//! Watches the container runtime, maintains one mount-point directory and
//! one filesystem child per eligible container under the environment root,
//! and answers start/stop requests from clients over a local socket.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod container;
mod error;
pub mod exec;
pub mod mounts;
pub mod podman;
pub mod server;
pub mod supervisor;

pub use config::{get_config, load_config, Config};
pub use error::{Error, Result};
pub use exec::Executables;
pub use supervisor::Supervisor;
