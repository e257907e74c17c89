use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    String(String),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    JSON(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("Failed to invoke {path}: {err}")]
    InvalidPath {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("Failed to spawn {command}: {err}")]
    ProcessSpawnError {
        command: String,
        #[source]
        err: io::Error,
    },
    #[error("Command {command} exited with status {status}")]
    CommandFailed { command: String, status: i32 },
    #[error("Cannot find the {0} binary next to the daemon")]
    MissingBinary(&'static str),
    #[error("No such container: {0}")]
    UnknownContainer(String),
}

impl Error {
    pub fn process_spawn_error<S: Into<String>>(command: S, err: io::Error) -> Error {
        Error::ProcessSpawnError {
            command: command.into(),
            err,
        }
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::String(err.to_owned())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::String(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
