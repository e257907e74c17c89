use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    String(String),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    IO(#[from] io::Error),
}

impl Error {
    /// The errno to hand back to the kernel for this error
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Nix(err) => Some(*err as i32),
            Error::IO(err) => err.raw_os_error(),
            Error::String(_) => None,
        }
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::String(err.to_owned())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
