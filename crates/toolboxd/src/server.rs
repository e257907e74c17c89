//! The request socket clients use to start and stop containers
//!
//! The wire format is one JSON object per line in each direction:
//! `{"verb": "start", "name": "fedora-toolbox-40"}` answered by
//! `{"status": "ok"}` or `{"status": "error", "message": "..."}`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./server_test.rs"]
mod server_test;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum Request {
    Start { name: String },
    Stop { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok,
    Error { message: String },
}

impl Response {
    pub fn from_result(result: &std::result::Result<(), String>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(message) => Response::Error {
                message: message.clone(),
            },
        }
    }
}

/// Bind the request socket, replacing any stale file left behind
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    UnixListener::bind(path).map_err(Error::from)
}

/// Read a single request line from a freshly accepted connection.
///
/// Returns the stream along with the parsed request (or `None` when the
/// client sent garbage) so a response can still be written either way.
pub async fn read_request(stream: UnixStream) -> (Option<Request>, UnixStream) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let request = match reader.read_line(&mut line).await {
        Ok(0) => None,
        Ok(_) => serde_json::from_str(&line)
            .map_err(|err| tracing::debug!(?err, "malformed request: {}", line.trim_end()))
            .ok(),
        Err(err) => {
            tracing::debug!(?err, "failed to read request");
            None
        }
    };
    (request, reader.into_inner())
}

pub async fn write_response(stream: &mut UnixStream, response: &Response) -> Result<()> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    stream.write_all(payload.as_bytes()).await?;
    Ok(())
}
