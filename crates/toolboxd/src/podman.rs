//! Interrogation of the container runtime

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./podman_test.rs"]
mod podman_test;

const COMPONENT_LABEL: &str = "com.redhat.component";
const TOOLBOX_COMPONENT: &str = "fedora-toolbox";

/// Container states as reported by libpod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Unknown,
    Configured,
    Created,
    Running,
    Stopped,
    Paused,
}

impl From<i64> for ContainerState {
    fn from(state: i64) -> Self {
        match state {
            1 => Self::Configured,
            2 => Self::Created,
            3 => Self::Running,
            4 => Self::Stopped,
            5 => Self::Paused,
            _ => Self::Unknown,
        }
    }
}

/// A point-in-time snapshot of one eligible container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Pid of the container's init on the host, zero when not running
    pub pid: i32,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: i64,
    #[serde(rename = "Pid")]
    pid: i32,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

/// Parse the runtime's `ps` output into container snapshots.
///
/// Only entries carrying the toolbox component label are kept; entries
/// lacking any required field are silently skipped. The runtime reports
/// the pid a stopped container used to have, so the pid is zeroed for
/// anything not currently running.
pub fn parse_listing(output: &str) -> Result<Vec<ContainerInfo>> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(output)?;
    Ok(entries
        .into_iter()
        .filter_map(|value| {
            let entry: PsEntry = serde_json::from_value(value).ok()?;
            if entry.labels.get(COMPONENT_LABEL).map(String::as_str) != Some(TOOLBOX_COMPONENT) {
                return None;
            }
            let pid = if ContainerState::from(entry.state) == ContainerState::Running {
                entry.pid
            } else {
                0
            };
            Some(ContainerInfo {
                id: entry.id,
                name: entry.names,
                pid,
            })
        })
        .collect())
}

/// Ask the runtime for all containers, running or not
pub async fn list_containers(podman: &Path) -> Result<Vec<ContainerInfo>> {
    let output = tokio::process::Command::new(podman)
        .args(["ps", "-a", "--format=json", "--no-trunc", "--namespace"])
        .output()
        .await
        .map_err(|err| Error::process_spawn_error("podman ps", err))?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: "podman ps".into(),
            status: output.status.code().unwrap_or(-1),
        });
    }
    parse_listing(&String::from_utf8_lossy(&output.stdout))
}

/// Run `podman start <name>` or `podman stop <name>` to completion
pub async fn run_verb(podman: &Path, verb: &str, name: &str) -> Result<()> {
    let status = tokio::process::Command::new(podman)
        .arg(verb)
        .arg(name)
        .status()
        .await
        .map_err(|err| Error::process_spawn_error(format!("podman {verb}"), err))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: format!("podman {verb} {name}"),
            status: status.code().unwrap_or(-1),
        })
    }
}
