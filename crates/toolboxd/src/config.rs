use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

const FALLBACK_DATA_DIR: &str = "/tmp/toolbox";

lazy_static! {
    static ref CONFIG: RwLock<Option<Arc<Config>>> = RwLock::new(None);
}

fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(dir);
    }
    expanduser::expanduser("~/.local/share").unwrap_or_else(|_| PathBuf::from(FALLBACK_DATA_DIR))
}

fn runtime_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from(format!("/run/user/{}", nix::unistd::Uid::current()))
}

/// Where the per-container mount points and the default link live
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Env {
    pub root: PathBuf,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            root: data_dir().join("toolbox").join("env"),
        }
    }
}

/// The container runtime collaborator
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Executable used to list, start and stop containers
    pub podman: PathBuf,
    /// Directory holding the runtime's control socket; any activity
    /// in it triggers a reconciliation pass
    pub socket_dir: PathBuf,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            podman: PathBuf::from("podman"),
            socket_dir: runtime_dir().join("libpod").join("tmp").join("socket"),
        }
    }
}

/// The daemon's own request socket
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Server {
    pub socket: PathBuf,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            socket: runtime_dir().join("toolbox").join("envd.sock"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub env: Env,
    pub runtime: Runtime,
    pub server: Server,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        let mut lock = CONFIG.write().map_err(|err| {
            crate::Error::String(format!("Cannot load config, lock has been poisoned: {err:?}"))
        })?;
        Ok(lock.insert(Arc::new(self)).clone())
    }
}

pub fn get_config() -> Result<Arc<Config>> {
    let lock = CONFIG.read().map_err(|err| {
        crate::Error::String(format!("Cannot load config, lock has been poisoned: {err:?}"))
    })?;
    if let Some(config) = &*lock {
        return Ok(config.clone());
    }
    drop(lock);

    // there is still a possible race condition here
    // where someone loads the config between the first check and
    // acquiring this lock, but the redundant work is still
    // less than not having a cache at all
    let config = load_config()?;
    config.make_current()
}

/// Load the daemon configuration from disk, even if it's already been loaded.
///
/// This includes the system and user configurations, if they exist,
/// with TOOLBOX_* environment variables layered on top.
pub fn load_config() -> Result<Config> {
    use config::{Config as RawConfig, Environment, File};

    let user_config_dir = "~/.config/toolbox/envd";
    let user_config = expanduser::expanduser(user_config_dir).map_err(|err| {
        crate::Error::InvalidPath {
            path: user_config_dir.into(),
            err,
        }
    })?;

    let config = RawConfig::builder()
        .add_source(File::with_name("/etc/toolbox/envd").required(false))
        .add_source(File::with_name(&user_config.to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("TOOLBOX").separator("__"))
        .build()?;

    Ok(config.try_deserialize()?)
}
