//! Per-container lifecycle: start/stop coalescing and the filesystem child

use std::path::PathBuf;

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::exec::{Executables, ENVFS_HELPER, RUN_HELPER};
use crate::podman::{self, ContainerInfo};
use crate::supervisor::{Event, Jobs};
use crate::{mounts, Error, Result};

#[cfg(test)]
#[path = "./container_test.rs"]
mod container_test;

/// Completion handle for one client waiting on a start or stop
pub type Waiter = oneshot::Sender<std::result::Result<(), String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the supervisor's table.
///
/// Holds the last runtime snapshot, the waiters of any in-flight start or
/// stop subprocess, and the handle to the filesystem child while mounted.
pub struct Container {
    info: ContainerInfo,
    envroot: PathBuf,
    pending_starts: Vec<Waiter>,
    pending_stops: Vec<Waiter>,
    fuse_child: Option<tokio::process::Child>,
}

impl Container {
    pub fn new(envroot: PathBuf, info: ContainerInfo) -> Self {
        Self {
            info,
            envroot,
            pending_starts: Vec::new(),
            pending_stops: Vec::new(),
            fuse_child: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn pid(&self) -> i32 {
        self.info.pid
    }

    pub fn is_mounted(&self) -> bool {
        self.fuse_child.is_some()
    }

    pub fn mount_path(&self) -> PathBuf {
        self.envroot.join(&self.info.name)
    }

    /// Request that the runtime start this container.
    ///
    /// An already-running container completes the waiter right away.
    /// Concurrent requests coalesce onto the single in-flight subprocess:
    /// the first caller spawns `podman start`, everyone else just queues.
    pub fn start(&mut self, waiter: Waiter, podman: PathBuf, jobs: &mut Jobs) {
        if self.info.pid != 0 {
            let _ = waiter.send(Ok(()));
            return;
        }
        self.pending_starts.push(waiter);
        if self.pending_starts.len() > 1 {
            return;
        }
        let name = self.info.name.clone();
        jobs.push(
            async move {
                let result = podman::run_verb(&podman, "start", &name).await;
                Event::Completed {
                    name,
                    verb: Verb::Start,
                    result,
                }
            }
            .boxed_local(),
        );
    }

    /// Request that the runtime stop this container; symmetric to [`Self::start`]
    pub fn stop(&mut self, waiter: Waiter, podman: PathBuf, jobs: &mut Jobs) {
        if self.info.pid == 0 {
            let _ = waiter.send(Ok(()));
            return;
        }
        self.pending_stops.push(waiter);
        if self.pending_stops.len() > 1 {
            return;
        }
        let name = self.info.name.clone();
        jobs.push(
            async move {
                let result = podman::run_verb(&podman, "stop", &name).await;
                Event::Completed {
                    name,
                    verb: Verb::Stop,
                    result,
                }
            }
            .boxed_local(),
        );
    }

    /// Hand back every waiter of the finished subprocess
    pub fn take_pending(&mut self, verb: Verb) -> Vec<Waiter> {
        match verb {
            Verb::Start => std::mem::take(&mut self.pending_starts),
            Verb::Stop => std::mem::take(&mut self.pending_stops),
        }
    }

    /// Fail every queued waiter, used when the entry is destroyed
    pub fn abort_pending(&mut self, message: &str) {
        for waiter in self
            .pending_starts
            .drain(..)
            .chain(self.pending_stops.drain(..))
        {
            let _ = waiter.send(Err(message.to_owned()));
        }
    }

    /// Spawn the filesystem child serving this container's mount point
    pub fn mount(&mut self, executables: &Executables) -> Result<()> {
        if self.fuse_child.is_some() {
            return Err(format!("{} is already mounted", self.info.name).into());
        }
        if self.info.pid == 0 {
            return Err(format!("{} is not running", self.info.name).into());
        }

        let envfs = executables
            .resolve(ENVFS_HELPER)
            .ok_or(Error::MissingBinary(ENVFS_HELPER))?;
        let run = executables
            .resolve(RUN_HELPER)
            .ok_or(Error::MissingBinary(RUN_HELPER))?;
        let mount_path = self.mount_path();

        let child = tokio::process::Command::new(envfs)
            .arg(self.info.pid.to_string())
            .arg(&mount_path)
            .arg(run)
            .spawn()
            .map_err(|err| Error::process_spawn_error(ENVFS_HELPER, err))?;
        self.fuse_child = Some(child);
        tracing::info!("Mounted {} on {}", self.info.name, mount_path.display());
        Ok(())
    }

    /// Detach the mount and wait for the filesystem child to exit
    pub async fn unmount(&mut self) -> Result<()> {
        if self.fuse_child.is_none() {
            return Err(format!("{} is not mounted", self.info.name).into());
        }

        mounts::unmount(self.mount_path()).await?;

        if let Some(mut child) = self.fuse_child.take() {
            if let Err(err) = child.wait().await {
                tracing::warn!("Failed to wait for filesystem child exit: {err}");
            }
        }
        tracing::info!("Unmounted {}", self.info.name);
        Ok(())
    }

    /// Reconcile this entry against a fresh runtime snapshot.
    ///
    /// A pid transition always unmounts the old instance before mounting
    /// the new one; the previous init is gone even when both pids are
    /// nonzero.
    pub async fn update(&mut self, info: ContainerInfo, executables: &Executables) {
        if info.id != self.info.id {
            tracing::info!("{}: Update ID: {} => {}", self.info.name, self.info.id, info.id);
            self.info.id = info.id;
        }

        if info.pid != self.info.pid {
            tracing::info!(
                "{}: Update Pid: {} => {}",
                self.info.name,
                self.info.pid,
                info.pid
            );
            if self.info.pid != 0 && self.is_mounted() {
                if let Err(err) = self.unmount().await {
                    tracing::error!("Failed to unmount {}: {err}", self.info.name);
                }
            }
            self.info.pid = info.pid;
            if self.info.pid != 0 {
                if let Err(err) = self.mount(executables) {
                    tracing::error!("Failed to mount {}: {err}", self.info.name);
                }
            }
        }
    }
}
