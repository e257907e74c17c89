//! Reconciliation of the runtime's container list with mounts, mount-point
//! directories and the default-environment link

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use inotify::{EventStream, Inotify, WatchMask};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

use crate::container::{Container, Verb};
use crate::exec::Executables;
use crate::podman::{self, ContainerInfo};
use crate::server::{self, Request, Response};
use crate::{mounts, Config, Error, Result};

#[cfg(test)]
#[path = "./supervisor_test.rs"]
mod supervisor_test;

const DEFAULT_LINK: &str = "_default";
const DEFAULT_PREFIX: &str = "fedora-toolbox";

/// Completions delivered back to the supervisor loop
pub enum Event {
    /// A `podman ps` subprocess finished and its output was parsed
    Listed(Result<Vec<ContainerInfo>>),
    /// A `podman start`/`podman stop` subprocess finished
    Completed {
        name: String,
        verb: Verb,
        result: Result<()>,
    },
    /// A client connection produced a request (or garbage)
    Request {
        request: Option<Request>,
        stream: UnixStream,
    },
    /// A response was written back to a client
    Replied { ok: bool },
}

/// Subprocess and connection futures multiplexed by the supervisor loop.
///
/// Everything runs on the one loop thread; the container table is never
/// touched from anywhere else.
pub type Jobs = FuturesUnordered<LocalBoxFuture<'static, Event>>;

pub struct Supervisor {
    config: Arc<Config>,
    executables: Executables,
    containers: HashMap<String, Container>,
    listing: bool,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, executables: Executables) -> Self {
        Self {
            config,
            executables,
            containers: HashMap::new(),
            listing: false,
        }
    }

    fn envroot(&self) -> &Path {
        &self.config.env.root
    }

    /// Run until interrupted, then unmount everything
    pub async fn run(&mut self) -> Result<()> {
        std::fs::create_dir_all(self.envroot())?;
        mounts::sweep_stale(self.envroot()).await;

        let listener = server::bind(&self.config.server.socket)?;
        let mut watch = watch_directory(&self.config.runtime.socket_dir);
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let mut jobs: Jobs = Jobs::new();
        self.trigger_listing(&mut jobs);

        loop {
            tokio::select! {
                _ = next_change(&mut watch) => self.trigger_listing(&mut jobs),
                Some(event) = jobs.next(), if !jobs.is_empty() => {
                    self.handle_event(event, &mut jobs).await;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        jobs.push(
                            async move {
                                let (request, stream) = server::read_request(stream).await;
                                Event::Request { request, stream }
                            }
                            .boxed_local(),
                        );
                    }
                    Err(err) => tracing::warn!(?err, "failed to accept connection"),
                },
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                    break;
                }
            }
        }

        self.shutdown().await;
        let _ = std::fs::remove_file(&self.config.server.socket);
        Ok(())
    }

    async fn handle_event(&mut self, event: Event, jobs: &mut Jobs) {
        match event {
            Event::Listed(result) => {
                // clear the in-flight marker first so a trigger arriving
                // mid-refresh starts a fresh listing afterwards
                self.listing = false;
                match result {
                    Ok(list) => self.refresh(list).await,
                    Err(err) => tracing::error!("podman ps failed: {err}"),
                }
            }
            Event::Completed { name, verb, result } => self.complete(&name, verb, result),
            Event::Request { request, stream } => self.dispatch(request, stream, jobs),
            Event::Replied { ok } => {
                if ok {
                    self.trigger_listing(jobs);
                }
            }
        }
    }

    /// Queue one listing subprocess unless one is already in flight
    fn trigger_listing(&mut self, jobs: &mut Jobs) {
        if self.listing {
            return;
        }
        self.listing = true;
        let podman = self.config.runtime.podman.clone();
        jobs.push(
            async move { Event::Listed(podman::list_containers(&podman).await) }.boxed_local(),
        );
    }

    /// Complete every waiter of a finished start/stop subprocess
    fn complete(&mut self, name: &str, verb: Verb, result: Result<()>) {
        let waiters = match self.containers.get_mut(name) {
            Some(container) => container.take_pending(verb),
            None => Vec::new(),
        };
        let outcome = match &result {
            Ok(()) => {
                match verb {
                    Verb::Start => tracing::info!("Container {name} started"),
                    Verb::Stop => tracing::info!("Container {name} stopped"),
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!("podman {verb} failed: {err}");
                Err(err.to_string())
            }
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Route a client request into the container table and queue the reply
    fn dispatch(&mut self, request: Option<Request>, mut stream: UnixStream, jobs: &mut Jobs) {
        let receiver = match request {
            Some(Request::Start { name }) => {
                tracing::info!("Start {name}");
                self.start_container(&name, jobs)
            }
            Some(Request::Stop { name }) => {
                tracing::info!("Stop {name}");
                self.stop_container(&name, jobs)
            }
            None => completed(Err("invalid request".to_owned())),
        };
        jobs.push(
            async move {
                let result = receiver
                    .await
                    .unwrap_or_else(|_| Err("request interrupted".to_owned()));
                let response = Response::from_result(&result);
                if let Err(err) = server::write_response(&mut stream, &response).await {
                    tracing::debug!(?err, "failed to write response");
                }
                Event::Replied { ok: result.is_ok() }
            }
            .boxed_local(),
        );
    }

    fn start_container(&mut self, name: &str, jobs: &mut Jobs) -> oneshot::Receiver<std::result::Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        match self.containers.get_mut(name) {
            None => {
                let _ = tx.send(Err(Error::UnknownContainer(name.to_owned()).to_string()));
            }
            Some(container) => container.start(tx, self.config.runtime.podman.clone(), jobs),
        }
        rx
    }

    fn stop_container(&mut self, name: &str, jobs: &mut Jobs) -> oneshot::Receiver<std::result::Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        match self.containers.get_mut(name) {
            None => {
                let _ = tx.send(Err(Error::UnknownContainer(name.to_owned()).to_string()));
            }
            Some(container) => container.stop(tx, self.config.runtime.podman.clone(), jobs),
        }
        rx
    }

    /// One reconciliation pass: converge the table, the mount-point
    /// directories and the default link onto the runtime's snapshot.
    ///
    /// Everything here tolerates per-entry I/O errors; only a failure to
    /// enumerate the environment root aborts the pass.
    async fn refresh(&mut self, list: Vec<ContainerInfo>) {
        let envroot = self.envroot().to_path_buf();
        let old = match scan_envroot(&envroot) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!("Failed to list contents of {}: {err}", envroot.display());
                return;
            }
        };

        for name in &old.extra {
            let child = envroot.join(name);
            if let Err(err) = std::fs::remove_file(&child) {
                tracing::error!("Unable to delete {}: {err}", child.display());
            }
        }

        let new: HashMap<String, ContainerInfo> = list
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();

        for info in new.values() {
            if !old.dirs.contains(&info.name) {
                let child = envroot.join(&info.name);
                if let Err(err) = std::fs::create_dir(&child) {
                    tracing::error!("Unable to create {}: {err}", child.display());
                }
            }
            if self.containers.contains_key(&info.name) {
                self.update_container(info).await;
            } else {
                self.add_container(info.clone());
            }
        }

        let new_default = select_default(new.values()).map(str::to_owned);

        let stale: Vec<String> = self
            .containers
            .keys()
            .filter(|name| !new.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            self.remove_container(&name).await;
        }

        for name in old.dirs.iter().filter(|name| !new.contains_key(*name)) {
            let child = envroot.join(name);
            if let Err(err) = std::fs::remove_dir(&child) {
                tracing::error!("Unable to delete {}: {err}", child.display());
            }
        }

        if new_default != old.default_target {
            let link = envroot.join(DEFAULT_LINK);
            if old.default_target.is_some() {
                if let Err(err) = std::fs::remove_file(&link) {
                    tracing::error!("Unable to delete {}: {err}", link.display());
                }
            }
            if let Some(target) = &new_default {
                if let Err(err) = std::os::unix::fs::symlink(target, &link) {
                    tracing::error!("Unable to create default symlink: {err}");
                }
            }
        }
    }

    async fn update_container(&mut self, info: &ContainerInfo) {
        let Some(container) = self.containers.get_mut(&info.name) else {
            return;
        };
        container.update(info.clone(), &self.executables).await;
    }

    fn add_container(&mut self, info: ContainerInfo) {
        tracing::info!("{}: Add (ID={}, Pid={})", info.name, info.id, info.pid);
        let mut container = Container::new(self.envroot().to_path_buf(), info);
        if container.pid() != 0 {
            if let Err(err) = container.mount(&self.executables) {
                tracing::error!("Failed to mount {}: {err}", container.name());
            }
        }
        self.containers.insert(container.name().to_owned(), container);
    }

    async fn remove_container(&mut self, name: &str) {
        let Some(mut container) = self.containers.remove(name) else {
            return;
        };
        tracing::info!("{name}: Remove");
        if container.is_mounted() {
            if let Err(err) = container.unmount().await {
                tracing::error!("Failed to unmount {name}: {err}");
            }
        }
        container.abort_pending("container removed");
    }

    /// Unmount every mounted entry before exiting
    async fn shutdown(&mut self) {
        for container in self.containers.values_mut() {
            if container.pid() != 0 && container.is_mounted() {
                if let Err(err) = container.unmount().await {
                    tracing::error!("Failed to unmount {}: {err}", container.name());
                }
            }
        }
    }
}

/// A completion that is already resolved
fn completed(
    result: std::result::Result<(), String>,
) -> oneshot::Receiver<std::result::Result<(), String>> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

struct EnvrootState {
    dirs: HashSet<String>,
    default_target: Option<String>,
    extra: Vec<String>,
}

/// Classify the children of the environment root.
///
/// Anything that is not a directory or the default link is garbage to be
/// removed by the pass.
fn scan_envroot(envroot: &Path) -> Result<EnvrootState> {
    let mut state = EnvrootState {
        dirs: HashSet::new(),
        default_target: None,
        extra: Vec::new(),
    };

    for entry in std::fs::read_dir(envroot)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!("Failed to list contents of {}: {err}", envroot.display());
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(meta) = entry.path().symlink_metadata() else {
            continue;
        };
        if meta.is_dir() {
            state.dirs.insert(name);
        } else if meta.is_symlink() && name == DEFAULT_LINK {
            state.default_target = std::fs::read_link(entry.path())
                .ok()
                .map(|target| target.to_string_lossy().into_owned());
        } else {
            state.extra.push(name);
        }
    }

    Ok(state)
}

/// The default environment is the alphabetically greatest toolbox name
fn select_default<'a, I>(infos: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a ContainerInfo>,
{
    infos
        .into_iter()
        .filter(|info| info.name.starts_with(DEFAULT_PREFIX))
        .map(|info| info.name.as_str())
        .max()
}

fn watch_directory(dir: &Path) -> Option<EventStream<Vec<u8>>> {
    let inotify = match Inotify::init() {
        Ok(inotify) => inotify,
        Err(err) => {
            tracing::warn!(?err, "failed to initialize inotify");
            return None;
        }
    };
    if let Err(err) = inotify.watches().add(dir, WatchMask::ALL_EVENTS) {
        tracing::warn!(?err, "failed to watch {}", dir.display());
        return None;
    }
    match inotify.into_event_stream(vec![0u8; 1024]) {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(?err, "failed to start inotify stream");
            None
        }
    }
}

/// Wait for any activity in the watched directory; pends forever once the
/// watch is gone so the select loop falls back to the other sources
async fn next_change(watch: &mut Option<EventStream<Vec<u8>>>) {
    let Some(stream) = watch.as_mut() else {
        return std::future::pending().await;
    };
    if stream.next().await.is_none() {
        tracing::warn!("socket watch ended");
        *watch = None;
    }
}
