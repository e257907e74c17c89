use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fuser::MountOption;
use tokio::signal::unix::{signal, SignalKind};
use toolbox_cli_common as cli;
use toolbox_vfs::Session;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    // any argument mistake is a setup failure, same as the rest
    let opt = match CmdEnvfs::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            let _ = err.print();
            return 1;
        }
    };
    opt.logging.configure();

    match opt.run() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            1
        }
    }
}

/// Serve one container's environment filesystem.
///
/// The mount presents an `exe` and a `raw` view of the container's root;
/// it is torn down by unmounting the mount path.
#[derive(Debug, Parser)]
#[clap(name = "toolbox-envfs")]
pub struct CmdEnvfs {
    #[clap(flatten)]
    logging: cli::Logging,

    /// Pid of the container's init on the host
    container_pid: u32,

    /// Where to mount the filesystem
    mount_path: PathBuf,

    /// Host binary substituted for executables in the exe view
    run_trampoline_path: PathBuf,
}

impl CmdEnvfs {
    pub fn run(&self) -> Result<i32> {
        // the container root must be resolved before joining the user
        // namespace, or the open would run under the new credentials
        let source = toolbox_vfs::open_container_root(self.container_pid)
            .context("Unable to open the container root")?;

        tracing::debug!("Establishing fuse session...");
        let fs = Session::new(source, self.run_trampoline_path.clone());
        let mut session = fuser::Session::new(fs, &self.mount_path, &[MountOption::RO])
            .context("Failed to create a FUSE session")?;

        if let Err(err) = toolbox_vfs::enter_user_namespace(self.container_pid) {
            // dropping the session tears the mount down again
            tracing::error!("Failed to enter the container user namespace: {err}");
            return Ok(1);
        }

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to establish runtime")?;

        let result = rt.block_on(async move {
            let mut interrupt =
                signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate =
                signal(SignalKind::terminate()).context("terminate signal handler")?;

            tracing::info!("Serving the environment filesystem");
            // the dispatch loop is blocking, so move it into the runtime
            // where the per-request tasks are scheduled
            let fut = tokio::task::spawn_blocking(move || session.run());
            tokio::select! {
                res = fut => {
                    tracing::info!("Filesystem shutting down");
                    res.context("FUSE session failed")
                }
                _ = terminate.recv() => Err(anyhow!("Terminate signal received, filesystem shutting down")),
                _ = interrupt.recv() => Err(anyhow!("Interrupt signal received, filesystem shutting down")),
                _ = quit.recv() => Err(anyhow!("Quit signal received, filesystem shutting down")),
            }
        });

        // don't block forever on stray request tasks when the runtime
        // is dropped
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result??;
        Ok(0)
    }
}
