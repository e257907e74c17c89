use std::path::Path;

use clap::Parser;
use toolbox_cli_common as cli;
use toolboxd::{Executables, Supervisor};

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let opt = CmdEnvd::parse();
    opt.logging.configure();

    let config = match toolboxd::get_config() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };

    let argv0 = std::env::args_os()
        .next()
        .unwrap_or_else(|| "toolboxd".into());
    let executables = Executables::discover(Path::new(&argv0));

    // namespaces, the container table and all subprocess bookkeeping stay
    // on this one thread
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Err(err) => {
            tracing::error!("Failed to establish runtime: {err:?}");
            return 1;
        }
        Ok(rt) => rt,
    };

    let result = rt.block_on(async move { Supervisor::new(config, executables).run().await });
    rt.shutdown_timeout(std::time::Duration::from_millis(250));

    match result {
        Err(err) => {
            tracing::error!("{err}");
            1
        }
        Ok(()) => 0,
    }
}

/// Watch the container runtime and expose every toolbox container's
/// filesystem under the environment root
#[derive(Debug, Parser)]
#[clap(name = "toolboxd")]
pub struct CmdEnvd {
    #[clap(flatten)]
    logging: cli::Logging,
}
