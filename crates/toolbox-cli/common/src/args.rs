use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::prelude::*;

const TOOLBOX_LOG: &str = "TOOLBOX_LOG";

/// Command line flags for configuring logging
#[derive(Debug, Clone, clap::Args)]
pub struct Logging {
    /// Make the logging more verbose, can be given more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to the given file
    #[clap(long, global = true, env = "TOOLBOX_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Logging {
    pub fn configure(&self) {
        let mut config = match self.verbose {
            0 => {
                if let Ok(existing) = std::env::var(TOOLBOX_LOG) {
                    existing
                } else {
                    "toolboxd=info,toolbox_vfs=info,warn".to_string()
                }
            }
            1 => "toolboxd=debug,toolbox_vfs=debug,info".to_string(),
            2 => "toolboxd=trace,toolbox_vfs=trace,info".to_string(),
            3 => "toolboxd=trace,toolbox_vfs=trace,debug".to_string(),
            _ => "trace".to_string(),
        };
        std::env::set_var(TOOLBOX_LOG, &config);
        if let Ok(overrides) = std::env::var("RUST_LOG") {
            config.push(',');
            config.push_str(&overrides);
        }

        let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .without_time()
            .with_target(self.verbose > 2);

        let file_layer = self.log_file.as_ref().and_then(|path| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| eprintln!("Cannot open log file {}: {err}", path.display()))
                .ok()?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
        });

        let sub = tracing_subscriber::Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer);
        tracing::subscriber::set_global_default(sub).expect("logging initialized once");
    }
}
