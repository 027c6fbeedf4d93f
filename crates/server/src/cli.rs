//! Command-line overrides for the server binary.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "chatlog-server",
    version,
    about = "Background task scheduler with live websocket status"
)]
pub struct Cli {
    /// Bind address; overrides `HOST` from the environment profile.
    #[arg(long, env = "CHATLOG_HOST")]
    pub host: Option<String>,

    /// Bind port; overrides `PORT` from the environment profile.
    #[arg(long, env = "CHATLOG_PORT")]
    pub port: Option<u16>,

    /// Worker limit; overrides `TASK_MAX_WORKERS`.
    #[arg(long)]
    pub max_workers: Option<usize>,
}

impl Cli {
    /// Fold the flags into an already-loaded config.
    pub fn apply(&self, config: &mut chatlog_core::Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(workers) = self.max_workers {
            config.scheduler.max_workers = workers;
        }
    }
}
