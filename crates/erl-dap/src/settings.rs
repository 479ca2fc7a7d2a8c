use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::connector::NodeConnector;
use crate::dist::DEFAULT_EPMD_PORT;
use crate::launcher::{ProcessLauncher, default_external_terminal};
use crate::session::Backends;

#[derive(Parser, Debug, Clone)]
#[command(name = "erl-dap")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Debug adapter that launches or attaches to Erlang nodes over the Debug Adapter Protocol.",
    long_about = None
)]
pub struct AdapterSettings {
    /// Log filter, e.g. `info` or `erl_dap=debug`
    #[arg(long, env = "ERL_DAP_LOG", default_value = "info")]
    pub log_level: String,

    /// Port of the Erlang port mapper daemon
    #[arg(long, env = "ERL_EPMD_PORT", default_value_t = DEFAULT_EPMD_PORT)]
    pub epmd_port: u16,

    /// Command prefix used for `"kind": "external"` launches
    #[arg(long, env = "ERL_DAP_EXTERNAL_TERMINAL", value_delimiter = ' ', num_args = 1..)]
    pub external_terminal: Option<Vec<String>>,

    /// Time a launched node may take to fail before it counts as started
    #[arg(long, default_value_t = 200)]
    pub startup_grace_ms: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            epmd_port: DEFAULT_EPMD_PORT,
            external_terminal: None,
            startup_grace_ms: 200,
        }
    }
}

impl AdapterSettings {
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    }

    pub fn backends(&self) -> Backends {
        let external_terminal = self
            .external_terminal
            .clone()
            .unwrap_or_else(default_external_terminal);

        Backends {
            launcher: Arc::new(ProcessLauncher::new(
                external_terminal,
                Duration::from_millis(self.startup_grace_ms),
            )),
            connector: Arc::new(NodeConnector::new(self.epmd_port)),
        }
    }
}
