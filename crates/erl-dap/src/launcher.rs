use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{LaunchConfig, RunInTerminal, TerminalKind};
use crate::log::DEBUGGEE_TARGET;
use crate::node::{NameDomain, NodeId};

pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable `{0}` not found")]
    NotFound(String),
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited immediately with {status}")]
    ExitedEarly { program: String, status: ExitStatus },
    #[error("no external terminal configured")]
    NoExternalTerminal,
}

/// Code the debuggee evaluates at startup to become reachable: it starts
/// distribution unless the command line already did, then installs a
/// generated cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPayload {
    pub node: NodeId,
    pub cookie: String,
    pub code: String,
}

impl InitPayload {
    /// Payload for a node named by the adapter.
    pub fn generate(name_domain: NameDomain) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let node = NodeId::new(format!("erl_dap_target_{}", &id[..12]), name_domain.local_host());
        Self::for_node(node, name_domain)
    }

    /// Payload for a node whose name is already fixed, e.g. by `-sname` in the
    /// debuggee's args.
    pub fn for_node(node: NodeId, name_domain: NameDomain) -> Self {
        let cookie = Uuid::new_v4().simple().to_string();
        let code = format!(
            "case net_kernel:start(['{node}', {name_domain}]) of \
             {{ok, _}} -> ok; {{error, {{already_started, _}}}} -> ok end, \
             true = erlang:set_cookie(node(), '{cookie}')."
        );

        Self { node, cookie, code }
    }
}

/// Fully resolved process request: final argument vector and environment
/// overlay after the init payload has been substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, Option<String>>,
    pub kind: TerminalKind,
    pub args_can_be_interpreted_by_shell: bool,
    pub payload: InitPayload,
}

impl LaunchSpec {
    /// Places the payload either in the requested environment variable or as
    /// trailing `-eval` arguments.
    pub fn new(config: &LaunchConfig, payload: InitPayload) -> Self {
        let RunInTerminal {
            args,
            cwd,
            env,
            kind,
            args_can_be_interpreted_by_shell,
        } = config.run_in_terminal.clone();

        let mut args = args;
        let mut env = env;

        match &config.node_init_code_in_env_var {
            Some(var) => {
                env.insert(var.clone(), Some(payload.code.clone()));
            }
            None => {
                args.push("-eval".to_string());
                if args_can_be_interpreted_by_shell {
                    args.push(shell_quote(&payload.code));
                } else {
                    args.push(payload.code.clone());
                }
            }
        }

        Self {
            args,
            cwd,
            env,
            kind,
            args_can_be_interpreted_by_shell,
            payload,
        }
    }
}

#[cfg(not(windows))]
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(windows)]
fn shell_quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "\\\""))
}

/// A debuggee started for a session. Dropping it kills the process.
#[derive(Debug)]
pub struct LaunchedProcess {
    program: String,
    child: Child,
    payload: InitPayload,
}

impl LaunchedProcess {
    pub fn new(program: impl Into<String>, child: Child, payload: InitPayload) -> Self {
        Self {
            program: program.into(),
            child,
            payload,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn payload(&self) -> &InitPayload {
        &self.payload
    }

    /// Sends the termination signal if the process is still running and reaps
    /// it.
    pub async fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        info!(program = %self.program, pid = ?self.child.id(), "Terminating debuggee");
        self.child.start_kill()?;
        self.child.wait().await
    }
}

/// Starts debuggee processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError>;
}

/// Spawns debuggees as child processes, directly or inside an external
/// terminal emulator.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    external_terminal: Vec<String>,
    startup_grace: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(default_external_terminal(), DEFAULT_STARTUP_GRACE)
    }
}

pub fn default_external_terminal() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd".into(), "/C".into(), "start".into(), "/WAIT".into()]
    } else if cfg!(target_os = "macos") {
        vec!["open".into(), "-W".into(), "-a".into(), "Terminal".into(), "--args".into()]
    } else {
        vec!["x-terminal-emulator".into(), "-e".into()]
    }
}

impl ProcessLauncher {
    pub fn new(external_terminal: Vec<String>, startup_grace: Duration) -> Self {
        Self {
            external_terminal,
            startup_grace,
        }
    }

    /// Argument vector actually executed, program first.
    pub fn command_line(&self, spec: &LaunchSpec) -> Result<Vec<String>, LaunchError> {
        let mut argv = if spec.args_can_be_interpreted_by_shell {
            let mut shell = shell_prefix();
            shell.push(spec.args.join(" "));
            shell
        } else {
            spec.args.clone()
        };

        if spec.kind == TerminalKind::External {
            if self.external_terminal.is_empty() {
                return Err(LaunchError::NoExternalTerminal);
            }
            let mut wrapped = self.external_terminal.clone();
            wrapped.append(&mut argv);
            argv = wrapped;
        }

        Ok(argv)
    }

    fn command(&self, argv: &[String], spec: &LaunchSpec) -> Command {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }

        match spec.kind {
            TerminalKind::Integrated => command.stdout(Stdio::piped()).stderr(Stdio::piped()),
            TerminalKind::External => command.stdout(Stdio::null()).stderr(Stdio::null()),
        };

        command
    }
}

#[cfg(not(windows))]
fn shell_prefix() -> Vec<String> {
    vec!["sh".into(), "-c".into()]
}

#[cfg(windows)]
fn shell_prefix() -> Vec<String> {
    vec!["cmd".into(), "/C".into()]
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
        let argv = self.command_line(spec)?;
        let program = argv[0].clone();

        debug!(?argv, cwd = %spec.cwd.display(), kind = ?spec.kind, "Spawning debuggee");

        let mut child = self.command(&argv, spec).spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound && cwd_exists(&spec.cwd) {
                LaunchError::NotFound(program.clone())
            } else {
                LaunchError::Spawn {
                    program: program.clone(),
                    source: e,
                }
            }
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        if let Ok(status) = tokio::time::timeout(self.startup_grace, child.wait()).await {
            let status = status.map_err(|e| LaunchError::Spawn {
                program: program.clone(),
                source: e,
            })?;
            if !status.success() {
                error!(program = %program, %status, "Debuggee exited during startup");
                return Err(LaunchError::ExitedEarly { program, status });
            }
        }

        info!(program = %program, pid = ?child.id(), node = %spec.payload.node, "Debuggee started");
        Ok(LaunchedProcess::new(program, child, spec.payload.clone()))
    }
}

fn cwd_exists(cwd: &Path) -> bool {
    cwd.as_os_str().is_empty() || cwd.is_dir()
}

fn forward_output<R>(stream: R, channel: &'static str)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: DEBUGGEE_TARGET, channel, "{line}");
        }
    });
}
