use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SessionConfig, SessionMode};
use crate::connector::{ConnectError, ConnectTarget, ConnectionEvent, Connector, NodeChannel, NodeConnection};
use crate::launcher::{InitPayload, LaunchError, LaunchSpec, LaunchedProcess, Launcher};
use crate::node::{NameDomain, NodeId};
use crate::protocol::SessionEvent;
use crate::source_path::SourcePathResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Configuring,
    Launching,
    Connecting,
    Attached,
    Terminated,
    Errored(String),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Configuring => "Configuring",
            SessionState::Launching => "Launching",
            SessionState::Connecting => "Connecting",
            SessionState::Attached => "Attached",
            SessionState::Terminated => "Terminated",
            SessionState::Errored(_) => "Errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Errored(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("cancelled")]
    Cancelled,
    #[error("session was already started")]
    AlreadyStarted,
    #[error("connection to node {node} lost: {reason}")]
    ConnectionLost { node: NodeId, reason: String },
}

impl SessionError {
    /// Error kind reported to the client.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Config(_) => "ConfigError",
            SessionError::Launch(_) => "LaunchError",
            SessionError::Connect(ConnectError::Timeout { .. }) => "ConnectTimeout",
            SessionError::Connect(ConnectError::Refused { .. } | ConnectError::NameDomain(_)) => {
                "ConnectRefused"
            }
            SessionError::Connect(ConnectError::Auth { .. }) => "AuthError",
            SessionError::Cancelled => "Cancelled",
            SessionError::AlreadyStarted => "SessionError",
            SessionError::ConnectionLost { .. } => "ConnectionLost",
        }
    }
}

/// A failure while bringing a session up, tagged with the state it happened in.
#[derive(Error, Debug)]
#[error("{kind} while {phase}: {source}", kind = .source.kind(), phase = .state.to_lowercase())]
pub struct StartError {
    pub state: &'static str,
    pub source: SessionError,
}

/// User-initiated stop signal. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// The launcher and connector a session drives.
#[derive(Clone)]
pub struct Backends {
    pub launcher: Arc<dyn Launcher>,
    pub connector: Arc<dyn Connector>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// One debug session: configuration, the debuggee it may own and the live
/// connection to the target node.
pub struct DebugSession {
    config: SessionConfig,
    resolver: SourcePathResolver,
    state: watch::Sender<SessionState>,
    process: Option<LaunchedProcess>,
    connection: Option<NodeConnection>,
    backends: Backends,
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("mode", &self.config.mode())
            .field("state", &*self.state.borrow())
            .field("pid", &self.process_id())
            .finish()
    }
}

enum Step<T> {
    Done(T),
    Cancelled,
}

impl DebugSession {
    /// Validates `raw` for `mode`. Invalid configurations never produce a
    /// session, so nothing is launched or connected for them.
    pub fn configure(mode: SessionMode, raw: &Value, backends: Backends) -> Result<Self, StartError> {
        let config = SessionConfig::validate(mode, raw).map_err(|e| {
            error!(mode = mode.as_str(), error = %e, "Invalid session configuration");
            StartError {
                state: SessionState::Configuring.name(),
                source: e.into(),
            }
        })?;

        Ok(Self::new(config, backends))
    }

    pub fn new(config: SessionConfig, backends: Backends) -> Self {
        let resolver = config.source_path_resolver();
        let (state, _) = watch::channel(SessionState::Configuring);

        Self {
            config,
            resolver,
            state,
            process: None,
            connection: None,
            backends,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn resolver(&self) -> &SourcePathResolver {
        &self.resolver
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(LaunchedProcess::id)
    }

    pub fn node(&self) -> Option<&NodeId> {
        self.connection.as_ref().map(NodeConnection::node)
    }

    pub fn channel(&self) -> Option<NodeChannel> {
        self.connection.as_ref().map(NodeConnection::channel)
    }

    fn transition(&self, next: SessionState) {
        let current = self.state();
        if current.is_terminal() {
            return;
        }
        debug!(from = %current, to = %next, "Session state transition");
        self.state.send_replace(next);
    }

    /// Drives the session from `Configuring` to `Attached`.
    pub async fn start(&mut self, cancel: &Cancellation) -> Result<(), StartError> {
        if self.state() != SessionState::Configuring {
            return Err(StartError {
                state: self.state().name(),
                source: SessionError::AlreadyStarted,
            });
        }

        let target = match self.config.clone() {
            SessionConfig::Attach(config) => ConnectTarget {
                name_domain: NameDomain::of_host(config.node.host()),
                node: config.node,
                cookie: config.cookie,
                timeout: config.timeout,
            },
            SessionConfig::Launch(config) => {
                self.transition(SessionState::Launching);

                let payload = match &config.node {
                    Some(node) => InitPayload::for_node(node.clone(), config.name_domain),
                    None => InitPayload::generate(config.name_domain),
                };
                let spec = LaunchSpec::new(&config, payload);
                let launcher = Arc::clone(&self.backends.launcher);
                let launched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    result = launcher.launch(&spec) => Step::Done(result),
                };

                let process = match launched {
                    Step::Cancelled => return Err(self.cancel_start("Launching").await),
                    Step::Done(Err(e)) => return Err(self.fail("Launching", e.into()).await),
                    Step::Done(Ok(process)) => self.process.insert(process),
                };

                let payload = process.payload();
                ConnectTarget {
                    node: payload.node.clone(),
                    name_domain: config.name_domain,
                    cookie: Some(payload.cookie.clone()),
                    timeout: config.timeout,
                }
            }
        };

        self.transition(SessionState::Connecting);

        let connector = Arc::clone(&self.backends.connector);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            result = connector.connect(&target) => Step::Done(result),
        };

        match connected {
            Step::Cancelled => Err(self.cancel_start("Connecting").await),
            Step::Done(Err(e)) => Err(self.fail("Connecting", e.into()).await),
            Step::Done(Ok(connection)) => {
                info!(node = %connection.node(), "Session attached");
                self.connection = Some(connection);
                self.transition(SessionState::Attached);
                Ok(())
            }
        }
    }

    /// Waits while attached. Returns `Ok` on user stop and the loss cause when
    /// the node went away.
    pub async fn wait_detached(&mut self, cancel: &Cancellation) -> Result<(), SessionError> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };

        let lost = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            event = connection.closed() => Some(match event {
                ConnectionEvent::Lost(reason) => reason,
                ConnectionEvent::Closed => "connection closed".to_string(),
            }),
        };

        match lost {
            None => {
                self.terminate().await;
                Ok(())
            }
            Some(reason) => {
                let node = connection_node(&self.connection);
                warn!(node = %node, reason = %reason, "Lost connection to node");
                let err = SessionError::ConnectionLost { node, reason };
                self.enter_terminal(SessionState::Errored(err.to_string())).await;
                Err(err)
            }
        }
    }

    /// Graceful stop: `Terminated`, owned debuggee killed.
    pub async fn terminate(&mut self) {
        self.enter_terminal(SessionState::Terminated).await;
    }

    async fn cancel_start(&mut self, state: &'static str) -> StartError {
        info!(state, "Session start cancelled");
        self.enter_terminal(SessionState::Terminated).await;
        StartError {
            state,
            source: SessionError::Cancelled,
        }
    }

    async fn fail(&mut self, state: &'static str, source: SessionError) -> StartError {
        error!(state, kind = source.kind(), error = %source, "Session failed to start");
        self.enter_terminal(SessionState::Errored(source.to_string())).await;
        StartError { state, source }
    }

    async fn enter_terminal(&mut self, next: SessionState) {
        self.transition(next);

        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }

        if let Some(mut process) = self.process.take() {
            match process.terminate().await {
                Ok(status) => debug!(%status, "Debuggee stopped"),
                Err(e) => error!(error = %e, "Failed to terminate debuggee"),
            }
        }
    }
}

fn connection_node(connection: &Option<NodeConnection>) -> NodeId {
    connection
        .as_ref()
        .map(|c| c.node().clone())
        .unwrap_or_else(|| NodeId::new("unknown", "unknown"))
}

/// A session running on the adapter's runtime.
#[derive(Debug)]
pub struct SessionHandle {
    cancel: Cancellation,
    state: watch::Receiver<SessionState>,
    resolver: SourcePathResolver,
    channel: Arc<OnceLock<NodeChannel>>,
    task: JoinHandle<DebugSession>,
}

impl SessionHandle {
    /// Starts `session` in the background. `notify` is called from the runtime
    /// as the session reaches `Attached`, fails or ends.
    pub fn spawn<F>(runtime: &Handle, session: DebugSession, mut notify: F) -> Self
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        let cancel = Cancellation::new();
        let state = session.subscribe();
        let resolver = session.resolver().clone();
        let channel = Arc::new(OnceLock::new());

        let task_cancel = cancel.clone();
        let task_channel = Arc::clone(&channel);
        let task = runtime.spawn(async move {
            let mut session = session;
            match session.start(&task_cancel).await {
                Ok(()) => {
                    let Some(attached) = session.channel() else {
                        return session;
                    };
                    let _ = task_channel.set(attached.clone());
                    notify(SessionEvent::Attached { channel: attached });
                    match session.wait_detached(&task_cancel).await {
                        Ok(()) => notify(SessionEvent::Detached),
                        Err(e) => notify(SessionEvent::ConnectionLost(e)),
                    }
                }
                Err(e) => notify(SessionEvent::StartFailed(e)),
            }
            session
        });

        Self {
            cancel,
            state,
            resolver,
            channel,
            task,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn resolver(&self) -> &SourcePathResolver {
        &self.resolver
    }

    /// Channel to the node once the session has attached.
    pub fn channel(&self) -> Option<&NodeChannel> {
        self.channel.get()
    }

    /// Cancels the session and waits for it to settle. In launch mode the
    /// debuggee has been killed and reaped when this returns.
    pub async fn shutdown(self) -> Option<DebugSession> {
        self.cancel.cancel();
        match self.task.await {
            Ok(session) => Some(session),
            Err(e) => {
                error!(error = %e, "Session task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Pid;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Calls {
        calls: Mutex<Vec<&'static str>>,
        pids: Mutex<Vec<u32>>,
    }

    impl Calls {
        fn push(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn get(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn launched_pid(&self) -> u32 {
            *self.pids.lock().unwrap().first().unwrap()
        }
    }

    struct SleepLauncher(Arc<Calls>);

    #[async_trait]
    impl Launcher for SleepLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
            self.0.push("launch");
            let child = tokio::process::Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            self.0.pids.lock().unwrap().extend(child.id());
            Ok(LaunchedProcess::new("sleep", child, spec.payload.clone()))
        }
    }

    struct FailingLauncher;

    #[async_trait]
    impl Launcher for FailingLauncher {
        async fn launch(&self, _: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
            Err(LaunchError::NotFound("erl".to_string()))
        }
    }

    enum ConnectBehavior {
        Succeed,
        Hang,
        Timeout,
    }

    struct FakeConnector {
        calls: Arc<Calls>,
        behavior: ConnectBehavior,
        peer: Mutex<Option<tokio::io::DuplexStream>>,
        dialed: Mutex<Vec<(NodeId, Option<String>)>>,
    }

    impl FakeConnector {
        fn new(calls: Arc<Calls>, behavior: ConnectBehavior) -> Self {
            Self {
                calls,
                behavior,
                peer: Mutex::new(None),
                dialed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, target: &ConnectTarget) -> Result<NodeConnection, ConnectError> {
            self.calls.push("connect");
            self.dialed
                .lock()
                .unwrap()
                .push((target.node.clone(), target.cookie.clone()));
            match self.behavior {
                ConnectBehavior::Succeed => {
                    let (client, server) = tokio::io::duplex(64);
                    *self.peer.lock().unwrap() = Some(server);
                    Ok(NodeConnection::new(target.node.clone(), Pid::new("dap@box", 1, 1), client))
                }
                ConnectBehavior::Hang => std::future::pending().await,
                ConnectBehavior::Timeout => Err(ConnectError::Timeout {
                    node: target.node.clone(),
                    waited: target.timeout,
                    last: None,
                }),
            }
        }
    }

    fn launch_body() -> Value {
        json!({
            "runInTerminal": { "args": ["erl"], "cwd": "/tmp" },
            "config": { "nameDomain": "shortnames", "stripSourcePrefix": "/build" }
        })
    }

    fn backends(launcher: Arc<dyn Launcher>, connector: Arc<FakeConnector>) -> Backends {
        Backends {
            launcher,
            connector,
        }
    }

    fn pid_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_configure_rejects_attach_without_node() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Succeed));
        let err = DebugSession::configure(
            SessionMode::Attach,
            &json!({ "config": { "cwd": "/ws" } }),
            backends(Arc::new(FailingLauncher), connector),
        )
        .unwrap_err();

        assert_eq!(err.state, "Configuring");
        assert_eq!(err.source.kind(), "ConfigError");
        assert!(calls.get().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_runs_launcher_then_connector_once() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Succeed));
        let mut session = DebugSession::configure(
            SessionMode::Launch,
            &launch_body(),
            backends(Arc::new(SleepLauncher(calls.clone())), connector),
        )
        .unwrap();

        session.start(&Cancellation::new()).await.unwrap();

        assert_eq!(calls.get(), vec!["launch", "connect"]);
        assert_eq!(session.state(), SessionState::Attached);
        assert_eq!(
            session.resolver().resolve("/build/src/a.erl"),
            std::path::PathBuf::from("/tmp/src/a.erl")
        );

        let pid = session.process_id().unwrap();
        session.terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!pid_alive(pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_dials_node_named_in_args() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Succeed));
        let mut body = launch_body();
        body["runInTerminal"]["args"] = json!(["erl", "-sname", "shop@localhost"]);
        let mut session = DebugSession::configure(
            SessionMode::Launch,
            &body,
            backends(Arc::new(SleepLauncher(calls.clone())), connector.clone()),
        )
        .unwrap();

        session.start(&Cancellation::new()).await.unwrap();

        let dialed = connector.dialed.lock().unwrap().clone();
        let [(node, Some(cookie))] = dialed.as_slice() else {
            panic!("expected one dial with a cookie, got {dialed:?}");
        };
        assert_eq!(node.to_string(), "shop@localhost");
        assert_eq!(cookie.len(), 32);
        session.terminate().await;
    }

    #[tokio::test]
    async fn test_launch_failure_skips_connect() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Succeed));
        let mut session = DebugSession::configure(
            SessionMode::Launch,
            &launch_body(),
            backends(Arc::new(FailingLauncher), connector),
        )
        .unwrap();

        let err = session.start(&Cancellation::new()).await.unwrap_err();
        assert_eq!(err.state, "Launching");
        assert_eq!(err.source.kind(), "LaunchError");
        assert!(calls.get().is_empty());
        assert!(matches!(session.state(), SessionState::Errored(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_timeout_kills_debuggee() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Timeout));
        let mut session = DebugSession::configure(
            SessionMode::Launch,
            &launch_body(),
            backends(Arc::new(SleepLauncher(calls.clone())), connector),
        )
        .unwrap();
        let mut states = session.subscribe();

        let err = session.start(&Cancellation::new()).await.unwrap_err();
        assert_eq!(err.state, "Connecting");
        assert_eq!(err.source.kind(), "ConnectTimeout");
        assert_eq!(session.process_id(), None);
        assert!(!pid_alive(calls.launched_pid()));
        assert!(matches!(*states.borrow_and_update(), SessionState::Errored(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_while_connecting_terminates_debuggee_first() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Hang));
        let session = DebugSession::configure(
            SessionMode::Launch,
            &launch_body(),
            backends(Arc::new(SleepLauncher(calls.clone())), connector),
        )
        .unwrap();
        let mut states = session.subscribe();

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let handle = SessionHandle::spawn(&Handle::current(), session, move |event| {
            recorded.lock().unwrap().push(event);
        });

        states
            .wait_for(|state| *state == SessionState::Connecting)
            .await
            .unwrap();

        let pid = calls.launched_pid();
        assert!(pid_alive(pid));

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.process_id(), None);
        assert!(!pid_alive(pid));

        let events = events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::StartFailed(StartError {
                state: "Connecting",
                source: SessionError::Cancelled
            })]
        ));
    }

    #[tokio::test]
    async fn test_attach_connection_loss_is_errored() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Succeed));
        let mut session = DebugSession::configure(
            SessionMode::Attach,
            &json!({ "config": { "node": "app@box", "cwd": "/ws", "cookie": "c" } }),
            backends(Arc::new(FailingLauncher), connector.clone()),
        )
        .unwrap();

        session.start(&Cancellation::new()).await.unwrap();
        assert_eq!(calls.get(), vec!["connect"]);
        assert_eq!(session.node().map(ToString::to_string).as_deref(), Some("app@box"));

        drop(connector.peer.lock().unwrap().take());

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            session.wait_detached(&Cancellation::new()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), "ConnectionLost");
        assert!(matches!(session.state(), SessionState::Errored(_)));
    }

    #[tokio::test]
    async fn test_user_stop_while_attached_is_terminated() {
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(FakeConnector::new(calls.clone(), ConnectBehavior::Succeed));
        let mut session = DebugSession::configure(
            SessionMode::Attach,
            &json!({ "config": { "node": "app@box", "cwd": "/ws" } }),
            backends(Arc::new(FailingLauncher), connector),
        )
        .unwrap();

        let cancel = Cancellation::new();
        session.start(&cancel).await.unwrap();
        cancel.cancel();
        session.wait_detached(&cancel).await.unwrap();

        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.start(&cancel).await.is_err());
    }

    #[test]
    fn test_start_error_message_names_kind_and_state() {
        let err = StartError {
            state: "Connecting",
            source: SessionError::Cancelled,
        };
        assert_eq!(err.to_string(), "Cancelled while connecting: cancelled");
    }
}
