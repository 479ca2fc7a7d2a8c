use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dap::prelude::*;
use dap::responses::{
    ContinueResponse, Response, SetBreakpointsResponse, SetExceptionBreakpointsResponse, StackTraceResponse,
    ThreadsResponse,
};
use dap::server::ServerOutput;
use dap::types::{Breakpoint, Source, StackFrame};
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::config::SessionMode;
use crate::connector::{NodeChannel, RpcError};
use crate::debugger::{self, DebuggerError, LineBreakpoint, StoppedFrame};
use crate::error::ErlAdapterError;
use crate::protocol::SessionEvent;
use crate::session::{Backends, DebugSession, SessionError, SessionHandle, SessionState};
use crate::term::Pid;

type DynResult<T> = miette::Result<T, Box<dyn std::error::Error>>;

/// The node is presented to the client as a single thread.
const THREAD_ID: i64 = 1;

/// How often an attached node is asked for processes stopped on breakpoints.
const STOPPED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which request a session start answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Launch,
    Attach,
    Restart,
}

impl Reply {
    fn body(self) -> ResponseBody {
        match self {
            Reply::Launch => ResponseBody::Launch,
            Reply::Attach => ResponseBody::Attach,
            Reply::Restart => ResponseBody::Restart,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestedBreakpoint {
    id: i64,
    line: i64,
}

/// Breakpoints the client asked for, by client source path. They outlive
/// sessions and are applied again on every attach.
type BreakpointTable = Arc<Mutex<BTreeMap<PathBuf, Vec<RequestedBreakpoint>>>>;

fn lock_table(table: &BreakpointTable) -> MutexGuard<'_, BTreeMap<PathBuf, Vec<RequestedBreakpoint>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Main DAP adapter: owns the runtime sessions run on and at most one
/// active session.
pub struct ErlAdapter {
    runtime: Runtime,
    backends: Backends,
    session: Option<SessionHandle>,
    last_request: Option<(SessionMode, Value)>,
    breakpoints: BreakpointTable,
    next_breakpoint_id: i64,
}

impl ErlAdapter {
    pub fn new(backends: Backends) -> Result<Self, ErlAdapterError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("erl-dap-session")
            .build()?;

        Ok(Self {
            runtime,
            backends,
            session: None,
            last_request: None,
            breakpoints: BreakpointTable::default(),
            next_breakpoint_id: 1,
        })
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(SessionHandle::state)
    }

    /// Stops the active session, if any, and waits until its debuggee is
    /// gone.
    pub fn teardown(&mut self) -> Option<DebugSession> {
        let handle = self.session.take()?;
        debug!(state = %handle.state(), "Tearing down session");
        self.runtime.block_on(handle.shutdown())
    }

    fn start_session<R: Read, W: Write + Send + 'static>(
        &mut self,
        mode: SessionMode,
        raw: Value,
        req: Request,
        reply: Reply,
        server: &mut Server<R, W>,
    ) -> DynResult<()> {
        self.teardown();

        let session = match DebugSession::configure(mode, &raw, self.backends.clone()) {
            Ok(session) => session,
            Err(e) => {
                server.respond(req.error(&e.to_string()))?;
                return Ok(());
            }
        };

        info!(mode = mode.as_str(), "Starting debug session");
        self.last_request = Some((mode, raw));

        let notify = session_notifier(
            Arc::clone(&server.output),
            Arc::clone(&self.breakpoints),
            req,
            reply,
        );
        self.session = Some(SessionHandle::spawn(self.runtime.handle(), session, notify));
        Ok(())
    }

    /// Replaces the active session with a fresh one built from the last
    /// launch/attach configuration. Calling it repeatedly still leaves a single
    /// session.
    fn restart<R: Read, W: Write + Send + 'static>(
        &mut self,
        req: Request,
        server: &mut Server<R, W>,
    ) -> DynResult<()> {
        match self.last_request.clone() {
            Some((mode, raw)) => self.start_session(mode, raw, req, Reply::Restart, server),
            None => {
                self.teardown();
                server.respond(req.success(ResponseBody::Restart))?;
                Ok(())
            }
        }
    }

    /// Channel to the node while the active session is attached.
    fn attached_channel(&self) -> Option<&NodeChannel> {
        self.session
            .as_ref()
            .filter(|handle| handle.state() == SessionState::Attached)
            .and_then(SessionHandle::channel)
    }

    fn threads(&self) -> Vec<types::Thread> {
        match self.attached_channel() {
            Some(channel) => vec![types::Thread {
                id: THREAD_ID,
                name: channel.node().to_string(),
            }],
            None => Vec::new(),
        }
    }

    /// Records the client's breakpoints for `path` and installs them on the
    /// node when attached.
    fn set_breakpoints(&mut self, path: Option<&Path>, lines: &[i64]) -> Vec<(i64, LineBreakpoint)> {
        let requested: Vec<RequestedBreakpoint> = lines
            .iter()
            .map(|&line| {
                let id = self.next_breakpoint_id;
                self.next_breakpoint_id += 1;
                RequestedBreakpoint { id, line }
            })
            .collect();

        if let Some(path) = path {
            lock_table(&self.breakpoints).insert(path.to_path_buf(), requested.clone());
        }

        let outcomes = match (self.attached_channel(), path.and_then(debugger::module_of)) {
            (_, None) => Err("Breakpoints need an Erlang source file".to_string()),
            (None, Some(_)) => Err("Not attached to a node yet".to_string()),
            (Some(channel), Some(module)) => self
                .runtime
                .block_on(debugger::set_breakpoints(channel, module, lines))
                .map_err(|e| e.to_string()),
        };

        match outcomes {
            Ok(outcomes) => requested.iter().map(|r| r.id).zip(outcomes).collect(),
            Err(message) => requested
                .iter()
                .map(|r| (r.id, unverified(r.line, &message)))
                .collect(),
        }
    }

    fn stack_frames(&self) -> Vec<StackFrame> {
        let (Some(channel), Some(handle)) = (self.attached_channel(), self.session.as_ref()) else {
            return Vec::new();
        };

        match self
            .runtime
            .block_on(debugger::stopped_frames(channel, handle.resolver()))
        {
            Ok(frames) => frames.iter().enumerate().map(|(i, frame)| stack_frame(i, frame)).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read stopped processes");
                Vec::new()
            }
        }
    }

    /// Resumes every process stopped on a breakpoint.
    fn continue_all(&self) -> Result<usize, DebuggerError> {
        let Some(channel) = self.attached_channel() else {
            return Ok(0);
        };

        self.runtime.block_on(async {
            let stopped = debugger::stopped_processes(channel).await?;
            for process in &stopped {
                debugger::continue_process(channel, &process.pid).await?;
            }
            Ok::<_, DebuggerError>(stopped.len())
        })
    }

    /// Handle DAP request and send appropriate response
    pub fn handle_request<R: Read, W: Write + Send + 'static>(
        &mut self,
        req: Request,
        server: &mut Server<R, W>,
    ) -> DynResult<()> {
        match &req.command {
            Command::Launch(args) => {
                debug!("Received Launch request");
                let Some(raw) = args.additional_data.clone() else {
                    let message = ErlAdapterError::MissingArguments("launch").to_string();
                    server.respond(req.error(&message))?;
                    return Ok(());
                };
                self.start_session(SessionMode::Launch, raw, req, Reply::Launch, server)?;
            }
            Command::Attach(args) => {
                debug!("Received Attach request");
                let Some(raw) = args.additional_data.clone() else {
                    let message = ErlAdapterError::MissingArguments("attach").to_string();
                    server.respond(req.error(&message))?;
                    return Ok(());
                };
                self.start_session(SessionMode::Attach, raw, req, Reply::Attach, server)?;
            }
            Command::Restart(_) => {
                debug!("Received Restart request");
                self.restart(req, server)?;
            }
            Command::SetExceptionBreakpoints(_) => {
                debug!("Received SetExceptionBreakpoints request");
                let rsp = req.success(ResponseBody::SetExceptionBreakpoints(
                    SetExceptionBreakpointsResponse { breakpoints: None },
                ));
                server.respond(rsp)?;
            }
            Command::SetBreakpoints(args) => {
                debug!(?args, "Received SetBreakpoints request");

                let lines = args
                    .breakpoints
                    .as_ref()
                    .map(|breakpoints| breakpoints.iter().map(|b| b.line).collect::<Vec<_>>())
                    .unwrap_or_default();
                let path = args.source.path.as_ref().map(PathBuf::from);

                let breakpoints = self
                    .set_breakpoints(path.as_deref(), &lines)
                    .into_iter()
                    .map(|(id, outcome)| breakpoint(id, &args.source, outcome))
                    .collect();

                let rsp = req.success(ResponseBody::SetBreakpoints(SetBreakpointsResponse {
                    breakpoints,
                }));
                server.respond(rsp)?;
            }
            Command::Threads => {
                debug!("Received Threads request");
                let threads = self.threads();
                server.respond(req.success(ResponseBody::Threads(ThreadsResponse { threads })))?;
            }
            Command::StackTrace(args) => {
                debug!(?args, "Received StackTrace request");
                let stack_frames = self.stack_frames();
                let rsp = req.success(ResponseBody::StackTrace(StackTraceResponse {
                    total_frames: Some(stack_frames.len() as i64),
                    stack_frames,
                }));
                server.respond(rsp)?;
            }
            Command::Continue(_) => {
                debug!("Received Continue request");
                match self.continue_all() {
                    Ok(resumed) => {
                        debug!(resumed, "Resumed stopped processes");
                        server.respond(req.success(ResponseBody::Continue(ContinueResponse {
                            all_threads_continued: Some(true),
                        })))?;
                    }
                    Err(e) => server.respond(req.error(&e.to_string()))?,
                }
            }
            Command::ConfigurationDone => {
                debug!("Received ConfigurationDone request");
                server.respond(req.success(ResponseBody::ConfigurationDone))?;
            }
            Command::Terminate(_) => {
                debug!("Received Terminate request");
                self.teardown();
                server.respond(req.success(ResponseBody::Terminate))?;
                server.send_event(terminated_event())?;
            }
            Command::Disconnect(_) => {
                debug!("Received Disconnect request");
                self.teardown();

                server.respond(req.success(ResponseBody::Disconnect))?;
                return Err(Box::new(ErlAdapterError::ProtocolError("Shutdown".to_string())));
            }
            command => {
                let message = format!("Unsupported request: {:?}", command);
                let command = command.clone();
                server.respond(req.error(&message))?;
                return Err(Box::new(ErlAdapterError::UnhandledCommand(Box::new(command))));
            }
        }
        Ok(())
    }
}

impl Drop for ErlAdapter {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn unverified(line: i64, message: &str) -> LineBreakpoint {
    LineBreakpoint {
        line,
        verified: false,
        message: Some(message.to_string()),
    }
}

fn breakpoint(id: i64, source: &Source, outcome: LineBreakpoint) -> Breakpoint {
    Breakpoint {
        id: Some(id),
        verified: outcome.verified,
        message: outcome.message,
        source: Some(source.clone()),
        line: Some(outcome.line),
        ..Default::default()
    }
}

fn source_of(path: &Path) -> Source {
    Source {
        name: path.file_name().map(|name| name.to_string_lossy().to_string()),
        path: Some(path.to_string_lossy().to_string()),
        ..Default::default()
    }
}

fn stack_frame(index: usize, frame: &StoppedFrame) -> StackFrame {
    StackFrame {
        id: index as i64 + 1,
        name: format!("{} ({})", frame.process.function, frame.process.pid),
        source: frame.source.as_deref().map(source_of),
        line: frame.process.line,
        column: 1,
        ..Default::default()
    }
}

pub(crate) fn console_output(output: String, category: types::OutputEventCategory) -> Event {
    Event::Output(events::OutputEventBody {
        output,
        category: Some(category),
        group: None,
        variables_reference: None,
        source: None,
        line: None,
        column: None,
        data: None,
    })
}

fn terminated_event() -> Event {
    Event::Terminated(Some(events::TerminatedEventBody {
        restart: Some(Value::Bool(false)),
    }))
}

fn stopped_event(description: String) -> Event {
    Event::Stopped(events::StoppedEventBody {
        reason: types::StoppedEventReason::Breakpoint,
        description: Some(description),
        thread_id: Some(THREAD_ID),
        preserve_focus_hint: None,
        text: None,
        all_threads_stopped: Some(false),
        hit_breakpoint_ids: None,
    })
}

fn send_all<W: Write>(output: &Mutex<ServerOutput<W>>, responses: Vec<Response>, events: Vec<Event>) {
    let Ok(mut server) = output.lock() else {
        error!("Server output lock poisoned, dropping session messages");
        return;
    };

    for response in responses {
        if let Err(e) = server.respond(response) {
            error!(error = %e, "Failed to send session response");
        }
    }
    for event in events {
        if let Err(e) = server.send_event(event) {
            error!(error = %e, "Failed to send session event");
        }
    }
}

/// Answers the start request once the session settles and reports how an
/// attached session ends.
fn session_notifier<W: Write + Send + 'static>(
    output: Arc<Mutex<ServerOutput<W>>>,
    breakpoints: BreakpointTable,
    req: Request,
    reply: Reply,
) -> impl FnMut(SessionEvent) + Send + 'static {
    let mut pending = Some(req);

    move |event| {
        let mut responses: Vec<Response> = Vec::new();
        let mut events: Vec<Event> = Vec::new();

        match event {
            SessionEvent::Attached { channel } => {
                if let Some(req) = pending.take() {
                    responses.push(req.success(reply.body()));
                }
                events.push(console_output(
                    format!("Attached to node {}\n", channel.node()),
                    types::OutputEventCategory::Console,
                ));
                tokio::spawn(watch_node(channel, Arc::clone(&output), Arc::clone(&breakpoints)));
            }
            SessionEvent::StartFailed(e) => {
                if let Some(req) = pending.take() {
                    responses.push(req.error(&e.to_string()));
                }
                // A cancelled start was torn down by the client, which
                // reports the end of the session itself.
                if !matches!(e.source, SessionError::Cancelled) {
                    events.push(terminated_event());
                }
            }
            SessionEvent::Detached => {
                debug!("Session stopped by the client");
            }
            SessionEvent::ConnectionLost(e) => {
                events.push(console_output(
                    format!("Debug session terminated unexpectedly: {}\n", e),
                    types::OutputEventCategory::Stderr,
                ));
                events.push(terminated_event());
            }
        }

        send_all(&output, responses, events);
    }
}

/// Installs the recorded breakpoints on a freshly attached node, then reports
/// processes that stop on them until the connection closes.
async fn watch_node<W: Write>(channel: NodeChannel, output: Arc<Mutex<ServerOutput<W>>>, table: BreakpointTable) {
    let recorded = lock_table(&table).clone();
    for (path, requested) in recorded {
        let Some(module) = debugger::module_of(&path) else {
            continue;
        };
        let lines: Vec<i64> = requested.iter().map(|r| r.line).collect();
        let outcomes = match debugger::set_breakpoints(&channel, module, &lines).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(module, error = %e, "Failed to install breakpoints");
                lines.iter().map(|&line| unverified(line, &e.to_string())).collect()
            }
        };

        let source = source_of(&path);
        let events = requested
            .iter()
            .zip(outcomes)
            .map(|(r, outcome)| {
                Event::Breakpoint(events::BreakpointEventBody {
                    reason: types::BreakpointEventReason::Changed,
                    breakpoint: breakpoint(r.id, &source, outcome),
                })
            })
            .collect();
        send_all(&output, Vec::new(), events);
    }

    let mut stopped: HashSet<Pid> = HashSet::new();
    loop {
        tokio::time::sleep(STOPPED_POLL_INTERVAL).await;
        match debugger::stopped_processes(&channel).await {
            Ok(processes) => {
                let newly_stopped = processes.iter().find(|p| !stopped.contains(&p.pid));
                if let Some(process) = newly_stopped {
                    let description = format!("{} stopped at {}:{}", process.pid, process.module, process.line);
                    info!(node = %channel.node(), "{description}");
                    send_all(&output, Vec::new(), vec![stopped_event(description)]);
                }
                stopped = processes.into_iter().map(|p| p.pid).collect();
            }
            Err(DebuggerError::Rpc(RpcError::Closed(_))) => break,
            Err(e) => debug!(error = %e, "Polling for stopped processes failed"),
        }
    }
}
