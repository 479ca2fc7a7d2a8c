use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::dist::{self, DEFAULT_EPMD_PORT, DistError, Packet};
use crate::node::{NameDomain, NameDomainMismatch, NodeId};
use crate::term::{Pid, Reference, Term};

/// Interval between lookups while the target is not registered yet.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error(transparent)]
    NameDomain(#[from] NameDomainMismatch),
    #[error("timed out after {}s waiting for node {node}{}", .waited.as_secs_f64(), last_cause(.last))]
    Timeout {
        node: NodeId,
        waited: Duration,
        last: Option<String>,
    },
    #[error("connection to node {node} refused: {reason}")]
    Refused { node: NodeId, reason: String },
    #[error("authentication with node {node} failed: {reason}")]
    Auth { node: NodeId, reason: String },
}

fn last_cause(last: &Option<String>) -> String {
    last.as_ref()
        .map(|cause| format!(" (last error: {cause})"))
        .unwrap_or_default()
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub node: NodeId,
    pub name_domain: NameDomain,
    pub cookie: Option<String>,
    pub timeout: Duration,
}

/// Establishes the debugging channel to a node.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<NodeConnection, ConnectError>;
}

/// Connects through the port mapper and the distribution handshake.
#[derive(Debug, Clone)]
pub struct NodeConnector {
    epmd_port: u16,
    cookie_file: Option<PathBuf>,
}

impl Default for NodeConnector {
    fn default() -> Self {
        Self::new(DEFAULT_EPMD_PORT)
    }
}

enum Attempt {
    /// The node may still be starting up.
    Pending(String),
    Failed(ConnectError),
}

impl NodeConnector {
    pub fn new(epmd_port: u16) -> Self {
        Self {
            epmd_port,
            cookie_file: dirs::home_dir().map(|home| home.join(".erlang.cookie")),
        }
    }

    pub fn with_cookie_file(mut self, cookie_file: Option<PathBuf>) -> Self {
        self.cookie_file = cookie_file;
        self
    }

    fn cookie(&self, target: &ConnectTarget) -> Result<String, ConnectError> {
        if let Some(cookie) = &target.cookie {
            return Ok(cookie.clone());
        }

        self.cookie_file
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|cookie| cookie.trim().to_string())
            .filter(|cookie| !cookie.is_empty())
            .ok_or_else(|| ConnectError::Auth {
                node: target.node.clone(),
                reason: "no cookie given and no cookie file found".to_string(),
            })
    }

    async fn attempt(
        &self,
        target: &ConnectTarget,
        local: &Pid,
        cookie: &str,
    ) -> Result<NodeConnection, Attempt> {
        let node = &target.node;

        let mut epmd = TcpStream::connect((node.host(), self.epmd_port))
            .await
            .map_err(|e| Attempt::Pending(format!("port mapper on {}: {e}", node.host())))?;

        let registration = match dist::port_please(&mut epmd, node.name()).await {
            Ok(registration) => registration,
            Err(DistError::NotRegistered(name)) => {
                return Err(Attempt::Pending(format!("`{name}` is not registered yet")));
            }
            Err(e) => return Err(Attempt::Pending(e.to_string())),
        };
        drop(epmd);

        let mut stream = TcpStream::connect((node.host(), registration.port))
            .await
            .map_err(|e| {
                Attempt::Failed(ConnectError::Refused {
                    node: node.clone(),
                    reason: e.to_string(),
                })
            })?;
        stream.set_nodelay(true).ok();

        match dist::handshake(&mut stream, &local.node, cookie, local.creation).await {
            Ok(handshake) => {
                info!(node = %node, peer_flags = handshake.peer_flags, "Connected to node");
                Ok(NodeConnection::new(node.clone(), local.clone(), stream))
            }
            Err(e @ (DistError::ClosedAfterChallenge | DistError::DigestMismatch)) => {
                Err(Attempt::Failed(ConnectError::Auth {
                    node: node.clone(),
                    reason: e.to_string(),
                }))
            }
            Err(e) => Err(Attempt::Failed(ConnectError::Refused {
                node: node.clone(),
                reason: e.to_string(),
            })),
        }
    }
}

#[async_trait]
impl Connector for NodeConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<NodeConnection, ConnectError> {
        target.node.check_domain(target.name_domain)?;
        let cookie = self.cookie(target)?;
        let local = Pid::new(
            format!(
                "erl_dap_{}_{:08x}@{}",
                process::id(),
                dist::random_u32(),
                target.name_domain.local_host()
            ),
            1,
            dist::random_u32().max(4),
        );

        let deadline = Instant::now() + target.timeout;
        let mut last = None;

        debug!(node = %target.node, timeout = ?target.timeout, "Waiting for node");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, self.attempt(target, &local, &cookie)).await {
                Ok(Ok(connection)) => return Ok(connection),
                Ok(Err(Attempt::Failed(e))) => return Err(e),
                Ok(Err(Attempt::Pending(cause))) => {
                    debug!(node = %target.node, cause = %cause, "Node not reachable yet");
                    last = Some(cause);
                    sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
                        .await;
                }
                Err(_) => break,
            }
        }

        warn!(node = %target.node, "Timed out waiting for node");
        Err(ConnectError::Timeout {
            node: target.node.clone(),
            waited: target.timeout,
            last,
        })
    }
}

/// Notification from a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Closed,
    Lost(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("connection to node {0} is closed")]
    Closed(NodeId),
    #[error("{call} on node {node} did not answer within {}s", RPC_TIMEOUT.as_secs())]
    Timeout { node: NodeId, call: String },
    #[error("{call} on node {node} failed: {reason}")]
    BadRpc {
        node: NodeId,
        call: String,
        reason: String,
    },
}

/// How long a remote call may take before it is abandoned.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

type PendingCalls = Arc<Mutex<HashMap<Vec<u32>, oneshot::Sender<Term>>>>;

fn lock_pending(pending: &PendingCalls) -> MutexGuard<'_, HashMap<Vec<u32>, oneshot::Sender<Term>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle for calling functions on a connected node.
#[derive(Debug, Clone)]
pub struct NodeChannel {
    node: NodeId,
    local: Pid,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingCalls,
    open: Arc<AtomicBool>,
}

impl NodeChannel {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// `rpc:call(Module, Function, Args)` through the node's `rex` server.
    pub async fn rpc(&self, module: &str, function: &str, args: Vec<Term>) -> Result<Term, RpcError> {
        let call = format!("{module}:{function}/{}", args.len());
        let ids = vec![dist::random_u32() & 0x3ffff, dist::random_u32(), dist::random_u32()];
        let reference = Reference {
            node: self.local.node.clone(),
            creation: self.local.creation,
            ids: ids.clone(),
        };

        let request = Term::tuple([
            Term::atom("$gen_call"),
            Term::tuple([Term::Pid(self.local.clone()), Term::Reference(reference)]),
            Term::tuple([
                Term::atom("call"),
                Term::atom(module),
                Term::atom(function),
                Term::List(args),
                Term::atom("user"),
            ]),
        ]);

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(ids.clone(), tx);
        // Checked after registering, so a concurrent close either sees the
        // call and drops it or is seen here.
        if !self.open.load(Ordering::SeqCst) {
            lock_pending(&self.pending).remove(&ids);
            return Err(RpcError::Closed(self.node.clone()));
        }

        debug!(node = %self.node, %call, "Calling node");
        if self
            .outbound
            .send(dist::reg_send_packet(&self.local, "rex", &request))
            .is_err()
        {
            lock_pending(&self.pending).remove(&ids);
            return Err(RpcError::Closed(self.node.clone()));
        }

        let reply = match timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(RpcError::Closed(self.node.clone())),
            Err(_) => {
                lock_pending(&self.pending).remove(&ids);
                return Err(RpcError::Timeout {
                    node: self.node.clone(),
                    call,
                });
            }
        };

        match reply.as_tuple() {
            Some([tag, reason]) if tag.is_atom("badrpc") => Err(RpcError::BadRpc {
                node: self.node.clone(),
                call,
                reason: format!("{reason:?}"),
            }),
            _ => Ok(reply),
        }
    }
}

/// A live distribution channel. Background tasks answer ticks and route
/// replies to pending calls until the peer goes away or the connection is
/// closed.
#[derive(Debug)]
pub struct NodeConnection {
    channel: NodeChannel,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    events: Option<oneshot::Receiver<ConnectionEvent>>,
}

impl NodeConnection {
    /// `local` is the adapter's own pid, on the name and creation it presented
    /// in the handshake.
    pub fn new<S>(node: NodeId, local: Pid, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (events_tx, events_rx) = oneshot::channel();
        let pending = PendingCalls::default();
        let open = Arc::new(AtomicBool::new(true));

        let monitored = node.clone();
        let writer = tokio::spawn(async move {
            while let Some(packet) = outbound_rx.recv().await {
                if let Err(e) = dist::write_packet(&mut write_half, &packet).await {
                    warn!(node = %monitored, error = %e, "Failed to write to node");
                    break;
                }
            }
        });

        let monitored = node.clone();
        let ticks = outbound.clone();
        let routes = Arc::clone(&pending);
        let still_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            let event = loop {
                match dist::read_packet(&mut read_half).await {
                    Ok(Packet::Tick) => {
                        if ticks.send(Vec::new()).is_err() {
                            break ConnectionEvent::Lost("writer stopped".to_string());
                        }
                    }
                    Ok(Packet::Message(body)) => match dist::parse_delivery(&body) {
                        Ok(Some(delivery)) => route_reply(&routes, delivery.message),
                        Ok(None) => debug!(node = %monitored, "Ignoring control message"),
                        Err(e) => debug!(node = %monitored, error = %e, "Ignoring undecodable message"),
                    },
                    Ok(Packet::Skipped(_)) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        break ConnectionEvent::Lost("connection closed by peer".to_string());
                    }
                    Err(e) => break ConnectionEvent::Lost(e.to_string()),
                }
            };
            still_open.store(false, Ordering::SeqCst);
            lock_pending(&routes).clear();
            let _ = events_tx.send(event);
        });

        Self {
            channel: NodeChannel {
                node,
                local,
                outbound,
                pending,
                open,
            },
            reader,
            writer,
            events: Some(events_rx),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.channel.node
    }

    pub fn channel(&self) -> NodeChannel {
        self.channel.clone()
    }

    /// Resolves when the connection goes away.
    pub async fn closed(&mut self) -> ConnectionEvent {
        match self.events.as_mut() {
            Some(rx) => {
                let event = rx.await.unwrap_or(ConnectionEvent::Closed);
                self.events = None;
                event
            }
            None => std::future::pending().await,
        }
    }

    pub fn close(&mut self) {
        self.channel.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.writer.abort();
        lock_pending(&self.channel.pending).clear();
        self.events = None;
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Hands a `{Ref, Reply}` message to the call waiting on `Ref`.
fn route_reply(pending: &PendingCalls, message: Term) {
    let Term::Tuple(mut items) = message else {
        return;
    };
    if items.len() != 2 {
        return;
    }
    let reply = items.pop();
    let waiter = match items.first() {
        Some(Term::Reference(reference)) => lock_pending(pending).remove(&reference.ids),
        _ => None,
    };
    if let (Some(waiter), Some(reply)) = (waiter, reply) {
        let _ = waiter.send(reply);
    }
}
