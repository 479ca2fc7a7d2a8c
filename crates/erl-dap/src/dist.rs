//! Port mapper lookup and the distribution handshake.
//!
//! The adapter connects as a hidden node: it completes the cookie challenge,
//! answers ticks and talks to registered processes through pass-through
//! packets, without publishing itself to the rest of the cluster.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::term::{Pid, Term, TermError};

pub const DEFAULT_EPMD_PORT: u16 = 4369;

/// Largest post-handshake packet the adapter buffers. Bigger ones are skipped.
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

const PORT_PLEASE2_REQ: u8 = 122;
const PORT2_RESP: u8 = 119;

const TAG_SEND_NAME: u8 = b'N';
const TAG_STATUS: u8 = b's';
const TAG_CHALLENGE_REPLY: u8 = b'r';
const TAG_CHALLENGE_ACK: u8 = b'a';

const PASS_THROUGH: u8 = b'p';
const CONTROL_SEND: i64 = 2;
const CONTROL_REG_SEND: i64 = 6;
const CONTROL_SEND_SENDER: i64 = 22;

pub const DFLAG_EXTENDED_REFERENCES: u64 = 0x4;
pub const DFLAG_DIST_MONITOR: u64 = 0x8;
pub const DFLAG_FUN_TAGS: u64 = 0x10;
pub const DFLAG_NEW_FUN_TAGS: u64 = 0x80;
pub const DFLAG_EXTENDED_PIDS_PORTS: u64 = 0x100;
pub const DFLAG_EXPORT_PTR_TAG: u64 = 0x200;
pub const DFLAG_BIT_BINARIES: u64 = 0x400;
pub const DFLAG_NEW_FLOATS: u64 = 0x800;
pub const DFLAG_UTF8_ATOMS: u64 = 0x10000;
pub const DFLAG_MAP_TAG: u64 = 0x20000;
pub const DFLAG_BIG_CREATION: u64 = 0x40000;
pub const DFLAG_HANDSHAKE_23: u64 = 0x100_0000;
pub const DFLAG_UNLINK_ID: u64 = 0x200_0000;
pub const DFLAG_V4_NC: u64 = 1 << 34;

/// Capabilities announced by the adapter. Publishing is left out so the
/// adapter stays hidden.
pub const LOCAL_FLAGS: u64 = DFLAG_EXTENDED_REFERENCES
    | DFLAG_DIST_MONITOR
    | DFLAG_FUN_TAGS
    | DFLAG_NEW_FUN_TAGS
    | DFLAG_EXTENDED_PIDS_PORTS
    | DFLAG_EXPORT_PTR_TAG
    | DFLAG_BIT_BINARIES
    | DFLAG_NEW_FLOATS
    | DFLAG_UTF8_ATOMS
    | DFLAG_MAP_TAG
    | DFLAG_BIG_CREATION
    | DFLAG_HANDSHAKE_23
    | DFLAG_UNLINK_ID
    | DFLAG_V4_NC;

#[derive(Error, Debug)]
pub enum DistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node `{0}` is not registered with the port mapper")]
    NotRegistered(String),
    #[error("unexpected reply from {peer}: {detail}")]
    Protocol { peer: &'static str, detail: String },
    #[error("handshake rejected with status `{0}`")]
    Rejected(String),
    #[error("peer closed the connection after the challenge reply")]
    ClosedAfterChallenge,
    #[error("challenge acknowledgement digest does not match the cookie")]
    DigestMismatch,
}

/// Registration reported by the port mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistration {
    pub port: u16,
    pub highest_version: u16,
    pub lowest_version: u16,
}

/// Asks the port mapper for the distribution port of `alive_name`.
pub async fn port_please<S>(stream: &mut S, alive_name: &str) -> Result<NodeRegistration, DistError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(3 + alive_name.len());
    request.extend_from_slice(&(1 + alive_name.len() as u16).to_be_bytes());
    request.push(PORT_PLEASE2_REQ);
    request.extend_from_slice(alive_name.as_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let tag = stream.read_u8().await?;
    if tag != PORT2_RESP {
        return Err(DistError::Protocol {
            peer: "port mapper",
            detail: format!("response tag {tag}"),
        });
    }

    let result = stream.read_u8().await?;
    if result != 0 {
        return Err(DistError::NotRegistered(alive_name.to_string()));
    }

    let port = stream.read_u16().await?;
    let _node_type = stream.read_u8().await?;
    let _protocol = stream.read_u8().await?;
    let highest_version = stream.read_u16().await?;
    let lowest_version = stream.read_u16().await?;

    debug!(alive_name, port, "Port mapper resolved node");

    Ok(NodeRegistration {
        port,
        highest_version,
        lowest_version,
    })
}

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub peer_name: String,
    pub peer_flags: u64,
    pub peer_creation: u32,
}

/// Runs the initiating side of the handshake over an established stream.
/// `creation` is the incarnation stamped into pids the adapter hands out.
pub async fn handshake<S>(
    stream: &mut S,
    local_name: &str,
    cookie: &str,
    creation: u32,
) -> Result<Handshake, DistError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut send_name = Vec::with_capacity(15 + local_name.len());
    send_name.push(TAG_SEND_NAME);
    send_name.extend_from_slice(&LOCAL_FLAGS.to_be_bytes());
    send_name.extend_from_slice(&creation.to_be_bytes());
    send_name.extend_from_slice(&(local_name.len() as u16).to_be_bytes());
    send_name.extend_from_slice(local_name.as_bytes());
    write_handshake_packet(stream, &send_name).await?;

    let status = read_handshake_packet(stream).await?;
    match status.split_first() {
        Some((&TAG_STATUS, rest)) => {
            let status = String::from_utf8_lossy(rest).to_string();
            if status != "ok" && status != "ok_simultaneous" {
                return Err(DistError::Rejected(status));
            }
        }
        _ => {
            return Err(DistError::Protocol {
                peer: "node",
                detail: "expected status message".to_string(),
            });
        }
    }

    let challenge = read_handshake_packet(stream).await?;
    let peer = parse_challenge(&challenge)?;

    let own_challenge = random_u32();
    let mut reply = Vec::with_capacity(21);
    reply.push(TAG_CHALLENGE_REPLY);
    reply.extend_from_slice(&own_challenge.to_be_bytes());
    reply.extend_from_slice(&gen_digest(peer.challenge, cookie));
    write_handshake_packet(stream, &reply).await?;

    let ack = match read_handshake_packet(stream).await {
        Ok(ack) => ack,
        Err(DistError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(DistError::ClosedAfterChallenge);
        }
        Err(e) => return Err(e),
    };

    match ack.split_first() {
        Some((&TAG_CHALLENGE_ACK, digest)) if digest == gen_digest(own_challenge, cookie) => {
            debug!(peer = %peer.name, "Distribution handshake completed");
            Ok(Handshake {
                peer_name: peer.name,
                peer_flags: peer.flags,
                peer_creation: peer.creation,
            })
        }
        Some((&TAG_CHALLENGE_ACK, _)) => Err(DistError::DigestMismatch),
        _ => Err(DistError::Protocol {
            peer: "node",
            detail: "expected challenge acknowledgement".to_string(),
        }),
    }
}

struct Challenge {
    flags: u64,
    challenge: u32,
    creation: u32,
    name: String,
}

fn parse_challenge(packet: &[u8]) -> Result<Challenge, DistError> {
    let invalid = |detail: &str| DistError::Protocol {
        peer: "node",
        detail: detail.to_string(),
    };

    let (tag, body) = packet.split_first().ok_or_else(|| invalid("empty challenge"))?;
    if *tag != TAG_SEND_NAME {
        return Err(invalid("only version 6 challenges are supported"));
    }
    if body.len() < 18 {
        return Err(invalid("truncated challenge"));
    }

    let flags = u64::from_be_bytes(body[0..8].try_into().map_err(|_| invalid("flags"))?);
    let challenge = u32::from_be_bytes(body[8..12].try_into().map_err(|_| invalid("challenge"))?);
    let creation = u32::from_be_bytes(body[12..16].try_into().map_err(|_| invalid("creation"))?);
    let name_len = u16::from_be_bytes([body[16], body[17]]) as usize;
    let name = body
        .get(18..18 + name_len)
        .ok_or_else(|| invalid("truncated node name"))?;

    Ok(Challenge {
        flags,
        challenge,
        creation,
        name: String::from_utf8_lossy(name).to_string(),
    })
}

/// Digest the peer expects for `challenge`: MD5 of the cookie followed by the
/// challenge in decimal.
pub fn gen_digest(challenge: u32, cookie: &str) -> [u8; 16] {
    let mut input = cookie.as_bytes().to_vec();
    input.extend_from_slice(challenge.to_string().as_bytes());
    md5::compute(input).0
}

async fn write_handshake_packet<S>(stream: &mut S, body: &[u8]) -> Result<(), DistError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u16(body.len() as u16).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_handshake_packet<S>(stream: &mut S) -> Result<Vec<u8>, DistError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u16().await? as usize;
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// One post-handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Tick,
    Message(Vec<u8>),
    /// Body longer than [`MAX_PACKET_LEN`]; it was read and discarded.
    Skipped(usize),
}

pub async fn read_packet<S>(stream: &mut S) -> std::io::Result<Packet>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len == 0 {
        return Ok(Packet::Tick);
    }

    if len > MAX_PACKET_LEN {
        let skipped = tokio::io::copy(&mut (&mut *stream).take(len as u64), &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        warn!(len, "Skipped oversized distribution packet");
        return Ok(Packet::Skipped(len));
    }

    let mut body = vec![0; len];
    stream.read_exact(&mut body).await?;
    Ok(Packet::Message(body))
}

/// Writes one framed packet; an empty body is a tick.
pub async fn write_packet<S>(stream: &mut S, body: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Random value from the OS generator, for challenges, creations and
/// reference ids.
pub fn random_u32() -> u32 {
    Uuid::new_v4().as_u128() as u32
}

/// Pass-through packet delivering `message` to the process registered as
/// `to_name` on the peer.
pub fn reg_send_packet(from: &Pid, to_name: &str, message: &Term) -> Vec<u8> {
    let control = Term::tuple([
        Term::Int(CONTROL_REG_SEND),
        Term::Pid(from.clone()),
        Term::atom(""),
        Term::atom(to_name),
    ]);

    let mut packet = vec![PASS_THROUGH];
    packet.extend_from_slice(&control.encode());
    packet.extend_from_slice(&message.encode());
    packet
}

/// A message addressed to one of the adapter's pids.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: Pid,
    pub message: Term,
}

/// Extracts a delivered message from a packet body. Other control messages
/// (links, monitors, exits) yield `None`.
pub fn parse_delivery(body: &[u8]) -> Result<Option<Delivery>, TermError> {
    let Some((&PASS_THROUGH, rest)) = body.split_first() else {
        return Ok(None);
    };

    let (control, used) = Term::decode(rest)?;
    let to = match control.as_tuple() {
        Some([op, _, Term::Pid(to)]) if op.as_int() == Some(CONTROL_SEND) => to.clone(),
        Some([op, _, Term::Pid(to)]) if op.as_int() == Some(CONTROL_SEND_SENDER) => to.clone(),
        _ => return Ok(None),
    };

    let (message, _) = Term::decode(&rest[used..])?;
    Ok(Some(Delivery { to, message }))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted peers for connector tests.

    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use tokio::net::TcpListener;

    /// Answers `rpc:call(Module, Function, Args)` on the fake node.
    pub type Responder = Arc<dyn Fn(&str, &str, &[Term]) -> Term + Send + Sync>;

    /// Port mapper answering every lookup with `node_port`, or "not
    /// registered" when `None`.
    pub async fn spawn_epmd(node_port: Option<u16>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let len = stream.read_u16().await.unwrap() as usize;
                let mut req = vec![0; len];
                stream.read_exact(&mut req).await.unwrap();
                assert_eq!(req[0], PORT_PLEASE2_REQ);

                let mut resp = vec![PORT2_RESP];
                match node_port {
                    Some(p) => {
                        resp.push(0);
                        resp.extend_from_slice(&p.to_be_bytes());
                        resp.extend_from_slice(&[77, 0, 0, 6, 0, 5]);
                        resp.extend_from_slice(&((len - 1) as u16).to_be_bytes());
                        resp.extend_from_slice(&req[1..]);
                        resp.extend_from_slice(&0u16.to_be_bytes());
                    }
                    None => resp.push(1),
                }
                stream.write_all(&resp).await.unwrap();
            }
        });

        port
    }

    /// Node accepting handshakes that present `cookie`. Wrong cookies get the
    /// connection closed, like a real node does. Every rpc returns `ok`.
    pub async fn spawn_node(name: &'static str, cookie: &'static str) -> u16 {
        spawn_node_with(name, cookie, Arc::new(|_, _, _| Term::atom("ok"))).await
    }

    /// Like [`spawn_node`], with `rex` calls answered by `responder`.
    pub async fn spawn_node_with(name: &'static str, cookie: &'static str, responder: Responder) -> u16 {
        serve_node(name, cookie, responder, None).await
    }

    /// Node that drops every connection `lifetime` after the handshake.
    pub async fn spawn_short_lived_node(name: &'static str, cookie: &'static str, lifetime: Duration) -> u16 {
        serve_node(name, cookie, Arc::new(|_, _, _| Term::atom("ok")), Some(lifetime)).await
    }

    async fn serve_node(
        name: &'static str,
        cookie: &'static str,
        responder: Responder,
        lifetime: Option<Duration>,
    ) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let responder = responder.clone();
                tokio::spawn(async move {
                    let _send_name = read_handshake_packet(&mut stream).await.unwrap();
                    write_handshake_packet(&mut stream, b"sok").await.unwrap();

                    let challenge = random_u32();
                    let mut packet = vec![TAG_SEND_NAME];
                    packet.extend_from_slice(&LOCAL_FLAGS.to_be_bytes());
                    packet.extend_from_slice(&challenge.to_be_bytes());
                    packet.extend_from_slice(&7u32.to_be_bytes());
                    packet.extend_from_slice(&(name.len() as u16).to_be_bytes());
                    packet.extend_from_slice(name.as_bytes());
                    write_handshake_packet(&mut stream, &packet).await.unwrap();

                    let reply = read_handshake_packet(&mut stream).await.unwrap();
                    if reply[5..21] != gen_digest(challenge, cookie) {
                        return;
                    }
                    let their_challenge = u32::from_be_bytes(reply[1..5].try_into().unwrap());
                    let mut ack = vec![TAG_CHALLENGE_ACK];
                    ack.extend_from_slice(&gen_digest(their_challenge, cookie));
                    write_handshake_packet(&mut stream, &ack).await.unwrap();

                    write_packet(&mut stream, &[]).await.unwrap();
                    let serve = async {
                        while let Ok(packet) = read_packet(&mut stream).await {
                            let Packet::Message(body) = packet else {
                                continue;
                            };
                            if let Some(answer) = answer_rpc(&body, &*responder)
                                && write_packet(&mut stream, &answer).await.is_err()
                            {
                                break;
                            }
                        }
                    };
                    match lifetime {
                        Some(lifetime) => {
                            let _ = tokio::time::timeout(lifetime, serve).await;
                        }
                        None => serve.await,
                    }
                });
            }
        });

        port
    }

    /// Turns a `rex` `$gen_call` into the pass-through reply packet.
    fn answer_rpc(body: &[u8], responder: &(dyn Fn(&str, &str, &[Term]) -> Term + Send + Sync)) -> Option<Vec<u8>> {
        let Some((&PASS_THROUGH, rest)) = body.split_first() else {
            return None;
        };
        let (control, used) = Term::decode(rest).ok()?;
        let [op, _, _, to] = control.as_tuple()? else {
            return None;
        };
        if op.as_int() != Some(CONTROL_REG_SEND) || !to.is_atom("rex") {
            return None;
        }

        let (message, _) = Term::decode(&rest[used..]).ok()?;
        let [tag, from, request] = message.as_tuple()? else {
            return None;
        };
        let [Term::Pid(caller), reference] = from.as_tuple()? else {
            return None;
        };
        let [call, module, function, args, _] = request.as_tuple()? else {
            return None;
        };
        if !tag.is_atom("$gen_call") || !call.is_atom("call") {
            return None;
        }

        let result = responder(module.as_atom()?, function.as_atom()?, args.as_list()?);
        let control = Term::tuple([Term::Int(CONTROL_SEND), Term::atom(""), Term::Pid(caller.clone())]);
        let mut packet = vec![PASS_THROUGH];
        packet.extend_from_slice(&control.encode());
        packet.extend_from_slice(&Term::tuple([reference.clone(), result]).encode());
        Some(packet)
    }

    /// Node that rejects every handshake with `status`.
    pub async fn spawn_rejecting_node(status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = read_handshake_packet(&mut stream).await;
                let mut packet = vec![TAG_STATUS];
                packet.extend_from_slice(status.as_bytes());
                let _ = write_handshake_packet(&mut stream, &packet).await;
            }
        });

        port
    }
}
