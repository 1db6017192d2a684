//! Link tasks: one command link and one pub/sub link per instance.
//!
//! Each task owns its socket and reports everything back to the server
//! loop over a channel; the engine's link-state bookkeeping is the only
//! authority on which incarnation (generation) is current, so every
//! message carries the generation it was produced under.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use vigil_core::{InstanceId, IsDownReply, LinkKind};
use vigil_types::Epoch;
use vigil_wire::{cmd, Frame};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How the server loop should route a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    Ping,
    Info,
    /// Fire-and-forget commands; only the pending counter cares.
    Ack,
    IsDown,
}

/// A request written on a command link.
#[derive(Debug)]
pub(crate) struct LinkRequest {
    pub frame: Frame,
    pub reply: ReplyKind,
}

/// Everything a link task can report back to the server loop.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Up {
        id: InstanceId,
        kind: LinkKind,
        generation: u64,
    },
    Down {
        id: InstanceId,
        kind: LinkKind,
        generation: u64,
    },
    PingReply {
        id: InstanceId,
        generation: u64,
        text: String,
    },
    InfoReply {
        id: InstanceId,
        generation: u64,
        text: String,
    },
    Acked {
        id: InstanceId,
        generation: u64,
    },
    IsDownReply {
        id: InstanceId,
        generation: u64,
        reply: IsDownReply,
    },
    Hello {
        payload: String,
    },
    PubsubActivity {
        id: InstanceId,
    },
}

/// Server-side handle to a running link task.
#[derive(Debug)]
pub(crate) struct LinkHandle {
    pub generation: u64,
    pub tx: Option<mpsc::UnboundedSender<LinkRequest>>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn send(&self, request: LinkRequest) {
        if let Some(tx) = &self.tx {
            tx.send(request).ok();
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns a command-link task.
pub(crate) fn spawn_command_link(
    id: InstanceId,
    addr: SocketAddr,
    auth: Option<String>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> LinkHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(command_link(id, addr, auth, generation, rx, events));
    LinkHandle {
        generation,
        tx: Some(tx),
        task,
    }
}

/// Spawns a pub/sub link task subscribed to the hello channel.
pub(crate) fn spawn_pubsub_link(
    id: InstanceId,
    addr: SocketAddr,
    auth: Option<String>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> LinkHandle {
    let task = tokio::spawn(pubsub_link(id, addr, auth, generation, events));
    LinkHandle {
        generation,
        tx: None,
        task,
    }
}

// ============================================================================
// Frame-oriented stream reader
// ============================================================================

struct FrameReader {
    stream: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    fn new(stream: OwnedReadHalf) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Next complete frame, or `None` on clean EOF. Decoding state lives
    /// in `self.buf`, so this is safe to race in a `select!`.
    async fn next(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            match Frame::decode(&mut self.buf) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(err) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        err.to_string(),
                    ))
                }
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}

async fn write_frame(stream: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);
    stream.write_all(&buf).await
}

async fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))?
}

// ============================================================================
// Command link
// ============================================================================

async fn command_link(
    id: InstanceId,
    addr: SocketAddr,
    auth: Option<String>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<LinkRequest>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let down = |why: &str| {
        trace!(%id, generation, why, "command link down");
        events
            .send(LinkEvent::Down {
                id: id.clone(),
                kind: LinkKind::Command,
                generation,
            })
            .ok();
    };

    let stream = match connect(addr).await {
        Ok(stream) => stream,
        Err(err) => {
            down(&err.to_string());
            return;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    // Authentication failures are not fatal: the node may simply not
    // require auth, and pings will tell us whether it serves us.
    if let Some(secret) = auth {
        if write_frame(&mut write_half, &cmd::auth(&secret)).await.is_err() {
            down("auth write failed");
            return;
        }
        match reader.next().await {
            Ok(Some(_)) => {}
            _ => {
                down("auth reply missing");
                return;
            }
        }
    }

    events
        .send(LinkEvent::Up {
            id: id.clone(),
            kind: LinkKind::Command,
            generation,
        })
        .ok();

    let mut in_flight: VecDeque<ReplyKind> = VecDeque::new();
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else {
                    // Server dropped the handle; the link is dead.
                    return;
                };
                if write_frame(&mut write_half, &request.frame).await.is_err() {
                    down("write failed");
                    return;
                }
                in_flight.push_back(request.reply);
            }
            frame = reader.next() => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => { down("eof"); return; }
                    Err(err) => { down(&err.to_string()); return; }
                };
                let Some(kind) = in_flight.pop_front() else {
                    debug!(%id, "unsolicited frame on command link, dropping");
                    continue;
                };
                route_reply(&id, generation, kind, frame, &events);
            }
        }
    }
}

fn route_reply(
    id: &InstanceId,
    generation: u64,
    kind: ReplyKind,
    frame: Frame,
    events: &mpsc::UnboundedSender<LinkEvent>,
) {
    let event = match kind {
        ReplyKind::Ping => LinkEvent::PingReply {
            id: id.clone(),
            generation,
            text: frame.as_text().unwrap_or_default().to_string(),
        },
        ReplyKind::Info => LinkEvent::InfoReply {
            id: id.clone(),
            generation,
            text: frame.as_text().unwrap_or_default().to_string(),
        },
        ReplyKind::Ack => LinkEvent::Acked {
            id: id.clone(),
            generation,
        },
        ReplyKind::IsDown => {
            let Some(reply) = parse_is_down_reply(&frame) else {
                // Malformed reply still settles the pending slot.
                events
                    .send(LinkEvent::Acked {
                        id: id.clone(),
                        generation,
                    })
                    .ok();
                return;
            };
            LinkEvent::IsDownReply {
                id: id.clone(),
                generation,
                reply,
            }
        }
    };
    events.send(event).ok();
}

/// `IS-PRIMARY-DOWN-BY-ADDR` replies are `[0|1, runid, epoch]`.
fn parse_is_down_reply(frame: &Frame) -> Option<IsDownReply> {
    let items = frame.as_array()?;
    if items.len() != 3 {
        return None;
    }
    Some(IsDownReply {
        is_down: items[0].as_integer()? != 0,
        leader: items[1].as_text()?.to_string(),
        leader_epoch: Epoch::from(u64::try_from(items[2].as_integer()?).ok()?),
    })
}

// ============================================================================
// Pub/sub link
// ============================================================================

async fn pubsub_link(
    id: InstanceId,
    addr: SocketAddr,
    auth: Option<String>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let down = |why: &str| {
        trace!(%id, generation, why, "pubsub link down");
        events
            .send(LinkEvent::Down {
                id: id.clone(),
                kind: LinkKind::Pubsub,
                generation,
            })
            .ok();
    };

    let stream = match connect(addr).await {
        Ok(stream) => stream,
        Err(err) => {
            down(&err.to_string());
            return;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    if let Some(secret) = auth {
        if write_frame(&mut write_half, &cmd::auth(&secret)).await.is_err() {
            down("auth write failed");
            return;
        }
        if !matches!(reader.next().await, Ok(Some(_))) {
            down("auth reply missing");
            return;
        }
    }

    // Subscription failure tears the link down; the engine retries on
    // the next tick.
    if write_frame(&mut write_half, &cmd::subscribe_hello()).await.is_err() {
        down("subscribe write failed");
        return;
    }
    match reader.next().await {
        Ok(Some(Frame::Array(_))) => {}
        _ => {
            down("subscribe rejected");
            return;
        }
    }

    events
        .send(LinkEvent::Up {
            id: id.clone(),
            kind: LinkKind::Pubsub,
            generation,
        })
        .ok();

    loop {
        let frame = match reader.next().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                down("eof");
                return;
            }
            Err(err) => {
                down(&err.to_string());
                return;
            }
        };

        events.send(LinkEvent::PubsubActivity { id: id.clone() }).ok();

        // Push messages are [message, channel, payload].
        if let Some(items) = frame.as_array() {
            if items.len() == 3
                && items[0].as_text().map(str::to_ascii_lowercase).as_deref()
                    == Some("message")
            {
                if let Some(payload) = items[2].as_text() {
                    events
                        .send(LinkEvent::Hello {
                            payload: payload.to_string(),
                        })
                        .ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_down_reply_parses_the_three_fields() {
        let frame = Frame::Array(vec![
            Frame::Integer(1),
            Frame::bulk(&b"abc"[..]),
            Frame::Integer(7),
        ]);
        let reply = parse_is_down_reply(&frame).unwrap();
        assert!(reply.is_down);
        assert_eq!(reply.leader, "abc");
        assert_eq!(reply.leader_epoch, Epoch::from(7));
    }

    #[test]
    fn is_down_reply_rejects_wrong_shapes() {
        assert!(parse_is_down_reply(&Frame::Null).is_none());
        assert!(parse_is_down_reply(&Frame::Array(vec![Frame::Integer(1)])).is_none());
        let negative_epoch = Frame::Array(vec![
            Frame::Integer(0),
            Frame::bulk(&b"?"[..]),
            Frame::Integer(-4),
        ]);
        assert!(parse_is_down_reply(&negative_epoch).is_none());
    }
}
