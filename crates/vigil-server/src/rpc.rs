//! Peer-facing RPC listener.
//!
//! Peers and operators speak the monitored store's own protocol to us:
//! `PING`, `IS-PRIMARY-DOWN-BY-ADDR`, and the introspection surface
//! (`MASTERS`, `SLAVES`, `SENTINELS`, `GET-MASTER-ADDR-BY-NAME`,
//! `RESET`, `FAILOVER`, `PENDING-SCRIPTS`). Connection tasks parse
//! requests and forward them to the server loop, which owns the engine.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use vigil_types::Epoch;
use vigil_wire::Frame;

/// A parsed request from a peer or operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RpcCommand {
    Ping,
    IsPrimaryDown {
        ip: String,
        port: u16,
        epoch: Epoch,
        runid: String,
    },
    Masters,
    Slaves(String),
    Sentinels(String),
    GetPrimaryAddr(String),
    Reset(String),
    Failover(String),
    PendingScripts,
}

/// One in-flight request: the command plus where to send the reply.
#[derive(Debug)]
pub(crate) struct RpcRequest {
    pub command: RpcCommand,
    pub reply: oneshot::Sender<Frame>,
}

/// Accept loop. Each connection gets its own task; requests funnel into
/// the server loop through `requests`.
pub(crate) async fn serve(listener: TcpListener, requests: mpsc::UnboundedSender<RpcRequest>) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            continue;
        };
        trace!(%peer, "rpc connection accepted");
        tokio::spawn(connection(stream, requests.clone()));
    }
}

async fn connection(mut stream: TcpStream, requests: mpsc::UnboundedSender<RpcRequest>) {
    let mut buf = BytesMut::with_capacity(4 * 1024);

    loop {
        let frame = loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(err) => {
                    debug!(%err, "malformed rpc frame, closing connection");
                    return;
                }
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) => return,
                Ok(_) => {}
                Err(_) => return,
            }
        };

        let reply_frame = match parse_command(&frame) {
            Some(command) => {
                let (tx, rx) = oneshot::channel();
                if requests
                    .send(RpcRequest {
                        command,
                        reply: tx,
                    })
                    .is_err()
                {
                    return;
                }
                match rx.await {
                    Ok(frame) => frame,
                    Err(_) => return,
                }
            }
            None => Frame::Error("ERR unknown command".to_string()),
        };

        let mut out = BytesMut::new();
        reply_frame.encode(&mut out);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Parses an array-of-bulk-strings request into a command.
fn parse_command(frame: &Frame) -> Option<RpcCommand> {
    let words: Vec<String> = frame
        .as_array()?
        .iter()
        .map(|f| f.as_text().map(str::to_string))
        .collect::<Option<_>>()?;
    let (head, args) = words.split_first()?;

    match (head.to_ascii_uppercase().as_str(), args) {
        ("PING", []) => Some(RpcCommand::Ping),
        ("IS-PRIMARY-DOWN-BY-ADDR", [ip, port, epoch, runid]) => {
            Some(RpcCommand::IsPrimaryDown {
                ip: ip.clone(),
                port: port.parse().ok()?,
                epoch: Epoch::from(epoch.parse::<u64>().ok()?),
                runid: runid.clone(),
            })
        }
        ("MASTERS", []) => Some(RpcCommand::Masters),
        ("SLAVES", [name]) => Some(RpcCommand::Slaves(name.clone())),
        ("SENTINELS", [name]) => Some(RpcCommand::Sentinels(name.clone())),
        ("GET-MASTER-ADDR-BY-NAME", [name]) => {
            Some(RpcCommand::GetPrimaryAddr(name.clone()))
        }
        ("RESET", [pattern]) => Some(RpcCommand::Reset(pattern.clone())),
        ("FAILOVER", [name]) => Some(RpcCommand::Failover(name.clone())),
        ("PENDING-SCRIPTS", []) => Some(RpcCommand::PendingScripts),
        _ => None,
    }
}

/// Encodes a field/value description list as a flat array of bulks.
pub(crate) fn encode_fields(fields: &[(String, String)]) -> Frame {
    Frame::Array(
        fields
            .iter()
            .flat_map(|(k, v)| {
                [
                    Frame::bulk(k.clone().into_bytes()),
                    Frame::bulk(v.clone().into_bytes()),
                ]
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Frame {
        Frame::command(parts.iter().copied())
    }

    #[test]
    fn parses_the_operator_surface() {
        assert_eq!(parse_command(&command(&["ping"])), Some(RpcCommand::Ping));
        assert_eq!(
            parse_command(&command(&["MASTERS"])),
            Some(RpcCommand::Masters)
        );
        assert_eq!(
            parse_command(&command(&["SLAVES", "cache"])),
            Some(RpcCommand::Slaves("cache".into()))
        );
        assert_eq!(
            parse_command(&command(&["get-master-addr-by-name", "cache"])),
            Some(RpcCommand::GetPrimaryAddr("cache".into()))
        );
        assert_eq!(
            parse_command(&command(&["RESET", "*"])),
            Some(RpcCommand::Reset("*".into()))
        );
    }

    #[test]
    fn parses_is_primary_down() {
        let parsed = parse_command(&command(&[
            "IS-PRIMARY-DOWN-BY-ADDR",
            "10.0.0.1",
            "6379",
            "4",
            "*",
        ]));
        assert_eq!(
            parsed,
            Some(RpcCommand::IsPrimaryDown {
                ip: "10.0.0.1".into(),
                port: 6379,
                epoch: Epoch::from(4),
                runid: "*".into(),
            })
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(parse_command(&command(&["SLAVES"])), None);
        assert_eq!(
            parse_command(&command(&["IS-PRIMARY-DOWN-BY-ADDR", "x", "y", "z"])),
            None
        );
        assert_eq!(parse_command(&Frame::Integer(3)), None);
        assert_eq!(parse_command(&command(&["FLUSHALL"])), None);
    }
}
