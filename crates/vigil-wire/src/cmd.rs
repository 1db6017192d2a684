//! Builders for the commands the supervisor issues.

use vigil_types::{constants::HELLO_CHANNEL, Address, Epoch};

use crate::Frame;

pub fn ping() -> Frame {
    Frame::command(["PING"])
}

pub fn info() -> Frame {
    Frame::command(["INFO"])
}

pub fn auth(secret: &str) -> Frame {
    Frame::command(["AUTH", secret])
}

/// `REPLICAOF host port`, or `REPLICAOF NO ONE` to promote.
pub fn replicaof(target: Option<Address>) -> Frame {
    match target {
        Some(addr) => Frame::command([
            "REPLICAOF".to_string(),
            addr.ip.to_string(),
            addr.port.to_string(),
        ]),
        None => Frame::command(["REPLICAOF", "NO", "ONE"]),
    }
}

/// Best-effort request that the node persists its current configuration.
pub fn config_rewrite() -> Frame {
    Frame::command(["CONFIG", "REWRITE"])
}

/// Kills a long-running server-side script wedging the instance.
pub fn script_kill() -> Frame {
    Frame::command(["SCRIPT", "KILL"])
}

pub fn subscribe_hello() -> Frame {
    Frame::command(["SUBSCRIBE", HELLO_CHANNEL])
}

pub fn publish_hello(payload: &str) -> Frame {
    Frame::command(["PUBLISH", HELLO_CHANNEL, payload])
}

/// Peer liveness probe: asks a peer supervisor for its opinion of a
/// primary, optionally requesting its election vote.
pub fn is_primary_down_by_addr(
    addr: Address,
    epoch: Epoch,
    runid: &str,
) -> Frame {
    Frame::command([
        "IS-PRIMARY-DOWN-BY-ADDR".to_string(),
        addr.ip.to_string(),
        addr.port.to_string(),
        epoch.as_u64().to_string(),
        runid.to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn words(frame: &Frame) -> Vec<String> {
        frame
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f.as_text().unwrap().to_string())
            .collect()
    }

    #[test]
    fn replicaof_no_one_is_three_words() {
        assert_eq!(words(&replicaof(None)), ["REPLICAOF", "NO", "ONE"]);
    }

    #[test]
    fn replicaof_renders_target() {
        let addr = Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6380);
        assert_eq!(
            words(&replicaof(Some(addr))),
            ["REPLICAOF", "10.0.0.2", "6380"]
        );
    }

    #[test]
    fn ask_command_carries_epoch_and_runid() {
        let addr = Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6379);
        assert_eq!(
            words(&is_primary_down_by_addr(addr, Epoch::from(5), "*")),
            ["IS-PRIMARY-DOWN-BY-ADDR", "10.0.0.1", "6379", "5", "*"]
        );
    }
}
