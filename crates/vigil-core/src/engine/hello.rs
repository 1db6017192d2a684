//! Hello gossip ingestion.
//!
//! Every supervisor periodically publishes a nine-field hello on the
//! shared channel of each monitored node:
//!
//! ```text
//! <ip>,<port>,<runid>,<can-failover>,<current-epoch>,
//! <primary-name>,<primary-ip>,<primary-port>,<primary-config-epoch>
//! ```
//!
//! Receiving one registers the sender as a peer, adopts a higher global
//! epoch, and adopts a newer primary configuration (address switch) when
//! the advertised config epoch beats ours.

use vigil_types::{Address, Epoch, EventLevel, InstanceRole, RunId};

use crate::instance::{Peer, Primary};
use crate::{EngineOutput, InstanceId};

use super::{emit, EmitCtx, Engine};

/// A parsed hello payload.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct HelloMessage {
    pub addr: Address,
    pub run_id: String,
    pub can_failover: bool,
    pub current_epoch: Epoch,
    pub primary_name: String,
    pub primary_host: String,
    pub primary_port: u16,
    pub primary_config_epoch: Epoch,
}

/// Parses the comma-separated payload. Anything malformed is `None`; the
/// sender is not trusted.
pub(crate) fn parse_hello(payload: &str) -> Option<HelloMessage> {
    let tokens: Vec<&str> = payload.split(',').collect();
    if tokens.len() != 9 {
        return None;
    }

    let port: u32 = tokens[1].parse().ok()?;
    let addr = Address::resolve(tokens[0], port).ok()?;
    let can_failover = match tokens[3] {
        "0" => false,
        "1" => true,
        _ => return None,
    };

    Some(HelloMessage {
        addr,
        run_id: tokens[2].to_string(),
        can_failover,
        current_epoch: Epoch::from(tokens[4].parse::<u64>().ok()?),
        primary_name: tokens[5].to_string(),
        primary_host: tokens[6].to_string(),
        primary_port: tokens[7].parse().ok()?,
        primary_config_epoch: Epoch::from(tokens[8].parse::<u64>().ok()?),
    })
}

impl Engine {
    /// A message arrived on the hello channel of any monitored node.
    pub fn hello_received(&mut self, payload: &str, now: u64) -> EngineOutput {
        let mut out = EngineOutput::empty();
        let Some(hello) = parse_hello(payload) else {
            tracing::debug!(payload, "ignoring malformed hello");
            return out;
        };

        // Our own gossip loops straight back through the channel.
        if hello.run_id == self.run_id.as_str() {
            return out;
        }

        let Some(mut primary) = self.primaries.remove(&hello.primary_name) else {
            return out;
        };

        self.register_peer(&mut primary, &hello, now, &mut out);

        if hello.current_epoch > self.current_epoch {
            self.current_epoch = hello.current_epoch;
            let ctx = EmitCtx::of(&primary);
            emit(
                &mut out,
                Some(&ctx),
                EventLevel::Warning,
                "+new-epoch",
                self.current_epoch.to_string(),
            );
        }

        self.adopt_config(&mut primary, &hello, now, &mut out);

        self.primaries.insert(primary.name().to_string(), primary);
        out
    }

    /// Finds or (re)creates the peer entry for a hello sender.
    ///
    /// An entry matches only when both run id and address agree. When the
    /// sender restarted (new run id) or moved (new address), every entry
    /// matching either key is removed first, so the peer count stays flat
    /// across restarts.
    fn register_peer(
        &mut self,
        primary: &mut Primary,
        hello: &HelloMessage,
        now: u64,
        out: &mut EngineOutput,
    ) {
        let ctx = EmitCtx::of(primary);
        let name = hello.addr.instance_name();
        let run_id = RunId::new(hello.run_id.clone());

        let exact = primary
            .peers
            .get(&name)
            .is_some_and(|p| p.inst.run_id.as_ref() == Some(&run_id));

        if !exact {
            let stale: Vec<String> = primary
                .peers
                .iter()
                .filter(|(_, p)| {
                    p.inst.addr == hello.addr || p.inst.run_id.as_ref() == Some(&run_id)
                })
                .map(|(n, _)| n.clone())
                .collect();
            for stale_name in stale {
                if let Some(mut peer) = primary.peers.remove(&stale_name) {
                    let id =
                        InstanceId::child(&ctx.name, InstanceRole::Peer, &stale_name);
                    Self::kill_links(&id, &mut peer.inst, out);
                    let body = ctx.child_body(InstanceRole::Peer, &peer.inst);
                    emit(out, Some(&ctx), EventLevel::Warning, "-dup-sentinel", body);
                }
            }

            let peer = Peer::new(hello.addr, run_id, primary.inst.down_after_ms, now);
            let body = ctx.child_body(InstanceRole::Peer, &peer.inst);
            emit(out, Some(&ctx), EventLevel::Info, "+sentinel", body);
            primary.peers.insert(name.clone(), peer);
        }

        let peer = primary.peers.get_mut(&name).expect("inserted above");
        peer.last_hello_received = now;
        peer.can_failover = hello.can_failover;
    }

    /// Adopts a newer primary configuration from gossip. The switch
    /// itself is suppressed during tilt; a later hello re-triggers it.
    fn adopt_config(
        &mut self,
        primary: &mut Primary,
        hello: &HelloMessage,
        now: u64,
        out: &mut EngineOutput,
    ) {
        if hello.primary_config_epoch <= primary.config_epoch {
            return;
        }

        let addr = primary.addr();
        let addr_differs =
            hello.primary_host != addr.ip.to_string() || hello.primary_port != addr.port;

        if !addr_differs {
            primary.config_epoch = hello.primary_config_epoch;
            return;
        }

        if self.tilt_since.is_some() {
            return;
        }

        let Ok(new_addr) =
            Address::resolve(&hello.primary_host, u32::from(hello.primary_port))
        else {
            return;
        };

        primary.config_epoch = hello.primary_config_epoch;

        let ctx = EmitCtx::of(primary);
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+config-update-from",
            format!("sentinel {} {}", hello.run_id, hello.addr),
        );
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+switch-master",
            format!(
                "{} {} {} {} {}",
                primary.name(),
                addr.ip,
                addr.port,
                new_addr.ip,
                new_addr.port
            ),
        );
        self.switch_primary_address(primary, new_addr, now, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> String {
        "10.0.0.8,26379,aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa,1,3,cache,10.0.0.1,6379,2"
            .to_string()
    }

    #[test]
    fn parses_a_full_payload() {
        let hello = parse_hello(&payload()).unwrap();
        assert_eq!(hello.addr.to_string(), "10.0.0.8:26379");
        assert_eq!(hello.run_id, "a".repeat(40));
        assert!(hello.can_failover);
        assert_eq!(hello.current_epoch, Epoch::from(3));
        assert_eq!(hello.primary_name, "cache");
        assert_eq!(hello.primary_host, "10.0.0.1");
        assert_eq!(hello.primary_port, 6379);
        assert_eq!(hello.primary_config_epoch, Epoch::from(2));
    }

    #[test]
    fn rejects_wrong_arity_and_bad_fields() {
        assert_eq!(parse_hello(""), None);
        assert_eq!(parse_hello("a,b,c"), None);
        assert_eq!(
            parse_hello("10.0.0.8,26379,r,2,3,cache,10.0.0.1,6379,2"),
            None,
            "can-failover must be 0 or 1"
        );
        assert_eq!(
            parse_hello("10.0.0.8,0,r,1,3,cache,10.0.0.1,6379,2"),
            None,
            "port zero is invalid"
        );
        assert_eq!(
            parse_hello("10.0.0.8,26379,r,1,x,cache,10.0.0.1,6379,2"),
            None,
            "epoch must be numeric"
        );
    }
}
