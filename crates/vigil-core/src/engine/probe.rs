//! Link maintenance and the periodic probe loop.
//!
//! Per connected instance, at most one probe is issued per tick, in
//! priority order: info refresh, then ping, then hello publication. The
//! per-link pending cap skips probes entirely when the instance stops
//! draining replies.

use vigil_types::constants::{
    INFO_PERIOD_MS, MAX_PENDING_COMMANDS, MIN_LINK_RECONNECT_PERIOD_MS, PING_PERIOD_MS,
    PUBLISH_PERIOD_MS,
};
use vigil_types::InstanceRole;

use crate::instance::{Instance, Primary};
use crate::{Command, EngineOutput, InstanceId, LinkKind};

use super::Engine;

impl Engine {
    // ========================================================================
    // Link maintenance
    // ========================================================================

    /// Kills stale links and schedules reconnects for absent ones, for the
    /// primary and all of its children.
    pub(super) fn link_step(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        let pname = primary.name().to_string();
        let auth = primary.auth_pass.clone();

        let id = InstanceId::primary(&pname);
        link_step_one(&id, &mut primary.inst, auth.as_deref(), now, out);

        let mut replica_names: Vec<String> = primary.replicas.keys().cloned().collect();
        replica_names.sort();
        for name in replica_names {
            let id = InstanceId::child(&pname, InstanceRole::Replica, &name);
            let replica = primary.replicas.get_mut(&name).expect("name just listed");
            link_step_one(&id, &mut replica.inst, auth.as_deref(), now, out);
        }

        let mut peer_names: Vec<String> = primary.peers.keys().cloned().collect();
        peer_names.sort();
        for name in peer_names {
            let id = InstanceId::child(&pname, InstanceRole::Peer, &name);
            let peer = primary.peers.get_mut(&name).expect("name just listed");
            // Peer supervisors authenticate nothing and have no pub/sub
            // link on our side.
            link_step_one(&id, &mut peer.inst, None, now, out);
        }
    }

    // ========================================================================
    // Probes
    // ========================================================================

    /// Periodic info/ping/hello issuance for the primary and children.
    pub(super) fn probe_step(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        let pname = primary.name().to_string();
        let hello = self.hello_payload(primary);
        let replica_info_period = primary.replica_info_period();

        let id = InstanceId::primary(&pname);
        probe_one(
            &id,
            &mut primary.inst,
            Some(INFO_PERIOD_MS),
            Some(&hello),
            now,
            out,
        );

        let mut replica_names: Vec<String> = primary.replicas.keys().cloned().collect();
        replica_names.sort();
        for name in replica_names {
            let id = InstanceId::child(&pname, InstanceRole::Replica, &name);
            let replica = primary.replicas.get_mut(&name).expect("name just listed");
            probe_one(
                &id,
                &mut replica.inst,
                Some(replica_info_period),
                Some(&hello),
                now,
                out,
            );
        }

        let mut peer_names: Vec<String> = primary.peers.keys().cloned().collect();
        peer_names.sort();
        for name in peer_names {
            let id = InstanceId::child(&pname, InstanceRole::Peer, &name);
            let peer = primary.peers.get_mut(&name).expect("name just listed");
            probe_one(&id, &mut peer.inst, None, None, now, out);
        }
    }
}

/// Link maintenance for one instance.
fn link_step_one(
    id: &InstanceId,
    inst: &mut Instance,
    auth: Option<&str>,
    now: u64,
    out: &mut EngineOutput,
) {
    // A command link that stopped answering pings is torn down so the
    // reconnect below gets a fresh socket.
    if inst.link.cmd_up {
        let age = now.saturating_sub(inst.link.cmd_connected_at);
        let half_down_after = inst.down_after_ms / 2;
        if age > MIN_LINK_RECONNECT_PERIOD_MS
            && inst.ping_sent_at != 0
            && now.saturating_sub(inst.ping_sent_at) > half_down_after
            && now.saturating_sub(inst.last_any_reply) > half_down_after
        {
            out.commands.push(Command::KillLink {
                id: id.clone(),
                kind: LinkKind::Command,
                generation: inst.link.cmd_generation,
            });
            inst.link.cmd_generation += 1;
            inst.link.drop_command();
            inst.ping_sent_at = 0;
        }
    }

    // A silent pub/sub link means we stopped seeing anyone's hellos,
    // including our own; rebuild it.
    if inst.link.pubsub_up {
        let age = now.saturating_sub(inst.link.pubsub_connected_at);
        if age > MIN_LINK_RECONNECT_PERIOD_MS
            && now.saturating_sub(inst.link.last_pubsub_activity) > 3 * PUBLISH_PERIOD_MS
        {
            out.commands.push(Command::KillLink {
                id: id.clone(),
                kind: LinkKind::Pubsub,
                generation: inst.link.pubsub_generation,
            });
            inst.link.pubsub_generation += 1;
            inst.link.drop_pubsub();
        }
    }

    let needs_pubsub = inst.role != InstanceRole::Peer;
    let mut attempted = false;

    let reconnect_pacing = |last: u64, connecting: bool| {
        let pace_ok = last == 0 || now.saturating_sub(last) > PING_PERIOD_MS;
        let not_stuck = !connecting || now.saturating_sub(last) > MIN_LINK_RECONNECT_PERIOD_MS;
        pace_ok && not_stuck
    };

    if !inst.link.cmd_up {
        if reconnect_pacing(inst.link.last_reconnect_attempt, inst.link.cmd_connecting) {
            inst.link.cmd_generation += 1;
            inst.link.cmd_connecting = true;
            out.commands.push(Command::Connect {
                id: id.clone(),
                kind: LinkKind::Command,
                addr: inst.addr,
                auth: auth.map(str::to_string),
                generation: inst.link.cmd_generation,
            });
            attempted = true;
        }
    }

    if needs_pubsub && !inst.link.pubsub_up {
        if reconnect_pacing(inst.link.last_reconnect_attempt, inst.link.pubsub_connecting) {
            inst.link.pubsub_generation += 1;
            inst.link.pubsub_connecting = true;
            out.commands.push(Command::Connect {
                id: id.clone(),
                kind: LinkKind::Pubsub,
                addr: inst.addr,
                auth: auth.map(str::to_string),
                generation: inst.link.pubsub_generation,
            });
            attempted = true;
        }
    }

    if attempted {
        inst.link.last_reconnect_attempt = now;
    }
}

/// Probe decision for one instance: info, else ping, else hello.
fn probe_one(
    id: &InstanceId,
    inst: &mut Instance,
    info_period: Option<u64>,
    hello_payload: Option<&str>,
    now: u64,
    out: &mut EngineOutput,
) {
    if !inst.link.cmd_up {
        return;
    }
    if inst.link.pending_commands > MAX_PENDING_COMMANDS {
        return;
    }

    let info_due = info_period.is_some_and(|period| {
        inst.info_refresh == 0 || now.saturating_sub(inst.info_refresh) > period
    });
    let ping_due = now.saturating_sub(inst.last_any_reply) > PING_PERIOD_MS
        && now.saturating_sub(inst.last_ping_sent) > PING_PERIOD_MS / 2;
    let hello_due = hello_payload.is_some()
        && now.saturating_sub(inst.last_hello_sent) > PUBLISH_PERIOD_MS;

    if info_due {
        inst.link.pending_commands += 1;
        out.commands.push(Command::Info { id: id.clone() });
    } else if ping_due {
        inst.link.pending_commands += 1;
        inst.last_ping_sent = now;
        if inst.ping_sent_at == 0 {
            inst.ping_sent_at = now;
        }
        out.commands.push(Command::Ping { id: id.clone() });
    } else if hello_due {
        inst.link.pending_commands += 1;
        inst.last_hello_sent = now;
        out.commands.push(Command::PublishHello {
            id: id.clone(),
            payload: hello_payload.expect("hello_due implies payload").to_string(),
        });
    }
}
