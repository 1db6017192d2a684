//! The engine: global state and the per-tick dispatcher.
//!
//! One [`Engine`] value holds everything a supervisor process knows:
//! the monitored primaries (each owning its replica and peer sets), the
//! global election epoch, the tilt guard, and a seeded RNG. The timer
//! driver calls [`Engine::tick`] roughly every 100 ms and feeds replies
//! back through the typed entry points; every call returns an
//! [`EngineOutput`] describing what to send, log, and execute.
//!
//! Within one tick, each primary is handled in order: link maintenance,
//! probes, down detection, election asks, failover state machine. Address
//! switches triggered by a completed failover are deferred until after the
//! walk.

mod down;
mod election;
mod failover;
mod hello;
mod info;
mod probe;

use std::collections::HashMap;
use std::path::PathBuf;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use vigil_types::{
    constants, Address, Epoch, Event, EventLevel, InstanceRole, PrimaryConfig, ReconfigRole,
    ReconfigStage, RunId,
};

use crate::instance::{
    FailoverState, Instance, LinkState, Peer, Primary, Replica, ResetFlags,
};
use crate::util::glob_match;
use crate::{Command, EngineError, EngineOutput, InstanceId, LinkKind, ScriptCall};

// ============================================================================
// Event emission
// ============================================================================

/// The slice of a primary needed to emit events while its children are
/// mutably borrowed: name, address, and the notification script hook.
#[derive(Debug, Clone)]
pub(crate) struct EmitCtx {
    pub name: String,
    pub addr: Address,
    pub script: Option<PathBuf>,
}

impl EmitCtx {
    pub fn of(primary: &Primary) -> Self {
        Self {
            name: primary.name().to_string(),
            addr: primary.addr(),
            script: primary.notification_script.clone(),
        }
    }

    /// `primary <name> <ip> <port>`
    pub fn primary_body(&self) -> String {
        format!("primary {} {} {}", self.name, self.addr.ip, self.addr.port)
    }

    /// `<role> <name> <ip> <port> @ <primary> <ip> <port>`
    pub fn child_body(&self, role: InstanceRole, inst: &Instance) -> String {
        format!(
            "{} {} {} {} @ {} {} {}",
            role, inst.name, inst.addr.ip, inst.addr.port, self.name, self.addr.ip, self.addr.port
        )
    }
}

/// Records an event, fanning warning-level events bound to a primary out
/// to its notification script.
pub(crate) fn emit(
    out: &mut EngineOutput,
    ctx: Option<&EmitCtx>,
    level: EventLevel,
    kind: &str,
    body: String,
) {
    if level == EventLevel::Warning {
        if let Some(script) = ctx.and_then(|c| c.script.as_ref()) {
            out.scripts.push(ScriptCall::Notification {
                script: script.clone(),
                event_kind: kind.to_string(),
                message: body.clone(),
            });
        }
    }
    out.events
        .push(Event::new(level, kind, body, ctx.map(|c| c.name.clone())));
}

// ============================================================================
// Engine
// ============================================================================

/// The supervision engine. See the module docs.
#[derive(Debug)]
pub struct Engine {
    run_id: RunId,

    /// Address we advertise in hello gossip (our RPC endpoint).
    announce: Address,

    current_epoch: Epoch,

    primaries: HashMap<String, Primary>,

    /// Set while the tilt guard suspends acting.
    tilt_since: Option<u64>,

    last_tick_at: Option<u64>,

    rng: ChaCha8Rng,
}

impl Engine {
    /// Creates an engine with no monitored primaries.
    ///
    /// The RNG seed controls election desynchronisation delays; fix it in
    /// tests for reproducible runs.
    pub fn new(run_id: RunId, announce: Address, seed: u64) -> Self {
        Self {
            run_id,
            announce,
            current_epoch: Epoch::ZERO,
            primaries: HashMap::new(),
            tilt_since: None,
            last_tick_at: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Starts monitoring a primary.
    pub fn monitor(
        &mut self,
        config: &PrimaryConfig,
        now: u64,
    ) -> Result<EngineOutput, EngineError> {
        if config.quorum == 0 {
            return Err(EngineError::QuorumMustBePositive);
        }
        if self.primaries.contains_key(&config.name) {
            return Err(EngineError::Duplicate(config.name.clone()));
        }

        let primary = Primary::from_config(config, now);
        let mut out = EngineOutput::empty();
        let ctx = EmitCtx::of(&primary);
        emit(&mut out, Some(&ctx), EventLevel::Info, "+monitor", ctx.primary_body());
        self.primaries.insert(config.name.clone(), primary);
        Ok(out)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn announce_addr(&self) -> Address {
        self.announce
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn in_tilt(&self) -> bool {
        self.tilt_since.is_some()
    }

    pub fn primary_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.primaries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Read access to a monitored primary's full state.
    pub fn primary(&self, name: &str) -> Option<&Primary> {
        self.primaries.get(name)
    }

    // ========================================================================
    // Timer tick
    // ========================================================================

    /// One timer tick: tilt guard, the instance walk, deferred address
    /// switches.
    pub fn tick(&mut self, now: u64) -> EngineOutput {
        let mut out = EngineOutput::empty();
        self.tilt_guard(now, &mut out);

        let names = self.primary_names();
        for name in &names {
            let Some(mut primary) = self.primaries.remove(name) else {
                continue;
            };
            self.handle_primary(&mut primary, now, &mut out);
            self.primaries.insert(primary.name().to_string(), primary);
        }

        // Address switches run after the walk so a completed failover
        // cannot invalidate instances the walk still visits.
        if self.tilt_since.is_none() {
            for name in &names {
                let needs_switch = self
                    .primaries
                    .get(name)
                    .is_some_and(|p| p.failover_state == FailoverState::UpdateConfig);
                if !needs_switch {
                    continue;
                }
                let Some(mut primary) = self.primaries.remove(name) else {
                    continue;
                };
                self.switch_to_promoted(&mut primary, now, &mut out);
                self.primaries.insert(primary.name().to_string(), primary);
            }
        }

        out
    }

    fn handle_primary(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        self.link_step(primary, now, out);
        self.probe_step(primary, now, out);

        // Monitoring continues during tilt; acting does not.
        if self.tilt_since.is_some() {
            return;
        }

        self.check_s_down(primary, now, out);
        self.check_o_down(primary, now, out);
        if self.start_failover_if_needed(primary, now, out) {
            self.ask_peers(primary, now, true, out);
        }
        self.failover_step(primary, now, out);
        self.ask_peers(primary, now, false, out);
    }

    // ========================================================================
    // Tilt guard
    // ========================================================================

    /// Detects timer anomalies (a jump, or time running backwards) and
    /// suspends the acting half of the engine for a cool-down period.
    fn tilt_guard(&mut self, now: u64, out: &mut EngineOutput) {
        if let Some(prev) = self.last_tick_at {
            let delta = now as i64 - prev as i64;
            if delta < 0 || delta > constants::TILT_TRIGGER_MS as i64 {
                self.tilt_since = Some(now);
                emit(
                    out,
                    None,
                    EventLevel::Warning,
                    "+tilt",
                    "#tilt mode entered".to_string(),
                );
            }
        }
        self.last_tick_at = Some(now);

        if let Some(since) = self.tilt_since {
            if now.saturating_sub(since) >= constants::TILT_PERIOD_MS {
                self.tilt_since = None;
                emit(
                    out,
                    None,
                    EventLevel::Warning,
                    "-tilt",
                    "#tilt mode exited".to_string(),
                );
            }
        }
    }

    // ========================================================================
    // Link events (driver-facing)
    // ========================================================================

    /// A link the engine asked for is up. Stale generations are ignored.
    pub fn link_established(
        &mut self,
        id: &InstanceId,
        kind: LinkKind,
        generation: u64,
        now: u64,
    ) -> EngineOutput {
        let mut out = EngineOutput::empty();
        let Some(inst) = self.instance_mut(id) else {
            return out;
        };
        match kind {
            LinkKind::Command => {
                if inst.link.cmd_generation != generation {
                    return out;
                }
                inst.link.cmd_up = true;
                inst.link.cmd_connecting = false;
                inst.link.cmd_connected_at = now;
                inst.link.pending_commands = 0;
                inst.ping_sent_at = 0;
                // Ping immediately so liveness is re-established promptly.
                inst.link.pending_commands += 1;
                inst.last_ping_sent = now;
                inst.ping_sent_at = now;
                out.commands.push(Command::Ping { id: id.clone() });
            }
            LinkKind::Pubsub => {
                if inst.link.pubsub_generation != generation {
                    return out;
                }
                inst.link.pubsub_up = true;
                inst.link.pubsub_connecting = false;
                inst.link.pubsub_connected_at = now;
                inst.link.last_pubsub_activity = now;
            }
        }
        out
    }

    /// A link dropped (connect failure, socket error, or subscription
    /// failure). The next tick schedules a reconnect.
    pub fn link_lost(
        &mut self,
        id: &InstanceId,
        kind: LinkKind,
        generation: u64,
        _now: u64,
    ) -> EngineOutput {
        if let Some(inst) = self.instance_mut(id) {
            match kind {
                LinkKind::Command if inst.link.cmd_generation == generation => {
                    inst.link.drop_command();
                }
                LinkKind::Pubsub if inst.link.pubsub_generation == generation => {
                    inst.link.drop_pubsub();
                }
                _ => {}
            }
        }
        EngineOutput::empty()
    }

    /// Any traffic observed on a pub/sub link.
    pub fn pubsub_activity(&mut self, id: &InstanceId, now: u64) {
        if let Some(inst) = self.instance_mut(id) {
            inst.link.last_pubsub_activity = now;
        }
    }

    /// Reply to a fire-and-forget command (publish, replicaof, config
    /// persist, script kill). Only the pending counter cares.
    pub fn command_acked(&mut self, id: &InstanceId, generation: u64, now: u64) {
        if let Some(inst) = self.instance_mut(id) {
            if inst.link.cmd_generation == generation && inst.link.cmd_up {
                inst.link.pending_commands = inst.link.pending_commands.saturating_sub(1);
                inst.last_any_reply = now;
            }
        }
    }

    /// Reply to a ping.
    pub fn ping_reply(
        &mut self,
        id: &InstanceId,
        generation: u64,
        reply: &str,
        now: u64,
    ) -> EngineOutput {
        let mut out = EngineOutput::empty();
        let Some(inst) = self.instance_mut(id) else {
            return out;
        };
        if inst.link.cmd_generation != generation || !inst.link.cmd_up {
            return out;
        }

        inst.link.pending_commands = inst.link.pending_commands.saturating_sub(1);
        inst.last_any_reply = now;

        if reply.starts_with("PONG")
            || reply.starts_with("LOADING")
            || reply.starts_with("MASTERDOWN")
        {
            inst.last_valid_reply = now;
            inst.ping_sent_at = 0;
        } else if reply.starts_with("BUSY") && inst.is_s_down() && !inst.script_kill_sent {
            // A wedged server-side script is keeping the node from
            // serving; kill it once per episode.
            inst.script_kill_sent = true;
            inst.link.pending_commands += 1;
            out.commands.push(Command::ScriptKill { id: id.clone() });
        }
        out
    }

    // ========================================================================
    // Instance lookup and lifecycle
    // ========================================================================

    fn instance_mut(&mut self, id: &InstanceId) -> Option<&mut Instance> {
        let primary = self.primaries.get_mut(&id.primary)?;
        match id.role {
            InstanceRole::Primary => {
                (primary.inst.name == id.name).then_some(&mut primary.inst)
            }
            InstanceRole::Replica => primary.replicas.get_mut(&id.name).map(|r| &mut r.inst),
            InstanceRole::Peer => primary.peers.get_mut(&id.name).map(|p| &mut p.inst),
        }
    }

    /// Adds a newly discovered replica. A duplicate address is a no-op.
    pub(crate) fn create_replica(
        primary: &mut Primary,
        addr: Address,
        now: u64,
        out: &mut EngineOutput,
        announce: bool,
    ) {
        let name = addr.instance_name();
        if primary.replicas.contains_key(&name) {
            return;
        }
        let replica = Replica::new(addr, primary.inst.down_after_ms, now);
        if announce {
            let ctx = EmitCtx::of(primary);
            let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
            emit(out, Some(&ctx), EventLevel::Info, "+slave", body);
        }
        primary.replicas.insert(name, replica);
    }

    /// Emits kill commands for whatever links an instance holds.
    pub(crate) fn kill_links(id: &InstanceId, inst: &mut Instance, out: &mut EngineOutput) {
        if inst.link.cmd_up || inst.link.cmd_connecting {
            out.commands.push(Command::KillLink {
                id: id.clone(),
                kind: LinkKind::Command,
                generation: inst.link.cmd_generation,
            });
        }
        if inst.link.pubsub_up || inst.link.pubsub_connecting {
            out.commands.push(Command::KillLink {
                id: id.clone(),
                kind: LinkKind::Pubsub,
                generation: inst.link.pubsub_generation,
            });
        }
        let generations = (inst.link.cmd_generation, inst.link.pubsub_generation);
        inst.link = LinkState {
            cmd_generation: generations.0 + 1,
            pubsub_generation: generations.1 + 1,
            ..LinkState::default()
        };
    }

    // ========================================================================
    // Reset and address switch
    // ========================================================================

    /// Drops a primary's children and runtime state, keeping its identity
    /// and configuration. Links are killed; the next tick reconnects.
    pub(crate) fn reset_primary(
        primary: &mut Primary,
        flags: ResetFlags,
        now: u64,
        out: &mut EngineOutput,
    ) {
        let pname = primary.name().to_string();

        let primary_id = InstanceId::primary(&pname);
        Self::kill_links(&primary_id, &mut primary.inst, out);

        for (name, mut replica) in primary.replicas.drain() {
            let id = InstanceId::child(&pname, InstanceRole::Replica, &name);
            Self::kill_links(&id, &mut replica.inst, out);
        }
        if !flags.keep_peers {
            for (name, mut peer) in primary.peers.drain() {
                let id = InstanceId::child(&pname, InstanceRole::Peer, &name);
                Self::kill_links(&id, &mut peer.inst, out);
            }
        }

        primary.failover_state = FailoverState::None;
        primary.failover_state_changed_at = now;
        primary.failover_epoch = Epoch::ZERO;
        primary.promoted = None;
        primary.leader = None;
        primary.leader_epoch = Epoch::ZERO;
        primary.force_failover = false;
        primary.o_down_since = None;
        primary.last_o_down_at = 0;

        let inst = &mut primary.inst;
        inst.run_id = None;
        inst.role_reported = InstanceRole::Primary;
        inst.role_reported_at = now;
        inst.s_down_since = None;
        inst.last_s_down_at = 0;
        inst.script_kill_sent = false;
        inst.info_refresh = 0;
        inst.last_valid_reply = now;
        inst.last_any_reply = now;
        inst.ping_sent_at = 0;
        inst.last_ping_sent = 0;
        inst.last_hello_sent = 0;

        if flags.generate_event {
            let ctx = EmitCtx::of(primary);
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "+reset-master",
                ctx.primary_body(),
            );
        }
    }

    /// Moves a primary to a new address: current replicas are remembered,
    /// the old address is re-added as a replica, and everything is
    /// re-discovered from scratch. Peers survive.
    pub(crate) fn switch_primary_address(
        &mut self,
        primary: &mut Primary,
        new_addr: Address,
        now: u64,
        out: &mut EngineOutput,
    ) {
        let old_addr = primary.addr();

        let mut snapshot: Vec<Address> = primary
            .replicas
            .values()
            .map(|r| r.inst.addr)
            .filter(|a| *a != new_addr)
            .collect();
        if new_addr != old_addr {
            snapshot.push(old_addr);
        }
        snapshot.sort_by_key(|a| a.instance_name());

        Self::reset_primary(
            primary,
            ResetFlags {
                keep_peers: true,
                generate_event: false,
            },
            now,
            out,
        );

        primary.inst.addr = new_addr;
        for addr in snapshot {
            Self::create_replica(primary, addr, now, out, true);
        }
    }

    /// Terminal failover step: install the promoted replica's address.
    fn switch_to_promoted(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        let new_addr = primary
            .promoted
            .as_ref()
            .and_then(|name| primary.replicas.get(name))
            .map(|r| r.inst.addr);

        let Some(new_addr) = new_addr else {
            // The promoted replica vanished (reset raced the switch); all
            // we can do is fall back to monitoring the old address.
            primary.failover_state = FailoverState::None;
            primary.failover_state_changed_at = now;
            primary.promoted = None;
            return;
        };

        let old_addr = primary.addr();
        let ctx = EmitCtx::of(primary);
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+switch-master",
            format!(
                "{} {} {} {} {}",
                primary.name(),
                old_addr.ip,
                old_addr.port,
                new_addr.ip,
                new_addr.port
            ),
        );
        self.switch_primary_address(primary, new_addr, now, out);
    }

    // ========================================================================
    // Operator surface
    // ========================================================================

    /// Current address of a monitored primary.
    pub fn primary_addr(&self, name: &str) -> Result<Address, EngineError> {
        self.primaries
            .get(name)
            .map(Primary::addr)
            .ok_or_else(|| EngineError::NoSuchPrimary(name.to_string()))
    }

    /// Resets every primary whose name matches the glob pattern. Returns
    /// how many matched.
    pub fn reset_matching(&mut self, pattern: &str, now: u64) -> (usize, EngineOutput) {
        let mut out = EngineOutput::empty();
        let mut matched = 0;
        for name in self.primary_names() {
            if !glob_match(pattern, &name) {
                continue;
            }
            matched += 1;
            if let Some(primary) = self.primaries.get_mut(&name) {
                Self::reset_primary(
                    primary,
                    ResetFlags {
                        keep_peers: false,
                        generate_event: true,
                    },
                    now,
                    &mut out,
                );
            }
        }
        (matched, out)
    }

    /// Operator-requested failover: starts on the next tick without
    /// waiting for quorum agreement.
    pub fn force_failover(&mut self, name: &str, now: u64) -> Result<(), EngineError> {
        let primary = self
            .primaries
            .get_mut(name)
            .ok_or_else(|| EngineError::NoSuchPrimary(name.to_string()))?;
        if primary.failover_in_progress() {
            return Err(EngineError::FailoverInProgress(name.to_string()));
        }
        if primary.inst.info_refresh == 0 {
            // Never seen an info snapshot; we know nothing about replicas.
            return Err(EngineError::InsufficientInfo(name.to_string()));
        }
        if failover::select_replica(primary, now).is_none() {
            return Err(EngineError::NoSuitableReplica(name.to_string()));
        }
        primary.force_failover = true;
        Ok(())
    }

    /// Field/value description of every monitored primary.
    pub fn describe_primaries(&self, now: u64) -> Vec<Vec<(String, String)>> {
        self.primary_names()
            .iter()
            .filter_map(|name| self.primaries.get(name))
            .map(|p| describe_primary(p, now))
            .collect()
    }

    pub fn describe_replicas(
        &self,
        name: &str,
        now: u64,
    ) -> Result<Vec<Vec<(String, String)>>, EngineError> {
        let primary = self
            .primaries
            .get(name)
            .ok_or_else(|| EngineError::NoSuchPrimary(name.to_string()))?;
        let mut names: Vec<&String> = primary.replicas.keys().collect();
        names.sort();
        Ok(names
            .iter()
            .filter_map(|n| primary.replicas.get(*n))
            .map(|r| describe_replica(r, now))
            .collect())
    }

    pub fn describe_peers(
        &self,
        name: &str,
        now: u64,
    ) -> Result<Vec<Vec<(String, String)>>, EngineError> {
        let primary = self
            .primaries
            .get(name)
            .ok_or_else(|| EngineError::NoSuchPrimary(name.to_string()))?;
        let mut names: Vec<&String> = primary.peers.keys().collect();
        names.sort();
        Ok(names
            .iter()
            .filter_map(|n| primary.peers.get(*n))
            .map(|p| describe_peer(p, now))
            .collect())
    }

    /// Hello payload advertised for one primary: nine comma-separated
    /// fields closing with the primary's address and config epoch.
    pub(crate) fn hello_payload(&self, primary: &Primary) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.announce.ip,
            self.announce.port,
            self.run_id,
            u8::from(primary.can_failover),
            self.current_epoch,
            primary.name(),
            primary.addr().ip,
            primary.addr().port,
            primary.config_epoch
        )
    }
}

// ============================================================================
// Describe helpers
// ============================================================================

fn age(now: u64, at: u64) -> String {
    if at == 0 {
        "never".to_string()
    } else {
        now.saturating_sub(at).to_string()
    }
}

fn describe_common(inst: &Instance, now: u64) -> Vec<(String, String)> {
    vec![
        ("name".into(), inst.name.clone()),
        ("ip".into(), inst.addr.ip.to_string()),
        ("port".into(), inst.addr.port.to_string()),
        (
            "runid".into(),
            inst.run_id.as_ref().map(RunId::to_string).unwrap_or_default(),
        ),
        (
            "pending-commands".into(),
            inst.link.pending_commands.to_string(),
        ),
        (
            "last-ok-ping-reply".into(),
            age(now, inst.last_valid_reply),
        ),
        ("last-ping-reply".into(), age(now, inst.last_any_reply)),
    ]
}

fn describe_primary(p: &Primary, now: u64) -> Vec<(String, String)> {
    let mut fields = describe_common(&p.inst, now);
    fields.insert(4, ("flags".into(), p.flags_string()));
    fields.extend([
        ("info-refresh".into(), age(now, p.inst.info_refresh)),
        ("role-reported".into(), p.inst.role_reported.to_string()),
        (
            "role-reported-time".into(),
            age(now, p.inst.role_reported_at),
        ),
        ("config-epoch".into(), p.config_epoch.to_string()),
        ("num-slaves".into(), p.replicas.len().to_string()),
        ("num-other-sentinels".into(), p.peers.len().to_string()),
        ("quorum".into(), p.quorum.to_string()),
        (
            "failover-timeout".into(),
            p.failover_timeout_ms.to_string(),
        ),
        ("parallel-syncs".into(), p.parallel_syncs.to_string()),
        (
            "down-after-milliseconds".into(),
            p.inst.down_after_ms.to_string(),
        ),
        ("failover-state".into(), p.failover_state.to_string()),
    ]);
    fields
}

fn describe_replica(r: &Replica, now: u64) -> Vec<(String, String)> {
    let mut fields = describe_common(&r.inst, now);
    fields.insert(4, ("flags".into(), r.flags_string()));
    fields.extend([
        ("info-refresh".into(), age(now, r.inst.info_refresh)),
        (
            "master-link-status".into(),
            if r.primary_link_up { "ok" } else { "err" }.to_string(),
        ),
        (
            "master-link-down-time".into(),
            r.primary_link_down_ms.to_string(),
        ),
        (
            "master-host".into(),
            r.reported_primary_host.clone().unwrap_or_default(),
        ),
        ("master-port".into(), r.reported_primary_port.to_string()),
        ("slave-priority".into(), r.priority.to_string()),
    ]);
    fields
}

fn describe_peer(p: &Peer, now: u64) -> Vec<(String, String)> {
    let mut fields = describe_common(&p.inst, now);
    fields.insert(4, ("flags".into(), p.flags_string()));
    fields.extend([
        (
            "last-hello-message".into(),
            age(now, p.last_hello_received),
        ),
        (
            "can-failover-its-master".into(),
            u8::from(p.can_failover).to_string(),
        ),
        (
            "voted-leader".into(),
            p.vote
                .as_ref()
                .map(|(id, _)| id.to_string())
                .unwrap_or_else(|| "?".to_string()),
        ),
        (
            "voted-leader-epoch".into(),
            p.vote
                .as_ref()
                .map(|(_, e)| e.to_string())
                .unwrap_or_else(|| "0".to_string()),
        ),
    ]);
    fields
}

/// Client-reconfiguration script invocation, when one is configured.
pub(crate) fn reconfig_call(
    primary: &Primary,
    stage: ReconfigStage,
    from: Address,
    to: Address,
) -> Option<ScriptCall> {
    primary
        .client_reconfig_script
        .as_ref()
        .map(|script| ScriptCall::ClientReconfig {
            script: script.clone(),
            primary_name: primary.name().to_string(),
            role: ReconfigRole::Leader,
            stage,
            from,
            to,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8, port: u16) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn engine() -> Engine {
        Engine::new(RunId::new("a".repeat(40)), addr(10, 26379), 0)
    }

    #[test]
    fn monitor_rejects_duplicates_and_zero_quorum() {
        let mut engine = engine();
        let config = PrimaryConfig::new("cache", addr(1, 6379), 2);
        engine.monitor(&config, 0).unwrap();

        assert!(matches!(
            engine.monitor(&config, 0),
            Err(EngineError::Duplicate(_))
        ));
        assert!(matches!(
            engine.monitor(&PrimaryConfig::new("other", addr(2, 6379), 0), 0),
            Err(EngineError::QuorumMustBePositive)
        ));
    }

    #[test]
    fn force_failover_requires_knowledge() {
        let mut engine = engine();
        engine
            .monitor(&PrimaryConfig::new("cache", addr(1, 6379), 2), 0)
            .unwrap();

        assert!(matches!(
            engine.force_failover("nope", 100),
            Err(EngineError::NoSuchPrimary(_))
        ));
        // No info snapshot yet.
        assert!(matches!(
            engine.force_failover("cache", 100),
            Err(EngineError::InsufficientInfo(_))
        ));
    }

    #[test]
    fn primary_addr_reports_unknown_names() {
        let engine = engine();
        assert!(matches!(
            engine.primary_addr("cache"),
            Err(EngineError::NoSuchPrimary(_))
        ));
    }

    #[test]
    fn hello_payload_has_nine_fields() {
        let mut engine = engine();
        engine
            .monitor(&PrimaryConfig::new("cache", addr(1, 6379), 2), 0)
            .unwrap();
        let primary = engine.primaries.get("cache").unwrap();
        let payload = engine.hello_payload(primary);
        assert_eq!(payload.split(',').count(), 9);
        assert_eq!(
            payload,
            format!("10.0.0.10,26379,{},1,0,cache,10.0.0.1,6379,0", "a".repeat(40))
        );
    }

    #[test]
    fn reset_kills_links_and_drops_children() {
        let mut engine = engine();
        engine
            .monitor(&PrimaryConfig::new("cache", addr(1, 6379), 2), 0)
            .unwrap();
        {
            let primary = engine.primaries.get_mut("cache").unwrap();
            primary.inst.link.cmd_up = true;
            primary.inst.link.pubsub_up = true;
            Engine::create_replica(primary, addr(2, 6380), 0, &mut EngineOutput::empty(), false);
        }

        let (matched, out) = engine.reset_matching("cache", 500);
        assert_eq!(matched, 1);
        assert!(out
            .commands
            .iter()
            .any(|c| matches!(c, Command::KillLink { .. })));
        assert!(out.events.iter().any(|e| e.kind == "+reset-master"));

        let primary = engine.primaries.get("cache").unwrap();
        assert!(primary.replicas.is_empty());
        assert!(primary.inst.is_disconnected());
        assert_eq!(primary.failover_state, FailoverState::None);
        assert!(primary.inst.run_id.is_none());
    }
}
