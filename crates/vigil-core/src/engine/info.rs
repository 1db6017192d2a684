//! Info snapshot ingestion.
//!
//! Parses the monitored store's textual info reply and reacts to what it
//! says: discovers replicas, records role flips and reboots, advances a
//! failover when the promoted replica confirms its new role, and
//! re-points stray replicas at the address they should be following.
//! Reactions are suppressed during tilt; parsing is not.

use vigil_types::constants::PUBLISH_PERIOD_MS;
use vigil_types::{Address, EventLevel, InstanceRole};

use crate::instance::{FailoverState, Primary, ReconfState};
use crate::{Command, EngineOutput, InstanceId};

use super::{emit, reconfig_call, EmitCtx, Engine};
use vigil_types::ReconfigStage;

// ============================================================================
// Snapshot
// ============================================================================

/// Fields extracted from one info reply.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct InfoSnapshot {
    pub run_id: Option<String>,
    pub role: Option<InstanceRole>,
    /// `slaveN:` entries, as reported (host, port).
    pub replicas: Vec<(String, u16)>,
    pub primary_host: Option<String>,
    pub primary_port: Option<u16>,
    /// `master_link_status: up`.
    pub primary_link_up: Option<bool>,
    pub primary_link_down_ms: Option<u64>,
    pub priority: Option<u32>,
}

/// Parses the canonical `key:value` line format. Unknown lines are
/// ignored; a hostile or truncated reply yields a partial snapshot, never
/// an error.
pub(crate) fn parse_info(text: &str) -> InfoSnapshot {
    let mut snapshot = InfoSnapshot::default();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key {
            "run_id" => snapshot.run_id = Some(value.trim().to_string()),
            "role" => {
                snapshot.role = match value.trim() {
                    "master" => Some(InstanceRole::Primary),
                    "slave" => Some(InstanceRole::Replica),
                    _ => None,
                }
            }
            "master_host" => snapshot.primary_host = Some(value.trim().to_string()),
            "master_port" => snapshot.primary_port = value.trim().parse().ok(),
            "master_link_status" => {
                snapshot.primary_link_up = Some(value.trim() == "up");
            }
            "master_link_down_since_seconds" => {
                snapshot.primary_link_down_ms =
                    value.trim().parse::<u64>().ok().map(|s| s * 1000);
            }
            "slave_priority" => snapshot.priority = value.trim().parse().ok(),
            _ if key.starts_with("slave")
                && !key[5..].is_empty()
                && key[5..].chars().all(|c| c.is_ascii_digit()) =>
            {
                if let Some(entry) = parse_replica_line(value) {
                    snapshot.replicas.push(entry);
                }
            }
            _ => {}
        }
    }
    snapshot
}

/// One `slaveN:` value, either legacy `ip,port,state` or keyed
/// `ip=…,port=…,state=…`.
fn parse_replica_line(value: &str) -> Option<(String, u16)> {
    if value.contains('=') {
        let mut host = None;
        let mut port = None;
        for field in value.split(',') {
            match field.split_once('=') {
                Some(("ip", v)) => host = Some(v.to_string()),
                Some(("port", v)) => port = v.parse().ok(),
                _ => {}
            }
        }
        Some((host?, port?))
    } else {
        let mut fields = value.split(',');
        let host = fields.next()?.to_string();
        let port = fields.next()?.parse().ok()?;
        Some((host, port))
    }
}

// ============================================================================
// Ingestion
// ============================================================================

impl Engine {
    /// A full info reply arrived for a primary or replica.
    pub fn info_reply(
        &mut self,
        id: &InstanceId,
        generation: u64,
        text: &str,
        now: u64,
    ) -> EngineOutput {
        let mut out = EngineOutput::empty();
        if id.role == InstanceRole::Peer {
            return out;
        }
        let Some(mut primary) = self.primaries.remove(&id.primary) else {
            return out;
        };

        let snapshot = parse_info(text);
        let accepted = apply_snapshot(&mut primary, id, generation, &snapshot, now, &mut out);

        if accepted && self.tilt_since.is_none() {
            self.react_to_info(&mut primary, id, &snapshot, now, &mut out);
        }

        self.primaries.insert(primary.name().to_string(), primary);
        out
    }

    /// Role-driven reactions, skipped during tilt.
    fn react_to_info(
        &mut self,
        primary: &mut Primary,
        id: &InstanceId,
        snapshot: &InfoSnapshot,
        now: u64,
        out: &mut EngineOutput,
    ) {
        if id.role != InstanceRole::Replica || !primary.replicas.contains_key(&id.name) {
            return;
        }
        let ctx = EmitCtx::of(primary);
        let primary_addr = primary.addr();
        let promoted_addr = primary
            .promoted
            .as_ref()
            .and_then(|name| primary.replicas.get(name))
            .map(|r| r.inst.addr);

        // A replica reporting the primary role is either our promotion
        // succeeding or a stray node that needs demoting.
        if snapshot.role == Some(InstanceRole::Primary) {
            let is_promotion = {
                let replica = &primary.replicas[&id.name];
                replica.promoted
                    && primary.promoted.as_deref() == Some(id.name.as_str())
                    && primary.failover_state == FailoverState::WaitPromotion
            };
            if is_promotion {
                self.confirm_promotion(primary, id, now, out);
                return;
            }

            let wait = 4 * PUBLISH_PERIOD_MS;
            let demote = {
                let replica = &primary.replicas[&id.name];
                !replica.promoted
                    && primary.looks_sane(now)
                    && replica.inst.no_down_for(now, wait)
                    && now.saturating_sub(replica.inst.role_reported_at) > wait
            };
            if demote {
                let replica = primary.replicas.get_mut(&id.name).expect("checked above");
                replica.conf_change_at = now;
                replica.inst.link.pending_commands += 1;
                let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
                out.commands.push(Command::ReplicaOf {
                    id: id.clone(),
                    target: Some(primary_addr),
                });
                emit(out, Some(&ctx), EventLevel::Info, "+convert-to-slave", body);
            }
            return;
        }

        if snapshot.role != Some(InstanceRole::Replica) {
            return;
        }

        // Reconfiguration progress during a failover.
        if let Some(promoted_addr) = promoted_addr {
            let replica = primary.replicas.get_mut(&id.name).expect("checked above");
            if replica.reconf == ReconfState::Sent && replica.reports_primary(promoted_addr) {
                replica.reconf = ReconfState::InProgress;
                let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
                emit(out, Some(&ctx), EventLevel::Info, "+slave-reconf-inprog", body);
            }
            if replica.reconf == ReconfState::InProgress && replica.primary_link_up {
                replica.reconf = ReconfState::Done;
                let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
                emit(out, Some(&ctx), EventLevel::Info, "+slave-reconf-done", body);
            }
        }

        // A replica following the wrong primary is repaired, but only
        // when the rightful primary has looked healthy for a while.
        let wait = primary.failover_timeout_ms;
        let fix = {
            let replica = &primary.replicas[&id.name];
            replica.reported_primary_host.is_some()
                && !replica.reports_primary(primary_addr)
                && !replica.promoted
                && replica.reconf == ReconfState::None
                && primary.looks_sane(now)
                && replica.inst.no_down_for(now, wait)
                && now.saturating_sub(replica.conf_change_at) > wait
        };
        if fix {
            let replica = primary.replicas.get_mut(&id.name).expect("checked above");
            replica.conf_change_at = now;
            replica.inst.link.pending_commands += 1;
            let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
            out.commands.push(Command::ReplicaOf {
                id: id.clone(),
                target: Some(primary_addr),
            });
            emit(out, Some(&ctx), EventLevel::Info, "+fix-slave-config", body);
        }
    }

    /// The promoted replica confirmed the primary role: stamp the config
    /// epoch and move on to reconfiguring the rest.
    fn confirm_promotion(
        &mut self,
        primary: &mut Primary,
        id: &InstanceId,
        now: u64,
        out: &mut EngineOutput,
    ) {
        let ctx = EmitCtx::of(primary);
        primary.config_epoch = primary.failover_epoch;

        let (replica_addr, body) = {
            let replica = primary.replicas.get(&id.name).expect("promoted exists");
            (
                replica.inst.addr,
                ctx.child_body(InstanceRole::Replica, &replica.inst),
            )
        };
        emit(out, Some(&ctx), EventLevel::Warning, "+promoted-slave", body);

        primary.failover_state = FailoverState::ReconfReplicas;
        primary.failover_state_changed_at = now;
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+failover-state-reconf-slaves",
            ctx.primary_body(),
        );

        if let Some(call) =
            reconfig_call(primary, ReconfigStage::Start, primary.addr(), replica_addr)
        {
            out.scripts.push(call);
        }
    }
}

/// Applies the parsed fields to the instance and discovers new replicas.
/// Returns false when the reply belongs to a dead link incarnation.
fn apply_snapshot(
    primary: &mut Primary,
    id: &InstanceId,
    generation: u64,
    snapshot: &InfoSnapshot,
    now: u64,
    out: &mut EngineOutput,
) -> bool {
    let ctx = EmitCtx::of(primary);

    {
        let is_primary = id.role == InstanceRole::Primary;
        let inst = match id.role {
            InstanceRole::Primary => &mut primary.inst,
            InstanceRole::Replica => match primary.replicas.get_mut(&id.name) {
                Some(r) => &mut r.inst,
                None => return false,
            },
            InstanceRole::Peer => return false,
        };
        if inst.link.cmd_generation != generation || !inst.link.cmd_up {
            tracing::trace!(instance = %inst.name, "dropping info reply from dead link");
            return false;
        }

        inst.link.pending_commands = inst.link.pending_commands.saturating_sub(1);
        inst.last_any_reply = now;
        // A full info snapshot proves liveness as much as a ping reply
        // does. The probe loop issues at most one command per tick with
        // info taking priority, so under the fast info cadence pings may
        // not get a turn; without this, a perfectly healthy replica
        // would drift into S_DOWN mid-failover.
        inst.last_valid_reply = now;
        inst.info_refresh = now;

        match (&inst.run_id, &snapshot.run_id) {
            (None, Some(new)) => inst.run_id = Some(new.as_str().into()),
            (Some(old), Some(new)) if old.as_str() != new => {
                let body = if is_primary {
                    ctx.primary_body()
                } else {
                    ctx.child_body(InstanceRole::Replica, inst)
                };
                emit(out, Some(&ctx), EventLevel::Info, "+reboot", body);
                inst.run_id = Some(new.as_str().into());
            }
            _ => {}
        }

        if let Some(role) = snapshot.role {
            if role != inst.role_reported {
                inst.role_reported = role;
                inst.role_reported_at = now;
                let body = format!("{} reports {role}", inst.name);
                emit(out, Some(&ctx), EventLevel::Debug, "role-change", body);
            }
        }
    }

    match id.role {
        InstanceRole::Primary => {
            for (host, port) in &snapshot.replicas {
                if let Ok(addr) = Address::resolve(host, u32::from(*port)) {
                    Engine::create_replica(primary, addr, now, out, true);
                }
            }
        }
        InstanceRole::Replica => {
            let replica = primary.replicas.get_mut(&id.name).expect("checked above");
            if let Some(priority) = snapshot.priority {
                replica.priority = priority;
            }
            if let Some(up) = snapshot.primary_link_up {
                replica.primary_link_up = up;
                if up {
                    replica.primary_link_down_ms = 0;
                }
            }
            if let Some(down_ms) = snapshot.primary_link_down_ms {
                replica.primary_link_down_ms = down_ms;
            }
            if snapshot.primary_host.is_some() || snapshot.primary_port.is_some() {
                let host = snapshot.primary_host.clone();
                let port = snapshot
                    .primary_port
                    .unwrap_or(replica.reported_primary_port);
                if replica.reported_primary_host != host
                    || replica.reported_primary_port != port
                {
                    replica.reported_primary_host = host;
                    replica.reported_primary_port = port;
                    replica.conf_change_at = now;
                }
            }
        }
        InstanceRole::Peer => {}
    }

    true
}
