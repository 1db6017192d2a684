//! Subjective and objective down detection.

use vigil_types::constants::{ASK_PERIOD_MS, INFO_PERIOD_MS};
use vigil_types::{Epoch, EventLevel, InstanceRole, RunId};

use crate::instance::{Instance, Primary};
use crate::{Command, EngineOutput, InstanceId, IsDownReply};

use super::{emit, EmitCtx, Engine};

impl Engine {
    // ========================================================================
    // Subjective down
    // ========================================================================

    /// Re-evaluates S_DOWN for the primary and every child.
    pub(super) fn check_s_down(
        &mut self,
        primary: &mut Primary,
        now: u64,
        out: &mut EngineOutput,
    ) {
        let ctx = EmitCtx::of(primary);

        let body = ctx.primary_body();
        check_one(&ctx, &mut primary.inst, true, body, now, out);

        let mut replica_names: Vec<String> = primary.replicas.keys().cloned().collect();
        replica_names.sort();
        for name in replica_names {
            let replica = primary.replicas.get_mut(&name).expect("name just listed");
            let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
            check_one(&ctx, &mut replica.inst, false, body, now, out);
        }

        let mut peer_names: Vec<String> = primary.peers.keys().cloned().collect();
        peer_names.sort();
        for name in peer_names {
            let peer = primary.peers.get_mut(&name).expect("name just listed");
            let body = ctx.child_body(InstanceRole::Peer, &peer.inst);
            check_one(&ctx, &mut peer.inst, false, body, now, out);
        }
    }

    // ========================================================================
    // Objective down
    // ========================================================================

    /// O_DOWN: our own S_DOWN plus enough peers reporting the primary
    /// down to reach the configured quorum.
    pub(super) fn check_o_down(
        &mut self,
        primary: &mut Primary,
        now: u64,
        out: &mut EngineOutput,
    ) {
        let ctx = EmitCtx::of(primary);

        let mut quorum_met = false;
        let mut votes = 0u32;
        if primary.inst.is_s_down() {
            votes = 1 + primary.peers.values().filter(|p| p.primary_down).count() as u32;
            quorum_met = votes >= primary.quorum;
        }

        if quorum_met {
            if !primary.is_o_down() {
                primary.o_down_since = Some(now);
                primary.last_o_down_at = now;
                emit(
                    out,
                    Some(&ctx),
                    EventLevel::Warning,
                    "+odown",
                    format!("{} #quorum {}/{}", ctx.primary_body(), votes, primary.quorum),
                );
            }
        } else if primary.is_o_down() {
            primary.o_down_since = None;
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "-odown",
                ctx.primary_body(),
            );
        }
    }

    // ========================================================================
    // Peer polling
    // ========================================================================

    /// Asks every reachable peer for its opinion of a suspected primary.
    /// `forced` bypasses the per-peer rate limit (used when an election
    /// starts and votes are needed immediately).
    pub(super) fn ask_peers(
        &mut self,
        primary: &mut Primary,
        now: u64,
        forced: bool,
        out: &mut EngineOutput,
    ) {
        if !primary.inst.is_s_down() {
            return;
        }

        // Our run id solicits a vote; only candidates solicit.
        let runid = if primary.failover_in_progress() {
            self.run_id.to_string()
        } else {
            "*".to_string()
        };

        let pname = primary.name().to_string();
        let primary_addr = primary.addr();
        let mut peer_names: Vec<String> = primary.peers.keys().cloned().collect();
        peer_names.sort();

        for name in peer_names {
            let peer = primary.peers.get_mut(&name).expect("name just listed");
            if !peer.inst.link.cmd_up {
                continue;
            }
            if !forced && now.saturating_sub(peer.last_down_reply) < ASK_PERIOD_MS {
                continue;
            }
            peer.inst.link.pending_commands += 1;
            out.commands.push(Command::AskIsPrimaryDown {
                id: InstanceId::child(&pname, InstanceRole::Peer, &name),
                primary_addr,
                epoch: self.current_epoch,
                runid: runid.clone(),
            });
        }
    }

    /// A peer answered `IS-PRIMARY-DOWN-BY-ADDR`.
    pub fn is_down_reply(
        &mut self,
        primary_name: &str,
        peer_name: &str,
        generation: u64,
        reply: &IsDownReply,
        now: u64,
    ) -> EngineOutput {
        let out = EngineOutput::empty();
        let Some(primary) = self.primaries.get_mut(primary_name) else {
            return out;
        };
        let Some(peer) = primary.peers.get_mut(peer_name) else {
            return out;
        };
        if peer.inst.link.cmd_generation != generation || !peer.inst.link.cmd_up {
            return out;
        }

        peer.inst.link.pending_commands = peer.inst.link.pending_commands.saturating_sub(1);
        peer.inst.last_any_reply = now;
        // Asks recur at the ping period and their replies keep deferring
        // the next ping; answering one proves the peer alive just as a
        // pong would.
        peer.inst.last_valid_reply = now;
        peer.last_down_reply = now;
        peer.primary_down = reply.is_down;

        if reply.leader != "?" && reply.leader != "*" {
            peer.vote = Some((RunId::new(reply.leader.clone()), reply.leader_epoch));
        }
        out
    }

    // ========================================================================
    // Peer-facing request handler
    // ========================================================================

    /// Serves `IS-PRIMARY-DOWN-BY-ADDR <ip> <port> <epoch> <runid>` from a
    /// peer. A supervisor in tilt reports "not down" and withholds votes.
    pub fn handle_is_down_request(
        &mut self,
        ip: &str,
        port: u16,
        req_epoch: Epoch,
        req_runid: &str,
        now: u64,
    ) -> (IsDownReply, EngineOutput) {
        let mut out = EngineOutput::empty();
        let mut reply = IsDownReply {
            is_down: false,
            leader: "?".to_string(),
            leader_epoch: Epoch::ZERO,
        };

        let tilt = self.tilt_since.is_some();
        let found = self
            .primaries
            .values()
            .find(|p| p.addr().ip.to_string() == ip && p.addr().port == port)
            .map(|p| p.name().to_string());

        let Some(name) = found else {
            return (reply, out);
        };
        let Some(mut primary) = self.primaries.remove(&name) else {
            return (reply, out);
        };

        if !tilt && primary.inst.is_s_down() {
            reply.is_down = true;
        }
        if req_runid != "*" && !tilt {
            let req_runid = RunId::new(req_runid);
            let (leader, leader_epoch) =
                self.vote_leader(&mut primary, req_epoch, &req_runid, now, &mut out);
            if let Some(leader) = leader {
                reply.leader = leader.to_string();
            }
            reply.leader_epoch = leader_epoch;
        }

        self.primaries.insert(primary.name().to_string(), primary);
        (reply, out)
    }
}

/// S_DOWN for one instance.
///
/// An instance is subjectively down when it has produced no valid ping
/// reply for its down-after period, or when it is a primary that has
/// persistently reported the replica role.
fn check_one(
    ctx: &EmitCtx,
    inst: &mut Instance,
    is_primary: bool,
    body: String,
    now: u64,
    out: &mut EngineOutput,
) {
    let silent = now.saturating_sub(inst.last_valid_reply) > inst.down_after_ms;
    let demoted = is_primary
        && inst.role_reported == InstanceRole::Replica
        && now.saturating_sub(inst.role_reported_at) > inst.down_after_ms + 2 * INFO_PERIOD_MS;

    if silent || demoted {
        if !inst.is_s_down() {
            inst.s_down_since = Some(now);
            inst.last_s_down_at = now;
            emit(out, Some(ctx), EventLevel::Warning, "+sdown", body);
        }
    } else if inst.is_s_down() {
        inst.s_down_since = None;
        inst.script_kill_sent = false;
        emit(out, Some(ctx), EventLevel::Warning, "-sdown", body);
    }
}
