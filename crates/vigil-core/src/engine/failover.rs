//! The failover state machine.
//!
//! One failover runs per primary at a time, consuming one election epoch:
//!
//! ```text
//! None → WaitStart → SelectReplica → PromoteReplica → WaitPromotion
//!      → ReconfReplicas → UpdateConfig → None
//! ```
//!
//! Every stage is bounded by the primary's failover timeout; stages up to
//! and including `WaitPromotion` can abort, later stages only run out the
//! clock. `WaitPromotion → ReconfReplicas` is driven by the info ingestor
//! when the promoted replica first reports the primary role.

use vigil_types::constants::{
    ELECTION_TIMEOUT_MS, INFO_PERIOD_MS, INFO_VALIDITY_TIME_MS, MAX_DESYNC_MS,
    REPLICA_RECONF_RETRY_PERIOD_MS,
};
use vigil_types::{Address, EventLevel, InstanceRole, ReconfigStage};

use rand::Rng;

use crate::instance::{FailoverState, Primary, ReconfState, Replica};
use crate::{Command, EngineOutput, InstanceId};

use super::{emit, reconfig_call, EmitCtx, Engine};

impl Engine {
    // ========================================================================
    // Entry
    // ========================================================================

    /// Starts a failover when the primary is objectively down (or the
    /// operator forced one), we are allowed to act, none is running, and
    /// enough time has passed since the previous attempt. Returns whether
    /// a failover was started this tick.
    pub(super) fn start_failover_if_needed(
        &mut self,
        primary: &mut Primary,
        now: u64,
        out: &mut EngineOutput,
    ) -> bool {
        if !primary.can_failover {
            return false;
        }
        if !primary.is_o_down() && !primary.force_failover {
            return false;
        }
        if primary.failover_in_progress() {
            return false;
        }
        if primary.failover_start_at != 0
            && now.saturating_sub(primary.failover_start_at) < 2 * primary.failover_timeout_ms
        {
            return false;
        }

        self.current_epoch = self.current_epoch.next();
        primary.failover_epoch = self.current_epoch;

        let ctx = EmitCtx::of(primary);
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+new-epoch",
            self.current_epoch.to_string(),
        );
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+try-failover",
            ctx.primary_body(),
        );

        primary.failover_state = FailoverState::WaitStart;
        primary.failover_state_changed_at = now;
        // Desynchronise candidacies so split votes resolve quickly.
        primary.failover_start_at = now + self.rng.gen_range(0..MAX_DESYNC_MS);
        true
    }

    // ========================================================================
    // Per-tick step
    // ========================================================================

    pub(super) fn failover_step(
        &mut self,
        primary: &mut Primary,
        now: u64,
        out: &mut EngineOutput,
    ) {
        match primary.failover_state {
            FailoverState::None | FailoverState::UpdateConfig => {}
            FailoverState::WaitStart => self.wait_start(primary, now, out),
            FailoverState::SelectReplica => self.select_replica_stage(primary, now, out),
            FailoverState::PromoteReplica => self.promote_replica_stage(primary, now, out),
            FailoverState::WaitPromotion => self.wait_promotion_stage(primary, now, out),
            FailoverState::ReconfReplicas => self.reconf_replicas_stage(primary, now, out),
        }
    }

    fn wait_start(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        let failover_epoch = primary.failover_epoch;
        let leader = self.get_leader(primary, failover_epoch, now, out);
        let elected = leader.as_ref() == Some(&self.run_id);

        if !elected && !primary.force_failover {
            let election_timeout = ELECTION_TIMEOUT_MS.min(primary.failover_timeout_ms);
            if now.saturating_sub(primary.failover_start_at) > election_timeout {
                let ctx = EmitCtx::of(primary);
                emit(
                    out,
                    Some(&ctx),
                    EventLevel::Warning,
                    "-failover-abort-not-elected",
                    ctx.primary_body(),
                );
                self.abort_failover(primary, now, out);
            }
            return;
        }

        let ctx = EmitCtx::of(primary);
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+elected-leader",
            ctx.primary_body(),
        );
        primary.failover_state = FailoverState::SelectReplica;
        primary.failover_state_changed_at = now;
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+failover-state-select-slave",
            ctx.primary_body(),
        );
    }

    fn select_replica_stage(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        let ctx = EmitCtx::of(primary);
        let Some(name) = select_replica(primary, now) else {
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "-failover-abort-no-good-slave",
                ctx.primary_body(),
            );
            self.abort_failover(primary, now, out);
            return;
        };

        let replica = primary.replicas.get_mut(&name).expect("selected exists");
        replica.promoted = true;
        let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
        primary.promoted = Some(name);

        emit(out, Some(&ctx), EventLevel::Info, "+selected-slave", body);
        primary.failover_state = FailoverState::PromoteReplica;
        primary.failover_state_changed_at = now;
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+failover-state-send-slaveof-noone",
            ctx.primary_body(),
        );
    }

    /// Sends the promotion command, retrying while the candidate is
    /// unreachable, up to the failover timeout.
    fn promote_replica_stage(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        let ctx = EmitCtx::of(primary);
        let pname = primary.name().to_string();
        let promoted = primary.promoted.clone().expect("stage requires candidate");
        let Some(replica) = primary.replicas.get_mut(&promoted) else {
            self.abort_failover(primary, now, out);
            return;
        };

        if replica.inst.is_disconnected() {
            if now.saturating_sub(primary.failover_state_changed_at) > primary.failover_timeout_ms
            {
                emit(
                    out,
                    Some(&ctx),
                    EventLevel::Warning,
                    "-failover-abort-slave-timeout",
                    ctx.primary_body(),
                );
                self.abort_failover(primary, now, out);
            }
            return;
        }

        let id = InstanceId::child(&pname, InstanceRole::Replica, &promoted);
        replica.inst.link.pending_commands += 2;
        replica.conf_change_at = now;
        out.commands.push(Command::ReplicaOf {
            id: id.clone(),
            target: None,
        });
        out.commands.push(Command::ConfigPersist { id });

        primary.failover_state = FailoverState::WaitPromotion;
        primary.failover_state_changed_at = now;
        emit(
            out,
            Some(&ctx),
            EventLevel::Warning,
            "+failover-state-wait-promotion",
            ctx.primary_body(),
        );
    }

    /// Nothing to drive here: the info ingestor advances the state when
    /// the promoted replica reports the primary role. Only the timeout is
    /// ours.
    fn wait_promotion_stage(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        if now.saturating_sub(primary.failover_state_changed_at) > primary.failover_timeout_ms {
            let ctx = EmitCtx::of(primary);
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "-failover-abort-slave-timeout",
                ctx.primary_body(),
            );
            self.abort_failover(primary, now, out);
        }
    }

    /// Drives up to `parallel_syncs` concurrent replica reconfigurations,
    /// then detects the end of the failover.
    fn reconf_replicas_stage(&mut self, primary: &mut Primary, now: u64, out: &mut EngineOutput) {
        let ctx = EmitCtx::of(primary);
        let pname = primary.name().to_string();
        let promoted_name = primary.promoted.clone().expect("stage requires candidate");
        let promoted_addr = primary
            .replicas
            .get(&promoted_name)
            .map(|r| r.inst.addr)
            .expect("promoted replica exists");

        let mut in_progress = primary
            .replicas
            .values()
            .filter(|r| matches!(r.reconf, ReconfState::Sent | ReconfState::InProgress))
            .count() as u32;

        let mut names: Vec<String> = primary.replicas.keys().cloned().collect();
        names.sort();
        for name in names {
            if in_progress >= primary.parallel_syncs {
                break;
            }
            let replica = primary.replicas.get_mut(&name).expect("name just listed");
            if replica.promoted || replica.reconf == ReconfState::Done {
                continue;
            }

            // A reconfiguration that stalled is released for another
            // attempt; the resend below still respects the window.
            if replica.reconf == ReconfState::Sent
                && now.saturating_sub(replica.reconf_sent_at) > REPLICA_RECONF_RETRY_PERIOD_MS
            {
                replica.reconf = ReconfState::None;
                in_progress = in_progress.saturating_sub(1);
                let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
                emit(out, Some(&ctx), EventLevel::Debug, "reconf-retry", body);
            }

            if replica.reconf != ReconfState::None || replica.inst.is_disconnected() {
                continue;
            }

            replica.reconf = ReconfState::Sent;
            replica.reconf_sent_at = now;
            replica.conf_change_at = now;
            replica.inst.link.pending_commands += 1;
            let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
            out.commands.push(Command::ReplicaOf {
                id: InstanceId::child(&pname, InstanceRole::Replica, &name),
                target: Some(promoted_addr),
            });
            emit(out, Some(&ctx), EventLevel::Info, "+slave-reconf-sent", body);
            in_progress += 1;
        }

        self.detect_reconf_end(primary, promoted_addr, now, out);
    }

    fn detect_reconf_end(
        &mut self,
        primary: &mut Primary,
        promoted_addr: Address,
        now: u64,
        out: &mut EngineOutput,
    ) {
        let ctx = EmitCtx::of(primary);
        let pname = primary.name().to_string();

        // Unreachable replicas don't hold the failover open.
        let not_reconfigured = primary
            .replicas
            .values()
            .filter(|r| !r.promoted && r.reconf != ReconfState::Done && !r.inst.is_s_down())
            .count();

        let timed_out = now.saturating_sub(primary.failover_state_changed_at)
            > primary.failover_timeout_ms;

        if not_reconfigured != 0 && !timed_out {
            return;
        }

        if not_reconfigured == 0 {
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "+failover-end",
                ctx.primary_body(),
            );
        } else {
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "+failover-end-for-timeout",
                ctx.primary_body(),
            );
            // Best effort: point every straggler at the new primary
            // anyway before we stop driving them.
            let mut names: Vec<String> = primary.replicas.keys().cloned().collect();
            names.sort();
            for name in names {
                let replica = primary.replicas.get_mut(&name).expect("name just listed");
                if replica.promoted
                    || matches!(replica.reconf, ReconfState::Done | ReconfState::Sent)
                    || replica.inst.is_disconnected()
                {
                    continue;
                }
                replica.reconf = ReconfState::Sent;
                replica.reconf_sent_at = now;
                replica.inst.link.pending_commands += 1;
                let body = ctx.child_body(InstanceRole::Replica, &replica.inst);
                out.commands.push(Command::ReplicaOf {
                    id: InstanceId::child(&pname, InstanceRole::Replica, &name),
                    target: Some(promoted_addr),
                });
                emit(
                    out,
                    Some(&ctx),
                    EventLevel::Info,
                    "+slave-reconf-sent-be",
                    body,
                );
            }
        }

        if let Some(call) = reconfig_call(primary, ReconfigStage::End, primary.addr(), promoted_addr)
        {
            out.scripts.push(call);
        }
        primary.failover_state = FailoverState::UpdateConfig;
        primary.failover_state_changed_at = now;
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Stops a failover that has not reconfigured anything yet. Replica
    /// reconf markers are cleared; a chosen candidate is demoted and the
    /// reconfig script is told about the abort.
    pub(super) fn abort_failover(
        &mut self,
        primary: &mut Primary,
        now: u64,
        out: &mut EngineOutput,
    ) {
        debug_assert!(primary.failover_state <= FailoverState::WaitPromotion);

        for replica in primary.replicas.values_mut() {
            replica.reconf = ReconfState::None;
            replica.reconf_sent_at = 0;
        }

        primary.failover_state = FailoverState::None;
        primary.failover_state_changed_at = now;
        primary.force_failover = false;

        if let Some(promoted) = primary.promoted.take() {
            let promoted_addr = primary.replicas.get_mut(&promoted).map(|replica| {
                replica.promoted = false;
                replica.inst.addr
            });
            if let Some(from) = promoted_addr {
                if let Some(call) =
                    reconfig_call(primary, ReconfigStage::Abort, from, primary.addr())
                {
                    out.scripts.push(call);
                }
            }
        }
    }
}

// ============================================================================
// Replica selection
// ============================================================================

/// Picks the replica to promote: reachable, recently seen alive, info
/// fresh, not opted out, and not too stale against the failed primary.
/// Ranked by ascending priority, then lexicographically smallest run id
/// (an unknown run id sorts last), then name.
pub(crate) fn select_replica(primary: &Primary, now: u64) -> Option<String> {
    let info_window = if primary.inst.is_s_down() {
        INFO_VALIDITY_TIME_MS
    } else {
        INFO_VALIDITY_TIME_MS + INFO_PERIOD_MS
    };
    let max_link_down = now.saturating_sub(primary.inst.s_down_since.unwrap_or(now))
        + 10 * primary.inst.down_after_ms;

    let mut candidates: Vec<&Replica> = primary
        .replicas
        .values()
        .filter(|r| {
            !r.inst.is_s_down()
                && !r.inst.is_disconnected()
                && now.saturating_sub(r.inst.last_valid_reply) < INFO_VALIDITY_TIME_MS
                && r.priority > 0
                && r.inst.info_refresh != 0
                && now.saturating_sub(r.inst.info_refresh) < info_window
                && r.primary_link_down_ms <= max_link_down
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| match (&a.inst.run_id, &b.inst.run_id) {
                (Some(ra), Some(rb)) => ra.cmp(rb),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.inst.name.cmp(&b.inst.name))
    });

    candidates.first().map(|r| r.inst.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use vigil_types::{Address, PrimaryConfig, RunId};

    fn addr(last: u8, port: u16) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    /// A healthy primary at t=10_000 with fresh, reachable replicas.
    fn primary_with_replicas(specs: &[(u8, u32, Option<char>)]) -> Primary {
        let mut config = PrimaryConfig::new("cache", addr(1, 6379), 2);
        config.down_after_ms = 1000;
        let mut primary = Primary::from_config(&config, 0);
        for (host, priority, runid) in specs {
            let mut replica = crate::instance::Replica::new(addr(*host, 6380), 1000, 0);
            replica.inst.link.cmd_up = true;
            replica.inst.link.pubsub_up = true;
            replica.inst.last_valid_reply = 9_500;
            replica.inst.info_refresh = 9_500;
            replica.priority = *priority;
            replica.inst.run_id = runid.map(|c| RunId::new(c.to_string().repeat(40)));
            primary
                .replicas
                .insert(replica.inst.name.clone(), replica);
        }
        primary
    }

    #[test]
    fn selection_prefers_low_priority_then_small_runid() {
        let primary = primary_with_replicas(&[
            (2, 100, Some('z')),
            (3, 100, Some('a')),
            (4, 50, Some('m')),
        ]);
        assert_eq!(select_replica(&primary, 10_000).as_deref(), Some("10.0.0.4:6380"));

        let primary = primary_with_replicas(&[(2, 100, Some('z')), (3, 100, Some('a'))]);
        assert_eq!(select_replica(&primary, 10_000).as_deref(), Some("10.0.0.3:6380"));
    }

    #[test]
    fn unknown_runid_sorts_after_known() {
        let primary = primary_with_replicas(&[(2, 100, None), (3, 100, Some('z'))]);
        assert_eq!(select_replica(&primary, 10_000).as_deref(), Some("10.0.0.3:6380"));
    }

    #[test]
    fn zero_priority_opts_out() {
        let primary = primary_with_replicas(&[(2, 0, Some('a')), (3, 100, Some('z'))]);
        assert_eq!(select_replica(&primary, 10_000).as_deref(), Some("10.0.0.3:6380"));

        let primary = primary_with_replicas(&[(2, 0, Some('a'))]);
        assert_eq!(select_replica(&primary, 10_000), None);
    }

    #[test]
    fn disconnected_and_stale_replicas_are_skipped() {
        let mut primary = primary_with_replicas(&[(2, 100, Some('a')), (3, 100, Some('b'))]);
        primary
            .replicas
            .get_mut("10.0.0.2:6380")
            .unwrap()
            .inst
            .link
            .pubsub_up = false;
        assert_eq!(select_replica(&primary, 10_000).as_deref(), Some("10.0.0.3:6380"));

        // With the primary subjectively down the info window shrinks to
        // the strict validity time; a stale snapshot disqualifies.
        primary.inst.s_down_since = Some(9_000);
        primary
            .replicas
            .get_mut("10.0.0.3:6380")
            .unwrap()
            .inst
            .info_refresh = 1_000;
        assert_eq!(select_replica(&primary, 10_000), None);
    }

    #[test]
    fn replica_that_lagged_behind_dead_primary_is_skipped() {
        let mut primary = primary_with_replicas(&[(2, 100, Some('a'))]);
        primary.inst.s_down_since = Some(9_000);
        // Link down far longer than the primary has been unreachable.
        primary
            .replicas
            .get_mut("10.0.0.2:6380")
            .unwrap()
            .primary_link_down_ms = 1_000 + 10 * 1000 + 1;
        assert_eq!(select_replica(&primary, 10_000), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The selected replica has the minimum priority, and among
            /// the minimum-priority replicas a known run id never loses
            /// to a smaller known run id.
            #[test]
            fn selection_is_minimal(
                specs in proptest::collection::vec(
                    (2u8..250u8, 1u32..200u32, proptest::option::of(proptest::char::range('a', 'z'))),
                    1..12,
                )
            ) {
                let primary = primary_with_replicas(&specs);
                let selected = select_replica(&primary, 10_000)
                    .expect("every generated replica is a valid candidate");
                let winner = &primary.replicas[&selected];

                let min_priority = primary
                    .replicas
                    .values()
                    .map(|r| r.priority)
                    .min()
                    .expect("non-empty");
                prop_assert_eq!(winner.priority, min_priority);

                for replica in primary.replicas.values() {
                    if replica.priority != min_priority {
                        continue;
                    }
                    match (&winner.inst.run_id, &replica.inst.run_id) {
                        (Some(w), Some(o)) => prop_assert!(w <= o),
                        // A winner with no run id implies no
                        // min-priority rival had one.
                        (None, Some(_)) => prop_assert!(false, "known run id lost to unknown"),
                        _ => {}
                    }
                }

                // Re-running the selection is stable.
                prop_assert_eq!(select_replica(&primary, 10_000), Some(selected.clone()));
            }
        }
    }
}
