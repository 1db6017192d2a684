//! The instance model: primaries, replicas, and peer supervisors.
//!
//! All three share the identity, link, and liveness bookkeeping in
//! [`Instance`]; role-specific payloads live in [`Primary`], [`Replica`],
//! and [`Peer`]. Children never hold references to their parent; the
//! engine passes the parent down every code path that needs it.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::PathBuf;

use vigil_types::{constants, Address, Epoch, InstanceRole, PrimaryConfig, RunId};

// ============================================================================
// Link state
// ============================================================================

/// Engine-side view of an instance's links.
///
/// The driver owns the sockets; the engine tracks establishment, activity,
/// and in-flight command counts, and decides when a link must be killed
/// and rebuilt. `generation` counts link incarnations per kind so late
/// replies from a dead link can be recognised and dropped.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    pub cmd_up: bool,
    pub pubsub_up: bool,

    /// A connect was issued and neither `link_established` nor
    /// `link_lost` has answered it yet.
    pub cmd_connecting: bool,
    pub pubsub_connecting: bool,

    pub cmd_generation: u64,
    pub pubsub_generation: u64,

    pub cmd_connected_at: u64,
    pub pubsub_connected_at: u64,

    /// Last traffic of any kind on the pub/sub link.
    pub last_pubsub_activity: u64,

    /// Commands written on the command link and not yet answered.
    pub pending_commands: u32,

    /// Last time a connect was issued, either kind.
    pub last_reconnect_attempt: u64,
}

impl LinkState {
    /// Marks the command link down and forgets its in-flight commands.
    pub fn drop_command(&mut self) {
        self.cmd_up = false;
        self.cmd_connecting = false;
        self.pending_commands = 0;
    }

    pub fn drop_pubsub(&mut self) {
        self.pubsub_up = false;
        self.pubsub_connecting = false;
    }
}

// ============================================================================
// Shared instance record
// ============================================================================

/// State every monitored instance carries, regardless of role.
///
/// Timestamps are monotonic milliseconds; zero means "never".
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub role: InstanceRole,
    pub addr: Address,

    /// Run id learned from the info snapshot (nodes) or hello gossip
    /// (peers).
    pub run_id: Option<RunId>,

    pub link: LinkState,

    pub created_at: u64,

    /// Last reply that proves liveness (`PONG`, `LOADING`, `MASTERDOWN`).
    pub last_valid_reply: u64,

    /// Last reply of any kind.
    pub last_any_reply: u64,

    /// Outstanding unanswered ping, zero when none.
    pub ping_sent_at: u64,

    /// Last time any ping was written, answered or not. Rate-limits ping
    /// retransmission to half a ping period.
    pub last_ping_sent: u64,

    pub last_hello_sent: u64,

    /// Last full info snapshot.
    pub info_refresh: u64,

    pub down_after_ms: u64,

    /// Currently subjectively down since this instant.
    pub s_down_since: Option<u64>,

    /// Onset of the most recent subjective-down episode, kept after the
    /// flag clears. Used by the "no down event within window" gates.
    pub last_s_down_at: u64,

    /// Role the instance itself last reported, with the instant the
    /// report first changed to it.
    pub role_reported: InstanceRole,
    pub role_reported_at: u64,

    /// One kill-script command was already sent for the current BUSY
    /// episode.
    pub script_kill_sent: bool,
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        role: InstanceRole,
        addr: Address,
        down_after_ms: u64,
        now: u64,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            addr,
            run_id: None,
            link: LinkState::default(),
            created_at: now,
            last_valid_reply: now,
            last_any_reply: now,
            ping_sent_at: 0,
            last_ping_sent: 0,
            last_hello_sent: 0,
            info_refresh: 0,
            down_after_ms,
            s_down_since: None,
            last_s_down_at: 0,
            role_reported: role,
            role_reported_at: now,
            script_kill_sent: false,
        }
    }

    /// A required link is absent. Peers need only the command link.
    pub fn is_disconnected(&self) -> bool {
        match self.role {
            InstanceRole::Peer => !self.link.cmd_up,
            _ => !self.link.cmd_up || !self.link.pubsub_up,
        }
    }

    pub fn is_s_down(&self) -> bool {
        self.s_down_since.is_some()
    }

    /// True when the instance has reported no down episode within the last
    /// `window_ms`.
    pub fn no_down_for(&self, now: u64, window_ms: u64) -> bool {
        !self.is_s_down()
            && (self.last_s_down_at == 0 || now.saturating_sub(self.last_s_down_at) > window_ms)
    }
}

// ============================================================================
// Replica
// ============================================================================

/// Reconfiguration stage of one replica during a failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconfState {
    /// Not part of a reconfiguration.
    #[default]
    None,
    /// REPLICAOF was sent, the replica has not acknowledged it via info.
    Sent,
    /// The replica reports the new primary but its link is still down.
    InProgress,
    /// The replica follows the new primary with the link up.
    Done,
}

impl Display for ReconfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconfState::None => "none",
            ReconfState::Sent => "sent",
            ReconfState::InProgress => "in-progress",
            ReconfState::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// A replica of a monitored primary.
#[derive(Debug, Clone)]
pub struct Replica {
    pub inst: Instance,

    /// Promotion priority from the info snapshot; zero opts out.
    pub priority: u32,

    /// Primary the replica itself reports following. Kept as reported, not
    /// resolved: comparisons are textual against our own address strings.
    pub reported_primary_host: Option<String>,
    pub reported_primary_port: u16,

    /// `master_link_status: up`.
    pub primary_link_up: bool,

    /// How long the replica reports its primary link has been down.
    pub primary_link_down_ms: u64,

    /// Last time this replica's replication target changed, either
    /// observed via info or forced by us.
    pub conf_change_at: u64,

    pub reconf: ReconfState,
    pub reconf_sent_at: u64,

    /// Chosen for promotion in the current failover.
    pub promoted: bool,
}

impl Replica {
    pub fn new(addr: Address, down_after_ms: u64, now: u64) -> Self {
        Self {
            inst: Instance::new(
                addr.instance_name(),
                InstanceRole::Replica,
                addr,
                down_after_ms,
                now,
            ),
            priority: constants::DEFAULT_REPLICA_PRIORITY,
            reported_primary_host: None,
            reported_primary_port: 0,
            primary_link_up: false,
            primary_link_down_ms: 0,
            conf_change_at: now,
            reconf: ReconfState::None,
            reconf_sent_at: 0,
            promoted: false,
        }
    }

    /// Whether the replica reports following the given address.
    pub fn reports_primary(&self, addr: Address) -> bool {
        self.reported_primary_host.as_deref() == Some(addr.ip.to_string().as_str())
            && self.reported_primary_port == addr.port
    }

    pub fn flags_string(&self) -> String {
        let mut flags = vec!["replica"];
        if self.inst.is_disconnected() {
            flags.push("disconnected");
        }
        if self.inst.is_s_down() {
            flags.push("s_down");
        }
        if self.promoted {
            flags.push("promoted");
        }
        match self.reconf {
            ReconfState::None => {}
            ReconfState::Sent => flags.push("reconf_sent"),
            ReconfState::InProgress => flags.push("reconf_inprog"),
            ReconfState::Done => flags.push("reconf_done"),
        }
        flags.join(",")
    }
}

// ============================================================================
// Peer supervisor
// ============================================================================

/// Another supervisor watching the same primary.
#[derive(Debug, Clone)]
pub struct Peer {
    pub inst: Instance,

    pub last_hello_received: u64,

    /// The peer advertises it may act as failover leader.
    pub can_failover: bool,

    /// The peer considers the primary down (its subjective view).
    pub primary_down: bool,

    /// Last `IS-PRIMARY-DOWN-BY-ADDR` reply; asks are rate-limited on it.
    pub last_down_reply: u64,

    /// Leader vote the peer reported, with the epoch it was cast in.
    pub vote: Option<(RunId, Epoch)>,
}

impl Peer {
    pub fn new(addr: Address, run_id: RunId, down_after_ms: u64, now: u64) -> Self {
        let mut inst = Instance::new(
            addr.instance_name(),
            InstanceRole::Peer,
            addr,
            down_after_ms,
            now,
        );
        inst.run_id = Some(run_id);
        Self {
            inst,
            last_hello_received: now,
            can_failover: false,
            primary_down: false,
            last_down_reply: 0,
            vote: None,
        }
    }

    pub fn flags_string(&self) -> String {
        let mut flags = vec!["peer"];
        if self.inst.is_disconnected() {
            flags.push("disconnected");
        }
        if self.inst.is_s_down() {
            flags.push("s_down");
        }
        if self.primary_down {
            flags.push("primary_down");
        }
        if self.can_failover {
            flags.push("can_failover");
        }
        flags.join(",")
    }
}

// ============================================================================
// Failover state
// ============================================================================

/// Stage of a primary's failover. A primary is in exactly one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FailoverState {
    #[default]
    None,
    /// Epoch consumed, waiting to win the election.
    WaitStart,
    /// Elected; choosing the replica to promote.
    SelectReplica,
    /// Sending the promotion command to the chosen replica.
    PromoteReplica,
    /// Waiting for the replica's info to confirm the primary role.
    WaitPromotion,
    /// Re-pointing the remaining replicas at the promoted one.
    ReconfReplicas,
    /// Done; the primary's address swaps at the end of the tick.
    UpdateConfig,
}

impl Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverState::None => "none",
            FailoverState::WaitStart => "wait-start",
            FailoverState::SelectReplica => "select-replica",
            FailoverState::PromoteReplica => "promote-replica",
            FailoverState::WaitPromotion => "wait-promotion",
            FailoverState::ReconfReplicas => "reconf-replicas",
            FailoverState::UpdateConfig => "update-config",
        };
        write!(f, "{s}")
    }
}

/// What a reset keeps and announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetFlags {
    /// Keep the peer set (used by the address switch; peers outlive the
    /// primary's address).
    pub keep_peers: bool,
    /// Emit `+reset-master`.
    pub generate_event: bool,
}

// ============================================================================
// Primary
// ============================================================================

/// A monitored primary with its replica and peer sets.
#[derive(Debug, Clone)]
pub struct Primary {
    pub inst: Instance,

    pub replicas: HashMap<String, Replica>,
    pub peers: HashMap<String, Peer>,

    pub quorum: u32,
    pub parallel_syncs: u32,
    pub auth_pass: Option<String>,
    pub notification_script: Option<PathBuf>,
    pub client_reconfig_script: Option<PathBuf>,

    /// This supervisor may drive failovers for this primary.
    pub can_failover: bool,

    /// Operator requested a failover regardless of quorum.
    pub force_failover: bool,

    /// Version of the primary's configuration; bumped by each successful
    /// promotion, adopted from gossip when a newer one appears. Never
    /// decreases.
    pub config_epoch: Epoch,

    pub failover_state: FailoverState,
    pub failover_state_changed_at: u64,

    /// Epoch our current/last failover attempt runs in.
    pub failover_epoch: Epoch,

    /// Start instant of the current/last attempt, including the random
    /// desync offset. Also gates how soon the next attempt may start.
    pub failover_start_at: u64,

    pub failover_timeout_ms: u64,

    /// Name of the replica chosen for promotion.
    pub promoted: Option<String>,

    /// Run id we voted for, in `leader_epoch`. At most one vote per epoch.
    pub leader: Option<RunId>,
    pub leader_epoch: Epoch,

    pub o_down_since: Option<u64>,
    pub last_o_down_at: u64,
}

impl Primary {
    pub fn from_config(config: &PrimaryConfig, now: u64) -> Self {
        Self {
            inst: Instance::new(
                config.name.clone(),
                InstanceRole::Primary,
                config.addr,
                config.down_after_ms,
                now,
            ),
            replicas: HashMap::new(),
            peers: HashMap::new(),
            quorum: config.quorum,
            parallel_syncs: config.parallel_syncs.max(1),
            auth_pass: config.auth_pass.clone(),
            notification_script: config.notification_script.clone(),
            client_reconfig_script: config.client_reconfig_script.clone(),
            can_failover: config.can_failover,
            force_failover: false,
            config_epoch: Epoch::ZERO,
            failover_state: FailoverState::None,
            failover_state_changed_at: now,
            failover_epoch: Epoch::ZERO,
            failover_start_at: 0,
            failover_timeout_ms: config.failover_timeout_ms,
            promoted: None,
            leader: None,
            leader_epoch: Epoch::ZERO,
            o_down_since: None,
            last_o_down_at: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.inst.name
    }

    pub fn addr(&self) -> Address {
        self.inst.addr
    }

    pub fn is_o_down(&self) -> bool {
        self.o_down_since.is_some()
    }

    pub fn failover_in_progress(&self) -> bool {
        self.failover_state != FailoverState::None
    }

    /// The primary currently looks healthy and authoritative: it still
    /// reports the primary role, is not suspected down, and its info is
    /// fresh. Gates corrective REPLICAOF commands to stray replicas.
    pub fn looks_sane(&self, now: u64) -> bool {
        self.inst.role_reported == InstanceRole::Primary
            && !self.inst.is_s_down()
            && !self.is_o_down()
            && self.inst.info_refresh != 0
            && now.saturating_sub(self.inst.info_refresh) < constants::INFO_PERIOD_MS * 2
    }

    /// Info refresh period for this primary's replicas: fast while the
    /// primary is objectively down or failing over, so promotions are
    /// observed promptly.
    pub fn replica_info_period(&self) -> u64 {
        if self.is_o_down() || self.failover_in_progress() {
            constants::INFO_FAST_PERIOD_MS
        } else {
            constants::INFO_PERIOD_MS
        }
    }

    /// Like [`Instance::no_down_for`], additionally covering objective
    /// down episodes.
    pub fn no_down_for(&self, now: u64, window_ms: u64) -> bool {
        self.inst.no_down_for(now, window_ms)
            && !self.is_o_down()
            && (self.last_o_down_at == 0
                || now.saturating_sub(self.last_o_down_at) > window_ms)
    }

    pub fn flags_string(&self) -> String {
        let mut flags = vec!["primary"];
        if self.inst.is_disconnected() {
            flags.push("disconnected");
        }
        if self.inst.is_s_down() {
            flags.push("s_down");
        }
        if self.is_o_down() {
            flags.push("o_down");
        }
        if self.can_failover {
            flags.push("can_failover");
        }
        if self.failover_in_progress() {
            flags.push("failover_in_progress");
        }
        if self.force_failover {
            flags.push("force_failover");
        }
        flags.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8, port: u16) -> Address {
        Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn test_primary() -> Primary {
        let config = PrimaryConfig::new("cache", addr(1, 6379), 2);
        Primary::from_config(&config, 1000)
    }

    #[test]
    fn new_instance_is_disconnected() {
        let primary = test_primary();
        assert!(primary.inst.is_disconnected());
        assert!(primary.flags_string().contains("disconnected"));
    }

    #[test]
    fn peer_needs_only_command_link() {
        let mut peer = Peer::new(addr(9, 26379), RunId::from("a".repeat(40).as_str()), 30_000, 0);
        peer.inst.link.cmd_up = true;
        assert!(!peer.inst.is_disconnected());

        let mut replica = Replica::new(addr(2, 6380), 30_000, 0);
        replica.inst.link.cmd_up = true;
        assert!(replica.inst.is_disconnected());
        replica.inst.link.pubsub_up = true;
        assert!(!replica.inst.is_disconnected());
    }

    #[test]
    fn no_down_for_tracks_history() {
        let mut inst = Instance::new("r", InstanceRole::Replica, addr(2, 6380), 1000, 0);
        assert!(inst.no_down_for(10_000, 8_000));

        inst.s_down_since = Some(9_000);
        inst.last_s_down_at = 9_000;
        assert!(!inst.no_down_for(10_000, 8_000));

        inst.s_down_since = None;
        assert!(!inst.no_down_for(10_000, 8_000));
        assert!(inst.no_down_for(18_000, 8_000));
    }

    #[test]
    fn replica_reports_primary_compares_textually() {
        let mut replica = Replica::new(addr(2, 6380), 30_000, 0);
        replica.reported_primary_host = Some("10.0.0.1".to_string());
        replica.reported_primary_port = 6379;
        assert!(replica.reports_primary(addr(1, 6379)));
        assert!(!replica.reports_primary(addr(1, 6380)));
        assert!(!replica.reports_primary(addr(3, 6379)));
    }

    #[test]
    fn looks_sane_requires_fresh_info() {
        let mut primary = test_primary();
        assert!(!primary.looks_sane(2000), "no info snapshot yet");

        primary.inst.info_refresh = 2000;
        assert!(primary.looks_sane(3000));
        assert!(!primary.looks_sane(2000 + 20_001), "info stale");

        primary.inst.s_down_since = Some(2500);
        assert!(!primary.looks_sane(3000));
    }

    #[test]
    fn flags_render_failover_progress() {
        let mut primary = test_primary();
        primary.failover_state = FailoverState::WaitStart;
        assert!(primary.flags_string().contains("failover_in_progress"));

        let mut replica = Replica::new(addr(2, 6380), 30_000, 0);
        replica.promoted = true;
        replica.reconf = ReconfState::Sent;
        let flags = replica.flags_string();
        assert!(flags.contains("promoted"));
        assert!(flags.contains("reconf_sent"));
    }
}
