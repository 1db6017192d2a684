//! Protocol tunables.
//!
//! All intervals are in milliseconds. The defaults mirror the wire-visible
//! behaviour other supervisors expect, so changing them changes cluster
//! semantics, not just local pacing.

/// Default listening port for the supervisor's own command surface.
pub const DEFAULT_PORT: u16 = 26379;

/// Pub/sub channel used for peer discovery and configuration gossip.
pub const HELLO_CHANNEL: &str = "__sentinel__:hello";

/// Default period without a valid ping reply before an instance is
/// subjectively down.
pub const DEFAULT_DOWN_AFTER_MS: u64 = 30_000;

/// Info snapshot refresh period for healthy instances.
pub const INFO_PERIOD_MS: u64 = 10_000;

/// Info refresh period for replicas whose primary is objectively down or
/// failing over. Promotion detection latency is bounded by this.
pub const INFO_FAST_PERIOD_MS: u64 = 1_000;

/// Ping period per instance.
pub const PING_PERIOD_MS: u64 = 1_000;

/// Hello publish period per monitored node.
pub const PUBLISH_PERIOD_MS: u64 = 2_000;

/// How often a peer may be asked for its down-state opinion of a primary.
pub const ASK_PERIOD_MS: u64 = 1_000;

/// Clock anomaly threshold between two timer ticks.
pub const TILT_TRIGGER_MS: u64 = 2_000;

/// How long the supervisor stays in tilt once entered.
pub const TILT_PERIOD_MS: u64 = 30 * PING_PERIOD_MS;

/// Default failover timeout, bounding each failover stage.
pub const DEFAULT_FAILOVER_TIMEOUT_MS: u64 = 180_000;

/// Default number of replicas reconfigured concurrently after promotion.
pub const DEFAULT_PARALLEL_SYNCS: u32 = 1;

/// Default replica priority when the info snapshot reports none.
pub const DEFAULT_REPLICA_PRIORITY: u32 = 100;

/// Retry period for the promotion command while the candidate is
/// unreachable.
pub const PROMOTION_RETRY_PERIOD_MS: u64 = 30_000;

/// A replica stuck in the reconfig-sent stage longer than this is
/// re-queued for another attempt.
pub const REPLICA_RECONF_RETRY_PERIOD_MS: u64 = 10_000;

/// Minimum age of a link before it may be proactively killed as stale.
pub const MIN_LINK_RECONNECT_PERIOD_MS: u64 = 15_000;

/// Cap on outstanding commands per link; probes are skipped above it.
pub const MAX_PENDING_COMMANDS: u32 = 100;

/// Upper bound on waiting for an election to produce a winner.
pub const ELECTION_TIMEOUT_MS: u64 = 10_000;

/// How fresh liveness and info data must be for a replica to be a
/// promotion candidate.
pub const INFO_VALIDITY_TIME_MS: u64 = 5_000;

/// Maximum random delay added to a failover start to desynchronise
/// competing candidacies.
pub const MAX_DESYNC_MS: u64 = 2_000;

/// Script queue bound; the oldest non-running job is dropped above it.
pub const SCRIPT_QUEUE_MAX: usize = 256;

/// Maximum concurrently running scripts.
pub const SCRIPT_MAX_RUNNING: usize = 16;

/// A script running longer than this is force-killed.
pub const SCRIPT_MAX_RUNTIME_MS: u64 = 60_000;

/// Maximum retries for a script that keeps failing.
pub const SCRIPT_MAX_RETRY: u32 = 10;

/// Base retry delay for failed scripts; doubles on each retry.
pub const SCRIPT_RETRY_DELAY_MS: u64 = 30_000;
