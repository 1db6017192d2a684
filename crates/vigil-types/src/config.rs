//! Per-primary monitoring configuration.

use std::path::PathBuf;

use crate::constants;
use crate::Address;

/// Everything the engine needs to start monitoring one primary.
///
/// Produced by the config-file parser; field defaults match the directive
/// defaults documented there.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    /// Caller-supplied logical name, unique across monitored primaries.
    pub name: String,

    /// Resolved address the primary currently lives at.
    pub addr: Address,

    /// Supervisors that must agree before the primary is objectively down.
    pub quorum: u32,

    /// Milliseconds without a valid ping reply before subjectively down.
    pub down_after_ms: u64,

    /// Bound on each failover stage.
    pub failover_timeout_ms: u64,

    /// Whether this supervisor may act as failover leader for the primary.
    pub can_failover: bool,

    /// Replicas reconfigured concurrently after a promotion.
    pub parallel_syncs: u32,

    /// Secret sent via AUTH when links to this primary's nodes open.
    pub auth_pass: Option<String>,

    /// Executable invoked on warning-level events for this primary.
    pub notification_script: Option<PathBuf>,

    /// Executable invoked at failover start/end/abort.
    pub client_reconfig_script: Option<PathBuf>,
}

impl PrimaryConfig {
    /// A config with all-default tunables for the given name and address.
    pub fn new(name: impl Into<String>, addr: Address, quorum: u32) -> Self {
        Self {
            name: name.into(),
            addr,
            quorum,
            down_after_ms: constants::DEFAULT_DOWN_AFTER_MS,
            failover_timeout_ms: constants::DEFAULT_FAILOVER_TIMEOUT_MS,
            can_failover: true,
            parallel_syncs: constants::DEFAULT_PARALLEL_SYNCS,
            auth_pass: None,
            notification_script: None,
            client_reconfig_script: None,
        }
    }
}
