//! # vigil-types: Core types for Vigil
//!
//! This crate contains shared types used across the Vigil supervisor:
//! - Network identity ([`Address`], [`RunId`])
//! - Election counters ([`Epoch`])
//! - Instance roles ([`InstanceRole`])
//! - Engine events ([`Event`], [`EventLevel`])
//! - Per-primary monitoring configuration ([`PrimaryConfig`])
//! - Protocol tunables ([`constants`])

mod addr;
mod config;
pub mod constants;
mod event;
mod script;

pub use addr::{Address, AddressError};
pub use config::PrimaryConfig;
pub use event::{Event, EventLevel};
pub use script::{ReconfigRole, ReconfigStage};

use std::fmt::{self, Display};

// ============================================================================
// Run identifier
// ============================================================================

/// The 40-character opaque identifier a node reports for its current run.
///
/// Monitored nodes report theirs in the info snapshot; supervisors generate
/// their own at startup and advertise it in hello gossip and election
/// traffic. Compared byte-wise, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(String);

impl RunId {
    /// Length of a run id in characters.
    pub const LEN: usize = 40;

    /// Wraps a reported run id without validating its length.
    ///
    /// Remote nodes are not trusted to be well-formed; a short or long id is
    /// still usable as an opaque comparison key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh run id from 20 random bytes, hex encoded.
    pub fn generate(random_bytes: [u8; 20]) -> Self {
        let mut s = String::with_capacity(Self::LEN);
        for b in random_bytes {
            s.push_str(&format!("{b:02x}"));
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Epoch
// ============================================================================

/// Monotonically increasing election counter.
///
/// Every failover attempt consumes one epoch; a primary's config epoch is
/// stamped from the epoch of the failover that promoted it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the next epoch.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Roles
// ============================================================================

/// The three kinds of instance a supervisor tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceRole {
    /// A monitored primary of the key-value store.
    Primary,
    /// A replica following one of the monitored primaries.
    Replica,
    /// A peer supervisor watching the same primary.
    Peer,
}

impl Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceRole::Primary => "primary",
            InstanceRole::Replica => "replica",
            InstanceRole::Peer => "peer",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_generate_is_forty_hex_chars() {
        let id = RunId::generate([0xab; 20]);
        assert_eq!(id.as_str().len(), RunId::LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.as_str(), "ab".repeat(20));
    }

    #[test]
    fn epoch_ordering_and_next() {
        let e = Epoch::ZERO;
        assert!(e.next() > e);
        assert_eq!(e.next().as_u64(), 1);
        assert_eq!(Epoch::from(7).to_string(), "7");
    }

    #[test]
    fn role_display_names() {
        assert_eq!(InstanceRole::Primary.to_string(), "primary");
        assert_eq!(InstanceRole::Replica.to_string(), "replica");
        assert_eq!(InstanceRole::Peer.to_string(), "peer");
    }
}
