//! # vigil-core: the supervision engine
//!
//! This crate implements the core of the supervisor as a pure,
//! deterministic state machine:
//!
//! - the instance model (primaries, their replicas, and peer supervisors);
//! - probe scheduling (ping, info, hello gossip);
//! - info and hello ingestion (replica discovery, peer discovery, newer
//!   configuration adoption);
//! - subjective/objective down detection by quorum;
//! - epoch-numbered leader election;
//! - the failover state machine driving a replica through promotion;
//! - the tilt guard suspending actions on clock anomalies.
//!
//! # Architecture
//!
//! The engine performs no I/O. Every entry point takes the current
//! monotonic time in milliseconds and returns an [`EngineOutput`]: network
//! commands for the driver to execute, events to log and fan out, and user
//! script invocations. Replies flow back in through typed entry points
//! ([`Engine::ping_reply`], [`Engine::info_reply`],
//! [`Engine::hello_received`], ...). Randomness comes from a per-engine
//! seeded RNG, so every election and selection is reproducible in tests.
//!
//! ```text
//! driver ──tick(now)──────────────► Engine
//!        ◄──{commands, events}─────
//! driver ──ping_reply/info/hello──► Engine
//!        ◄──{commands, events}─────
//! ```

mod engine;
mod instance;
mod util;

pub use engine::Engine;
pub use instance::{
    FailoverState, Instance, LinkState, Peer, Primary, ReconfState, Replica, ResetFlags,
};

use std::fmt::{self, Display};
use std::path::PathBuf;

use thiserror::Error;
use vigil_types::{
    Address, AddressError, Epoch, Event, InstanceRole, ReconfigRole, ReconfigStage,
};

// ============================================================================
// Instance identity
// ============================================================================

/// Stable handle for an instance, used to route commands and replies
/// between the engine and the driver.
///
/// Children are scoped by their parent primary's name; a primary's own id
/// repeats its name in both positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId {
    pub primary: String,
    pub role: InstanceRole,
    pub name: String,
}

impl InstanceId {
    pub fn primary(name: &str) -> Self {
        Self {
            primary: name.to_string(),
            role: InstanceRole::Primary,
            name: name.to_string(),
        }
    }

    pub fn child(primary: &str, role: InstanceRole, name: &str) -> Self {
        Self {
            primary: primary.to_string(),
            role,
            name: name.to_string(),
        }
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.role == InstanceRole::Primary {
            write!(f, "{}/{}", self.role, self.name)
        } else {
            write!(f, "{}/{}@{}", self.role, self.name, self.primary)
        }
    }
}

/// Which of an instance's two links a command refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Command,
    Pubsub,
}

// ============================================================================
// Engine output
// ============================================================================

/// A network command for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a link. `generation` tags the new incarnation; replies read on
    /// it must carry the same generation back.
    Connect {
        id: InstanceId,
        kind: LinkKind,
        addr: Address,
        /// AUTH secret to send right after the command link opens.
        auth: Option<String>,
        generation: u64,
    },

    /// Tear a link down. Late replies from it will carry a stale
    /// generation and be ignored.
    KillLink {
        id: InstanceId,
        kind: LinkKind,
        generation: u64,
    },

    Ping { id: InstanceId },

    Info { id: InstanceId },

    /// Publish a hello payload on the shared gossip channel.
    PublishHello { id: InstanceId, payload: String },

    /// `REPLICAOF host port`, or promotion when `target` is `None`.
    ReplicaOf {
        id: InstanceId,
        target: Option<Address>,
    },

    /// Best-effort request that the node persists its configuration.
    ConfigPersist { id: InstanceId },

    /// Kill a wedged server-side script.
    ScriptKill { id: InstanceId },

    /// Ask a peer supervisor for its down-state opinion (and possibly its
    /// vote) on the primary at `primary_addr`.
    AskIsPrimaryDown {
        id: InstanceId,
        primary_addr: Address,
        epoch: Epoch,
        /// Our run id when soliciting a vote, `"*"` for status only.
        runid: String,
    },
}

/// A user-script invocation requested by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCall {
    Notification {
        script: PathBuf,
        event_kind: String,
        message: String,
    },
    ClientReconfig {
        script: PathBuf,
        primary_name: String,
        role: ReconfigRole,
        stage: ReconfigStage,
        from: Address,
        to: Address,
    },
}

/// Everything one engine entry point produced.
///
/// The driver sends the commands, logs the events, and schedules the
/// script calls.
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub commands: Vec<Command>,
    pub events: Vec<Event>,
    pub scripts: Vec<ScriptCall>,
}

impl EngineOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty() && self.scripts.is_empty()
    }

    /// Merges another output into this one, preserving order.
    pub fn merge(&mut self, other: EngineOutput) {
        self.commands.extend(other.commands);
        self.events.extend(other.events);
        self.scripts.extend(other.scripts);
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced at the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such primary: {0}")]
    NoSuchPrimary(String),

    #[error("duplicate instance: {0}")]
    Duplicate(String),

    #[error("quorum must be positive")]
    QuorumMustBePositive,

    #[error("failover already in progress for {0}")]
    FailoverInProgress(String),

    #[error("no suitable replica for {0}")]
    NoSuitableReplica(String),

    #[error("not enough information about {0} to act")]
    InsufficientInfo(String),

    #[error(transparent)]
    Address(#[from] AddressError),
}

/// The three-field reply to `IS-PRIMARY-DOWN-BY-ADDR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsDownReply {
    pub is_down: bool,
    /// Granted leader run id, or `"?"` when no vote is cast.
    pub leader: String,
    pub leader_epoch: Epoch,
}
