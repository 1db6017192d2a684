//! # vigil-server: the supervisor daemon
//!
//! Binds the pure engine in `vigil-core` to the real world:
//!
//! - per-instance link tasks (command + pub/sub) over TCP with the
//!   protocol framing from `vigil-wire`;
//! - the peer-facing RPC listener (`IS-PRIMARY-DOWN-BY-ADDR` and the
//!   operator introspection commands);
//! - the ≈100 ms timer loop that ticks the engine and the script
//!   scheduler;
//! - event logging and script fan-out.
//!
//! Everything engine-related runs on one task; link and RPC tasks only
//! move bytes and report back over channels, matching the engine's
//! single-threaded cooperative model.

mod clock;
mod links;
mod rpc;
mod server;

pub use clock::Clock;
pub use server::{Server, ServerConfig};
