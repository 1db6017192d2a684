//! # vigil-scripts: user script scheduling
//!
//! Vigil invokes two kinds of user-supplied executables:
//!
//! - **notification scripts** on warning-level events bound to a primary,
//!   with arguments `(event-type, message)`;
//! - **client reconfiguration scripts** at failover start, end, and abort,
//!   with arguments
//!   `(primary-name, role, state, from-ip, from-port, to-ip, to-port)`.
//!
//! Jobs flow through a bounded FIFO with capped concurrency, a runtime
//! kill, and exponential retry for transient failures (death by signal or
//! exit code 1). The policy lives in [`ScriptQueue`], pure and clock-driven
//! for tests; [`ScriptRunner`] binds it to real child processes.

mod queue;
mod runner;

pub use queue::{ExitDisposition, ScriptJob, ScriptQueue};
pub use runner::{PendingScript, ScriptRunner};

use std::path::Path;

use vigil_types::{Address, ReconfigRole, ReconfigStage};

/// Argument vector for a notification script invocation.
pub fn notification_argv(script: &Path, event_kind: &str, message: &str) -> Vec<String> {
    vec![
        script.display().to_string(),
        event_kind.to_string(),
        message.to_string(),
    ]
}

/// Argument vector for a client reconfiguration script invocation.
pub fn reconfig_argv(
    script: &Path,
    primary_name: &str,
    role: ReconfigRole,
    stage: ReconfigStage,
    from: Address,
    to: Address,
) -> Vec<String> {
    vec![
        script.display().to_string(),
        primary_name.to_string(),
        role.as_str().to_string(),
        stage.as_str().to_string(),
        from.ip.to_string(),
        from.port.to_string(),
        to.ip.to_string(),
        to.port.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;

    #[test]
    fn reconfig_argv_layout_matches_contract() {
        let from = Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6379);
        let to = Address::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6380);
        let argv = reconfig_argv(
            &PathBuf::from("/opt/reconf.sh"),
            "cache",
            ReconfigRole::Leader,
            ReconfigStage::Start,
            from,
            to,
        );
        assert_eq!(
            argv,
            [
                "/opt/reconf.sh",
                "cache",
                "leader",
                "start",
                "10.0.0.1",
                "6379",
                "10.0.0.2",
                "6380",
            ]
        );
    }

    #[test]
    fn notification_argv_is_script_kind_message() {
        let argv = notification_argv(
            &PathBuf::from("/opt/notify.sh"),
            "+sdown",
            "primary cache 10.0.0.1 6379",
        );
        assert_eq!(argv[0], "/opt/notify.sh");
        assert_eq!(argv[1], "+sdown");
        assert_eq!(argv[2], "primary cache 10.0.0.1 6379");
    }
}
