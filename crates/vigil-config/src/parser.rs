//! Directive-line parser.
//!
//! The configuration grammar is one directive per line:
//!
//! ```text
//! monitor cache 10.0.0.1 6379 2
//! down-after-milliseconds cache 5000
//! failover-timeout cache 60000
//! can-failover cache yes
//! parallel-syncs cache 2
//! notification-script cache /opt/vigil/notify.sh
//! client-reconfig-script cache /opt/vigil/reconf.sh
//! auth-pass cache s3cret
//! ```
//!
//! Blank lines and `#` comments are skipped. Tuning directives must follow
//! the `monitor` line that declares their primary.

use vigil_types::{Address, PrimaryConfig};

use crate::{ConfigError, Result, VigilConfig};

pub(crate) fn parse(input: &str) -> Result<VigilConfig> {
    let mut config = VigilConfig::default();

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let directive = tokens.next().expect("non-empty line has a token");
        let args: Vec<&str> = tokens.collect();

        match directive {
            "monitor" => parse_monitor(&mut config, line_no, &args)?,
            "down-after-milliseconds" => {
                let (name, ms) = name_and_u64(line_no, &args)?;
                primary_mut(&mut config, line_no, name)?.down_after_ms = ms;
            }
            "failover-timeout" => {
                let (name, ms) = name_and_u64(line_no, &args)?;
                primary_mut(&mut config, line_no, name)?.failover_timeout_ms = ms;
            }
            "can-failover" => {
                let (name, value) = name_and_arg(line_no, &args)?;
                let flag = match value {
                    "yes" => true,
                    "no" => false,
                    other => {
                        return Err(ConfigError::Parse {
                            line: line_no,
                            reason: format!("expected yes or no, got {other:?}"),
                        })
                    }
                };
                primary_mut(&mut config, line_no, name)?.can_failover = flag;
            }
            "parallel-syncs" => {
                let (name, n) = name_and_u64(line_no, &args)?;
                let n = u32::try_from(n).map_err(|_| ConfigError::Parse {
                    line: line_no,
                    reason: "parallel-syncs out of range".into(),
                })?;
                primary_mut(&mut config, line_no, name)?.parallel_syncs = n.max(1);
            }
            "notification-script" => {
                let (name, path) = name_and_arg(line_no, &args)?;
                primary_mut(&mut config, line_no, name)?.notification_script =
                    Some(path.into());
            }
            "client-reconfig-script" => {
                let (name, path) = name_and_arg(line_no, &args)?;
                primary_mut(&mut config, line_no, name)?.client_reconfig_script =
                    Some(path.into());
            }
            "auth-pass" => {
                let (name, secret) = name_and_arg(line_no, &args)?;
                primary_mut(&mut config, line_no, name)?.auth_pass =
                    Some(secret.to_string());
            }
            other => {
                return Err(ConfigError::Parse {
                    line: line_no,
                    reason: format!("unknown directive: {other}"),
                })
            }
        }
    }

    Ok(config)
}

fn parse_monitor(config: &mut VigilConfig, line_no: usize, args: &[&str]) -> Result<()> {
    let [name, host, port, quorum] = args else {
        return Err(ConfigError::Parse {
            line: line_no,
            reason: "monitor takes: <name> <host> <port> <quorum>".into(),
        });
    };

    if config.primary(name).is_some() {
        return Err(ConfigError::Duplicate((*name).to_string()));
    }

    let port: u32 = port.parse().map_err(|_| ConfigError::Parse {
        line: line_no,
        reason: format!("invalid port: {port:?}"),
    })?;
    let quorum: u32 = quorum.parse().map_err(|_| ConfigError::Parse {
        line: line_no,
        reason: format!("invalid quorum: {quorum:?}"),
    })?;
    if quorum == 0 {
        return Err(ConfigError::QuorumMustBePositive((*name).to_string()));
    }

    let addr = Address::resolve(host, port)
        .map_err(|source| ConfigError::Address { line: line_no, source })?;

    config
        .primaries
        .push(PrimaryConfig::new(*name, addr, quorum));
    Ok(())
}

fn name_and_arg<'a>(line_no: usize, args: &[&'a str]) -> Result<(&'a str, &'a str)> {
    match args {
        [name, value] => Ok((*name, *value)),
        _ => Err(ConfigError::Parse {
            line: line_no,
            reason: "expected: <name> <value>".into(),
        }),
    }
}

fn name_and_u64<'a>(line_no: usize, args: &[&'a str]) -> Result<(&'a str, u64)> {
    let (name, value) = name_and_arg(line_no, args)?;
    let value = value.parse().map_err(|_| ConfigError::Parse {
        line: line_no,
        reason: format!("invalid number: {value:?}"),
    })?;
    Ok((name, value))
}

fn primary_mut<'a>(
    config: &'a mut VigilConfig,
    line_no: usize,
    name: &str,
) -> Result<&'a mut PrimaryConfig> {
    config
        .primaries
        .iter_mut()
        .find(|p| p.name == name)
        .ok_or_else(|| ConfigError::NoSuchPrimary {
            line: line_no,
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parses_full_example() {
        let config = parse(
            "# primary cache\n\
             monitor cache 10.0.0.1 6379 2\n\
             down-after-milliseconds cache 5000\n\
             failover-timeout cache 60000\n\
             can-failover cache yes\n\
             parallel-syncs cache 3\n\
             auth-pass cache hunter2\n\
             \n\
             monitor sessions 10.0.1.1 6379 3\n\
             can-failover sessions no\n",
        )
        .unwrap();

        assert_eq!(config.primaries.len(), 2);
        let cache = config.primary("cache").unwrap();
        assert_eq!(cache.addr.to_string(), "10.0.0.1:6379");
        assert_eq!(cache.quorum, 2);
        assert_eq!(cache.down_after_ms, 5000);
        assert_eq!(cache.failover_timeout_ms, 60000);
        assert_eq!(cache.parallel_syncs, 3);
        assert_eq!(cache.auth_pass.as_deref(), Some("hunter2"));
        assert!(cache.can_failover);
        assert!(!config.primary("sessions").unwrap().can_failover);
    }

    #[test]
    fn defaults_apply_without_tuning_directives() {
        let config = parse("monitor cache 10.0.0.1 6379 2\n").unwrap();
        let cache = config.primary("cache").unwrap();
        assert_eq!(cache.down_after_ms, 30_000);
        assert_eq!(cache.failover_timeout_ms, 180_000);
        assert_eq!(cache.parallel_syncs, 1);
        assert!(cache.can_failover);
        assert!(cache.auth_pass.is_none());
    }

    #[test]
    fn directive_before_monitor_is_rejected() {
        let err = parse("down-after-milliseconds cache 5000\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoSuchPrimary { line: 1, .. }));
    }

    #[test]
    fn duplicate_monitor_is_rejected() {
        let err = parse(
            "monitor cache 10.0.0.1 6379 2\nmonitor cache 10.0.0.2 6379 2\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(name) if name == "cache"));
    }

    #[test]
    fn zero_quorum_is_rejected() {
        let err = parse("monitor cache 10.0.0.1 6379 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::QuorumMustBePositive(_)));
    }

    #[test]
    fn invalid_port_is_an_address_error() {
        let err = parse("monitor cache 10.0.0.1 0 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Address { line: 1, .. }));
    }

    #[test_case("can-failover cache maybe" ; "bad boolean")]
    #[test_case("monitor cache 10.0.0.1 6379" ; "missing quorum")]
    #[test_case("frobnicate cache 1" ; "unknown directive")]
    fn malformed_lines_are_parse_errors(line: &str) {
        let input = format!("monitor cache 10.0.0.1 6379 2\n{line}\n");
        let err = parse(&input).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 2, .. }));
    }
}
