//! # vigil-config: configuration for the Vigil supervisor
//!
//! Parses the directive-style configuration file into a validated
//! [`VigilConfig`]. The grammar is one directive per line; `monitor`
//! declares a primary and the tuning directives that follow refer to it by
//! name.

mod error;
mod loader;
mod parser;

pub use error::{ConfigError, Result};
pub use loader::load_file;

use std::path::Path;

use vigil_types::PrimaryConfig;

/// The parsed configuration: one entry per monitored primary.
#[derive(Debug, Clone, Default)]
pub struct VigilConfig {
    pub primaries: Vec<PrimaryConfig>,
}

impl VigilConfig {
    /// Parses configuration text. Does not touch the filesystem; script
    /// paths are validated separately by [`load_file`] /
    /// [`VigilConfig::validate_scripts`].
    pub fn parse(input: &str) -> Result<Self> {
        parser::parse(input)
    }

    /// Looks up a monitored primary by name.
    pub fn primary(&self, name: &str) -> Option<&PrimaryConfig> {
        self.primaries.iter().find(|p| p.name == name)
    }

    /// Checks that every configured script path exists and is executable.
    pub fn validate_scripts(&self) -> Result<()> {
        for primary in &self.primaries {
            for path in [&primary.notification_script, &primary.client_reconfig_script]
                .into_iter()
                .flatten()
            {
                if !is_executable(path) {
                    return Err(ConfigError::NonExecutableScript(path.clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
