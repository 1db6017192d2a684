//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::VigilConfig;

/// Loads and fully validates a configuration file.
///
/// Script executability is checked here rather than in the parser so the
/// parser stays pure and unit-testable on strings.
pub fn load_file(path: impl AsRef<Path>) -> Result<VigilConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;

    let config = crate::parser::parse(&content)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    config.validate_scripts()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, executable: bool) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nexit 0").unwrap();
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn loads_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vigil.conf");
        fs::write(&config_path, "monitor cache 127.0.0.1 6379 2\n").unwrap();

        let config = load_file(&config_path).unwrap();
        assert_eq!(config.primaries.len(), 1);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_file("/no/such/vigil.conf").unwrap_err();
        assert!(err.to_string().contains("/no/such/vigil.conf"));
    }

    #[cfg(unix)]
    #[test]
    fn executable_script_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "notify.sh", true);
        let config_path = dir.path().join("vigil.conf");
        fs::write(
            &config_path,
            format!(
                "monitor cache 127.0.0.1 6379 2\nnotification-script cache {}\n",
                script.display()
            ),
        )
        .unwrap();

        assert!(load_file(&config_path).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_script_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "notify.sh", false);
        let config_path = dir.path().join("vigil.conf");
        fs::write(
            &config_path,
            format!(
                "monitor cache 127.0.0.1 6379 2\nclient-reconfig-script cache {}\n",
                script.display()
            ),
        )
        .unwrap();

        let err = load_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }
}
