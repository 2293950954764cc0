//! Resolution of the one external configuration input the core has: the
//! `prometheus_multiproc_dir` root directory. Modeled on `pbs-config`'s
//! fail-fast-at-construction validation style for its datastore lookups,
//! but kept to the single env var spec.md §6 names —
//! a full section-config parser is out of scope (the CLI/bootstrap of the
//! archiver daemon is an external collaborator, spec.md §1).

use std::path::PathBuf;

use crate::error::ConfigError;

pub const PROMETHEUS_MULTIPROC_DIR: &str = "prometheus_multiproc_dir";

/// Read and validate `prometheus_multiproc_dir` from the environment.
///
/// Fails with [`ConfigError`] if the variable is unset, empty, or does not
/// name an existing directory — the same three conditions that make the
/// original `MultiProcessCollector.__init__` raise `ValueError`.
pub fn multiproc_dir() -> Result<PathBuf, ConfigError> {
    let raw = std::env::var(PROMETHEUS_MULTIPROC_DIR).map_err(|_| ConfigError::NotSet)?;
    if raw.is_empty() {
        return Err(ConfigError::NotSet);
    }
    let path = PathBuf::from(raw);
    if !path.is_dir() {
        return Err(ConfigError::NotADirectory { path });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // std::env is process-global; serialize these tests against each
    // other the way `test_multiprocess.py::TestUnsetEnv`'s setUp/tearDown
    // implicitly does under unittest's serial runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_dir_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(PROMETHEUS_MULTIPROC_DIR);
        assert!(matches!(multiproc_dir(), Err(ConfigError::NotSet)));
    }

    #[test]
    fn non_directory_errors() {
        let _guard = ENV_LOCK.lock().unwrap();
        let file = tempfile_path();
        std::env::set_var(PROMETHEUS_MULTIPROC_DIR, &file);
        let result = multiproc_dir();
        std::env::remove_var(PROMETHEUS_MULTIPROC_DIR);
        std::fs::remove_file(&file).ok();
        assert!(matches!(result, Err(ConfigError::NotADirectory { .. })));
    }

    #[test]
    fn valid_dir_succeeds() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = std::env::temp_dir();
        std::env::set_var(PROMETHEUS_MULTIPROC_DIR, &dir);
        let result = multiproc_dir();
        std::env::remove_var(PROMETHEUS_MULTIPROC_DIR);
        assert_eq!(result.unwrap(), dir);
    }

    fn tempfile_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("pmc-config-test-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        path
    }
}
