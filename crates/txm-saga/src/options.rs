use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_RELEASE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OptionsError {
    #[error("failed to read coordinator options from '{path}'")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse coordinator options")]
    Parse(#[source] toml::de::Error),
}

/// Tuning for a [`Coordinator`](crate::Coordinator).
///
/// The lock ttl must exceed the worst-case duration of a forward action plus
/// a safety margin: locks are not renewed while a commit runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    lock_ttl: Duration,
    poll_interval: Duration,
    release_attempts: u32,
    timeout: Option<Duration>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            release_attempts: DEFAULT_RELEASE_ATTEMPTS,
            timeout: None,
        }
    }
}

/// On-disk form; all durations in milliseconds, absent or zero means default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawOptions {
    lock_ttl_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    release_attempts: Option<u32>,
    timeout_ms: Option<u64>,
}

fn non_zero_millis(value: Option<u64>) -> Option<Duration> {
    value.filter(|ms| *ms > 0).map(Duration::from_millis)
}

impl From<RawOptions> for CoordinatorOptions {
    fn from(raw: RawOptions) -> Self {
        let defaults = Self::default();
        Self {
            lock_ttl: non_zero_millis(raw.lock_ttl_ms).unwrap_or(defaults.lock_ttl),
            poll_interval: non_zero_millis(raw.poll_interval_ms).unwrap_or(defaults.poll_interval),
            release_attempts: raw
                .release_attempts
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.release_attempts),
            timeout: non_zero_millis(raw.timeout_ms),
        }
    }
}

impl CoordinatorOptions {
    /// Parse options from TOML.
    ///
    /// ```
    /// use std::time::Duration;
    /// use txm_saga::CoordinatorOptions;
    ///
    /// let options = CoordinatorOptions::from_toml_str("lock_ttl_ms = 5000")?;
    /// assert_eq!(options.lock_ttl(), Duration::from_secs(5));
    /// # Ok::<(), txm_saga::OptionsError>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid TOML or names unknown keys.
    pub fn from_toml_str(input: &str) -> Result<Self, OptionsError> {
        let raw: RawOptions = toml::from_str(input).map_err(OptionsError::Parse)?;
        Ok(raw.into())
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, OptionsError> {
        let input = std::fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn release_attempts(&self) -> u32 {
        self.release_attempts
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// A zero ttl is replaced by the default.
    #[must_use]
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = if lock_ttl.is_zero() {
            DEFAULT_LOCK_TTL
        } else {
            lock_ttl
        };
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Zero attempts is replaced by the default.
    #[must_use]
    pub fn with_release_attempts(mut self, release_attempts: u32) -> Self {
        self.release_attempts = if release_attempts == 0 {
            DEFAULT_RELEASE_ATTEMPTS
        } else {
            release_attempts
        };
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = CoordinatorOptions::default();

        assert_eq!(options.lock_ttl(), Duration::from_secs(30));
        assert_eq!(options.poll_interval(), Duration::from_millis(50));
        assert_eq!(options.release_attempts(), 3);
        assert_eq!(options.timeout(), None);
    }

    #[test]
    fn toml_overrides_defaults() -> Result<(), OptionsError> {
        let options = CoordinatorOptions::from_toml_str(
            r"
            lock_ttl_ms = 10000
            poll_interval_ms = 20
            release_attempts = 5
            timeout_ms = 2500
            ",
        )?;

        assert_eq!(options.lock_ttl(), Duration::from_secs(10));
        assert_eq!(options.poll_interval(), Duration::from_millis(20));
        assert_eq!(options.release_attempts(), 5);
        assert_eq!(options.timeout(), Some(Duration::from_millis(2500)));
        Ok(())
    }

    #[test]
    fn zero_values_are_repaired_to_defaults() -> Result<(), OptionsError> {
        let options = CoordinatorOptions::from_toml_str(
            r"
            lock_ttl_ms = 0
            release_attempts = 0
            timeout_ms = 0
            ",
        )?;

        assert_eq!(options, CoordinatorOptions::default());
        Ok(())
    }

    #[test]
    fn empty_input_yields_defaults() -> Result<(), OptionsError> {
        assert_eq!(
            CoordinatorOptions::from_toml_str("")?,
            CoordinatorOptions::default()
        );
        Ok(())
    }

    #[test]
    fn unknown_key_is_rejected() {
        let result = CoordinatorOptions::from_toml_str("lock_timeout = 3");
        assert!(matches!(result, Err(OptionsError::Parse(_))));
    }

    #[test]
    fn builders_repair_zero_values() {
        let options = CoordinatorOptions::default()
            .with_lock_ttl(Duration::ZERO)
            .with_release_attempts(0)
            .with_timeout(Duration::from_secs(1));

        assert_eq!(options.lock_ttl(), Duration::from_secs(30));
        assert_eq!(options.release_attempts(), 3);
        assert_eq!(options.timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn options_load_from_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "lock_ttl_ms = 1500")?;

        let options = CoordinatorOptions::from_path(file.path())?;

        assert_eq!(options.lock_ttl(), Duration::from_millis(1500));
        Ok(())
    }

    #[test]
    fn missing_file_reports_its_path() {
        let path = Path::new("/nonexistent/txm.toml");

        let result = CoordinatorOptions::from_path(path);

        assert!(matches!(result, Err(OptionsError::Read { path: p, .. }) if p == path));
    }
}
