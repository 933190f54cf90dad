//! Session configuration.
//!
//! Defaults come from [`SessionConfig::new`]; `PYTERM_*` environment variables
//! override them through [`SessionConfig::from_env`].

use std::time::Duration;

use crate::bridge::{DEFAULT_CAPACITY, HEADER_BYTES};
use crate::sanitize::{DEFAULT_ENTRY_FILENAME, Sanitizer, SanitizerRules};

pub const ENV_INPUT_CAPACITY: &str = "PYTERM_INPUT_CAPACITY";
pub const ENV_ENTRY_FILENAME: &str = "PYTERM_ENTRY_FILENAME";
pub const ENV_BOOT_TIMEOUT_MS: &str = "PYTERM_BOOT_TIMEOUT_MS";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "PYTERM_SHUTDOWN_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Size of the stdin control block in bytes, header included.
    pub input_capacity: usize,
    /// Filename the program runs as; also the sanitizer's boundary frame.
    pub entry_filename: String,
    /// Upper bound on engine bootstrap.
    pub boot_timeout: Duration,
    /// How long `shutdown` waits for the worker thread.
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            input_capacity: DEFAULT_CAPACITY,
            entry_filename: DEFAULT_ENTRY_FILENAME.to_string(),
            boot_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    pub fn with_entry_filename(mut self, filename: impl Into<String>) -> Self {
        self.entry_filename = filename.into();
        self
    }

    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(value) = lookup(ENV_INPUT_CAPACITY) {
            config.input_capacity = parse_capacity(&value)?;
        }
        if let Some(value) = lookup(ENV_ENTRY_FILENAME) {
            let value = value.trim();
            if value.is_empty() {
                return Err(ConfigError::invalid(
                    ENV_ENTRY_FILENAME,
                    value,
                    "must not be empty",
                ));
            }
            config.entry_filename = value.to_string();
        }
        if let Some(value) = lookup(ENV_BOOT_TIMEOUT_MS) {
            config.boot_timeout = parse_millis(ENV_BOOT_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            config.shutdown_timeout = parse_millis(ENV_SHUTDOWN_TIMEOUT_MS, &value)?;
        }

        Ok(config)
    }

    /// Sanitizer whose boundary frame is the configured entry file.
    pub fn sanitizer(&self) -> Sanitizer {
        Sanitizer::new(SanitizerRules::for_entry(&self.entry_filename))
    }
}

fn parse_capacity(value: &str) -> Result<usize, ConfigError> {
    let capacity: usize = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(ENV_INPUT_CAPACITY, value, "expected a byte count"))?;
    if capacity <= HEADER_BYTES || capacity % 4 != 0 {
        return Err(ConfigError::invalid(
            ENV_INPUT_CAPACITY,
            value,
            format!("must be a multiple of 4 larger than {HEADER_BYTES}"),
        ));
    }
    Ok(capacity)
}

fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::invalid(var, value, "expected milliseconds"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::new();
        assert_eq!(config.input_capacity, 1024);
        assert_eq!(config.entry_filename, "main.py");
        assert_eq!(config.boot_timeout, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(SessionConfig::from_lookup(lookup(&[])).unwrap(), config);
    }

    #[test]
    fn builders_override() {
        let config = SessionConfig::new()
            .with_input_capacity(64)
            .with_entry_filename("app.py")
            .with_boot_timeout(Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_millis(10));

        assert_eq!(config.input_capacity, 64);
        assert_eq!(config.entry_filename, "app.py");
        assert_eq!(config.boot_timeout, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(10));
    }

    #[test]
    fn environment_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            (ENV_INPUT_CAPACITY, "4096"),
            (ENV_ENTRY_FILENAME, " script.py "),
            (ENV_BOOT_TIMEOUT_MS, "1500"),
            (ENV_SHUTDOWN_TIMEOUT_MS, "250"),
        ]))
        .unwrap();

        assert_eq!(config.input_capacity, 4096);
        assert_eq!(config.entry_filename, "script.py");
        assert_eq!(config.boot_timeout, Duration::from_millis(1500));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_values() {
        for (var, value) in [
            (ENV_INPUT_CAPACITY, "lots"),
            (ENV_INPUT_CAPACITY, "8"),
            (ENV_INPUT_CAPACITY, "1001"),
            (ENV_ENTRY_FILENAME, "  "),
            (ENV_BOOT_TIMEOUT_MS, "-1"),
            (ENV_SHUTDOWN_TIMEOUT_MS, "soon"),
        ] {
            let err = SessionConfig::from_lookup(lookup(&[(var, value)])).unwrap_err();
            let ConfigError::Invalid { var: reported, .. } = err;
            assert_eq!(reported, var, "{var}={value:?}");
        }
    }

    #[test]
    fn sanitizer_uses_entry_filename() {
        let sanitizer = SessionConfig::new()
            .with_entry_filename("app.py")
            .sanitizer();
        let kept = sanitizer.filter(&[
            r#"  File "/lib/python3.12/runpy.py", line 1"#,
            r#"  File "app.py", line 2, in <module>"#,
            "ValueError: x",
        ]);
        assert_eq!(kept, vec![r#"  File "app.py", line 2, in <module>"#, "ValueError: x"]);
    }
}
