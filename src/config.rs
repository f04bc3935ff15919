//! Configuration for the rewriting engine.
//!
//! [`EngineConfig`] collects the few tunables the engine has: the debounce window of the
//! change scheduler, verbose redefinition logging, the optional debug dump directory, the
//! size of the background worker pool and the names of the runtime indirection points.
//! Values can be set with the `with_*` builder methods or read from the environment with
//! [`EngineConfig::from_env`].

use std::{path::PathBuf, time::Duration};

use tracing::warn;

use crate::rewrite::RuntimeTargets;

/// Environment variable overriding the debounce window, in milliseconds.
pub const ENV_DEBOUNCE_MS: &str = "HOTSWAP_DEBOUNCE_MS";
/// Environment variable enabling verbose redefinition logging (`1`/`true`/`yes`/`on`).
pub const ENV_LOG_REDEFINITION: &str = "HOTSWAP_LOG_REDEFINITION";
/// Environment variable naming the debug dump directory.
pub const ENV_DUMP_DIR: &str = "HOTSWAP_DUMP_DIR";
/// Environment variable overriding the number of background worker threads.
pub const ENV_WORKER_THREADS: &str = "HOTSWAP_WORKER_THREADS";

/// Default quiet period before a batch of redefinitions is delivered.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Configuration for the rewriting engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quiet period before a batch is delivered (default: 300ms).
    pub debounce_window: Duration,

    /// Log every redefinition at `info` level (default: false).
    pub log_redefinition: bool,

    /// Directory receiving the binary form of every rewritten unit.
    ///
    /// Purely diagnostic; `None` disables the dump.
    pub dump_dir: Option<PathBuf>,

    /// Threads of the background pool running eager resolution and extension activation.
    ///
    /// `0` lets the pool pick (default: 2).
    pub worker_threads: usize,

    /// Internal names of the runtime indirection points.
    pub targets: RuntimeTargets,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE,
            log_redefinition: false,
            dump_dir: None,
            worker_threads: 2,
            targets: RuntimeTargets::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from the process environment.
    ///
    /// Unset variables keep their defaults. Values that do not parse are logged and
    /// ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates a configuration from an arbitrary variable source.
    ///
    /// # Arguments
    ///
    /// * `lookup` - Returns the value of a variable, or `None` if it is unset.
    ///
    /// # Returns
    ///
    /// The default configuration with every parseable variable applied.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_DEBOUNCE_MS) {
            match value.trim().parse::<u64>() {
                Ok(millis) => config.debounce_window = Duration::from_millis(millis),
                Err(_) => warn!(variable = ENV_DEBOUNCE_MS, %value, "ignoring invalid value"),
            }
        }
        if let Some(value) = lookup(ENV_LOG_REDEFINITION) {
            match parse_flag(&value) {
                Some(flag) => config.log_redefinition = flag,
                None => warn!(variable = ENV_LOG_REDEFINITION, %value, "ignoring invalid value"),
            }
        }
        if let Some(value) = lookup(ENV_DUMP_DIR) {
            let value = value.trim();
            if value.is_empty() {
                warn!(variable = ENV_DUMP_DIR, "ignoring empty value");
            } else {
                config.dump_dir = Some(PathBuf::from(value));
            }
        }
        if let Some(value) = lookup(ENV_WORKER_THREADS) {
            match value.trim().parse::<usize>() {
                Ok(threads) => config.worker_threads = threads,
                Err(_) => warn!(variable = ENV_WORKER_THREADS, %value, "ignoring invalid value"),
            }
        }
        config
    }

    /// Sets the debounce window.
    ///
    /// # Arguments
    ///
    /// * `window` - Quiet period before a batch is delivered.
    ///
    /// # Returns
    ///
    /// The modified configuration (builder pattern).
    #[must_use]
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Enables or disables verbose redefinition logging.
    #[must_use]
    pub fn with_log_redefinition(mut self, enable: bool) -> Self {
        self.log_redefinition = enable;
        self
    }

    /// Sets the debug dump directory.
    ///
    /// # Arguments
    ///
    /// * `dir` - Directory receiving rewritten units; created on demand.
    ///
    /// # Returns
    ///
    /// The modified configuration (builder pattern).
    #[must_use]
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    /// Sets the number of background worker threads.
    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the names of the runtime indirection points.
    #[must_use]
    pub fn with_targets(mut self, targets: RuntimeTargets) -> Self {
        self.targets = targets;
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = EngineConfig::from_lookup(|_| None);
        assert_eq!(config.debounce_window, DEFAULT_DEBOUNCE);
        assert!(!config.log_redefinition);
        assert!(config.dump_dir.is_none());
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn reads_every_variable() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_DEBOUNCE_MS, "50"),
            (ENV_LOG_REDEFINITION, "yes"),
            (ENV_DUMP_DIR, "/tmp/hotswap"),
            (ENV_WORKER_THREADS, " 4 "),
        ]));
        assert_eq!(config.debounce_window, Duration::from_millis(50));
        assert!(config.log_redefinition);
        assert_eq!(config.dump_dir, Some(PathBuf::from("/tmp/hotswap")));
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn invalid_values_are_ignored() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_DEBOUNCE_MS, "soon"),
            (ENV_LOG_REDEFINITION, "maybe"),
            (ENV_WORKER_THREADS, "-1"),
        ]));
        assert_eq!(config.debounce_window, DEFAULT_DEBOUNCE);
        assert!(!config.log_redefinition);
        assert_eq!(config.worker_threads, 2);
    }
}
