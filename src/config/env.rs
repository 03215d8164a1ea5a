//! Environment variable configuration
//!
//! `TRELLIS_*` variables override values from the config file.

use std::env;

use crate::utils::LogLevel;

/// Environment variable prefix
const ENV_PREFIX: &str = "TRELLIS";

/// Engine overrides read from the environment
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvConfig {
    /// TRELLIS_MAX_PARALLELISM
    pub max_parallelism: Option<usize>,
    /// TRELLIS_TIMEOUT_MS
    pub timeout_ms: Option<u64>,
    /// TRELLIS_RETRY_LIMIT
    pub retry_limit: Option<u32>,
    /// TRELLIS_GRACE_MS
    pub grace_ms: Option<u64>,
    /// TRELLIS_FAIL_FAST
    pub fail_fast: Option<bool>,
    /// TRELLIS_LOG
    pub log_level: Option<LogLevel>,
    /// TRELLIS_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load overrides from the process environment
    pub fn load() -> Self {
        Self {
            max_parallelism: get_env_parse("MAX_PARALLELISM"),
            timeout_ms: get_env_parse("TIMEOUT_MS"),
            retry_limit: get_env_parse("RETRY_LIMIT"),
            grace_ms: get_env_parse("GRACE_MS"),
            fail_fast: get_env_bool("FAIL_FAST"),
            log_level: get_env_parse("LOG"),
            config_file: get_env("CONFIG"),
        }
    }

    pub fn has_any(&self) -> bool {
        self.max_parallelism.is_some()
            || self.timeout_ms.is_some()
            || self.retry_limit.is_some()
            || self.grace_ms.is_some()
            || self.fail_fast.is_some()
            || self.log_level.is_some()
            || self.config_file.is_some()
    }

    pub fn print_summary(&self) {
        println!("Environment Overrides:");
        println!("  {ENV_PREFIX}_MAX_PARALLELISM: {:?}", self.max_parallelism);
        println!("  {ENV_PREFIX}_TIMEOUT_MS:      {:?}", self.timeout_ms);
        println!("  {ENV_PREFIX}_RETRY_LIMIT:     {:?}", self.retry_limit);
        println!("  {ENV_PREFIX}_GRACE_MS:        {:?}", self.grace_ms);
        println!("  {ENV_PREFIX}_FAIL_FAST:       {:?}", self.fail_fast);
        println!("  {ENV_PREFIX}_LOG:             {:?}", self.log_level);
        println!("  {ENV_PREFIX}_CONFIG:          {:?}", self.config_file);
    }
}

fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Sets `TRELLIS_*` variables, mostly for tests
#[derive(Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_parallelism(self, max: usize) -> Self {
        self.var("MAX_PARALLELISM", max.to_string())
    }

    pub fn timeout_ms(self, timeout: u64) -> Self {
        self.var("TIMEOUT_MS", timeout.to_string())
    }

    pub fn retry_limit(self, limit: u32) -> Self {
        self.var("RETRY_LIMIT", limit.to_string())
    }

    pub fn fail_fast(self, enabled: bool) -> Self {
        self.var("FAIL_FAST", enabled.to_string())
    }

    pub fn log(self, level: impl Into<String>) -> Self {
        self.var("LOG", level.into())
    }

    fn var(mut self, name: &str, value: String) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value));
        self
    }

    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return a guard that restores the previous values on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

/// Restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
