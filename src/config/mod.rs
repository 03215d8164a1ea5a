//! Configuration module
//!
//! Engine settings come from built-in defaults, then a config file, then
//! `TRELLIS_*` environment variables, then command-line flags.

mod env;
mod file;

pub use env::{EnvBuilder, EnvConfig, EnvGuard};
pub use file::ConfigFile;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::utils::LogLevel;

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of tests in flight
    pub max_parallelism: usize,

    /// Attempt timeout for tests that declare none
    pub default_timeout_ms: Option<u64>,

    /// Retry limit for tests that declare none
    pub default_retry_limit: u32,

    /// How long a cancelled body may take to return before it is abandoned
    pub cancellation_grace_ms: u64,

    /// Cancel the session on the first failed test
    pub fail_fast: bool,

    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            default_timeout_ms: None,
            default_retry_limit: 0,
            cancellation_grace_ms: 2000,
            fail_fast: false,
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_default_retry_limit(mut self, limit: u32) -> Self {
        self.default_retry_limit = limit;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.cancellation_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Overlay values present in the environment
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(max) = env.max_parallelism {
            self.max_parallelism = max;
        }
        if let Some(timeout) = env.timeout_ms {
            self.default_timeout_ms = Some(timeout);
        }
        if let Some(limit) = env.retry_limit {
            self.default_retry_limit = limit;
        }
        if let Some(grace) = env.grace_ms {
            self.cancellation_grace_ms = grace;
        }
        if let Some(fail_fast) = env.fail_fast {
            self.fail_fast = fail_fast;
        }
        if let Some(level) = env.log_level {
            self.log_level = level;
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(EngineError::InvalidConfig {
                message: "max_parallelism must be at least 1".to_string(),
            });
        }
        if self.cancellation_grace_ms == 0 {
            return Err(EngineError::InvalidConfig {
                message: "cancellation_grace_ms must be at least 1".to_string(),
            });
        }
        if self.default_timeout_ms == Some(0) {
            return Err(EngineError::InvalidConfig {
                message: "default_timeout_ms must be positive when set".to_string(),
            });
        }
        Ok(())
    }
}
