//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use strand_core::{CoreError, CoreResult, Timeout};

/// Office runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Timeout for asynchronous flows whose function template sets none
    pub default_async_timeout: Timeout,
    /// Team used by functions that name none (pass-through when unset)
    pub default_team: Option<String>,
    /// Whether threads created without an explicit preference are thread-local aware
    pub thread_local_aware: bool,
    /// Period of the asset monitor ticker in milliseconds
    pub tick_interval_ms: u64,
    /// Upper bound on threads per dedicated team (0 = no limit)
    pub max_team_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_async_timeout: Timeout::from_secs(30),
            default_team: None,
            thread_local_aware: false,
            tick_interval_ms: 10,
            max_team_threads: 0,
        }
    }
}

impl RuntimeConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default asynchronous flow timeout
    #[must_use]
    pub fn with_default_async_timeout(mut self, timeout: Timeout) -> Self {
        self.default_async_timeout = timeout;
        self
    }

    /// Set the default team
    #[must_use]
    pub fn with_default_team(mut self, team: impl Into<String>) -> Self {
        self.default_team = Some(team.into());
        self
    }

    /// Make new threads thread-local aware by default
    #[must_use]
    pub fn with_thread_local_aware(mut self, aware: bool) -> Self {
        self.thread_local_aware = aware;
        self
    }

    /// Set the ticker period
    #[must_use]
    pub fn with_tick_interval_ms(mut self, millis: u64) -> Self {
        self.tick_interval_ms = millis;
        self
    }

    /// Set the dedicated team thread limit
    #[must_use]
    pub fn with_max_team_threads(mut self, max: usize) -> Self {
        self.max_team_threads = max;
        self
    }

    /// Ticker period as a duration (never zero)
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Parse configuration from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| CoreError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), "loaded runtime config");
        Ok(config)
    }
}
