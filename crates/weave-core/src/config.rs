use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// SystemConfig
// ---------------------------------------------------------------------------

/// Shared configuration for an agent system.
///
/// A snapshot of this record is handed to every agent at construction and is
/// immutable for the agent's lifetime. Timeouts are expressed in whole
/// seconds so the struct round-trips cleanly through JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Upper bound on a blocking mailbox receive, in seconds.
    pub message_queue_timeout_secs: u64,
    /// Number of retries a failing step gets before the failure policy
    /// applies. A step is attempted `max_retries + 1` times in total.
    pub max_retries: u32,
    /// When true, a step whose retries are exhausted is logged and skipped
    /// instead of failing the agent.
    pub continue_on_error: bool,
    /// When true, a timed-out mailbox receive yields no message instead of
    /// an error. Kept separate from `continue_on_error`: a quiet mailbox is
    /// not a step failure.
    pub continue_on_receive_timeout: bool,
    /// Upper bound on a single tool invocation, in seconds.
    pub tool_timeout_secs: u64,
    /// Optional per-recipient mailbox capacity. `None` means unbounded;
    /// publishing to a full bounded mailbox fails with `QueueFull`.
    pub queue_capacity: Option<usize>,
    /// Optional global deadline for a whole system run, in seconds. When it
    /// elapses the run returns a partial report; agents are not killed.
    pub run_deadline_secs: Option<u64>,
    /// When true, one agent reaching `Failed` requests a stop on all of its
    /// siblings.
    pub abort_on_failure: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            message_queue_timeout_secs: 30,
            max_retries: 3,
            continue_on_error: true,
            continue_on_receive_timeout: true,
            tool_timeout_secs: 30,
            queue_capacity: None,
            run_deadline_secs: None,
            abort_on_failure: false,
        }
    }
}

impl SystemConfig {
    /// Parse a config from a JSON document, then validate it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: SystemConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.message_queue_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "message_queue_timeout_secs must be non-zero".into(),
            ));
        }
        if self.tool_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "tool_timeout_secs must be non-zero".into(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "queue_capacity must be non-zero when set".into(),
            ));
        }
        if self.run_deadline_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "run_deadline_secs must be non-zero when set".into(),
            ));
        }
        Ok(())
    }

    pub fn message_queue_timeout(&self) -> Duration {
        Duration::from_secs(self.message_queue_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
