use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an agent.
///
/// `Initialized → Running → {Completed | Failed | Stopped}`, with `Waiting`
/// as a sub-state entered while blocked on a mailbox receive. Retrying a
/// step does not change status (the agent stays `Running`); all other
/// transitions are validated in [`can_transition`](Self::can_transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initialized,
    Running,
    Waiting,
    Completed,
    Failed,
    Stopped,
}

impl AgentStatus {
    /// Terminal statuses admit no further step execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Stopped
        )
    }

    /// Whether moving from `self` to `to` is a legal transition.
    ///
    /// Valid transitions:
    /// - Initialized -> Running | Stopped
    /// - Running     -> Waiting | Completed | Failed | Stopped
    /// - Waiting     -> Running | Failed | Stopped
    pub fn can_transition(&self, to: AgentStatus) -> bool {
        matches!(
            (self, to),
            (AgentStatus::Initialized, AgentStatus::Running)
                | (AgentStatus::Initialized, AgentStatus::Stopped)
                | (AgentStatus::Running, AgentStatus::Waiting)
                | (AgentStatus::Running, AgentStatus::Completed)
                | (AgentStatus::Running, AgentStatus::Failed)
                | (AgentStatus::Running, AgentStatus::Stopped)
                | (AgentStatus::Waiting, AgentStatus::Running)
                | (AgentStatus::Waiting, AgentStatus::Failed)
                | (AgentStatus::Waiting, AgentStatus::Stopped)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Initialized => "initialized",
            AgentStatus::Running => "running",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
