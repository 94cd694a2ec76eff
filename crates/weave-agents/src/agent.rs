use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use weave_bus::{AgentMessage, BusError, MessageKind, MessageQueue};
use weave_core::config::SystemConfig;
use weave_core::state::{AgentRunState, StateError, StateManager};
use weave_tools::{ToolArgs, ToolError, ToolRegistry};

use crate::spec::AgentSpec;
use crate::status::AgentStatus;

/// Well-known mailbox that receives agent progress reports.
pub const SUPERVISOR_MAILBOX: &str = "supervisor";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A step exhausted its retry budget.
    #[error("agent `{agent}` step `{step}` failed after {attempts} attempts: {source}")]
    StepFailed {
        agent: String,
        step: String,
        attempts: u32,
        #[source]
        source: ToolError,
    },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: AgentStatus,
        to: AgentStatus,
    },

    /// The generator's global deadline elapsed with agents still running.
    #[error("agent system deadline elapsed after {waited_ms}ms; non-terminal agents: {pending:?}")]
    SystemTimeout { waited_ms: u64, pending: Vec<String> },

    #[error("invalid agent spec: {0}")]
    InvalidSpec(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// StopHandle
// ---------------------------------------------------------------------------

/// Cloneable cancellation handle for one agent.
///
/// A stop request takes effect at the agent's next step boundary or
/// suspension point; it never preempts a step mid-flight.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// An independently scheduled unit that walks an ordered step sequence
/// toward a terminal status.
///
/// The agent exclusively owns its step cursor and retry counter and shares
/// (never owns) the tool registry, state manager, and message queue it was
/// built with. Its config snapshot is immutable for the agent's lifetime.
pub struct Agent {
    name: String,
    description: String,
    tools: Vec<String>,
    owner: String,
    initial_step: String,
    steps: Vec<String>,
    final_step: String,
    config: Arc<SystemConfig>,
    registry: Arc<ToolRegistry>,
    state: StateManager,
    queue: MessageQueue,
    status: AgentStatus,
    current_step: Option<String>,
    stop: StopHandle,
    /// Non-stop messages absorbed while scanning for stop requests; served
    /// to `recv` before the mailbox is consulted again.
    inbox: VecDeque<AgentMessage>,
}

impl Agent {
    pub fn new(
        spec: AgentSpec,
        owner: impl Into<String>,
        config: Arc<SystemConfig>,
        registry: Arc<ToolRegistry>,
        state: StateManager,
        queue: MessageQueue,
    ) -> Self {
        queue.register(&spec.name);
        Self {
            name: spec.name,
            description: spec.description,
            tools: spec.tools,
            owner: owner.into(),
            initial_step: spec.initial_step,
            steps: spec.steps,
            final_step: spec.final_step,
            config,
            registry,
            state,
            queue,
            status: AgentStatus::Initialized,
            current_step: None,
            stop: StopHandle::new(),
            inbox: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Handle for requesting cancellation from outside the agent's task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// JSON summary of the agent's definition and position.
    pub fn summary(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "tools": self.tools,
            "initial_step": self.initial_step,
            "steps": self.steps,
            "final_step": self.final_step,
            "status": self.status.to_string(),
            "current_step": self.current_step,
        })
    }

    fn set_status(&mut self, to: AgentStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition(to) {
            return Err(AgentError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        debug!(agent = %self.name, from = %self.status, to = %to, "status transition");
        self.status = to;
        Ok(())
    }

    fn step_sequence(&self) -> Vec<String> {
        let mut seq = Vec::with_capacity(self.steps.len() + 2);
        seq.push(self.initial_step.clone());
        seq.extend(self.steps.iter().cloned());
        seq.push(self.final_step.clone());
        seq
    }

    /// Pull everything already queued for this agent, latching stop requests
    /// and buffering the rest for `recv`.
    fn absorb_pending_messages(&mut self) {
        while let Some(msg) = self.queue.try_consume(&self.name) {
            if msg.kind == MessageKind::Stop {
                info!(agent = %self.name, sender = %msg.sender, "stop requested via message");
                self.stop.stop();
            } else {
                self.inbox.push_back(msg);
            }
        }
    }

    fn should_stop(&mut self) -> bool {
        self.absorb_pending_messages();
        self.stop.is_stop_requested()
    }

    /// Receive the oldest pending message, waiting up to the configured
    /// `message_queue_timeout`.
    ///
    /// While blocked the agent is `Waiting`; it returns to `Running` on
    /// arrival or timeout. A timeout yields `Ok(None)` under
    /// `continue_on_receive_timeout`, otherwise the timeout error. A `Stop`
    /// message latches the stop request and yields `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<AgentMessage>> {
        self.recv_timeout(self.config.message_queue_timeout()).await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<AgentMessage>> {
        self.absorb_pending_messages();
        if let Some(msg) = self.inbox.pop_front() {
            return Ok(Some(msg));
        }

        let was_running = self.status == AgentStatus::Running;
        if was_running {
            self.set_status(AgentStatus::Waiting)?;
        }
        let outcome = self.queue.consume(&self.name, timeout).await;
        if was_running {
            self.set_status(AgentStatus::Running)?;
        }

        match outcome {
            Ok(msg) if msg.kind == MessageKind::Stop => {
                info!(agent = %self.name, sender = %msg.sender, "stop requested via message");
                self.stop.stop();
                Ok(None)
            }
            Ok(msg) => Ok(Some(msg)),
            Err(BusError::Timeout { .. }) if self.config.continue_on_receive_timeout => {
                debug!(agent = %self.name, "receive timed out, continuing");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Advance from the initial step through the step list to the final
    /// step, applying the retry and failure policy per step.
    pub async fn execute(&mut self) -> Result<AgentStatus> {
        self.set_status(AgentStatus::Running)?;
        let mut run = self.state.create_state(&self.name, &self.owner).await?;
        run.status = self.status.to_string();
        self.state.update_state(&mut run).await?;
        info!(agent = %self.name, owner = %self.owner, "agent starting");

        for step in self.step_sequence() {
            if self.should_stop() {
                info!(agent = %self.name, step = %step, "stopping at step boundary");
                return self.finish(&mut run, AgentStatus::Stopped).await;
            }

            self.current_step = Some(step.clone());
            run.current_step = Some(step.clone());
            self.state.update_state(&mut run).await?;
            debug!(agent = %self.name, step = %step, "executing step");

            match self.run_step_with_retries(&step, &mut run).await {
                Ok(results) => {
                    run.step_results
                        .insert(step.clone(), Value::Object(results.clone()));
                    self.state.update_state(&mut run).await?;
                    self.publish_progress(&step, results);
                }
                Err(err) if self.config.continue_on_error => {
                    warn!(
                        agent = %self.name,
                        step = %step,
                        error = %err,
                        "step failed, continuing per policy"
                    );
                    run.shared_data
                        .insert("last_error".to_string(), json!(err.to_string()));
                    self.state.update_state(&mut run).await?;
                }
                Err(err) => {
                    run.shared_data
                        .insert("last_error".to_string(), json!(err.to_string()));
                    self.finish(&mut run, AgentStatus::Failed).await?;
                    return Err(err);
                }
            }
        }

        info!(agent = %self.name, "agent completed");
        self.finish(&mut run, AgentStatus::Completed).await
    }

    /// Record a terminal status and release the agent's mailbox.
    async fn finish(&mut self, run: &mut AgentRunState, status: AgentStatus) -> Result<AgentStatus> {
        self.set_status(status)?;
        run.status = status.to_string();
        self.state.update_state(run).await?;

        let leftover = self.queue.drain(&self.name);
        if !leftover.is_empty() {
            warn!(agent = %self.name, count = leftover.len(), "undelivered messages at shutdown");
        }
        self.queue.close(&self.name);
        Ok(status)
    }

    async fn run_step_with_retries(
        &mut self,
        step: &str,
        run: &mut AgentRunState,
    ) -> Result<Map<String, Value>> {
        let attempts = self.config.max_retries.saturating_add(1);

        let mut last = match self.run_step_once(step, run).await {
            Ok(results) => return Ok(results),
            Err(err) => {
                warn!(agent = %self.name, step = %step, attempt = 1, error = %err, "step attempt failed");
                err
            }
        };

        for attempt in 2..=attempts {
            match self.run_step_once(step, run).await {
                Ok(results) => {
                    debug!(agent = %self.name, step = %step, attempt, "step recovered on retry");
                    return Ok(results);
                }
                Err(err) => {
                    warn!(agent = %self.name, step = %step, attempt, error = %err, "step attempt failed");
                    last = err;
                }
            }
        }

        Err(AgentError::StepFailed {
            agent: self.name.clone(),
            step: step.to_string(),
            attempts,
            source: last,
        })
    }

    /// One attempt at a step: invoke every tool this agent carries, in
    /// order, threading prior results and per-tool state through the args.
    async fn run_step_once(
        &self,
        step: &str,
        run: &mut AgentRunState,
    ) -> std::result::Result<Map<String, Value>, ToolError> {
        let mut results = Map::new();
        for tool_name in &self.tools {
            let args = ToolArgs::new(step, self.owner.clone())
                .with_input(Value::Object(run.step_results.clone()))
                .with_tool_state(
                    run.tools_state
                        .get(tool_name)
                        .cloned()
                        .unwrap_or(Value::Null),
                )
                .with_shared(Value::Object(run.shared_data.clone()));

            let value = self
                .registry
                .invoke_with_timeout(tool_name, args, self.config.tool_timeout())
                .await?;

            if let Some(state) = value.get("state") {
                run.tools_state.insert(tool_name.clone(), state.clone());
            }
            results.insert(tool_name.clone(), value);
        }
        Ok(results)
    }

    /// Progress reports are an observable side effect, not a step outcome:
    /// a full supervisor mailbox drops the report with a warning.
    fn publish_progress(&self, step: &str, results: Map<String, Value>) {
        let message = AgentMessage::progress(
            self.name.clone(),
            SUPERVISOR_MAILBOX,
            json!({
                "step": step,
                "status": "completed",
                "results": Value::Object(results),
            }),
        );
        if let Err(err) = self.queue.publish(message) {
            warn!(agent = %self.name, step = %step, error = %err, "progress report dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::AgentSpec;

    fn make_agent(config: SystemConfig) -> Agent {
        Agent::new(
            AgentSpec::new("solo").with_steps(vec!["work".into()]),
            "user-1",
            Arc::new(config),
            Arc::new(ToolRegistry::new()),
            StateManager::new(),
            MessageQueue::new(),
        )
    }

    #[tokio::test]
    async fn new_agent_is_initialized() {
        let agent = make_agent(SystemConfig::default());
        assert_eq!(agent.status(), AgentStatus::Initialized);
        assert!(agent.current_step().is_none());
        assert_eq!(agent.summary()["name"], "solo");
    }

    #[tokio::test]
    async fn toolless_agent_completes() {
        let mut agent = make_agent(SystemConfig::default());
        let status = agent.execute().await.unwrap();
        assert_eq!(status, AgentStatus::Completed);
        assert_eq!(agent.current_step(), Some("complete"));
    }

    #[tokio::test]
    async fn stop_before_execute_halts_at_first_boundary() {
        let mut agent = make_agent(SystemConfig::default());
        agent.stop_handle().stop();
        let status = agent.execute().await.unwrap();
        assert_eq!(status, AgentStatus::Stopped);
        assert!(agent.current_step().is_none());
    }

    #[tokio::test]
    async fn stop_message_halts_at_first_boundary() {
        let queue = MessageQueue::new();
        let mut agent = Agent::new(
            AgentSpec::new("listener"),
            "user-1",
            Arc::new(SystemConfig::default()),
            Arc::new(ToolRegistry::new()),
            StateManager::new(),
            queue.clone(),
        );
        queue.publish(AgentMessage::stop("external", "listener")).unwrap();

        let status = agent.execute().await.unwrap();
        assert_eq!(status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn recv_timeout_is_soft_by_default() {
        let mut agent = make_agent(SystemConfig::default());
        let got = agent.recv_timeout(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn recv_timeout_is_hard_when_configured() {
        let cfg = SystemConfig {
            continue_on_receive_timeout: false,
            ..Default::default()
        };
        let mut agent = make_agent(cfg);
        let err = agent
            .recv_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Bus(BusError::Timeout { .. })));
    }

    #[tokio::test]
    async fn recv_returns_buffered_data_message() {
        let queue = MessageQueue::new();
        let mut agent = Agent::new(
            AgentSpec::new("rx"),
            "user-1",
            Arc::new(SystemConfig::default()),
            Arc::new(ToolRegistry::new()),
            StateManager::new(),
            queue.clone(),
        );
        queue
            .publish(AgentMessage::data("peer", "rx", json!("hello")))
            .unwrap();

        let got = agent.recv_timeout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(got.unwrap().payload, json!("hello"));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let mut agent = make_agent(SystemConfig::default());
        let err = agent.set_status(AgentStatus::Waiting).unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidTransition {
                from: AgentStatus::Initialized,
                to: AgentStatus::Waiting,
            }
        ));
    }
}
