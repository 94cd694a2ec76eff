use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use weave_bus::{AgentMessage, MessageQueue};
use weave_core::config::SystemConfig;
use weave_core::state::StateManager;
use weave_tools::ToolRegistry;

use crate::agent::{Agent, AgentError, Result, StopHandle, SUPERVISOR_MAILBOX};
use crate::spec::{AgentSpec, RulesDocument};
use crate::status::AgentStatus;

// ---------------------------------------------------------------------------
// SystemReport
// ---------------------------------------------------------------------------

/// Outcome of one system run: the terminal status of every agent that
/// finished, the errors of those that failed, and the names of any that
/// were still running when the deadline elapsed.
#[derive(Debug, Default)]
pub struct SystemReport {
    pub statuses: BTreeMap<String, AgentStatus>,
    pub errors: BTreeMap<String, String>,
    pub pending: Vec<String>,
    pub progress: Vec<AgentMessage>,
    pub elapsed_ms: u64,
}

impl SystemReport {
    pub fn all_completed(&self) -> bool {
        self.pending.is_empty()
            && self
                .statuses
                .values()
                .all(|s| *s == AgentStatus::Completed)
    }

    /// Error out when the run deadline left agents unfinished.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        Err(AgentError::SystemTimeout {
            waited_ms: self.elapsed_ms,
            pending: self.pending.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// AgentSystem
// ---------------------------------------------------------------------------

/// Shared infrastructure for a fleet of agents plus the run loop that
/// drives them concurrently to terminal statuses.
#[derive(Clone)]
pub struct AgentSystem {
    config: Arc<SystemConfig>,
    registry: Arc<ToolRegistry>,
    state: StateManager,
    queue: MessageQueue,
}

impl AgentSystem {
    pub fn builder() -> AgentSystemBuilder {
        AgentSystemBuilder::default()
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Instantiate one agent wired to this system's shared collaborators.
    pub fn build_agent(&self, spec: AgentSpec, owner: impl Into<String>) -> Agent {
        Agent::new(
            spec,
            owner,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            self.state.clone(),
            self.queue.clone(),
        )
    }

    /// Run every agent in the document concurrently and wait for the fleet
    /// to settle, bounded by `run_deadline_secs` when set.
    ///
    /// One agent failing never takes down its siblings unless
    /// `abort_on_failure` is set, in which case the remaining agents are
    /// asked to stop at their next step boundary. On deadline the
    /// unfinished tasks are detached, not killed; the report names them.
    pub async fn run(&self, doc: &RulesDocument, owner: &str) -> Result<SystemReport> {
        doc.validate()?;
        doc.validate_tools(&self.registry)?;
        self.queue.register(SUPERVISOR_MAILBOX);

        let started = Instant::now();
        let mut tasks: JoinSet<(String, Result<AgentStatus>)> = JoinSet::new();
        let mut stop_handles: HashMap<String, StopHandle> = HashMap::new();
        let mut pending: HashSet<String> = HashSet::new();

        for spec in &doc.agents {
            let mut agent = self.build_agent(spec.clone(), owner);
            let name = agent.name().to_string();
            stop_handles.insert(name.clone(), agent.stop_handle());
            pending.insert(name.clone());
            tasks.spawn(async move {
                let outcome = agent.execute().await;
                (name, outcome)
            });
        }
        info!(agents = tasks.len(), owner = %owner, "agent system starting");

        let mut report = SystemReport::default();
        loop {
            let joined = match self.config.run_deadline() {
                Some(deadline) => {
                    let remaining = deadline.saturating_sub(started.elapsed());
                    match tokio::time::timeout(remaining, tasks.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            warn!(
                                pending = ?pending,
                                "run deadline elapsed, detaching unfinished agents"
                            );
                            tasks.detach_all();
                            break;
                        }
                    }
                }
                None => tasks.join_next().await,
            };

            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((name, Ok(status))) => {
                    pending.remove(&name);
                    report.statuses.insert(name, status);
                }
                Ok((name, Err(err))) => {
                    error!(agent = %name, error = %err, "agent failed");
                    pending.remove(&name);
                    report.errors.insert(name.clone(), err.to_string());
                    report.statuses.insert(name, AgentStatus::Failed);
                    if self.config.abort_on_failure {
                        for (peer, handle) in &stop_handles {
                            if pending.contains(peer) {
                                handle.stop();
                            }
                        }
                    }
                }
                Err(join_err) => {
                    error!(error = %join_err, "agent task aborted");
                }
            }
        }

        report.pending = pending.into_iter().collect();
        report.pending.sort();
        report.progress = self.queue.drain(SUPERVISOR_MAILBOX);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            completed = report.statuses.len(),
            failed = report.errors.len(),
            pending = report.pending.len(),
            elapsed_ms = report.elapsed_ms,
            "agent system finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// AgentSystemBuilder
// ---------------------------------------------------------------------------

/// Builder over the system's collaborators; anything not supplied falls
/// back to a fresh default.
#[derive(Default)]
pub struct AgentSystemBuilder {
    config: Option<SystemConfig>,
    registry: Option<Arc<ToolRegistry>>,
    state: Option<StateManager>,
    queue: Option<MessageQueue>,
}

impl AgentSystemBuilder {
    pub fn config(mut self, config: SystemConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn state(mut self, state: StateManager) -> Self {
        self.state = Some(state);
        self
    }

    pub fn queue(mut self, queue: MessageQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn build(self) -> Result<AgentSystem> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|e| AgentError::InvalidSpec(e.to_string()))?;
        let queue = self.queue.unwrap_or_else(|| match config.queue_capacity {
            Some(n) => MessageQueue::bounded(n),
            None => MessageQueue::new(),
        });
        Ok(AgentSystem {
            config: Arc::new(config),
            registry: self.registry.unwrap_or_else(|| Arc::new(ToolRegistry::new())),
            state: self.state.unwrap_or_default(),
            queue,
        })
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Build a standalone agent against fresh default collaborators.
pub fn build_agent(spec: AgentSpec, owner: impl Into<String>) -> Result<Agent> {
    let system = AgentSystem::builder().build()?;
    Ok(system.build_agent(spec, owner))
}

/// Parse a rules document and drive the whole system it describes.
pub async fn run_agent_system(
    rules: &str,
    owner: &str,
    registry: Arc<ToolRegistry>,
    config: SystemConfig,
) -> Result<SystemReport> {
    let doc = RulesDocument::parse(rules)?;
    let system = AgentSystem::builder()
        .config(config)
        .registry(registry)
        .build()?;
    system.run(&doc, owner).await
}
