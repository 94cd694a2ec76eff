use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The backing store failed to persist or load an entry.
    #[error("state persistence error: {0}")]
    Persistence(String),
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// StateStore trait
// ---------------------------------------------------------------------------

/// Storage seam behind the [`StateManager`].
///
/// The default implementation is in-memory; a durable key-value backend can
/// be plugged in here without the orchestration core knowing its format.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, owner: &str, key: &str) -> Result<Option<Value>>;
    async fn store(&self, owner: &str, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, owner: &str, key: &str) -> Result<Option<Value>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store over a concurrent map. Individual get/set operations are
/// atomic; writes are last-write-wins per key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, owner: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .entries
            .get(&(owner.to_string(), key.to_string()))
            .map(|v| v.clone()))
    }

    async fn store(&self, owner: &str, key: &str, value: Value) -> Result<()> {
        self.entries
            .insert((owner.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn remove(&self, owner: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .entries
            .remove(&(owner.to_string(), key.to_string()))
            .map(|(_, v)| v))
    }
}

// ---------------------------------------------------------------------------
// AgentRunState
// ---------------------------------------------------------------------------

/// Snapshot of a single agent's run, persisted through the state manager
/// under a reserved key so it survives across steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunState {
    pub agent_id: String,
    pub owner: String,
    pub current_step: Option<String>,
    /// Serialized form of the agent's status enum.
    pub status: String,
    /// Per-tool opaque state, updated from tool results.
    pub tools_state: Map<String, Value>,
    /// Data shared across the agent's steps (e.g. last error).
    pub shared_data: Map<String, Value>,
    /// Results keyed by step name.
    pub step_results: Map<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl AgentRunState {
    pub fn new(agent_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            owner: owner.into(),
            current_step: None,
            status: "initialized".to_string(),
            tools_state: Map::new(),
            shared_data: Map::new(),
            step_results: Map::new(),
            last_updated: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Keyed state shared by all agents in a system: `(owner, key) -> Value`.
///
/// Reads never block writers; callers own any single-writer-per-key
/// discipline beyond the atomicity of individual get/set operations.
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn StateStore>,
}

impl StateManager {
    /// Create a state manager backed by an in-memory store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Create a state manager over an external store.
    pub fn with_store(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, owner: &str, key: &str) -> Result<Option<Value>> {
        self.store.load(owner, key).await
    }

    /// Return the stored value, or `default` when absent. Storage failures
    /// are logged and fold into the default: a read never fails the caller.
    pub async fn get_or(&self, owner: &str, key: &str, default: Value) -> Value {
        match self.store.load(owner, key).await {
            Ok(Some(v)) => v,
            Ok(None) => default,
            Err(e) => {
                warn!(owner = %owner, key = %key, error = %e, "state read failed, using default");
                default
            }
        }
    }

    /// Atomic last-write-wins upsert.
    pub async fn set(&self, owner: &str, key: &str, value: Value) -> Result<()> {
        self.store.store(owner, key, value).await
    }

    pub async fn remove(&self, owner: &str, key: &str) -> Result<Option<Value>> {
        self.store.remove(owner, key).await
    }

    // -- Run-record helpers --

    fn run_key(agent_id: &str) -> String {
        format!("run_state:{agent_id}")
    }

    /// Create and persist a fresh run record for an agent.
    pub async fn create_state(&self, agent_id: &str, owner: &str) -> Result<AgentRunState> {
        let state = AgentRunState::new(agent_id, owner);
        self.persist_state(&state).await?;
        Ok(state)
    }

    /// Persist a run record, stamping `last_updated`.
    pub async fn update_state(&self, state: &mut AgentRunState) -> Result<()> {
        state.last_updated = Utc::now();
        self.persist_state(state).await
    }

    async fn persist_state(&self, state: &AgentRunState) -> Result<()> {
        let value = serde_json::to_value(state)?;
        self.store
            .store(&state.owner, &Self::run_key(&state.agent_id), value)
            .await
    }

    pub async fn get_state(&self, agent_id: &str, owner: &str) -> Result<Option<AgentRunState>> {
        match self.store.load(owner, &Self::run_key(agent_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_state(&self, agent_id: &str, owner: &str) -> Result<()> {
        self.store.remove(owner, &Self::run_key(agent_id)).await?;
        Ok(())
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
