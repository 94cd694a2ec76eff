use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ToolArgs
// ---------------------------------------------------------------------------

/// Structured arguments handed to a tool for one invocation.
///
/// Mirrors what an agent knows at a step boundary: which step is running,
/// who owns the run, the results of prior steps, the tool's own opaque
/// state from earlier invocations, and the run's shared data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolArgs {
    /// Step currently being executed.
    pub step: String,
    /// Owner (user) identifier of the calling agent.
    pub owner: String,
    /// Results of previously completed steps, keyed by step name.
    pub input: Value,
    /// This tool's state from its previous invocation, if any.
    pub tool_state: Value,
    /// Data shared across the agent's whole run.
    pub shared: Value,
}

impl ToolArgs {
    pub fn new(step: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            owner: owner.into(),
            input: Value::Null,
            tool_state: Value::Null,
            shared: Value::Null,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_tool_state(mut self, tool_state: Value) -> Self {
        self.tool_state = tool_state;
        self
    }

    pub fn with_shared(mut self, shared: Value) -> Self {
        self.shared = shared;
        self
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A named, invocable capability resolved through the [`ToolRegistry`].
///
/// Concrete tools are the seam where external collaborators (document
/// processing, embedding lookup, model calls) plug into the core. A tool
/// returns a JSON value on success; an `Ok` value containing a `"state"`
/// field has that field persisted as the tool's state for its next call.
///
/// [`ToolRegistry`]: crate::registry::ToolRegistry
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn invoke(&self, args: ToolArgs) -> anyhow::Result<Value>;
}
