use serde::{Deserialize, Serialize};

use weave_tools::ToolRegistry;

use crate::agent::{AgentError, Result};

fn default_initial_step() -> String {
    "start".to_string()
}

fn default_final_step() -> String {
    "complete".to_string()
}

// ---------------------------------------------------------------------------
// AgentSpec
// ---------------------------------------------------------------------------

/// Declarative definition of one agent: its identity, tool set, and
/// step sequence. The initial and final steps default to `start` and
/// `complete` when a rules document omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_initial_step")]
    pub initial_step: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default = "default_final_step")]
    pub final_step: String,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tools: Vec::new(),
            initial_step: default_initial_step(),
            steps: Vec::new(),
            final_step: default_final_step(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }
}

// ---------------------------------------------------------------------------
// RulesDocument
// ---------------------------------------------------------------------------

/// Top-level rules document describing a whole agent system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesDocument {
    #[serde(default)]
    pub problem: String,
    pub agents: Vec<AgentSpec>,
}

impl RulesDocument {
    pub fn parse(raw: &str) -> Result<Self> {
        let doc: Self = serde_json::from_str(raw)
            .map_err(|e| AgentError::InvalidSpec(format!("malformed rules document: {e}")))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Structural checks that need no registry: at least one agent, each
    /// named, names unique.
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(AgentError::InvalidSpec(
                "rules document defines no agents".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.agents {
            if spec.name.trim().is_empty() {
                return Err(AgentError::InvalidSpec(
                    "agent with empty name".to_string(),
                ));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(AgentError::InvalidSpec(format!(
                    "duplicate agent name `{}`",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Check every referenced tool against the registry. Kept separate
    /// from `validate` so documents can be parsed before tools register.
    pub fn validate_tools(&self, registry: &ToolRegistry) -> Result<()> {
        for spec in &self.agents {
            for tool in &spec.tools {
                if !registry.contains(tool) {
                    return Err(AgentError::InvalidSpec(format!(
                        "agent `{}` references unknown tool `{tool}`",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
