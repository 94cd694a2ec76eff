use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::tool::{Tool, ToolArgs};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: `{0}`")]
    NotFound(String),

    #[error("duplicate tool name: `{0}`")]
    Duplicate(String),

    #[error("tool `{name}` execution failed: {cause}")]
    Execution { name: String, cause: anyhow::Error },
}

impl ToolError {
    pub fn execution(name: impl Into<String>, cause: anyhow::Error) -> Self {
        ToolError::Execution {
            name: name.into(),
            cause,
        }
    }

    /// The underlying failure for an `Execution` error, if that's what this is.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            ToolError::Execution { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

struct MetricsInner {
    invocations: AtomicU64,
    failures: AtomicU64,
    registered_at: DateTime<Utc>,
    last_invoked_ms: AtomicI64, // 0 = never
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            registered_at: Utc::now(),
            last_invoked_ms: AtomicI64::new(0),
        }
    }

    fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.last_invoked_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of a tool's invocation counters.
#[derive(Debug, Clone)]
pub struct ToolMetrics {
    pub invocations: u64,
    pub failures: u64,
    pub registered_at: DateTime<Utc>,
    pub last_invoked: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

struct Registered {
    tool: Arc<dyn Tool>,
    metrics: Arc<MetricsInner>,
}

/// Maps tool names to invocable capabilities.
///
/// Internally synchronized: registration through a shared reference is
/// immediately visible to every agent holding the same registry. Duplicate
/// names are rejected rather than overwritten.
pub struct ToolRegistry {
    tools: DashMap<String, Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Register a tool under its own name. Fails with
    /// [`ToolError::Duplicate`] if the name is taken.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        match self.tools.entry(name.clone()) {
            Entry::Occupied(_) => Err(ToolError::Duplicate(name)),
            Entry::Vacant(slot) => {
                slot.insert(Registered {
                    tool,
                    metrics: Arc::new(MetricsInner::new()),
                });
                debug!(name = %name, "registered tool");
                Ok(())
            }
        }
    }

    /// Remove a tool by name, returning it if present.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name).map(|(_, reg)| reg.tool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve `name` and call the tool, propagating its output or wrapping
    /// its failure with the original cause attached.
    pub async fn invoke(&self, name: &str, args: ToolArgs) -> Result<Value> {
        let (tool, metrics) = {
            let entry = self
                .tools
                .get(name)
                .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
            (entry.tool.clone(), entry.metrics.clone())
        };

        metrics.record_invocation();
        match tool.invoke(args).await {
            Ok(value) => Ok(value),
            Err(cause) => {
                metrics.record_failure();
                warn!(tool = %name, error = %cause, "tool invocation failed");
                Err(ToolError::execution(name, cause))
            }
        }
    }

    /// [`invoke`](Self::invoke) bounded by `timeout`; an overrun counts as a
    /// failed execution of the tool.
    pub async fn invoke_with_timeout(
        &self,
        name: &str,
        args: ToolArgs,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, self.invoke(name, args)).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(entry) = self.tools.get(name) {
                    entry.metrics.record_failure();
                }
                Err(ToolError::execution(
                    name,
                    anyhow::anyhow!("timed out after {}s", timeout.as_secs_f64()),
                ))
            }
        }
    }

    /// Counters for a registered tool.
    pub fn metrics(&self, name: &str) -> Option<ToolMetrics> {
        self.tools.get(name).map(|entry| {
            let m = &entry.metrics;
            let last_ms = m.last_invoked_ms.load(Ordering::Relaxed);
            ToolMetrics {
                invocations: m.invocations.load(Ordering::Relaxed),
                failures: m.failures.load(Ordering::Relaxed),
                registered_at: m.registered_at,
                last_invoked: (last_ms != 0)
                    .then(|| Utc.timestamp_millis_opt(last_ms).single())
                    .flatten(),
            }
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "returns its step name"
        }

        async fn invoke(&self, args: ToolArgs) -> anyhow::Result<Value> {
            Ok(json!({ "echo": args.step }))
        }
    }

    struct FailingTool;

    #[async_trait::async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }

        async fn invoke(&self, _args: ToolArgs) -> anyhow::Result<Value> {
            anyhow::bail!("backend unavailable")
        }
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, _args: ToolArgs) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn register_and_invoke() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();

        let out = reg
            .invoke("echo", ToolArgs::new("fetch", "user-1"))
            .await
            .unwrap();
        assert_eq!(out, json!({ "echo": "fetch" }));
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        let err = reg.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::Duplicate(name) if name == "echo"));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();

        let err = reg
            .invoke("missing", ToolArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));
        // The unrelated tool was never run.
        assert_eq!(reg.metrics("echo").unwrap().invocations, 0);
    }

    #[tokio::test]
    async fn failure_wraps_original_cause() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(FailingTool)).unwrap();

        let err = reg.invoke("broken", ToolArgs::default()).await.unwrap_err();
        match &err {
            ToolError::Execution { name, cause } => {
                assert_eq!(name, "broken");
                assert!(cause.to_string().contains("backend unavailable"));
            }
            other => panic!("expected Execution, got {other:?}"),
        }
        assert!(err.cause().is_some());
    }

    #[tokio::test]
    async fn metrics_track_invocations_and_failures() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        reg.register(Arc::new(FailingTool)).unwrap();

        reg.invoke("echo", ToolArgs::default()).await.unwrap();
        reg.invoke("echo", ToolArgs::default()).await.unwrap();
        let _ = reg.invoke("broken", ToolArgs::default()).await;

        let echo = reg.metrics("echo").unwrap();
        assert_eq!(echo.invocations, 2);
        assert_eq!(echo.failures, 0);
        assert!(echo.last_invoked.is_some());

        let broken = reg.metrics("broken").unwrap();
        assert_eq!(broken.invocations, 1);
        assert_eq!(broken.failures, 1);
    }

    #[tokio::test]
    async fn invoke_with_timeout_bounds_slow_tools() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(SlowTool)).unwrap();

        let err = reg
            .invoke_with_timeout("slow", ToolArgs::default(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution { .. }));
        assert_eq!(reg.metrics("slow").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn late_registration_is_visible_through_shared_handle() {
        let reg = Arc::new(ToolRegistry::new());
        let reader = reg.clone();
        assert!(!reader.contains("echo"));
        reg.register(Arc::new(EchoTool)).unwrap();
        assert!(reader.contains("echo"));
    }

    #[tokio::test]
    async fn unregister_then_invoke_is_not_found() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool)).unwrap();
        assert!(reg.unregister("echo").is_some());
        let err = reg.invoke("echo", ToolArgs::default()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
