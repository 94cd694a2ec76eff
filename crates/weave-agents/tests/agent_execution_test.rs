use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use weave_agents::{Agent, AgentError, AgentSpec, AgentStatus, StopHandle, SUPERVISOR_MAILBOX};
use weave_bus::MessageQueue;
use weave_core::config::SystemConfig;
use weave_core::state::StateManager;
use weave_tools::{Tool, ToolArgs, ToolRegistry};

struct CountingTool {
    name: String,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, args: ToolArgs) -> anyhow::Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "step": args.step, "call": n }))
    }
}

/// Fails its first `fail_times` invocations, succeeds afterwards.
struct FlakyTool {
    calls: Arc<AtomicU32>,
    fail_times: u32,
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn invoke(&self, _args: ToolArgs) -> anyhow::Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_times {
            anyhow::bail!("transient failure on call {n}");
        }
        Ok(json!({ "call": n }))
    }
}

struct FailingTool {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "broken"
    }

    async fn invoke(&self, _args: ToolArgs) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("permanent failure")
    }
}

/// Carries a counter forward through the `state` convention.
struct AccumulatingTool;

#[async_trait]
impl Tool for AccumulatingTool {
    fn name(&self) -> &str {
        "accum"
    }

    async fn invoke(&self, args: ToolArgs) -> anyhow::Result<Value> {
        let prev = args.tool_state.as_i64().unwrap_or(0);
        Ok(json!({ "state": prev + 1 }))
    }
}

/// Requests a stop on its first invocation.
struct SelfStoppingTool {
    handle: StopHandle,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for SelfStoppingTool {
    fn name(&self) -> &str {
        "brake"
    }

    async fn invoke(&self, _args: ToolArgs) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.handle.stop();
        Ok(json!(null))
    }
}

/// Counts invocations per step and fails the first `fail_times` calls made
/// during `flaky_step`.
struct StepFlakyTool {
    flaky_step: String,
    fail_times: u32,
    per_step: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl Tool for StepFlakyTool {
    fn name(&self) -> &str {
        "pipeline"
    }

    async fn invoke(&self, args: ToolArgs) -> anyhow::Result<Value> {
        let mut counts = self.per_step.lock().unwrap();
        let n = counts.entry(args.step.clone()).or_insert(0);
        *n += 1;
        if args.step == self.flaky_step && *n <= self.fail_times {
            anyhow::bail!("transient failure in `{}` on attempt {n}", args.step);
        }
        Ok(json!({ "attempt": *n }))
    }
}

struct Harness {
    registry: Arc<ToolRegistry>,
    state: StateManager,
    queue: MessageQueue,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: Arc::new(ToolRegistry::new()),
            state: StateManager::new(),
            queue: MessageQueue::new(),
        }
    }

    fn agent(&self, spec: AgentSpec, config: SystemConfig) -> Agent {
        Agent::new(
            spec,
            "user-1",
            Arc::new(config),
            Arc::clone(&self.registry),
            self.state.clone(),
            self.queue.clone(),
        )
    }
}

#[tokio::test]
async fn flaky_step_recovers_within_retry_budget() {
    let h = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    h.registry
        .register(Arc::new(FlakyTool {
            calls: Arc::clone(&calls),
            fail_times: 2,
        }))
        .unwrap();

    let config = SystemConfig {
        max_retries: 2,
        continue_on_error: false,
        ..Default::default()
    };
    let spec = AgentSpec::new("worker").with_tools(vec!["flaky".into()]);
    let mut agent = h.agent(spec, config);

    let status = agent.execute().await.unwrap();
    assert_eq!(status, AgentStatus::Completed);
    // start: two failed attempts then one success; complete: one success.
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let run = h.state.get_state("worker", "user-1").await.unwrap().unwrap();
    assert_eq!(run.status, "completed");
    assert!(run.step_results.contains_key("start"));
    assert!(run.step_results.contains_key("complete"));
}

#[tokio::test]
async fn only_the_failing_step_is_retried() {
    let h = Harness::new();
    let tool = Arc::new(StepFlakyTool {
        flaky_step: "process".into(),
        fail_times: 2,
        per_step: Mutex::new(HashMap::new()),
    });
    h.registry.register(Arc::clone(&tool) as Arc<dyn Tool>).unwrap();

    let config = SystemConfig {
        max_retries: 2,
        continue_on_error: false,
        ..Default::default()
    };
    let spec = AgentSpec::new("pipeline")
        .with_tools(vec!["pipeline".into()])
        .with_steps(vec!["fetch".into(), "process".into(), "respond".into()]);
    let mut agent = h.agent(spec, config);

    let status = agent.execute().await.unwrap();
    assert_eq!(status, AgentStatus::Completed);

    let counts = tool.per_step.lock().unwrap();
    assert_eq!(counts["start"], 1);
    assert_eq!(counts["fetch"], 1);
    assert_eq!(counts["process"], 3);
    assert_eq!(counts["respond"], 1);
    assert_eq!(counts["complete"], 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_agent() {
    let h = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    h.registry
        .register(Arc::new(FailingTool {
            calls: Arc::clone(&calls),
        }))
        .unwrap();

    let config = SystemConfig {
        max_retries: 1,
        continue_on_error: false,
        ..Default::default()
    };
    let spec = AgentSpec::new("doomed").with_tools(vec!["broken".into()]);
    let mut agent = h.agent(spec, config);

    let err = agent.execute().await.unwrap_err();
    match err {
        AgentError::StepFailed { step, attempts, .. } => {
            assert_eq!(step, "start");
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(agent.status(), AgentStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let run = h.state.get_state("doomed", "user-1").await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert!(run.shared_data.contains_key("last_error"));
}

#[tokio::test]
async fn continue_on_error_advances_past_failed_steps() {
    let h = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    h.registry
        .register(Arc::new(FailingTool {
            calls: Arc::clone(&calls),
        }))
        .unwrap();

    let config = SystemConfig {
        max_retries: 0,
        continue_on_error: true,
        ..Default::default()
    };
    let spec = AgentSpec::new("stoic")
        .with_tools(vec!["broken".into()])
        .with_steps(vec!["mid".into()]);
    let mut agent = h.agent(spec, config);

    let status = agent.execute().await.unwrap();
    assert_eq!(status, AgentStatus::Completed);

    let run = h.state.get_state("stoic", "user-1").await.unwrap().unwrap();
    assert_eq!(run.status, "completed");
    assert!(run.step_results.is_empty());
    assert!(run.shared_data.contains_key("last_error"));
}

#[tokio::test]
async fn progress_reports_arrive_in_step_order() {
    let h = Harness::new();
    h.queue.register(SUPERVISOR_MAILBOX);
    let calls = Arc::new(AtomicU32::new(0));
    h.registry
        .register(Arc::new(CountingTool {
            name: "echo".into(),
            calls,
        }))
        .unwrap();

    let spec = AgentSpec::new("reporter")
        .with_tools(vec!["echo".into()])
        .with_steps(vec!["mid".into()]);
    let mut agent = h.agent(spec, SystemConfig::default());
    agent.execute().await.unwrap();

    let reports = h.queue.drain(SUPERVISOR_MAILBOX);
    let steps: Vec<&str> = reports
        .iter()
        .map(|m| m.payload["step"].as_str().unwrap())
        .collect();
    assert_eq!(steps, vec!["start", "mid", "complete"]);
    assert!(reports.iter().all(|m| m.sender == "reporter"));
}

#[tokio::test]
async fn tool_state_threads_across_steps() {
    let h = Harness::new();
    h.registry.register(Arc::new(AccumulatingTool)).unwrap();

    let spec = AgentSpec::new("counter")
        .with_tools(vec!["accum".into()])
        .with_steps(vec!["mid".into()]);
    let mut agent = h.agent(spec, SystemConfig::default());
    agent.execute().await.unwrap();

    let run = h.state.get_state("counter", "user-1").await.unwrap().unwrap();
    assert_eq!(run.tools_state["accum"], json!(3));
}

#[tokio::test]
async fn stop_request_takes_effect_at_next_boundary() {
    let h = Harness::new();
    let spec = AgentSpec::new("braked")
        .with_tools(vec!["brake".into()])
        .with_steps(vec!["mid".into()]);
    let mut agent = h.agent(spec, SystemConfig::default());

    let calls = Arc::new(AtomicU32::new(0));
    h.registry
        .register(Arc::new(SelfStoppingTool {
            handle: agent.stop_handle(),
            calls: Arc::clone(&calls),
        }))
        .unwrap();

    let status = agent.execute().await.unwrap();
    assert_eq!(status, AgentStatus::Stopped);
    // The step in flight finishes; the walk halts before `mid`.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(agent.current_step(), Some("start"));

    let run = h.state.get_state("braked", "user-1").await.unwrap().unwrap();
    assert_eq!(run.status, "stopped");
}
