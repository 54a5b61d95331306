//! End-to-end tests for the Routewise orchestrator.
//!
//! These wire the real stores, policy engine, reflection and learning
//! modules together and drive requests through the full state machine,
//! using the built-in capabilities or scripted stubs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use routewise_agent::{AgentState, CancelHandle, Orchestrator, OrchestratorSettings};
use routewise_config::BusyPolicy;
use routewise_core::capability::{Capability, CapabilityOutput, CapabilityRegistry, ReferenceKind};
use routewise_core::error::ErrorKind;
use routewise_core::request::ExecutionRequest;
use routewise_core::store::{LogStore, SessionStore};
use routewise_memory::{
    ConversationMemory, EpisodicStore, FileSessionStore, InMemoryLogStore, InMemorySessionStore,
    JsonlLogStore,
};
use routewise_policy::{PolicyAction, PolicyEngine, PolicySet, VIOLATION_STREAM};
use routewise_reflection::{LearningModule, ReflectionKind, ReflectionModule};
use routewise_tools::default_registry;

// ── Scripted capability ──────────────────────────────────────────────────

/// Returns a fixed output after an optional delay, counting calls.
struct Stub {
    name: &'static str,
    description: &'static str,
    output: &'static str,
    delay: Duration,
    consumes: Option<ReferenceKind>,
    calls: AtomicUsize,
}

impl Stub {
    fn new(name: &'static str, description: &'static str, output: &'static str) -> Self {
        Self {
            name,
            description,
            output,
            delay: Duration::ZERO,
            consumes: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn consuming_urls(mut self) -> Self {
        self.consumes = Some(ReferenceKind::Url);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for Stub {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn consumes(&self) -> Option<ReferenceKind> {
        self.consumes
    }

    async fn execute(&self, _parameters: serde_json::Value) -> CapabilityOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        CapabilityOutput::ok(self.output)
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        capability_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_secs(10),
        retry_backoff: Duration::from_millis(5),
        throttle_delay: Duration::from_millis(10),
        reflection_async: false,
        ..OrchestratorSettings::default()
    }
}

fn registry_of(capabilities: Vec<Arc<dyn Capability>>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for capability in capabilities {
        registry.register(capability).unwrap();
    }
    registry
}

struct Stores {
    session: Arc<dyn SessionStore>,
    logs: Arc<dyn LogStore>,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            session: Arc::new(InMemorySessionStore::new()),
            logs: Arc::new(InMemoryLogStore::new()),
        }
    }

    fn on_disk(dir: &std::path::Path) -> Self {
        Self {
            session: Arc::new(FileSessionStore::new(dir.join("state"))),
            logs: Arc::new(JsonlLogStore::new(dir.join("logs"))),
        }
    }
}

async fn build(
    registry: CapabilityRegistry,
    policies: PolicySet,
    settings: OrchestratorSettings,
    stores: &Stores,
    window: (usize, usize),
) -> Orchestrator {
    let registry = Arc::new(registry);
    let summarizer = registry.capability("summarizer").ok();

    let mut memory = ConversationMemory::new(window.0, window.1).with_store(stores.session.clone());
    if let Some(summarizer) = &summarizer {
        memory = memory.with_summarizer(summarizer.clone());
    }
    let episodic = EpisodicStore::open(stores.session.clone(), summarizer).await.unwrap();
    let policy = PolicyEngine::new(policies).unwrap().with_log_store(stores.logs.clone());
    let learning = LearningModule::spawn(Some(stores.session.clone())).await;
    let reflection = ReflectionModule::new(learning).with_log_store(stores.logs.clone());

    Orchestrator::new(
        registry,
        Arc::new(memory),
        Arc::new(episodic),
        Arc::new(policy),
        Arc::new(reflection),
    )
    .with_settings(settings)
}

async fn with_tools(policies: PolicySet, settings: OrchestratorSettings) -> Orchestrator {
    build(default_registry(None).unwrap(), policies, settings, &Stores::in_memory(), (10, 5)).await
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_third_request_in_a_minute_is_throttled() {
    let policies = PolicySet::from_toml(
        r#"
[[policies]]
id = "two-per-minute"
type = "rate_limit"
max_requests_per_minute = 2
message = "Slow down"
"#,
    )
    .unwrap();
    let answer = Arc::new(Stub::new("answer", "Answers questions", "ok"));
    let orch = build(
        registry_of(vec![answer.clone() as Arc<dyn Capability>]),
        policies,
        settings(),
        &Stores::in_memory(),
        (10, 5),
    )
    .await;

    assert!(orch.handle(ExecutionRequest::new("s", "first question")).await.is_ok());
    assert!(orch.handle(ExecutionRequest::new("s", "second question")).await.is_ok());

    let third = orch
        .handle(ExecutionRequest::new("s", "third question"))
        .await
        .unwrap_err();
    assert_eq!(third.kind, ErrorKind::Throttled);
    assert!(third.retryable);
    assert_eq!(answer.calls(), 2);

    let decision = orch
        .policy()
        .evaluate(&ExecutionRequest::new("s", "fourth question"), Some("answer"))
        .await;
    assert_eq!(decision.action, PolicyAction::Throttle);
    assert!(!decision.allowed);

    // Other sessions have their own window.
    assert!(orch.handle(ExecutionRequest::new("other", "hello")).await.is_ok());
}

#[tokio::test]
async fn scenario_b_calculation_routes_to_calculator() {
    let orch = with_tools(PolicySet::default(), settings()).await;
    let outcome = orch
        .handle(ExecutionRequest::new("s", "Calculate 12*7"))
        .await
        .unwrap();

    assert!(outcome.answer.contains("84"), "answer: {}", outcome.answer);
    assert_eq!(outcome.capabilities, vec!["calculator"]);
    assert_eq!(outcome.trace.last(), Some(AgentState::Done));
    assert!(!outcome.partial);
}

#[tokio::test]
async fn scenario_c_capability_timeout_is_analysed() {
    let slow = Arc::new(Stub::new("slow_lookup", "Looks things up slowly", "late").slow(Duration::from_secs(5)));
    let orch = build(
        registry_of(vec![slow.clone() as Arc<dyn Capability>]),
        PolicySet::default(),
        OrchestratorSettings {
            capability_timeout: Duration::from_millis(50),
            ..settings()
        },
        &Stores::in_memory(),
        (10, 5),
    )
    .await;

    let failure = orch
        .handle(ExecutionRequest::new("s", "look this up"))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::CapabilityTimeout);
    assert!(failure.retryable);
    // One retry on the same capability, nothing else has a success record.
    assert_eq!(slow.calls(), 2);
    assert_eq!(failure.trace.count(AgentState::Execute), 2);

    let reflections = orch.session_reflections("s").await;
    assert!(reflections
        .iter()
        .any(|r| r.kind == ReflectionKind::ErrorAnalysis && r.subject == "slow_lookup"));

    let turns = orch.memory().turns("s").await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].error, Some(ErrorKind::CapabilityTimeout));
}

#[tokio::test]
async fn scenario_d_follow_up_resolves_previous_answer() {
    let orch = with_tools(
        PolicySet::default(),
        OrchestratorSettings {
            reflection_async: true,
            ..settings()
        },
    )
    .await;

    let first = orch
        .handle(ExecutionRequest::new("s", "Compute 10+5"))
        .await
        .unwrap();
    assert!(first.answer.contains("15"));

    let context = orch.memory().get_context("s").await;
    assert!(context.contains("15"), "context: {context}");

    let second = orch
        .handle(ExecutionRequest::new("s", "multiply that by 3"))
        .await
        .unwrap();
    assert!(second.answer.contains("45"), "answer: {}", second.answer);
    assert_eq!(second.capabilities, vec!["calculator"]);
}

#[tokio::test]
async fn scenario_e_deny_filter_beats_lower_priority_allow() {
    let policies = PolicySet::from_toml(
        r#"
[[policies]]
id = "allow-all"
type = "capability_gate"
capabilities = ["*"]
action = "allow"
priority = 1

[[policies]]
id = "no-destructive-sql"
type = "content_filter"
blocked_keywords = ["DROP TABLE"]
message = "Destructive SQL is not allowed"
priority = 50
"#,
    )
    .unwrap();
    let answer = Arc::new(Stub::new("answer", "Answers questions", "done"));
    let orch = build(
        registry_of(vec![answer.clone() as Arc<dyn Capability>]),
        policies,
        settings(),
        &Stores::in_memory(),
        (10, 5),
    )
    .await;

    let request = ExecutionRequest::new("s", "please run DROP TABLE users");
    let decision = orch.policy().evaluate(&request, Some("answer")).await;
    assert!(!decision.allowed);
    assert_eq!(decision.action, PolicyAction::Deny);

    let failure = orch.handle(request).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::PolicyViolation);
    assert_eq!(failure.message, "Destructive SQL is not allowed");
    assert!(!failure.retryable);
    assert_eq!(answer.calls(), 0);
    assert!(failure.trace.contains(AgentState::PolicyCheck));
    assert!(!failure.trace.contains(AgentState::Execute));

    let violations = orch.policy().violations(Some("s"));
    assert!(violations.iter().any(|v| v.rule_id == "no-destructive-sql"));

    // Harmless queries still pass through the allow rule.
    assert!(orch.handle(ExecutionRequest::new("s", "hello")).await.is_ok());
}

// ── Properties ───────────────────────────────────────────────────────────

#[tokio::test]
async fn denied_capability_never_executes() {
    let policies = PolicySet::from_toml(
        r#"
[[policies]]
id = "no-answers"
type = "capability_gate"
capabilities = ["answer"]
message = "Answers are switched off"
"#,
    )
    .unwrap();
    let answer = Arc::new(Stub::new("answer", "Answers questions", "done"));
    let orch = build(
        registry_of(vec![answer.clone() as Arc<dyn Capability>]),
        policies,
        settings(),
        &Stores::in_memory(),
        (10, 5),
    )
    .await;

    for query in ["what time is it", "tell me a joke", "Calculate 1+1"] {
        let failure = orch.handle(ExecutionRequest::new("s", query)).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::PolicyViolation);
        assert_eq!(failure.message, "Answers are switched off");
    }
    assert_eq!(answer.calls(), 0);
}

#[tokio::test]
async fn conversation_window_stays_bounded() {
    let answer = Arc::new(Stub::new("answer", "Answers questions", "noted"));
    let orch = build(
        registry_of(vec![answer as Arc<dyn Capability>]),
        PolicySet::default(),
        settings(),
        &Stores::in_memory(),
        (4, 2),
    )
    .await;

    for i in 0..3 {
        orch.handle(ExecutionRequest::new("s", format!("message number {i}")))
            .await
            .unwrap();
    }

    // Turn 5 overflowed the window of 4 and kept the 2 most recent.
    let stats = orch.memory().stats("s").await;
    assert_eq!(stats.total_turns, 6);
    assert_eq!(stats.summarizations, 1);
    assert_eq!(stats.turns_in_window, 3);
    assert!(stats.has_summary);

    let context = orch.memory().get_context("s").await;
    assert!(context.starts_with("[Previous conversation summary]"));
}

#[tokio::test]
async fn chain_depth_is_bounded() {
    fn chain() -> Vec<Arc<dyn Capability>> {
        vec![
            Arc::new(Stub::new("linker", "Finds links", "start at https://chain.example/0")),
            Arc::new(Stub::new("fetch_one", "Fetches pages", "next https://chain.example/1").consuming_urls()),
            Arc::new(Stub::new("fetch_two", "Fetches pages", "next https://chain.example/2").consuming_urls()),
            Arc::new(Stub::new("fetch_three", "Fetches pages", "next https://chain.example/3").consuming_urls()),
        ]
    }

    for depth in [1, 2, 3] {
        let orch = build(
            registry_of(chain()),
            PolicySet::default(),
            OrchestratorSettings {
                max_chain_depth: depth,
                ..settings()
            },
            &Stores::in_memory(),
            (10, 5),
        )
        .await;
        let outcome = orch
            .handle(ExecutionRequest::new("s", "collect links in more detail"))
            .await
            .unwrap();
        assert_eq!(outcome.capabilities.len(), depth, "depth {depth}");
        assert_eq!(outcome.trace.count(AgentState::Execute), depth);
        assert!(!outcome.partial);
    }

    // Without a request for depth the first answer stands.
    let orch = build(registry_of(chain()), PolicySet::default(), settings(), &Stores::in_memory(), (10, 5)).await;
    let outcome = orch
        .handle(ExecutionRequest::new("s", "collect links"))
        .await
        .unwrap();
    assert_eq!(outcome.capabilities, vec!["linker"]);
}

#[tokio::test]
async fn chained_steps_do_not_take_over_the_learned_route() {
    let orch = build(
        registry_of(vec![
            Arc::new(Stub::new("linker", "Finds links", "start at https://chain.example/0")) as Arc<dyn Capability>,
            Arc::new(Stub::new("fetch_one", "Fetches pages", "page body").consuming_urls()) as Arc<dyn Capability>,
        ]),
        PolicySet::default(),
        settings(),
        &Stores::in_memory(),
        (10, 5),
    )
    .await;

    let chained = orch
        .handle(ExecutionRequest::new("s", "collect links in more detail"))
        .await
        .unwrap();
    assert_eq!(chained.capabilities, vec!["linker", "fetch_one"]);

    // The fetcher earns its own record but not the category.
    let fetcher = orch.learning().performance("fetch_one").await.unwrap();
    assert_eq!(fetcher.usage_count, 1);

    let next = orch
        .handle(ExecutionRequest::new("s2", "collect links"))
        .await
        .unwrap();
    assert_eq!(next.capabilities, vec!["linker"]);
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let orch = with_tools(PolicySet::default(), settings()).await;
    orch.handle(ExecutionRequest::new("s", "Compute 2+2")).await.unwrap();
    orch.handle(ExecutionRequest::new("s", "Calculate 3*3")).await.unwrap();

    let first = orch.finalize_session("s").await.unwrap();
    let second = orch.finalize_session("s").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(orch.episodic().len().await, 1);
    assert_eq!(first.queries, vec!["Compute 2+2", "Calculate 3*3"]);
    assert_eq!(first.capabilities, vec!["calculator"]);

    let reflections = orch.session_reflections("s").await;
    assert!(reflections.iter().any(|r| r.kind == ReflectionKind::SessionSummary));
}

#[tokio::test]
async fn finalized_episodes_are_recalled_by_other_sessions() {
    let orch = with_tools(PolicySet::default(), settings()).await;
    orch.handle(ExecutionRequest::new("past", "Calculate the mortgage payment 1200*12"))
        .await
        .unwrap();
    orch.finalize_session("past").await.unwrap();

    let matches = orch.episodic().search_text("mortgage payment", 2).await;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].episode.session_id, "past");
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let stores = Stores::on_disk(dir.path());
        let orch = build(default_registry(None).unwrap(), PolicySet::default(), settings(), &stores, (10, 5)).await;
        orch.handle(ExecutionRequest::new("s", "Compute 2+3")).await.unwrap();
        orch.finalize_session("s").await.unwrap();
        orch.handle(ExecutionRequest::new("live", "Compute 4+4")).await.unwrap();
    }

    let stores = Stores::on_disk(dir.path());
    let orch = build(default_registry(None).unwrap(), PolicySet::default(), settings(), &stores, (10, 5)).await;

    let summary = orch.learning().summary().await;
    assert!(summary.total_actions >= 2);
    assert!(summary.rankings.iter().any(|(name, _)| name == "calculator"));

    assert_eq!(orch.episodic().len().await, 1);

    let turns = orch.memory().turns("live").await;
    assert_eq!(turns.len(), 2);
    assert!(turns[1].content.contains("8"));

    let reflections = ReflectionModule::load_log(stores.logs.as_ref()).await;
    assert!(reflections.iter().any(|r| r.kind == ReflectionKind::ToolSelection));
}

#[tokio::test]
async fn corrupt_violation_records_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::on_disk(dir.path());
    let policies = PolicySet::from_toml(
        r#"
[[policies]]
id = "no-answers"
type = "capability_gate"
capabilities = ["answer"]
"#,
    )
    .unwrap();
    let orch = build(
        registry_of(vec![Arc::new(Stub::new("answer", "Answers questions", "done")) as Arc<dyn Capability>]),
        policies,
        settings(),
        &stores,
        (10, 5),
    )
    .await;
    orch.handle(ExecutionRequest::new("s", "hello")).await.unwrap_err();

    let log = dir.path().join("logs").join(format!("{VIOLATION_STREAM}.jsonl"));
    let mut raw = std::fs::read_to_string(&log).unwrap();
    raw.push_str("{not json\n");
    std::fs::write(&log, raw).unwrap();

    let records = PolicyEngine::load_violations(stores.logs.as_ref()).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rule_id, "no-answers");
}

#[tokio::test]
async fn busy_session_rejects_second_request() {
    let slow = Arc::new(Stub::new("answer", "Answers questions", "eventually").slow(Duration::from_millis(300)));
    let orch = Arc::new(
        build(
            registry_of(vec![slow as Arc<dyn Capability>]),
            PolicySet::default(),
            OrchestratorSettings {
                busy_policy: BusyPolicy::Reject,
                ..settings()
            },
            &Stores::in_memory(),
            (10, 5),
        )
        .await,
    );

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.handle(ExecutionRequest::new("s", "first")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = orch
        .handle(ExecutionRequest::new("s", "second"))
        .await
        .unwrap_err();
    assert_eq!(rejected.kind, ErrorKind::Busy);
    assert!(rejected.retryable);
    assert_eq!(rejected.trace.states(), &[AgentState::Error]);

    // Other sessions are not blocked.
    assert!(orch.handle(ExecutionRequest::new("other", "hi")).await.is_ok());

    assert!(first.await.unwrap().is_ok());
    let turns = orch.memory().turns("s").await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].content, "first");
}

#[tokio::test]
async fn queued_requests_run_in_arrival_order() {
    let slow = Arc::new(Stub::new("answer", "Answers questions", "done").slow(Duration::from_millis(200)));
    let orch = Arc::new(
        build(
            registry_of(vec![slow.clone() as Arc<dyn Capability>]),
            PolicySet::default(),
            OrchestratorSettings {
                busy_policy: BusyPolicy::Queue,
                ..settings()
            },
            &Stores::in_memory(),
            (10, 5),
        )
        .await,
    );

    let mut pending = Vec::new();
    for query in ["first", "second", "third"] {
        let orch = orch.clone();
        pending.push(tokio::spawn(async move { orch.handle(ExecutionRequest::new("s", query)).await }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    for task in pending {
        assert!(task.await.unwrap().is_ok());
    }

    assert_eq!(slow.calls(), 3);
    let contents: Vec<_> = orch.memory().turns("s").await.into_iter().map(|t| t.content).collect();
    assert_eq!(contents, vec!["first", "done", "second", "done", "third", "done"]);
}

#[tokio::test]
async fn request_timeout_aborts_the_pipeline() {
    let slow = Arc::new(Stub::new("answer", "Answers questions", "too late").slow(Duration::from_secs(2)));
    let orch = build(
        registry_of(vec![slow.clone() as Arc<dyn Capability>]),
        PolicySet::default(),
        OrchestratorSettings {
            request_timeout: Duration::from_millis(100),
            capability_timeout: Duration::from_secs(5),
            ..settings()
        },
        &Stores::in_memory(),
        (10, 5),
    )
    .await;

    let started = std::time::Instant::now();
    let failure = orch
        .handle(ExecutionRequest::new("s", "how long is this"))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(failure.kind, ErrorKind::RequestTimeout);
    assert_eq!(failure.trace.states().last(), Some(&AgentState::Error));
    assert_eq!(failure.trace.count(AgentState::Synthesize), 0);
    assert_eq!(slow.calls(), 1);

    let turns = orch.memory().turns("s").await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].error, Some(ErrorKind::RequestTimeout));
}

#[tokio::test]
async fn cancellation_ends_in_error_without_answer() {
    let slow = Arc::new(Stub::new("answer", "Answers questions", "too late").slow(Duration::from_secs(5)));
    let orch = build(
        registry_of(vec![slow as Arc<dyn Capability>]),
        PolicySet::default(),
        OrchestratorSettings {
            capability_timeout: Duration::from_secs(8),
            ..settings()
        },
        &Stores::in_memory(),
        (10, 5),
    )
    .await;

    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let failure = orch
        .handle_with_cancel(ExecutionRequest::new("s", "take your time"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert!(!failure.trace.contains(AgentState::Synthesize));
    assert_eq!(failure.trace.last(), Some(AgentState::Error));

    let turns = orch.memory().turns("s").await;
    assert_eq!(turns[1].error, Some(ErrorKind::Cancelled));
}
