//! The request pipeline.
//!
//! ```text
//! UNDERSTAND → ROUTE → POLICY_CHECK → EXECUTE ─┬→ SYNTHESIZE → REFLECT → DONE
//!                 ↑                             │
//!                 └──── chained hop (URLs) ─────┘
//!          ROUTE / POLICY_CHECK / EXECUTE ──→ ERROR
//! ```
//!
//! One request runs at a time per session (see [`SessionSlots`]). Each
//! capability call runs on its own task under `capability_timeout`; the
//! whole pipeline runs under `request_timeout`. Reflection runs after the
//! answer is ready, in the background by default, and keeps the session
//! slot until it has been recorded.

use chrono::Utc;
use routewise_config::{AppConfig, BusyPolicy};
use routewise_core::capability::{CapabilityRegistry, ReferenceKind};
use routewise_core::error::{ErrorKind, MemoryError};
use routewise_core::event::{DomainEvent, EventBus};
use routewise_core::message::TurnDraft;
use routewise_core::request::{ExecutionRequest, ExecutionResult};
use routewise_memory::{format_episode_context, ConversationMemory, Episode, EpisodicStore};
use routewise_policy::{PolicyAction, PolicyEngine};
use routewise_reflection::{LearningHandle, QueryCategory, Reflection, ReflectionModule};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::outcome::{TaskFailure, TaskOutcome, TaskResult};
use crate::router::{extract_urls, wants_depth, Route, Router};
use crate::session::SessionSlots;
use crate::state::{AgentState, StateTrace};
use crate::synthesis::{synthesize, Synthesis};

/// Tunables of the pipeline. See [`AppConfig`] for the defaults.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations: usize,
    pub max_chain_depth: usize,
    pub request_timeout: Duration,
    pub capability_timeout: Duration,
    pub throttle_delay: Duration,
    pub retry_backoff: Duration,
    pub busy_policy: BusyPolicy,
    pub episodic_recall_limit: usize,
    pub reflection_enabled: bool,
    pub reflection_async: bool,
    pub reasoning_capability: String,
    pub summarizer_capability: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_chain_depth: config.max_chain_depth,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            capability_timeout: Duration::from_millis(config.capability_timeout_ms),
            throttle_delay: Duration::from_millis(config.throttle_delay_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            busy_policy: config.busy_policy,
            episodic_recall_limit: config.episodic_recall_limit,
            reflection_enabled: config.reflection_enabled,
            reflection_async: config.reflection_async,
            reasoning_capability: config.reasoning_capability.clone(),
            summarizer_capability: config.summarizer_capability.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Cancels an in-flight request.
///
/// Cancelling aborts the running capability call; the request ends in
/// `ERROR` with [`ErrorKind::Cancelled`] without synthesizing an answer.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when `rx` reports cancellation; never resolves if the handle
/// is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|c| *c).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Aborts the capability task when the call is abandoned.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Why a request ended in `ERROR`.
#[derive(Debug, Clone)]
struct Failure {
    kind: ErrorKind,
    /// User-visible text.
    message: String,
    /// Operator detail for logs and reflections.
    detail: String,
    capability: Option<String>,
    retryable: bool,
    /// Whether the failing execution is already in the run's results.
    from_result: bool,
}

impl Failure {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            message: TaskFailure::generic_message(kind),
            detail: detail.into(),
            capability: None,
            retryable: kind.is_retryable(),
            from_result: false,
        }
    }

    /// Denials surface the policy message verbatim.
    fn policy(message: String, capability: &str) -> Self {
        Self {
            kind: ErrorKind::PolicyViolation,
            detail: message.clone(),
            message,
            capability: Some(capability.to_string()),
            retryable: false,
            from_result: false,
        }
    }

    fn from_result(result: &ExecutionResult, idempotent: bool) -> Self {
        let kind = result.error_kind.unwrap_or(ErrorKind::CapabilityExecutionError);
        Self {
            kind,
            message: TaskFailure::generic_message(kind),
            detail: result.error.clone().unwrap_or_default(),
            capability: Some(result.capability.clone()),
            retryable: match kind {
                ErrorKind::CapabilityExecutionError => idempotent,
                other => other.is_retryable(),
            },
            from_result: true,
        }
    }

    fn with_capability(mut self, capability: &str) -> Self {
        self.capability = Some(capability.to_string());
        self
    }
}

enum Verdict {
    Answer(Synthesis),
    Failed(Failure),
}

/// Mutable state of one request as it moves through the pipeline.
struct Run {
    request: ExecutionRequest,
    cancel: watch::Receiver<bool>,
    trace: StateTrace,
    /// Every execution, failed ones included, in order.
    results: Vec<ExecutionResult>,
    /// Index of the first result produced by a chained hop.
    chain_start: Option<usize>,
    warnings: Vec<String>,
    executions: usize,
    retried: bool,
    partial: bool,
    context: String,
    enriched: String,
}

impl Run {
    fn new(request: ExecutionRequest, cancel: watch::Receiver<bool>) -> Self {
        Self {
            request,
            cancel,
            trace: StateTrace::new(),
            results: Vec::new(),
            chain_start: None,
            warnings: Vec::new(),
            executions: 0,
            retried: false,
            partial: false,
            context: String::new(),
            enriched: String::new(),
        }
    }

    fn mark_partial(&mut self, note: String) {
        self.partial = true;
        self.warnings.push(note);
    }

    fn executed(&self) -> Vec<String> {
        self.results.iter().map(|r| r.capability.clone()).collect()
    }

    fn chain_start(&self) -> usize {
        self.chain_start.unwrap_or(self.results.len())
    }
}

/// What a background reflection pass needs to know.
enum ReflectionJob {
    Answered {
        request: ExecutionRequest,
        results: Vec<ExecutionResult>,
        chain_start: usize,
        answer: String,
        sources: Vec<String>,
    },
    Failed {
        request: ExecutionRequest,
        results: Vec<ExecutionResult>,
        chain_start: usize,
        failure: Failure,
    },
}

type SessionReflections = Arc<Mutex<HashMap<String, Vec<Reflection>>>>;

/// Drives requests through the state machine.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: Arc<CapabilityRegistry>,
    memory: Arc<ConversationMemory>,
    episodic: Arc<EpisodicStore>,
    policy: Arc<PolicyEngine>,
    reflection: Arc<ReflectionModule>,
    events: Arc<EventBus>,
    router: Router,
    slots: SessionSlots,
    session_reflections: SessionReflections,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        memory: Arc<ConversationMemory>,
        episodic: Arc<EpisodicStore>,
        policy: Arc<PolicyEngine>,
        reflection: Arc<ReflectionModule>,
    ) -> Self {
        let settings = OrchestratorSettings::default();
        Self {
            router: router_for(&settings),
            slots: SessionSlots::new(settings.busy_policy),
            settings,
            registry,
            memory,
            episodic,
            policy,
            reflection,
            events: Arc::new(EventBus::default()),
            session_reflections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.router = router_for(&settings);
        self.slots = SessionSlots::new(settings.busy_policy);
        self.settings = settings;
        self
    }

    /// Publish domain events on `events` instead of a private bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn episodic(&self) -> &EpisodicStore {
        &self.episodic
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn learning(&self) -> &LearningHandle {
        self.reflection.learning()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ── Public operations ──

    /// Run one request to completion.
    pub async fn handle(&self, request: ExecutionRequest) -> TaskResult {
        let (_tx, rx) = watch::channel(false);
        self.process(request, rx).await
    }

    /// Run one request that `cancel` may abort.
    pub async fn handle_with_cancel(&self, request: ExecutionRequest, cancel: &CancelHandle) -> TaskResult {
        self.process(request, cancel.subscribe()).await
    }

    /// Resolve once no request or background reflection holds the session.
    pub async fn wait_idle(&self, session_id: &str) {
        self.slots.wait_idle(session_id).await;
    }

    pub fn is_idle(&self, session_id: &str) -> bool {
        self.slots.is_idle(session_id)
    }

    /// Reflections recorded for a session so far.
    pub async fn session_reflections(&self, session_id: &str) -> Vec<Reflection> {
        self.session_reflections
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Close a session into an episode.
    ///
    /// Waits for the session to go idle, records a session-summary
    /// reflection and stores the episode. Finalizing the same conversation
    /// again yields the same episode.
    pub async fn finalize_session(&self, session_id: &str) -> Result<Episode, MemoryError> {
        let _permit = self
            .slots
            .acquire_waiting(session_id)
            .await
            .map_err(|_| MemoryError::Storage(format!("session {session_id} is unavailable")))?;

        if self.settings.reflection_enabled {
            let reflections = self.session_reflections(session_id).await;
            let summary = self.reflection.summarize_session(session_id, &reflections).await;
            self.session_reflections
                .lock()
                .await
                .entry(session_id.to_string())
                .or_default()
                .push(summary);
        }

        let turns = self.memory.turns(session_id).await;
        let summary = self.memory.summary(session_id).await;
        let episode = self
            .episodic
            .finalize_session(session_id, &turns, summary.as_deref())
            .await?;

        info!(session_id, turns = turns.len(), "Session finalized");
        self.events.publish(DomainEvent::SessionFinalized {
            session_id: session_id.to_string(),
            turns: turns.len(),
            timestamp: Utc::now(),
        });
        Ok(episode)
    }

    /// Forget a session's conversation and collected reflections.
    pub async fn clear_session(&self, session_id: &str) {
        self.wait_idle(session_id).await;
        self.memory.clear(session_id).await;
        self.session_reflections.lock().await.remove(session_id);
        debug!(session_id, "Session cleared");
    }

    // ── Pipeline ──

    async fn process(&self, request: ExecutionRequest, cancel: watch::Receiver<bool>) -> TaskResult {
        let started = Instant::now();
        info!(
            session_id = %request.session_id,
            request_id = %request.request_id,
            "Request received"
        );
        self.events.publish(DomainEvent::RequestReceived {
            session_id: request.session_id.clone(),
            request_id: request.request_id.clone(),
            query_preview: request.query.chars().take(80).collect(),
            timestamp: Utc::now(),
        });

        let permit = match self
            .slots
            .acquire(&request.session_id, self.settings.request_timeout)
            .await
        {
            Ok(permit) => permit,
            Err(_) => {
                warn!(session_id = %request.session_id, "Session busy, request rejected");
                let mut trace = StateTrace::new();
                trace.push(AgentState::Error);
                return Err(TaskFailure {
                    request_id: request.request_id,
                    session_id: request.session_id,
                    kind: ErrorKind::Busy,
                    message: TaskFailure::generic_message(ErrorKind::Busy),
                    retryable: true,
                    trace,
                });
            }
        };

        let mut run = Run::new(request, cancel);
        let remaining = self.settings.request_timeout.saturating_sub(started.elapsed());
        let verdict = match tokio::time::timeout(remaining, self.pipeline(&mut run)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!(
                    session_id = %run.request.session_id,
                    timeout_ms = self.settings.request_timeout.as_millis() as u64,
                    "Request timed out"
                );
                Verdict::Failed(Failure::new(ErrorKind::RequestTimeout, "request timeout exceeded"))
            }
        };

        self.conclude(run, verdict, permit, started).await
    }

    fn enter(&self, run: &mut Run, state: AgentState) {
        debug!(
            session_id = %run.request.session_id,
            request_id = %run.request.request_id,
            state = state.as_str(),
            "State entered"
        );
        run.trace.push(state);
        self.events.publish(DomainEvent::StateEntered {
            session_id: run.request.session_id.clone(),
            request_id: run.request.request_id.clone(),
            state: state.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn pipeline(&self, run: &mut Run) -> Verdict {
        // ── UNDERSTAND ──
        self.enter(run, AgentState::Understand);
        let session_id = run.request.session_id.clone();
        let query = run.request.query.clone();
        run.context = self.memory.get_context(&session_id).await;
        let recalled = self.recall_episodes(&session_id, &query).await;
        run.enriched = enrich(&query, &run.context, &recalled);
        let category = QueryCategory::detect(&query);

        // ── ROUTE ──
        self.enter(run, AgentState::Route);
        let mut cancel = run.cancel.clone();
        let routed = tokio::select! {
            routed = self.router.route(&self.registry, self.learning(), &query, category) => routed,
            _ = cancelled(&mut cancel) => {
                return Verdict::Failed(Failure::new(ErrorKind::Cancelled, "cancelled while routing"));
            }
        };
        let Some(mut route) = routed else {
            return Verdict::Failed(Failure::new(
                ErrorKind::CapabilityNotFound,
                "no routable capability is registered",
            ));
        };

        let mut hops = 0usize;
        loop {
            if run.executions >= self.settings.max_iterations {
                warn!(session_id = %session_id, executions = run.executions, "Iteration limit reached");
                run.mark_partial(format!(
                    "{}: stopped after {} executions",
                    ErrorKind::IterationLimitExceeded.as_str(),
                    run.executions
                ));
                break;
            }

            // ── POLICY_CHECK ──
            if let Err(failure) = self.check_policy(run, &route.capability).await {
                if hops == 0 || failure.kind == ErrorKind::Cancelled {
                    return Verdict::Failed(failure);
                }
                run.mark_partial(format!("Chained step '{}' was blocked", route.capability));
                break;
            }

            // ── EXECUTE ──
            let result = match self.execute_with_retry(run, &route, category).await {
                Ok(result) => result,
                Err(failure) => {
                    if hops == 0 || failure.kind == ErrorKind::Cancelled {
                        return Verdict::Failed(failure);
                    }
                    run.mark_partial(format!("Chained step '{}' failed", route.capability));
                    break;
                }
            };
            hops += 1;

            if hops >= self.settings.max_chain_depth || !wants_depth(&query) {
                break;
            }
            let urls = extract_urls(&result.output);
            if urls.is_empty() {
                break;
            }
            let Some(mut next) = self
                .router
                .next_hop(&self.registry, ReferenceKind::Url, &run.executed())
            else {
                break;
            };
            debug!(from = %route.capability, to = %next.capability, urls = urls.len(), "Chaining");
            next.parameters.insert("url".into(), serde_json::json!(urls[0]));
            next.parameters.insert("urls".into(), serde_json::json!(urls));
            route = next;
            if run.chain_start.is_none() {
                run.chain_start = Some(run.results.len());
            }
            self.enter(run, AgentState::Route);
        }

        // ── SYNTHESIZE ──
        self.enter(run, AgentState::Synthesize);
        let synthesis = synthesize(&query, &run.results);
        let check = self
            .policy
            .check_output(&run.request, None, &synthesis.answer)
            .await;
        run.warnings.extend(check.warnings.iter().cloned());
        if !check.allowed {
            warn!(session_id = %session_id, rule = ?check.deciding_rule(), "Answer blocked by output policy");
            return Verdict::Failed(Failure::policy(check.message, "answer"));
        }
        Verdict::Answer(synthesis)
    }

    async fn recall_episodes(&self, session_id: &str, query: &str) -> String {
        let limit = self.settings.episodic_recall_limit;
        if limit == 0 {
            return String::new();
        }
        let matches: Vec<_> = self
            .episodic
            .search_text(query, limit + 1)
            .await
            .into_iter()
            .filter(|m| m.episode.session_id != session_id)
            .take(limit)
            .collect();
        if !matches.is_empty() {
            debug!(session_id, recalled = matches.len(), "Recalled past episodes");
        }
        format_episode_context(&matches)
    }

    /// Evaluate policy for one capability; a throttle waits once and
    /// re-checks.
    async fn check_policy(&self, run: &mut Run, capability: &str) -> Result<(), Failure> {
        self.enter(run, AgentState::PolicyCheck);
        let mut decision = self.policy.evaluate(&run.request, Some(capability)).await;

        if decision.action == PolicyAction::Throttle {
            info!(
                session_id = %run.request.session_id,
                capability,
                delay_ms = self.settings.throttle_delay.as_millis() as u64,
                "Throttled, re-checking after delay"
            );
            let mut cancel = run.cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.settings.throttle_delay) => {}
                _ = cancelled(&mut cancel) => {
                    return Err(Failure::new(ErrorKind::Cancelled, "cancelled while throttled").with_capability(capability));
                }
            }
            decision = self.policy.evaluate(&run.request, Some(capability)).await;
        }

        run.warnings.extend(decision.warnings.iter().cloned());
        if decision.allowed {
            return Ok(());
        }

        warn!(
            session_id = %run.request.session_id,
            capability,
            rule = decision.deciding_rule().unwrap_or(""),
            action = decision.action.as_str(),
            "Policy blocked capability"
        );
        self.events.publish(DomainEvent::PolicyViolation {
            session_id: run.request.session_id.clone(),
            rule_id: decision.deciding_rule().unwrap_or("").to_string(),
            action: decision.action.as_str().to_string(),
            timestamp: Utc::now(),
        });

        Err(match decision.action {
            PolicyAction::Throttle => {
                Failure::new(ErrorKind::Throttled, decision.message).with_capability(capability)
            }
            _ => Failure::policy(decision.message, capability),
        })
    }

    /// Execute a route, retrying once per request: timeouts move to the
    /// learned alternate (or retry in place), execution errors retry only
    /// idempotent capabilities.
    async fn execute_with_retry(
        &self,
        run: &mut Run,
        route: &Route,
        category: QueryCategory,
    ) -> Result<ExecutionResult, Failure> {
        let mut capability = route.capability.clone();
        let mut parameters = route.parameters.clone();

        loop {
            run.executions += 1;
            self.enter(run, AgentState::Execute);
            let params = self.parameters_for(run, &parameters);
            let result = self.execute_once(run, &capability, params).await;

            self.policy.record_execution(&run.request.session_id, &capability);
            self.events.publish(DomainEvent::CapabilityExecuted {
                session_id: run.request.session_id.clone(),
                capability: capability.clone(),
                success: result.success,
                duration_ms: result.duration_ms,
                timestamp: Utc::now(),
            });
            run.results.push(result.clone());

            if result.success {
                return Ok(result);
            }

            let idempotent = self.registry.get(&capability).is_ok_and(|d| d.idempotent);
            let kind = result.error_kind.unwrap_or(ErrorKind::CapabilityExecutionError);
            let may_retry = !run.retried
                && run.executions < self.settings.max_iterations
                && match kind {
                    ErrorKind::CapabilityTimeout => true,
                    ErrorKind::CapabilityExecutionError => idempotent,
                    _ => false,
                };
            if !may_retry {
                return Err(Failure::from_result(&result, idempotent));
            }
            run.retried = true;

            if kind == ErrorKind::CapabilityTimeout
                && let Some(alternate) = self.learning().alternate_for(category, &capability).await
                && self.registry.get(&alternate).is_ok_and(|d| d.available)
            {
                info!(from = %capability, to = %alternate, "Retrying on alternate capability");
                capability = alternate;
                parameters = serde_json::Map::new();
            }
            warn!(
                session_id = %run.request.session_id,
                capability = %capability,
                error = kind.as_str(),
                backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                "Retrying capability"
            );

            let mut cancel = run.cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                _ = cancelled(&mut cancel) => {
                    return Err(Failure::new(ErrorKind::Cancelled, "cancelled during retry backoff").with_capability(&capability));
                }
            }

            if capability != route.capability {
                self.check_policy(run, &capability).await?;
            }
        }
    }

    fn parameters_for(
        &self,
        run: &Run,
        suggested: &serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Value {
        let mut params = serde_json::Map::new();
        params.insert("query".into(), serde_json::json!(run.request.query));
        params.insert("context".into(), serde_json::json!(run.context));
        params.insert("enriched_query".into(), serde_json::json!(run.enriched));
        for (key, value) in suggested {
            params.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(params)
    }

    /// One capability call on its own task, bounded by the capability
    /// timeout and abandoned on cancellation.
    async fn execute_once(&self, run: &Run, name: &str, params: serde_json::Value) -> ExecutionResult {
        let started_at = Utc::now();
        let capability = match self.registry.capability(name) {
            Ok(capability) => capability,
            Err(e) => {
                return ExecutionResult::failed(name, ErrorKind::CapabilityNotFound, e.to_string(), started_at);
            }
        };

        let task = tokio::spawn(async move { capability.execute(params).await });
        let _abort = AbortOnDrop(task.abort_handle());
        let mut cancel = run.cancel.clone();
        let timeout = self.settings.capability_timeout;

        tokio::select! {
            joined = tokio::time::timeout(timeout, task) => match joined {
                Ok(Ok(output)) => {
                    let result = ExecutionResult::from_output(name, output, started_at, Utc::now());
                    debug!(capability = name, success = result.success, duration_ms = result.duration_ms, "Capability finished");
                    result
                }
                Ok(Err(e)) => ExecutionResult::failed(
                    name,
                    ErrorKind::CapabilityExecutionError,
                    format!("capability task failed: {e}"),
                    started_at,
                ),
                Err(_) => {
                    warn!(capability = name, timeout_ms = timeout.as_millis() as u64, "Capability timed out");
                    ExecutionResult::failed(
                        name,
                        ErrorKind::CapabilityTimeout,
                        format!("capability '{name}' exceeded {}ms", timeout.as_millis()),
                        started_at,
                    )
                }
            },
            _ = cancelled(&mut cancel) => {
                info!(capability = name, "Capability call cancelled");
                ExecutionResult::failed(name, ErrorKind::Cancelled, "request cancelled", started_at)
            }
        }
    }

    // ── Completion ──

    async fn conclude(
        &self,
        mut run: Run,
        verdict: Verdict,
        permit: OwnedSemaphorePermit,
        started: Instant,
    ) -> TaskResult {
        let session_id = run.request.session_id.clone();
        let duration_ms = started.elapsed().as_millis() as u64;

        match verdict {
            Verdict::Answer(synthesis) => {
                self.enter(&mut run, AgentState::Reflect);
                let capabilities: Vec<String> = run
                    .results
                    .iter()
                    .filter(|r| r.success)
                    .map(|r| r.capability.clone())
                    .collect();

                self.memory
                    .add_turn(&session_id, TurnDraft::user(&run.request.query))
                    .await;
                self.memory
                    .add_turn(
                        &session_id,
                        TurnDraft::assistant(&synthesis.answer)
                            .with_tool_calls(capabilities.clone())
                            .with_sources(synthesis.sources.clone()),
                    )
                    .await;

                self.dispatch_reflection(
                    ReflectionJob::Answered {
                        request: run.request.clone(),
                        results: run.results.clone(),
                        chain_start: run.chain_start(),
                        answer: synthesis.answer.clone(),
                        sources: synthesis.sources.clone(),
                    },
                    permit,
                )
                .await;

                self.enter(&mut run, AgentState::Done);
                info!(
                    session_id = %session_id,
                    capabilities = ?capabilities,
                    partial = run.partial,
                    duration_ms,
                    "Request completed"
                );
                Ok(TaskOutcome {
                    request_id: run.request.request_id,
                    session_id,
                    answer: synthesis.answer,
                    sources: synthesis.sources,
                    capabilities,
                    partial: run.partial,
                    warnings: run.warnings,
                    trace: run.trace,
                    duration_ms,
                })
            }
            Verdict::Failed(failure) => {
                self.enter(&mut run, AgentState::Error);
                warn!(
                    session_id = %session_id,
                    kind = failure.kind.as_str(),
                    capability = failure.capability.as_deref().unwrap_or(""),
                    detail = %failure.detail,
                    "Request failed"
                );
                self.events.publish(DomainEvent::ErrorOccurred {
                    context: format!("session {session_id}"),
                    error_message: format!("{}: {}", failure.kind.as_str(), failure.detail),
                    timestamp: Utc::now(),
                });

                self.memory
                    .add_turn(&session_id, TurnDraft::user(&run.request.query))
                    .await;
                self.memory
                    .add_turn(
                        &session_id,
                        TurnDraft::assistant(&failure.message).with_error(failure.kind),
                    )
                    .await;

                self.dispatch_reflection(
                    ReflectionJob::Failed {
                        request: run.request.clone(),
                        results: run.results.clone(),
                        chain_start: run.chain_start(),
                        failure: failure.clone(),
                    },
                    permit,
                )
                .await;

                Err(TaskFailure {
                    request_id: run.request.request_id,
                    session_id,
                    kind: failure.kind,
                    message: failure.message,
                    retryable: failure.retryable,
                    trace: run.trace,
                })
            }
        }
    }

    /// Run reflection inline or in the background. The session slot is
    /// released only once reflection is recorded.
    async fn dispatch_reflection(&self, job: ReflectionJob, permit: OwnedSemaphorePermit) {
        if !self.settings.reflection_enabled {
            drop(permit);
            return;
        }
        let reflection = self.reflection.clone();
        let collected = self.session_reflections.clone();
        if self.settings.reflection_async {
            tokio::spawn(async move {
                reflect(&reflection, &collected, job).await;
                drop(permit);
            });
        } else {
            reflect(&reflection, &collected, job).await;
            drop(permit);
        }
    }
}

fn router_for(settings: &OrchestratorSettings) -> Router {
    Router::new(
        settings.reasoning_capability.clone(),
        settings.summarizer_capability.clone(),
        settings.capability_timeout,
    )
}

/// The query, followed by conversation context and recalled episodes.
fn enrich(query: &str, context: &str, episodes: &str) -> String {
    let mut enriched = query.trim().to_string();
    for block in [context, episodes] {
        if !block.trim().is_empty() {
            enriched.push_str("\n\n");
            enriched.push_str(block.trim());
        }
    }
    enriched
}

async fn reflect(module: &ReflectionModule, collected: &SessionReflections, job: ReflectionJob) {
    let mut recorded = Vec::new();
    let (request, results, chain_start) = match &job {
        ReflectionJob::Answered { request, results, chain_start, .. }
        | ReflectionJob::Failed { request, results, chain_start, .. } => (request, results, *chain_start),
    };

    for (i, result) in results.iter().enumerate() {
        if result.error_kind == Some(ErrorKind::Cancelled) {
            continue;
        }
        let selection = if i < chain_start {
            module.reflect_on_tool_selection(request, &result.capability, result).await
        } else {
            module.reflect_on_chained_step(request, &result.capability, result).await
        };
        recorded.push(selection);
        if !result.success {
            recorded.push(module.reflect_on_error(request, result).await);
        }
    }

    match &job {
        ReflectionJob::Answered { answer, sources, .. } => {
            recorded.push(
                module
                    .reflect_on_answer_quality(&request.session_id, answer, sources)
                    .await,
            );
        }
        ReflectionJob::Failed { failure, .. } => {
            // Failures that never produced an execution result still get analysed.
            let cancelled_call = failure.kind == ErrorKind::Cancelled;
            if !failure.from_result || cancelled_call {
                let synthetic = ExecutionResult::failed(
                    failure.capability.clone().unwrap_or_default(),
                    failure.kind,
                    failure.detail.clone(),
                    request.timestamp,
                );
                recorded.push(module.reflect_on_error(request, &synthetic).await);
            }
        }
    }

    collected
        .lock()
        .await
        .entry(request.session_id.clone())
        .or_default()
        .extend(recorded);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use routewise_core::capability::{Capability, CapabilityOutput};
    use routewise_memory::InMemorySessionStore;
    use routewise_policy::PolicySet;
    use routewise_reflection::{LearningModule, ReflectionKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the query, optionally sleeping first or failing.
    struct Scripted {
        name: &'static str,
        description: &'static str,
        output: &'static str,
        delay: Duration,
        fail: bool,
        idempotent: bool,
        consumes: Option<ReferenceKind>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, description: &'static str, output: &'static str) -> Self {
            Self {
                name,
                description,
                output,
                delay: Duration::ZERO,
                fail: false,
                idempotent: true,
                consumes: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Capability for Scripted {
        fn name(&self) -> &str { self.name }
        fn description(&self) -> &str { self.description }
        fn idempotent(&self) -> bool { self.idempotent }
        fn consumes(&self) -> Option<ReferenceKind> { self.consumes }
        async fn execute(&self, _: serde_json::Value) -> CapabilityOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                CapabilityOutput::failure("scripted failure")
            } else {
                CapabilityOutput::ok(self.output)
            }
        }
    }

    fn sync_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            reflection_async: false,
            capability_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(5),
            throttle_delay: Duration::from_millis(5),
            request_timeout: Duration::from_secs(5),
            ..OrchestratorSettings::default()
        }
    }

    async fn orchestrator(capabilities: Vec<Arc<dyn Capability>>, policies: PolicySet) -> Orchestrator {
        let mut registry = CapabilityRegistry::new();
        for capability in capabilities {
            registry.register(capability).unwrap();
        }
        let store: Arc<dyn routewise_core::store::SessionStore> = Arc::new(InMemorySessionStore::new());
        let episodic = EpisodicStore::open(store, None).await.unwrap();
        let learning = LearningModule::spawn(None).await;
        Orchestrator::new(
            Arc::new(registry),
            Arc::new(ConversationMemory::new(10, 5)),
            Arc::new(episodic),
            Arc::new(PolicyEngine::new(policies).unwrap()),
            Arc::new(ReflectionModule::new(learning)),
        )
        .with_settings(sync_settings())
    }

    #[tokio::test]
    async fn happy_path_trace_and_memory() {
        let orch = orchestrator(
            vec![Arc::new(Scripted::new("answer", "Answers questions", "forty-two")) as Arc<dyn Capability>],
            PolicySet::default(),
        )
        .await;
        let outcome = orch.handle(ExecutionRequest::new("s1", "what is the answer")).await.unwrap();

        assert_eq!(outcome.answer, "forty-two");
        assert_eq!(outcome.capabilities, vec!["answer"]);
        assert!(!outcome.partial);
        assert_eq!(
            outcome.trace.states(),
            &[
                AgentState::Understand,
                AgentState::Route,
                AgentState::PolicyCheck,
                AgentState::Execute,
                AgentState::Synthesize,
                AgentState::Reflect,
                AgentState::Done,
            ]
        );

        let turns = orch.memory().turns("s1").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].tool_calls, vec!["answer"]);

        let reflections = orch.session_reflections("s1").await;
        assert!(reflections.iter().any(|r| r.kind == ReflectionKind::ToolSelection));
        assert!(reflections.iter().any(|r| r.kind == ReflectionKind::AnswerQuality));
    }

    #[tokio::test]
    async fn execution_error_retries_idempotent_only() {
        let flaky = Arc::new(Scripted { fail: true, ..Scripted::new("flaky", "Does things", "") });
        let orch = orchestrator(vec![flaky.clone() as Arc<dyn Capability>], PolicySet::default()).await;
        let failure = orch.handle(ExecutionRequest::new("s1", "do things")).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::CapabilityExecutionError);
        assert!(failure.retryable);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let once = Arc::new(Scripted {
            fail: true,
            idempotent: false,
            ..Scripted::new("once", "Does things", "")
        });
        let orch = orchestrator(vec![once.clone() as Arc<dyn Capability>], PolicySet::default()).await;
        let failure = orch.handle(ExecutionRequest::new("s1", "do things")).await.unwrap_err();
        assert!(!failure.retryable);
        assert_eq!(once.calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.trace.last(), Some(AgentState::Error));
    }

    #[tokio::test]
    async fn iteration_cap_yields_partial_answer() {
        let lister = Arc::new(Scripted::new("lister", "Lists links", "see https://a.example/1"));
        let fetcher = Arc::new(Scripted {
            consumes: Some(ReferenceKind::Url),
            ..Scripted::new("fetcher", "Fetches pages", "page https://a.example/2")
        });
        let mut orch = orchestrator(vec![lister as Arc<dyn Capability>, fetcher], PolicySet::default()).await;
        orch = orch.with_settings(OrchestratorSettings {
            max_iterations: 1,
            max_chain_depth: 3,
            ..sync_settings()
        });

        let outcome = orch
            .handle(ExecutionRequest::new("s1", "links, with more detail"))
            .await
            .unwrap();
        assert!(outcome.partial);
        assert_eq!(outcome.capabilities, vec!["lister"]);
        assert!(outcome.warnings.iter().any(|w| w.starts_with("iteration_limit_exceeded")));
    }

    #[tokio::test]
    async fn cancellation_skips_synthesis() {
        let slow = Arc::new(Scripted {
            delay: Duration::from_secs(30),
            ..Scripted::new("slow", "Takes forever", "late")
        });
        let orch = orchestrator(vec![slow as Arc<dyn Capability>], PolicySet::default())
            .await
            .with_settings(OrchestratorSettings {
                capability_timeout: Duration::from_secs(60),
                ..sync_settings()
            });

        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let failure = orch
            .handle_with_cancel(ExecutionRequest::new("s1", "slow please"), &cancel)
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert!(!failure.trace.contains(AgentState::Synthesize));
        let reflections = orch.session_reflections("s1").await;
        assert!(reflections.iter().any(|r| r.kind == ReflectionKind::ErrorAnalysis));
    }

    #[tokio::test]
    async fn cancellation_while_routing_skips_execution() {
        let reasoner = Arc::new(Scripted {
            delay: Duration::from_secs(5),
            ..Scripted::new("reasoner", "Picks a capability", r#"{"capability": "answer"}"#)
        });
        let answer = Arc::new(Scripted::new("answer", "Answers questions", "ok"));
        let orch = orchestrator(
            vec![answer.clone() as Arc<dyn Capability>, reasoner.clone() as Arc<dyn Capability>],
            PolicySet::default(),
        )
        .await
        .with_settings(OrchestratorSettings {
            capability_timeout: Duration::from_secs(10),
            ..sync_settings()
        });

        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let failure = orch
            .handle_with_cancel(ExecutionRequest::new("s1", "who wrote this"), &cancel)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert!(failure.trace.contains(AgentState::Route));
        assert!(!failure.trace.contains(AgentState::Execute));
        assert_eq!(reasoner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(answer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn async_reflection_holds_the_session_until_recorded() {
        let orch = orchestrator(
            vec![Arc::new(Scripted::new("answer", "Answers questions", "ok")) as Arc<dyn Capability>],
            PolicySet::default(),
        )
        .await
        .with_settings(OrchestratorSettings {
            reflection_async: true,
            ..sync_settings()
        });

        orch.handle(ExecutionRequest::new("s1", "hello there")).await.unwrap();
        orch.wait_idle("s1").await;
        assert!(orch.is_idle("s1"));
        assert!(!orch.session_reflections("s1").await.is_empty());
    }

    #[test]
    fn enrichment_appends_nonempty_blocks() {
        assert_eq!(enrich("q", "", ""), "q");
        assert_eq!(enrich(" q ", "ctx", "past"), "q\n\nctx\n\npast");
    }
}
