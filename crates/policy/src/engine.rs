//! Policy enforcement engine.
//!
//! The engine evaluates the rule set against a pending request (and the
//! capability about to run) or against produced output, and returns a
//! [`PolicyDecision`] the orchestrator must obey.

use crate::ledger::{UsageLedger, UsageSnapshot};
use crate::model::{
    PolicyAction, PolicyRule, PolicySet, RateScope, RuleCriteria, RuleType, compile_pattern,
};
use chrono::{DateTime, Utc};
use routewise_core::error::PolicyError;
use routewise_core::request::ExecutionRequest;
use routewise_core::store::{Envelope, LogStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Log stream holding durable violation records.
pub const VIOLATION_STREAM: &str = "violations";
const VIOLATION_SCHEMA: &str = "policy_violation";
const VIOLATION_VERSION: u32 = 1;

/// Default bound of the in-memory violation log.
const DEFAULT_LOG_LIMIT: usize = 1_000;

/// A rule that matched during one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub rule_id: String,
    pub rule_type: RuleType,
    pub action: PolicyAction,
    pub priority: i32,
    pub message: String,
}

/// The outcome of evaluating the rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// True only for ALLOW and WARN.
    pub allowed: bool,
    pub action: PolicyAction,
    /// Triggering rules, highest priority first.
    pub triggered: Vec<TriggeredRule>,
    pub message: String,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl PolicyDecision {
    /// No rule matched.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            action: PolicyAction::Allow,
            triggered: Vec::new(),
            message: String::new(),
            warnings: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Id of the rule whose message decided the verdict.
    pub fn deciding_rule(&self) -> Option<&str> {
        self.triggered
            .iter()
            .find(|t| t.action == self.action)
            .map(|t| t.rule_id.as_str())
    }

    fn from_triggered(mut triggered: Vec<(TriggeredRule, usize)>) -> Self {
        if triggered.is_empty() {
            return Self::allow();
        }
        triggered.sort_by(|a, b| b.0.priority.cmp(&a.0.priority).then(a.1.cmp(&b.1)));
        let triggered: Vec<TriggeredRule> = triggered.into_iter().map(|(t, _)| t).collect();

        // Most restrictive per type, then across types: the maximum overall.
        let mut per_type: HashMap<RuleType, PolicyAction> = HashMap::new();
        for t in &triggered {
            let slot = per_type.entry(t.rule_type).or_insert(PolicyAction::Allow);
            if t.action.severity() > slot.severity() {
                *slot = t.action;
            }
        }
        let action = per_type
            .values()
            .copied()
            .max_by_key(|a| a.severity())
            .unwrap_or(PolicyAction::Allow);

        let message = triggered
            .iter()
            .find(|t| t.action == action)
            .map(|t| t.message.clone())
            .unwrap_or_default();
        let warnings = triggered
            .iter()
            .filter(|t| t.action == PolicyAction::Warn)
            .map(|t| t.message.clone())
            .collect();

        Self {
            allowed: action.permits(),
            action,
            triggered,
            message,
            warnings,
            timestamp: Utc::now(),
        }
    }
}

/// One durable record per non-allow triggering rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub request_id: String,
    pub rule_id: String,
    pub rule_type: RuleType,
    pub action: PolicyAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub message: String,
}

struct CompiledRule {
    rule: PolicyRule,
    patterns: Vec<regex_lite::Regex>,
}

impl CompiledRule {
    fn compile(rule: PolicyRule) -> Result<Self, PolicyError> {
        rule.validate()?;
        let patterns = match &rule.criteria {
            RuleCriteria::ContentFilter { blocked_patterns, .. } => blocked_patterns
                .iter()
                .map(|p| {
                    compile_pattern(p).map_err(|reason| PolicyError::InvalidRule {
                        rule_id: rule.id.clone(),
                        reason,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        Ok(Self { rule, patterns })
    }

    fn message(&self) -> String {
        if self.rule.message.is_empty() {
            format!("Policy '{}' triggered", self.rule.id)
        } else {
            self.rule.message.clone()
        }
    }

    /// Keyword or pattern hit in `text`.
    fn content_hit(&self, keywords: &[String], text: &str) -> bool {
        let lowered = text.to_lowercase();
        keywords
            .iter()
            .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
            || self.patterns.iter().any(|p| p.is_match(text))
    }
}

fn targets(capabilities: &[String], except: &[String], capability: &str) -> bool {
    if except.iter().any(|c| c == capability) {
        return false;
    }
    capabilities.is_empty() || capabilities.iter().any(|c| c == "*" || c == capability)
}

/// Lazily observed usage for one evaluation: each key is read and recorded
/// at most once.
struct UsageView<'a> {
    ledger: &'a UsageLedger,
    request: &'a ExecutionRequest,
    tokens: u64,
    now: DateTime<Utc>,
    session: Option<UsageSnapshot>,
    user: Option<UsageSnapshot>,
    global: Option<UsageSnapshot>,
}

impl UsageView<'_> {
    fn scoped(&mut self, scope: RateScope) -> UsageSnapshot {
        match scope {
            RateScope::Session => self.session(),
            RateScope::User => *self.user.get_or_insert_with(|| {
                self.ledger.observe(
                    &UsageLedger::user_key(self.request.user_id.as_deref()),
                    &self.request.request_id,
                    self.tokens,
                    self.now,
                )
            }),
        }
    }

    fn session(&mut self) -> UsageSnapshot {
        *self.session.get_or_insert_with(|| {
            self.ledger.observe(
                &UsageLedger::session_key(&self.request.session_id),
                &self.request.request_id,
                self.tokens,
                self.now,
            )
        })
    }

    fn global(&mut self) -> UsageSnapshot {
        *self.global.get_or_insert_with(|| {
            self.ledger
                .observe_global(&self.request.request_id, self.tokens, self.now)
        })
    }
}

/// The policy enforcement engine.
///
/// Thread-safe. Holds the compiled rule set, the usage ledger and a bounded
/// violation log, optionally mirrored to a [`LogStore`].
pub struct PolicyEngine {
    enabled: bool,
    rules: RwLock<Vec<CompiledRule>>,
    ledger: UsageLedger,
    log: RwLock<Vec<ViolationRecord>>,
    log_limit: usize,
    sink: Option<Arc<dyn LogStore>>,
}

impl PolicyEngine {
    /// Create an engine enforcing the given rule set.
    pub fn new(set: PolicySet) -> Result<Self, PolicyError> {
        set.validate()?;
        let rules = Self::compile(set)?;
        info!(rules = rules.len(), "Policy engine initialized");
        Ok(Self {
            enabled: true,
            rules: RwLock::new(rules),
            ledger: UsageLedger::new(),
            log: RwLock::new(Vec::new()),
            log_limit: DEFAULT_LOG_LIMIT,
            sink: None,
        })
    }

    /// An engine that allows everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            rules: RwLock::new(Vec::new()),
            ledger: UsageLedger::new(),
            log: RwLock::new(Vec::new()),
            log_limit: DEFAULT_LOG_LIMIT,
            sink: None,
        }
    }

    /// Mirror violations to a durable log.
    pub fn with_log_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.sink = Some(store);
        self
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replace the rule set. Usage counters are kept.
    pub fn reload(&self, set: PolicySet) -> Result<(), PolicyError> {
        set.validate()?;
        let rules = Self::compile(set)?;
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules;
        info!("Policies reloaded");
        Ok(())
    }

    /// Add a rule at runtime.
    pub fn add_rule(&self, rule: PolicyRule) -> Result<(), PolicyError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if rules.iter().any(|r| r.rule.id == compiled.rule.id) {
            return Err(PolicyError::DuplicateRule(compiled.rule.id));
        }
        rules.push(compiled);
        Ok(())
    }

    /// Remove a rule by id.
    pub fn remove_rule(&self, id: &str) -> Result<(), PolicyError> {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|r| r.rule.id != id);
        if rules.len() == before {
            return Err(PolicyError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// All rules in declaration order.
    pub fn list_rules(&self) -> Vec<PolicyRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| r.rule.clone())
            .collect()
    }

    /// Number of enabled rules.
    pub fn active_count(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.rule.enabled)
            .count()
    }

    /// Evaluate a request, optionally for a specific capability.
    pub async fn evaluate(&self, request: &ExecutionRequest, capability: Option<&str>) -> PolicyDecision {
        if !self.enabled {
            return PolicyDecision::allow();
        }
        let decision = self.decide_request(request, capability);
        self.record_violations(request, capability, &decision).await;
        decision
    }

    /// Apply content-filter rules to produced output.
    pub async fn check_output(
        &self,
        request: &ExecutionRequest,
        capability: Option<&str>,
        output: &str,
    ) -> PolicyDecision {
        if !self.enabled {
            return PolicyDecision::allow();
        }
        let decision = self.decide_output(output);
        self.record_violations(request, capability, &decision).await;
        decision
    }

    /// Count a completed execution toward session execution caps.
    pub fn record_execution(&self, session_id: &str, capability: &str) {
        self.ledger
            .record_execution(&UsageLedger::session_key(session_id), capability);
    }

    /// In-memory violations, optionally for one session.
    pub fn violations(&self, session_id: Option<&str>) -> Vec<ViolationRecord> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|v| session_id.is_none_or(|s| v.session_id == s))
            .cloned()
            .collect()
    }

    /// Read durable violations back, skipping unreadable records.
    pub async fn load_violations(store: &dyn LogStore) -> Vec<ViolationRecord> {
        let raw = match store.read_all(VIOLATION_STREAM).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(store = store.name(), error = %e, "Failed to read violation log");
                return Vec::new();
            }
        };
        raw.iter()
            .enumerate()
            .filter_map(|(line, record)| {
                match Envelope::decode::<ViolationRecord>(record, VIOLATION_SCHEMA, VIOLATION_VERSION) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!(line = line + 1, error = %e, "Skipping unreadable violation record");
                        None
                    }
                }
            })
            .collect()
    }

    // ── Internal ───────────────────────────────────────────────────

    fn compile(set: PolicySet) -> Result<Vec<CompiledRule>, PolicyError> {
        set.policies.into_iter().map(CompiledRule::compile).collect()
    }

    fn decide_request(&self, request: &ExecutionRequest, capability: Option<&str>) -> PolicyDecision {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let tokens = request.estimated_tokens();
        let mut usage = UsageView {
            ledger: &self.ledger,
            request,
            tokens,
            now: Utc::now(),
            session: None,
            user: None,
            global: None,
        };
        let session_key = UsageLedger::session_key(&request.session_id);

        let mut triggered = Vec::new();
        for (order, compiled) in rules.iter().enumerate().filter(|(_, r)| r.rule.enabled) {
            let matched = match &compiled.rule.criteria {
                RuleCriteria::CapabilityGate {
                    capabilities,
                    except,
                    max_executions_per_session,
                } => capability.is_some_and(|cap| {
                    targets(capabilities, except, cap)
                        && max_executions_per_session.is_none_or(|max| {
                            self.ledger.executions_matching(&session_key, |c| {
                                targets(capabilities, except, c)
                            }) >= max
                        })
                }),
                RuleCriteria::RateLimit {
                    scope,
                    max_requests_per_minute,
                    max_requests_per_hour,
                    max_requests_per_day,
                    max_tokens_per_minute,
                    max_tokens_per_hour,
                    max_tokens_per_day,
                } => {
                    let snap = usage.scoped(*scope);
                    let over = |limit: Option<u32>, used: u32| limit.is_some_and(|l| used >= l);
                    let over_tokens =
                        |limit: Option<u64>, used: u64| limit.is_some_and(|l| used + tokens > l);
                    over(*max_requests_per_minute, snap.requests_minute)
                        || over(*max_requests_per_hour, snap.requests_hour)
                        || over(*max_requests_per_day, snap.requests_day)
                        || over_tokens(*max_tokens_per_minute, snap.tokens_minute)
                        || over_tokens(*max_tokens_per_hour, snap.tokens_hour)
                        || over_tokens(*max_tokens_per_day, snap.tokens_day)
                }
                RuleCriteria::ContentFilter {
                    blocked_keywords,
                    max_input_length,
                    ..
                } => {
                    max_input_length.is_some_and(|max| request.query.chars().count() > max)
                        || compiled.content_hit(blocked_keywords, &request.query)
                }
                RuleCriteria::CostLimit {
                    unit_cost_per_1k_tokens,
                    max_cost_per_request,
                    max_cost_per_session,
                    max_cost_per_day,
                } => {
                    let cost_of = |t: u64| t as f64 / 1000.0 * unit_cost_per_1k_tokens;
                    let cost = cost_of(tokens);
                    max_cost_per_request.is_some_and(|max| cost > max)
                        || max_cost_per_session
                            .is_some_and(|max| cost_of(usage.session().lifetime_tokens) + cost > max)
                        || max_cost_per_day
                            .is_some_and(|max| cost_of(usage.global().tokens_day) + cost > max)
                }
                RuleCriteria::AccessControl {
                    allowed_users,
                    blocked_users,
                } => {
                    let user = request.user_id.as_deref().unwrap_or("anonymous");
                    blocked_users.iter().any(|u| u == user)
                        || (!allowed_users.is_empty() && !allowed_users.iter().any(|u| u == user))
                }
            };
            if matched {
                triggered.push((Self::triggered(compiled), order));
            }
        }
        drop(rules);

        let decision = PolicyDecision::from_triggered(triggered);
        Self::trace(&decision, &request.session_id, capability);
        decision
    }

    fn decide_output(&self, output: &str) -> PolicyDecision {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let mut triggered = Vec::new();
        for (order, compiled) in rules.iter().enumerate().filter(|(_, r)| r.rule.enabled) {
            if let RuleCriteria::ContentFilter {
                blocked_keywords,
                max_output_length,
                ..
            } = &compiled.rule.criteria
            {
                let matched = max_output_length.is_some_and(|max| output.chars().count() > max)
                    || compiled.content_hit(blocked_keywords, output);
                if matched {
                    triggered.push((Self::triggered(compiled), order));
                }
            }
        }
        PolicyDecision::from_triggered(triggered)
    }

    fn triggered(compiled: &CompiledRule) -> TriggeredRule {
        TriggeredRule {
            rule_id: compiled.rule.id.clone(),
            rule_type: compiled.rule.rule_type(),
            action: compiled.rule.effective_action(),
            priority: compiled.rule.priority,
            message: compiled.message(),
        }
    }

    fn trace(decision: &PolicyDecision, session_id: &str, capability: Option<&str>) {
        let rule = decision.deciding_rule().unwrap_or("-");
        match decision.action {
            PolicyAction::Deny => warn!(
                session_id = %session_id,
                capability = ?capability,
                rule = %rule,
                "Policy DENIED request: {}",
                decision.message
            ),
            PolicyAction::RequireApproval => info!(
                session_id = %session_id,
                capability = ?capability,
                rule = %rule,
                "Policy requires APPROVAL: {}",
                decision.message
            ),
            PolicyAction::Throttle => info!(
                session_id = %session_id,
                capability = ?capability,
                rule = %rule,
                "Policy THROTTLED request"
            ),
            PolicyAction::Warn => warn!(
                session_id = %session_id,
                capability = ?capability,
                rule = %rule,
                "Policy WARNING: {}",
                decision.message
            ),
            PolicyAction::Allow => debug!(session_id = %session_id, capability = ?capability, "Policy allowed"),
        }
    }

    async fn record_violations(
        &self,
        request: &ExecutionRequest,
        capability: Option<&str>,
        decision: &PolicyDecision,
    ) {
        if decision.action == PolicyAction::Allow {
            return;
        }
        let records: Vec<ViolationRecord> = decision
            .triggered
            .iter()
            .filter(|t| t.action != PolicyAction::Allow)
            .map(|t| ViolationRecord {
                id: Uuid::new_v4().to_string(),
                timestamp: decision.timestamp,
                session_id: request.session_id.clone(),
                user_id: request.user_id.clone(),
                request_id: request.request_id.clone(),
                rule_id: t.rule_id.clone(),
                rule_type: t.rule_type,
                action: t.action,
                capability: capability.map(String::from),
                message: t.message.clone(),
            })
            .collect();

        {
            let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
            for record in &records {
                if log.len() >= self.log_limit {
                    let drop_n = (self.log_limit / 10).max(1).min(log.len());
                    log.drain(..drop_n);
                }
                log.push(record.clone());
            }
        }

        let Some(sink) = &self.sink else {
            return;
        };
        for record in &records {
            let encoded = match Envelope::encode(VIOLATION_SCHEMA, VIOLATION_VERSION, record) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(error = %e, "Failed to encode violation record");
                    continue;
                }
            };
            if let Err(e) = sink.append(VIOLATION_STREAM, encoded).await {
                warn!(store = sink.name(), error = %e, "Failed to persist violation record");
            }
        }
    }
}
