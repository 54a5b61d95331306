//! Policy data model: the rules that gate requests and capability calls.

use routewise_core::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A set of policy rules loaded from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a TOML string (`[[policies]]` tables).
    pub fn from_toml(toml_str: &str) -> Result<Self, PolicyError> {
        let set: PolicySet =
            toml::from_str(toml_str).map_err(|e| PolicyError::Parse(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    /// Load rules from a TOML file.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PolicyError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// The built-in rules used when no policy file is configured.
    pub fn defaults() -> Self {
        Self {
            policies: vec![
                PolicyRule {
                    id: "default_blocked_capabilities".into(),
                    description: "Block dangerous operations".into(),
                    action: Some(PolicyAction::Deny),
                    message: "This capability is blocked by policy".into(),
                    enabled: true,
                    priority: 100,
                    criteria: RuleCriteria::CapabilityGate {
                        capabilities: vec!["system_command".into(), "file_delete".into()],
                        except: vec![],
                        max_executions_per_session: None,
                    },
                },
                PolicyRule {
                    id: "default_session_executions".into(),
                    description: "Cap capability executions per session".into(),
                    action: Some(PolicyAction::Deny),
                    message: "Session execution limit reached".into(),
                    enabled: true,
                    priority: 90,
                    criteria: RuleCriteria::CapabilityGate {
                        capabilities: vec!["*".into()],
                        except: vec![],
                        max_executions_per_session: Some(100),
                    },
                },
                PolicyRule {
                    id: "default_rate_limit".into(),
                    description: "Prevent abuse with reasonable limits".into(),
                    action: Some(PolicyAction::Throttle),
                    message: "Rate limit exceeded".into(),
                    enabled: true,
                    priority: 50,
                    criteria: RuleCriteria::RateLimit {
                        scope: RateScope::Session,
                        max_requests_per_minute: Some(60),
                        max_requests_per_hour: Some(1000),
                        max_requests_per_day: None,
                        max_tokens_per_minute: Some(50_000),
                        max_tokens_per_hour: None,
                        max_tokens_per_day: None,
                    },
                },
                PolicyRule {
                    id: "default_content_filter".into(),
                    description: "Basic content safety".into(),
                    action: Some(PolicyAction::Deny),
                    message: "Content violates policy".into(),
                    enabled: true,
                    priority: 40,
                    criteria: RuleCriteria::ContentFilter {
                        blocked_keywords: vec![],
                        blocked_patterns: vec![],
                        max_input_length: Some(10_000),
                        max_output_length: Some(50_000),
                    },
                },
            ],
        }
    }

    /// Add a rule. Fails if the id is already taken.
    pub fn add(&mut self, rule: PolicyRule) -> Result<(), PolicyError> {
        if self.get(&rule.id).is_some() {
            return Err(PolicyError::DuplicateRule(rule.id));
        }
        rule.validate()?;
        self.policies.push(rule);
        Ok(())
    }

    /// Remove a rule by id. Returns `true` if found.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.policies.len();
        self.policies.retain(|r| r.id != id);
        self.policies.len() < before
    }

    pub fn get(&self, id: &str) -> Option<&PolicyRule> {
        self.policies.iter().find(|r| r.id == id)
    }

    /// Validate all rules and id uniqueness.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (i, rule) in self.policies.iter().enumerate() {
            rule.validate()?;
            if self.policies[..i].iter().any(|r| r.id == rule.id) {
                return Err(PolicyError::DuplicateRule(rule.id.clone()));
            }
        }
        Ok(())
    }

    /// Number of enabled rules.
    pub fn active_count(&self) -> usize {
        self.policies.iter().filter(|r| r.enabled).count()
    }
}

/// A single policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique id for this rule.
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// What to do when the rule matches. Defaults per rule type
    /// (throttle for rate limits, deny for everything else).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PolicyAction>,

    /// Message surfaced to the user when this rule decides the verdict.
    #[serde(default)]
    pub message: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Higher = listed first among triggering rules. Ties keep declaration order.
    #[serde(default)]
    pub priority: i32,

    #[serde(flatten)]
    pub criteria: RuleCriteria,
}

fn default_true() -> bool {
    true
}

impl PolicyRule {
    pub fn effective_action(&self) -> PolicyAction {
        self.action.unwrap_or_else(|| self.criteria.default_action())
    }

    pub fn rule_type(&self) -> RuleType {
        self.criteria.rule_type()
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.id.trim().is_empty() {
            return Err(PolicyError::InvalidRule {
                rule_id: "(empty)".into(),
                reason: "rule id cannot be empty".into(),
            });
        }
        let invalid = |reason: &str| PolicyError::InvalidRule {
            rule_id: self.id.clone(),
            reason: reason.into(),
        };
        match &self.criteria {
            RuleCriteria::ContentFilter { blocked_patterns, .. } => {
                for pattern in blocked_patterns {
                    compile_pattern(pattern).map_err(|e| invalid(&e))?;
                }
            }
            RuleCriteria::CostLimit { unit_cost_per_1k_tokens, .. } => {
                if !unit_cost_per_1k_tokens.is_finite() || *unit_cost_per_1k_tokens < 0.0 {
                    return Err(invalid("unit_cost_per_1k_tokens must be a non-negative number"));
                }
            }
            RuleCriteria::RateLimit {
                max_requests_per_minute,
                max_requests_per_hour,
                max_requests_per_day,
                max_tokens_per_minute,
                max_tokens_per_hour,
                max_tokens_per_day,
                ..
            } => {
                let any_limit = max_requests_per_minute.is_some()
                    || max_requests_per_hour.is_some()
                    || max_requests_per_day.is_some()
                    || max_tokens_per_minute.is_some()
                    || max_tokens_per_hour.is_some()
                    || max_tokens_per_day.is_some();
                if !any_limit {
                    return Err(invalid("rate limit rule sets no limit"));
                }
            }
            RuleCriteria::CapabilityGate { .. } | RuleCriteria::AccessControl { .. } => {}
        }
        Ok(())
    }
}

/// Compile a case-insensitive content pattern.
pub(crate) fn compile_pattern(pattern: &str) -> Result<regex_lite::Regex, String> {
    regex_lite::Regex::new(&format!("(?i){pattern}"))
        .map_err(|e| format!("invalid pattern '{pattern}': {e}"))
}

/// Type-specific match criteria, tagged by `type` in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCriteria {
    /// Matches calls to the listed capabilities (`*` = all, minus `except`);
    /// with `max_executions_per_session`, only once the session reached it.
    #[serde(alias = "capability-gate")]
    CapabilityGate {
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        except: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_executions_per_session: Option<u32>,
    },

    /// Rolling request/token windows per session (or per user).
    #[serde(alias = "rate-limit")]
    RateLimit {
        #[serde(default)]
        scope: RateScope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_requests_per_minute: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_requests_per_hour: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_requests_per_day: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens_per_minute: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens_per_hour: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens_per_day: Option<u64>,
    },

    /// Length limits, case-insensitive keywords and regex patterns.
    #[serde(alias = "content-filter")]
    ContentFilter {
        #[serde(default)]
        blocked_keywords: Vec<String>,
        #[serde(default)]
        blocked_patterns: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_input_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_output_length: Option<usize>,
    },

    /// Estimated token cost ceilings.
    #[serde(alias = "cost-limit")]
    CostLimit {
        #[serde(default = "default_unit_cost")]
        unit_cost_per_1k_tokens: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_cost_per_request: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_cost_per_session: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_cost_per_day: Option<f64>,
    },

    /// User allow/block lists.
    #[serde(alias = "access-control")]
    AccessControl {
        #[serde(default)]
        allowed_users: Vec<String>,
        #[serde(default)]
        blocked_users: Vec<String>,
    },
}

fn default_unit_cost() -> f64 {
    0.001
}

impl RuleCriteria {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleCriteria::CapabilityGate { .. } => RuleType::CapabilityGate,
            RuleCriteria::RateLimit { .. } => RuleType::RateLimit,
            RuleCriteria::ContentFilter { .. } => RuleType::ContentFilter,
            RuleCriteria::CostLimit { .. } => RuleType::CostLimit,
            RuleCriteria::AccessControl { .. } => RuleType::AccessControl,
        }
    }

    pub fn default_action(&self) -> PolicyAction {
        match self {
            RuleCriteria::RateLimit { .. } => PolicyAction::Throttle,
            _ => PolicyAction::Deny,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    CapabilityGate,
    RateLimit,
    ContentFilter,
    CostLimit,
    AccessControl,
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RuleType::CapabilityGate => "capability_gate",
            RuleType::RateLimit => "rate_limit",
            RuleType::ContentFilter => "content_filter",
            RuleType::CostLimit => "cost_limit",
            RuleType::AccessControl => "access_control",
        })
    }
}

/// Which counter a rate limit reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    #[default]
    Session,
    User,
}

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Explicit pass.
    Allow,
    /// Allow, but surface a warning.
    Warn,
    /// Hold back and re-check later.
    Throttle,
    /// Needs out-of-band approval; not auto-allowed.
    #[serde(alias = "require-approval")]
    RequireApproval,
    /// Block.
    Deny,
}

impl PolicyAction {
    /// Restrictiveness rank: Deny > RequireApproval > Throttle > Warn > Allow.
    pub fn severity(&self) -> u8 {
        match self {
            PolicyAction::Allow => 0,
            PolicyAction::Warn => 1,
            PolicyAction::Throttle => 2,
            PolicyAction::RequireApproval => 3,
            PolicyAction::Deny => 4,
        }
    }

    /// Whether the request may proceed.
    pub fn permits(&self) -> bool {
        matches!(self, PolicyAction::Allow | PolicyAction::Warn)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Warn => "warn",
            PolicyAction::Throttle => "throttle",
            PolicyAction::RequireApproval => "require_approval",
            PolicyAction::Deny => "deny",
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
