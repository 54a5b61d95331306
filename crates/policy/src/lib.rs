//! Policies: declarative guardrails for capability routing.
//!
//! Policies are loaded from TOML and evaluated before every capability call
//! (and against produced answers). Each rule has a type with its own match
//! criteria:
//!
//! - capability gates ("never run `system_command`", "at most 100 calls per session")
//! - rolling request and token rate limits per session or user
//! - content filters on input and output (keywords, regexes, lengths)
//! - estimated cost ceilings per request, session and day
//! - user allow and block lists
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Orchestrator │───▶│   Policy     │───▶│  Capability  │
//! │ (route/exec) │    │   Engine     │    │   Registry   │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!                           │
//!                  ┌────────┴────────┐
//!                  │ PolicyDecision  │
//!                  │ Allow / Warn    │
//!                  │ Throttle        │
//!                  │ RequireApproval │
//!                  │ Deny            │
//!                  └─────────────────┘
//! ```
//!
//! The most restrictive matching action wins, so a matching deny is never
//! overridden by an allow of higher priority.
//!
//! # Example Policy
//!
//! ```toml
//! [[policies]]
//! id = "no-shell"
//! description = "Never execute shell commands"
//! type = "capability_gate"
//! capabilities = ["system_command"]
//! action = "deny"
//! message = "Shell access is disabled"
//! priority = 100
//! ```

mod engine;
mod ledger;
mod model;

pub use engine::{PolicyDecision, PolicyEngine, TriggeredRule, ViolationRecord, VIOLATION_STREAM};
pub use ledger::{UsageLedger, UsageSnapshot};
pub use model::{PolicyAction, PolicyRule, PolicySet, RateScope, RuleCriteria, RuleType};
pub use routewise_core::error::PolicyError;
