//! Self-evaluation for Routewise.
//!
//! The [`ReflectionModule`] grades routing choices, answers, errors and
//! sessions; the [`LearningModule`] folds those grades into per-category
//! routing preferences that the orchestrator consults on the next request.

pub mod category;
pub mod learning;
pub mod reflection;

pub use category::QueryCategory;
pub use learning::{
    CapabilityPerformance, LearningHandle, LearningModule, LearningStats, LearningSummary,
};
pub use reflection::{
    AnswerScore, AnswerScorer, CapabilityScorer, ErrorCategory, HeuristicScorer, Recovery,
    Reflection, ReflectionDetails, ReflectionKind, ReflectionModule, REFLECTION_STREAM,
};
