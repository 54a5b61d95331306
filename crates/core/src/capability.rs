//! Capability trait: the uniform execution contract for external providers.
//!
//! Capabilities are the agent's only way to act: search documents, evaluate
//! arithmetic, summarize text, choose a route. Whatever happens inside, a
//! capability always answers with a [`CapabilityOutput`]; it never raises
//! past its boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use crate::error::CapabilityError;

/// Kinds of references a capability output may carry and another
/// capability may consume (used for auto-chaining).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Url,
}

/// Static description of a registered capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub description: String,

    /// JSON Schema for the parameters object.
    pub parameters: serde_json::Value,

    pub available: bool,

    /// Whether a failed call may safely be retried.
    #[serde(default = "default_true")]
    pub idempotent: bool,

    /// Reference kind this capability accepts as input, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumes: Option<ReferenceKind>,
}

fn default_true() -> bool {
    true
}

/// The result of a single capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub success: bool,
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub duration_ms: u64,

    /// Optional structured data (sources, chunks, routing choice).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CapabilityOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration_ms: 0,
            data: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms: 0,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// The core Capability trait.
///
/// Implementations are registered in the [`CapabilityRegistry`] and invoked
/// by the orchestrator. `execute` must convert every internal failure into a
/// `CapabilityOutput` with `success = false`.
#[async_trait]
pub trait Capability: Send + Sync {
    /// The unique name of this capability (e.g., "calculator").
    fn name(&self) -> &str;

    /// Natural-language description (fed to the reasoning capability).
    fn description(&self) -> &str;

    /// JSON Schema describing this capability's parameters.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" }
            },
            "required": ["query"]
        })
    }

    fn is_available(&self) -> bool {
        true
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn consumes(&self) -> Option<ReferenceKind> {
        None
    }

    /// Execute with the given parameters.
    async fn execute(&self, parameters: serde_json::Value) -> CapabilityOutput;

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
            available: self.is_available(),
            idempotent: self.idempotent(),
            consumes: self.consumes(),
        }
    }
}

/// A registry of available capabilities.
///
/// Names are unique; listing preserves registration order so fallback
/// routing ("first available") is deterministic.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    order: Vec<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a capability. Fails if the name is already taken.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), CapabilityError> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(CapabilityError::AlreadyRegistered(name));
        }
        self.order.push(name.clone());
        self.capabilities.insert(name, capability);
        Ok(())
    }

    /// Look up the descriptor of a capability.
    pub fn get(&self, name: &str) -> Result<CapabilityDescriptor, CapabilityError> {
        self.capabilities
            .get(name)
            .map(|c| c.descriptor())
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))
    }

    /// Get an executable handle for a capability.
    pub fn capability(&self, name: &str) -> Result<Arc<dyn Capability>, CapabilityError> {
        self.capabilities
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))
    }

    /// All descriptors, in registration order.
    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.capabilities.get(name))
            .map(|c| c.descriptor())
            .collect()
    }

    /// One `- name: description` line per available capability not in `exclude`.
    pub fn describe_for_prompt(&self, exclude: &[&str]) -> String {
        self.list()
            .into_iter()
            .filter(|d| d.available && !exclude.contains(&d.name.as_str()))
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The first available capability in registration order, skipping `exclude`.
    pub fn first_available(&self, exclude: &[&str]) -> Option<CapabilityDescriptor> {
        self.list()
            .into_iter()
            .find(|d| d.available && !exclude.contains(&d.name.as_str()))
    }

    /// Available capabilities accepting the given reference kind.
    pub fn consumers_of(&self, kind: ReferenceKind) -> Vec<CapabilityDescriptor> {
        self.list()
            .into_iter()
            .filter(|d| d.available && d.consumes == Some(kind))
            .collect()
    }

    /// List all registered capability names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
