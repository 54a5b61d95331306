//! # Routewise Core
//!
//! Domain types, traits, and error definitions for the Routewise
//! task-routing agent. This crate has no framework dependencies: it defines
//! the model every other crate implements against.
//!
//! ## Layout
//!
//! Every external collaborator is a trait here (capabilities, session and
//! log stores, retrievers). Implementations live in their own crates, which
//! keeps the dependency graph pointing inward and makes stubbing trivial in
//! tests.

pub mod error;
pub mod message;
pub mod request;
pub mod capability;
pub mod store;
pub mod retrieval;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{CapabilityError, Error, ErrorKind, MemoryError, PolicyError, Result};
pub use message::{ConversationTurn, Role, TurnDraft};
pub use request::{ExecutionRequest, ExecutionResult};
pub use capability::{
    Capability, CapabilityDescriptor, CapabilityOutput, CapabilityRegistry, ReferenceKind,
};
pub use store::{Envelope, LogStore, SessionStore};
pub use retrieval::{RetrievedChunk, Retriever};
pub use event::{DomainEvent, EventBus};
