//! The request orchestrator.
//!
//! Every query moves through a fixed state machine:
//!
//! 1. **Understand**: load conversation context and recall past episodes
//! 2. **Route**: pick a capability (learned preference, reasoning, fallback)
//! 3. **Policy check**: evaluate the capability against the rule set
//! 4. **Execute**: run it under a timeout, retrying once when that is safe
//! 5. **Synthesize**: build the answer and screen it against output rules
//! 6. **Reflect**: record turns and feed reflections to the learning module
//!
//! Outputs carrying URLs may chain into a follow-up capability (back to
//! step 2) when the query asks for depth, up to `max_chain_depth` hops.

pub mod orchestrator;
pub mod outcome;
pub mod router;
pub mod session;
pub mod state;
pub mod synthesis;

pub use orchestrator::{CancelHandle, Orchestrator, OrchestratorSettings};
pub use outcome::{TaskFailure, TaskOutcome, TaskResult};
pub use router::{Route, RouteSource, Router};
pub use session::{SessionSlots, SlotError};
pub use state::{AgentState, StateTrace};
pub use synthesis::{synthesize, Synthesis};
