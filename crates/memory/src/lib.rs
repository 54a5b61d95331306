//! Memory components for Routewise: conversation buffers, the episodic
//! store, and the storage backends they persist through.

pub mod in_memory;
pub mod file_backend;
pub mod text;
pub mod conversation;
pub mod episodic;

pub use in_memory::{InMemoryLogStore, InMemorySessionStore};
pub use file_backend::{FileSessionStore, JsonlLogStore};
pub use conversation::{ConversationMemory, ConversationStats};
pub use episodic::{format_episode_context, Episode, EpisodeMatch, EpisodeOutcome, EpisodicStore};
