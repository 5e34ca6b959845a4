//! The Helm concurrency core: per-session agent loops, the durable
//! store contract, the event bus, and the session directory.

pub mod agent;
pub mod events;
pub mod manager;
pub(crate) mod serial;
pub mod state;
pub mod store;

pub use agent::SessionAgent;
pub use events::{AgentEvent, CommittedAction, EventBus, EVENT_BUFFER};
pub use manager::SessionManager;
pub use state::{EntryId, EntryPayload, SessionId, SessionState, ToolCallStatus, TranscriptEntry};
pub use store::{MaterializeRequest, MemoryStore, SessionStore};
