// Real-time chat session client: one STOMP session multiplexing chat
// contexts, and per-contact conversation state on top of it.
pub mod api;
pub mod config;
pub mod models;
pub mod session;
pub mod stomp;
pub mod store;
pub mod transport;

// Re-export main types for convenience
pub use api::{ApiError, ChatApi, HttpChatApi};
pub use config::ChatConfig;
pub use models::*;
pub use session::{SessionError, SessionManager};
pub use store::{ConversationStore, LoadOutcome, StoreError, StoreEvent};
