use std::sync::Arc;

use trellis_engine::{ChatBroker, Interpreter};
use trellis_store::FileAgentRepository;

/// Shared state for all route handlers.
pub struct AppState {
    pub repository: Arc<FileAgentRepository>,
    pub interpreter: Arc<Interpreter>,
    pub chat: Arc<ChatBroker>,
}
