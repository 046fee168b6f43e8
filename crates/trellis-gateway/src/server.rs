use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use trellis_core::config::GatewayConfig;
use trellis_engine::{ChatBroker, Interpreter};
use trellis_store::FileAgentRepository;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway built on axum: agent CRUD, execute-by-name, and the
/// send/poll chat surface over the human-in-the-loop broker.
pub struct GatewayServer {
    config: GatewayConfig,
    repository: Arc<FileAgentRepository>,
    interpreter: Arc<Interpreter>,
    chat: Arc<ChatBroker>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        repository: Arc<FileAgentRepository>,
        interpreter: Arc<Interpreter>,
        chat: Arc<ChatBroker>,
    ) -> Self {
        Self {
            config,
            repository,
            interpreter,
            chat,
        }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            repository: self.repository.clone(),
            interpreter: self.interpreter.clone(),
            chat: self.chat.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/agents", get(routes::list_agents))
            .route("/api/agents/run", post(routes::run_agent))
            .route(
                "/api/agents/{name}",
                get(routes::get_agent).put(routes::save_agent),
            )
            .route("/api/chat/send", post(routes::chat_send))
            .route("/api/chat/messages", get(routes::chat_messages))
            .route("/api/chat/pending", get(routes::chat_pending))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve until the process is stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "gateway listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
