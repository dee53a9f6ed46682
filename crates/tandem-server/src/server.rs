use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use tandem_settings::TandemSettings;
use tandem_store::Database;

use crate::broker::RelayBroker;
use crate::routes;
use crate::runtime::{Runtime, RuntimeConfig};
use crate::shutdown::ShutdownCoordinator;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(routes::user_socket))
        .route("/ws/agent", get(routes::agent_socket))
        .route("/ws/session", get(routes::session_socket))
        .route("/sessions", post(routes::create_session))
        .route("/sessions/{id}", get(routes::get_session).delete(routes::delete_session))
        .route("/sessions/{id}/join", post(routes::join_session))
        .route("/sessions/{id}/leave", post(routes::leave_session))
        .route("/sessions/{id}/start", post(routes::start_session))
        .route("/sessions/{id}/pause", post(routes::pause_session))
        .route("/sessions/{id}/resume", post(routes::resume_session))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener, start relaying broker traffic and serve until
/// shutdown. Returns a handle to stop it.
pub async fn start(
    settings: &TandemSettings,
    db: Database,
    broker: Arc<dyn RelayBroker>,
) -> Result<ServerHandle, std::io::Error> {
    let runtime = Runtime::new(db, broker, RuntimeConfig::from_settings(settings));
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    serve(runtime, &addr).await
}

/// Serve an already-built runtime on `addr`.
pub async fn serve(runtime: Arc<Runtime>, addr: &str) -> Result<ServerHandle, std::io::Error> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let relay = runtime.spawn_relay_listener(shutdown.token());

    let router = build_router(AppState {
        runtime: runtime.clone(),
        shutdown: shutdown.clone(),
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    info!(
        port = local_addr.port(),
        instance_id = %runtime.instance,
        broker = runtime.fanout.broker_name(),
        "tandem server started"
    );

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        runtime,
        shutdown,
        tasks: vec![server, relay],
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    runtime: Arc<Runtime>,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Stop accepting requests and wait up to `timeout` for in-flight work.
    pub async fn shutdown(self, timeout: Duration) {
        self.shutdown.graceful_shutdown(self.tasks, Some(timeout)).await;
        info!("tandem server stopped");
    }
}
