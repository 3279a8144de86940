//! HTTP server construction and the running server handle.
//!
//! # Responsibilities
//! - Load the watched config and capture it in the handler state
//! - Build the router: every method and path answers with the message
//! - Wire up middleware (request deadline, tracing)
//! - Bind, spawn the serve loop, and report its exit on the done channel

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::any,
    Router,
};
use tokio::sync::{mpsc, oneshot};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::loader::load_message_config;
use crate::config::schema::{MessageConfig, Settings, TimeoutConfig};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{serve, DrainOutcome, Listener, ListenerError};

/// Sent by a server runner once its serve loop has fully stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerExit {
    pub generation: u64,
    pub outcome: DrainOutcome,
}

/// Builds fresh server instances from the current file contents.
#[derive(Debug, Clone)]
pub struct ServerFactory {
    config_path: PathBuf,
    bind_address: String,
    timeouts: TimeoutConfig,
}

impl ServerFactory {
    pub fn new(settings: &Settings) -> Self {
        Self {
            config_path: settings.config_path.clone(),
            bind_address: settings.listener.bind_address.clone(),
            timeouts: settings.timeouts,
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Bind every later server to `addr`, the address the first one got.
    ///
    /// Only matters when the configured port was 0.
    pub fn pin_address(&mut self, addr: SocketAddr) {
        self.bind_address = addr.to_string();
    }

    /// Load the config from disk and build a server. Does not bind.
    pub fn build(&self) -> HttpServer {
        let server = HttpServer::new(
            load_message_config(&self.config_path),
            self.bind_address.clone(),
            self.timeouts,
        );
        tracing::info!(
            path = %self.config_path.display(),
            message = %server.message(),
            "Loaded config map"
        );
        server
    }
}

/// A configured server that is not listening yet.
pub struct HttpServer {
    router: Router,
    config: Arc<MessageConfig>,
    bind_address: String,
    timeouts: TimeoutConfig,
}

impl HttpServer {
    pub fn new(config: MessageConfig, bind_address: String, timeouts: TimeoutConfig) -> Self {
        let config = Arc::new(config);
        let router = Self::build_router(Arc::clone(&config), &timeouts);
        Self {
            router,
            config,
            bind_address,
            timeouts,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: Arc<MessageConfig>, timeouts: &TimeoutConfig) -> Router {
        Router::new()
            .route("/", any(echo_message))
            .route("/{*path}", any(echo_message))
            .with_state(config)
            .layer(TimeoutLayer::new(timeouts.write()))
            .layer(TraceLayer::new_for_http())
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn message(&self) -> &str {
        &self.config.message
    }

    /// Bind the listener and spawn the serve loop.
    ///
    /// The runner sends one [`ServerExit`] on `done` after it stops.
    pub async fn start(
        self,
        generation: u64,
        done: mpsc::Sender<ServerExit>,
    ) -> Result<ServerHandle, ListenerError> {
        let listener = Listener::bind(&self.bind_address).await?;
        let local_addr = listener.local_addr();
        let tracker = ConnectionTracker::new();
        let (stop_tx, stop_rx) = oneshot::channel();

        let runner_tracker = tracker.clone();
        let router = self.router;
        let timeouts = self.timeouts;
        tokio::spawn(async move {
            tracing::info!(generation, address = %local_addr, "Server is ready to handle requests");
            let outcome = serve(listener, router, timeouts, runner_tracker, stop_rx).await;
            tracing::info!(generation, ?outcome, "Server stopped");
            let _ = done.send(ServerExit { generation, outcome }).await;
        });

        Ok(ServerHandle {
            generation,
            local_addr,
            config: self.config,
            tracker,
            stop: stop_tx,
        })
    }
}

/// The live server currently bound to the address.
pub struct ServerHandle {
    generation: u64,
    local_addr: SocketAddr,
    config: Arc<MessageConfig>,
    tracker: ConnectionTracker,
    stop: oneshot::Sender<Duration>,
}

impl ServerHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn message(&self) -> &str {
        &self.config.message
    }

    pub fn open_connections(&self) -> u64 {
        self.tracker.open_count()
    }

    /// Stop accepting, close keep-alive connections, and give in-flight
    /// requests `grace` to finish. Returns `false` if the runner is gone.
    pub fn shutdown(self, grace: Duration) -> bool {
        tracing::info!(
            generation = self.generation,
            open_connections = self.open_connections(),
            grace_ms = grace.as_millis() as u64,
            "Server is shutting down"
        );
        self.stop.send(grace).is_ok()
    }
}

async fn echo_message(State(config): State<Arc<MessageConfig>>) -> impl IntoResponse {
    (StatusCode::OK, config.message.clone())
}
