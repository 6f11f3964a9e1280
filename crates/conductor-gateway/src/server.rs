//! [`GatewayServer`] – HTTP + WebSocket boundary of the orchestrator.
//!
//! Listens on `0.0.0.0:8080` (configurable via [`GatewayServer::with_port`])
//! and serves the [`api_router`] with `axum`.

use std::net::SocketAddr;

use conductor_runtime::Orchestrator;
use conductor_types::ConductorError;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::{GatewayState, api_router};

/// Default TCP port for the gateway.
pub const DEFAULT_PORT: u16 = 8080;
/// Default command submissions allowed per second.
pub const DEFAULT_COMMANDS_PER_SECOND: u32 = 20;

// ---------------------------------------------------------------------------
// GatewayServer
// ---------------------------------------------------------------------------

pub struct GatewayServer {
    orchestrator: Orchestrator,
    port: u16,
    commands_per_second: u32,
}

impl GatewayServer {
    /// Create a gateway for `orchestrator` on the [`DEFAULT_PORT`].
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            port: DEFAULT_PORT,
            commands_per_second: DEFAULT_COMMANDS_PER_SECOND,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_rate_limit(mut self, commands_per_second: u32) -> Self {
        self.commands_per_second = commands_per_second;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the configured port and serve until the process exits.
    ///
    /// # Errors
    ///
    /// [`ConductorError::Io`] if the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<(), ConductorError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConductorError::Io(format!("gateway bind error on {addr}: {e}")))?;
        info!(%addr, "gateway listening");
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ConductorError> {
        let app = api_router(GatewayState::new(self.orchestrator, self.commands_per_second));
        axum::serve(listener, app)
            .await
            .map_err(|e| ConductorError::Io(format!("gateway server error: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
