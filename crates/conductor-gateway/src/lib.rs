//! `conductor-gateway` – HTTP + WebSocket boundary of the orchestrator.
//!
//! [`GatewayServer`] serves the `/api/v1` command, status, metrics, mode and
//! emergency-stop endpoints (see [`router`]) with `axum`, and upgrades
//! `/api/v1/telemetry` to a live WebSocket stream of fused frames and mode
//! transitions (see [`stream`]).
//!
//! # Usage
//!
//! ```rust,no_run
//! use conductor_gateway::GatewayServer;
//! use conductor_runtime::{Orchestrator, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = Orchestrator::new(OrchestratorConfig::default());
//!     GatewayServer::new(orchestrator)
//!         .with_port(8080)
//!         .run()
//!         .await
//!         .expect("gateway failed");
//! }
//! ```

pub mod router;
pub mod server;
pub mod stream;

pub use router::{GatewayState, api_router};
pub use server::{DEFAULT_COMMANDS_PER_SECOND, DEFAULT_PORT, GatewayServer};
