//! Parley Relay Server
//!
//! Real-time presence and message relay for friend-gated direct messaging.
//!
//! 1. **Presence**: tracks every live WebSocket per user. A user is online
//!    while at least one connection is bound; the first connection and the
//!    last disconnect are announced to everyone else exactly once.
//!
//! 2. **Direct messages**: a message is only accepted between mutually
//!    accepted friends. It is persisted first, then delivered to every live
//!    connection of the recipient, and echoed to the sender as its ack.
//!
//! 3. **Typing indicators**: ephemeral, forwarded to the recipient's live
//!    connections and never stored.
//!
//! The HTTP API under `/api` exposes friend management and message history
//! from the same SQLite database.

mod api;
mod auth;
mod error;
mod handler;
mod presence;
mod protocol;
mod relay;
mod state;
mod store;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use relay::DEFAULT_MAX_MESSAGE_LEN;
use state::{AuthMode, RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "parley-relay", version, about = "Parley presence and message relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// SQLite database file. Omit to keep everything in memory.
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// How connections authenticate
    #[arg(long, value_enum, default_value_t = AuthMode::Trusted, env = "AUTH_MODE")]
    auth_mode: AuthMode,

    /// Hex-encoded Ed25519 public key of the token issuer (signed mode)
    #[arg(long, env = "AUTH_PUBLIC_KEY")]
    auth_public_key: Option<String>,

    /// Only forward typing indicators between friends
    #[arg(long, env = "TYPING_REQUIRES_FRIENDSHIP")]
    typing_requires_friendship: bool,

    /// Maximum message length in characters
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_LEN, env = "MAX_MESSAGE_LEN")]
    max_message_len: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            port: self.port,
            database_path: self.database_path,
            auth_mode: self.auth_mode,
            auth_public_key: self.auth_public_key,
            typing_requires_friendship: self.typing_requires_friendship,
            max_message_len: self.max_message_len,
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "parley_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let state = match RelayState::new(args.into_config()) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize relay");
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", state.config.port);
    let app = build_router(state);

    tracing::info!("Parley relay server starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = addr.as_str(), "Failed to bind address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

/// Assemble every route with CORS and request tracing.
fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/info", get(info_handler))
        .merge(api::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "parley-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_users": state.online_count(),
        "live_connections": state.connection_count(),
    }))
}

/// Server info endpoint. Also handy for client-side latency checks.
async fn info_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "service": "parley-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "auth_mode": format!("{:?}", state.config.auth_mode).to_lowercase(),
        "typing_requires_friendship": state.config.typing_requires_friendship,
        "max_message_len": state.config.max_message_len,
        "online_users": state.online_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
