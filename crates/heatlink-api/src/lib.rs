//! HTTP/WebSocket facade.
//!
//! A thin translator: reads serve state snapshots, every mutation goes
//! through the command bus with an awaited verdict, and the WebSocket
//! endpoint streams the same typed events the Modbus reflector consumes.

pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use heatlink_core::{CommandBus, StateStore};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<StateStore>,
    pub commands: CommandBus,
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/devices", get(handlers::list_devices))
        .route("/api/devices/:id", get(handlers::get_device))
        .route("/api/devices/:id/setpoint", put(handlers::set_setpoint))
        .route("/api/devices/:id/auto", put(handlers::set_auto))
        .route("/api/devices/:id/fan", put(handlers::set_fan))
        .route("/api/devices/:id/emergency", post(handlers::emergency_stop))
        .route(
            "/api/devices/:id/emergency/reset",
            post(handlers::reset_emergency),
        )
        .route("/api/events", get(ws::events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
