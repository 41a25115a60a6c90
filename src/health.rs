use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Liveness plus a snapshot of the bridge: live sessions, observers, backend
/// link state and delivery counters.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let metrics = state.metrics.snapshot();
    let link_state = state.link.state();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "bridge": {
            "sessions": state.registry.len(),
            "observers": state.observers.len(),
            "backend_link": link_state,
            "backend_configured": config.bridge.backend_ws_url.is_some(),
            "callback_configured": state.router.has_callback(),
            "secret_required": config.bridge.shared_secret.is_some()
        },
        "metrics": metrics
    }))
}
