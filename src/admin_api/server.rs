use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::admin_api::routes::AppState;
use crate::admin_api::{auth, routes};

pub struct AdminApiServer {
    state: AppState,
    bind_addr: String,
}

impl AdminApiServer {
    pub fn new(state: AppState, bind_addr: String) -> Self {
        Self { state, bind_addr }
    }

    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let api_key = state.api_key.clone();

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/waf/stats", get(routes::get_stats))
            .route("/api/waf/health", get(routes::get_health))
            .route("/api/waf/events", get(routes::get_events))
            .route("/api/waf/events/{id}", get(routes::get_event))
            .route("/api/waf/reputation/{ip}", get(routes::get_reputation))
            .route("/api/waf/blocked/{ip}", delete(routes::unblock_ip))
            .route("/api/waf/rules/reload", post(routes::reload_rules))
            .layer(middleware::from_fn_with_state(api_key, auth::auth_middleware))
            .layer(cors)
            .with_state(state)
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API listening");
        axum::serve(listener, app).await?;

        Ok(())
    }
}
