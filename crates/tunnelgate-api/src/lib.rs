//! HTTP control API
//!
//! Every route lives under `/api/v1` and, except for the health check,
//! requires the API key. The OpenAPI document is served at `/api/openapi.json`
//! with Swagger UI at `/swagger-ui`.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, patch, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tunnelgate_control::Coordinator;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use error::{ApiError, ApiResult};

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Tunnelgate API",
        version = "0.1.0",
        description = "Control API for WireGuard clients and their public tunnels",
    ),
    paths(
        handlers::health_check,
        handlers::register,
        handlers::create_tunnel,
        handlers::list_tunnels,
        handlers::get_tunnel,
        handlers::delete_tunnel,
        handlers::list_clients,
        handlers::get_client,
        handlers::update_client_status,
        handlers::delete_client,
        handlers::reconcile,
        handlers::reset,
        handlers::get_domain,
        handlers::set_domain,
    ),
    components(
        schemas(
            models::RegisterRequest,
            models::RegisterResponse,
            models::Client,
            models::ClientList,
            models::UpdateClientStatusRequest,
            models::TunnelStatus,
            models::Tunnel,
            models::TunnelList,
            models::CreateTunnelRequest,
            models::CreateTunnelResponse,
            models::OrphanedPeerInfo,
            models::ReconcileResponse,
            models::DomainSettings,
            models::UpdateDomainRequest,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "clients", description = "Client registration and management"),
        (name = "tunnels", description = "Tunnel lifecycle endpoints"),
        (name = "maintenance", description = "Reconciliation and reset"),
        (name = "settings", description = "Runtime settings"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Key required on every route except the health check
    pub api_key: String,
    /// Enable CORS
    pub enable_cors: bool,
    /// Allowed CORS origins (if None, allows all)
    pub cors_origins: Option<Vec<String>>,
}

impl ApiServerConfig {
    pub fn new(bind_addr: SocketAddr, api_key: impl Into<String>) -> Self {
        Self {
            bind_addr,
            api_key: api_key.into(),
            enable_cors: false,
            cors_origins: None,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, coordinator: Arc<Coordinator>) -> Self {
        let state = Arc::new(AppState { coordinator });
        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();
        let key_state = Arc::new(middleware::ApiKeyState::new(&self.config.api_key));

        let public_router = Router::new()
            .route("/api/v1/health", get(handlers::health_check))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route("/api/v1/register", post(handlers::register))
            .route(
                "/api/v1/tunnels",
                get(handlers::list_tunnels).post(handlers::create_tunnel),
            )
            .route(
                "/api/v1/tunnels/{id}",
                get(handlers::get_tunnel).delete(handlers::delete_tunnel),
            )
            .route("/api/v1/clients", get(handlers::list_clients))
            .route(
                "/api/v1/clients/{id}",
                get(handlers::get_client).delete(handlers::delete_client),
            )
            .route(
                "/api/v1/clients/{id}/status",
                patch(handlers::update_client_status),
            )
            .route("/api/v1/reconcile", post(handlers::reconcile))
            .route("/api/v1/reset", post(handlers::reset))
            .route(
                "/api/v1/settings/domain",
                get(handlers::get_domain).put(handlers::set_domain),
            )
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                key_state,
                middleware::require_api_key,
            ));

        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(public_router)
            .merge(protected_router)
            .layer(TraceLayer::new_for_http());

        match self.cors_layer() {
            Some(cors) => router.layer(cors),
            None => router,
        }
    }

    fn cors_layer(&self) -> Option<CorsLayer> {
        if !self.config.enable_cors {
            return None;
        }

        let layer = CorsLayer::new()
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::PATCH,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static(middleware::auth::API_KEY_HEADER),
            ]);

        let layer = match &self.config.cors_origins {
            Some(origins) => {
                let origins: Vec<HeaderValue> = origins
                    .iter()
                    .filter_map(|o| HeaderValue::from_str(o).ok())
                    .collect();
                layer.allow_origin(AllowOrigin::list(origins))
            }
            None => layer.allow_origin(Any),
        };
        Some(layer)
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
