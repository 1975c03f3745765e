use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::*;
use crate::AppState;

/// Health check (no authentication)
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database = match state.coordinator.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            warn!("Health check: database unreachable: {}", e);
            "unreachable".to_string()
        }
    };

    Json(HealthResponse {
        status: if database == "ok" { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    })
}

/// Register a new client
#[utoipa::path(
    post,
    path = "/api/v1/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Client registered", body = RegisterResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 409, description = "Address pool exhausted", body = ErrorResponse),
        (status = 500, description = "Network command failed", body = ErrorResponse)
    ),
    tag = "clients"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    info!("Registering client '{}'", req.name);

    let registration = state.coordinator.register(&req.name).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            peer: registration.peer.into(),
            interface_config: registration.interface_config,
            private_key: registration.private_key,
        }),
    ))
}

/// Create a tunnel, replacing the client's current one
#[utoipa::path(
    post,
    path = "/api/v1/tunnels",
    request_body = CreateTunnelRequest,
    responses(
        (status = 201, description = "Tunnel created", body = CreateTunnelResponse),
        (status = 400, description = "Invalid subdomain or port", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse),
        (status = 409, description = "Subdomain taken or client inactive", body = ErrorResponse),
        (status = 500, description = "Route provisioning failed", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateTunnelRequest>,
) -> ApiResult<(StatusCode, Json<CreateTunnelResponse>)> {
    info!(
        "Creating tunnel for peer {} on port {} (subdomain: {:?})",
        req.peer_id, req.local_port, req.subdomain
    );

    let view = state
        .coordinator
        .create_tunnel(req.peer_id, req.local_port, req.subdomain.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateTunnelResponse {
            tunnel: view.into(),
        }),
    ))
}

/// List tunnels (active only unless `all=true`)
#[utoipa::path(
    get,
    path = "/api/v1/tunnels",
    params(TunnelListQuery),
    responses(
        (status = 200, description = "List of tunnels", body = TunnelList),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 500, description = "Base domain not configured", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<TunnelListQuery>,
) -> ApiResult<Json<TunnelList>> {
    let include_closed = query.all.unwrap_or(false);
    debug!("Listing tunnels (include closed: {})", include_closed);

    let tunnels: Vec<Tunnel> = state
        .coordinator
        .list_tunnels(include_closed)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    let total = tunnels.len();

    Ok(Json(TunnelList { tunnels, total }))
}

/// Get a specific tunnel by ID
#[utoipa::path(
    get,
    path = "/api/v1/tunnels/{id}",
    params(
        ("id" = Uuid, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Tunnel information", body = Tunnel),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Tunnel not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Tunnel>> {
    debug!("Getting tunnel: {}", id);
    let view = state.coordinator.get_tunnel(id).await?;
    Ok(Json(view.into()))
}

/// Close a tunnel and remove its route (idempotent)
#[utoipa::path(
    delete,
    path = "/api/v1/tunnels/{id}",
    params(
        ("id" = Uuid, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Tunnel closed", body = Tunnel),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Tunnel not found", body = ErrorResponse),
        (status = 500, description = "Route removal failed", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Tunnel>> {
    info!("Closing tunnel: {}", id);
    state.coordinator.close_tunnel(id).await?;
    let view = state.coordinator.get_tunnel(id).await?;
    Ok(Json(view.into()))
}

/// List registered clients
#[utoipa::path(
    get,
    path = "/api/v1/clients",
    responses(
        (status = 200, description = "List of clients", body = ClientList),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse)
    ),
    tag = "clients"
)]
pub async fn list_clients(State(state): State<Arc<AppState>>) -> ApiResult<Json<ClientList>> {
    let clients: Vec<Client> = state
        .coordinator
        .list_clients()
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    let total = clients.len();

    Ok(Json(ClientList { clients, total }))
}

/// Get a specific client by ID
#[utoipa::path(
    get,
    path = "/api/v1/clients/{id}",
    params(
        ("id" = Uuid, Path, description = "Client ID")
    ),
    responses(
        (status = 200, description = "Client information", body = Client),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse)
    ),
    tag = "clients"
)]
pub async fn get_client(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Client>> {
    let client = state.coordinator.get_client(id).await?;
    Ok(Json(client.into()))
}

/// Activate or deactivate a client
///
/// Deactivation closes the client's tunnel and unbinds it from the interface.
#[utoipa::path(
    patch,
    path = "/api/v1/clients/{id}/status",
    params(
        ("id" = Uuid, Path, description = "Client ID")
    ),
    request_body = UpdateClientStatusRequest,
    responses(
        (status = 200, description = "Client updated", body = Client),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse),
        (status = 409, description = "Address bound to another peer", body = ErrorResponse),
        (status = 500, description = "Network command failed", body = ErrorResponse)
    ),
    tag = "clients"
)]
pub async fn update_client_status(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateClientStatusRequest>,
) -> ApiResult<Json<Client>> {
    info!("Setting client {} active={}", id, req.is_active);
    let client = state
        .coordinator
        .set_client_active(id, req.is_active)
        .await?;
    Ok(Json(client.into()))
}

/// Remove a client, its tunnels and its interface binding
#[utoipa::path(
    delete,
    path = "/api/v1/clients/{id}",
    params(
        ("id" = Uuid, Path, description = "Client ID")
    ),
    responses(
        (status = 200, description = "Client removed", body = Client),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Client not found", body = ErrorResponse),
        (status = 500, description = "Network command failed", body = ErrorResponse)
    ),
    tag = "clients"
)]
pub async fn delete_client(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Client>> {
    info!("Removing client: {}", id);
    let removed = state.coordinator.remove_client(id).await?;
    Ok(Json(removed.into()))
}

/// Repair drift between the interface, the records and the routes
#[utoipa::path(
    post,
    path = "/api/v1/reconcile",
    responses(
        (status = 200, description = "Reconciliation report", body = ReconcileResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 500, description = "Records could not be loaded", body = ErrorResponse)
    ),
    tag = "maintenance"
)]
pub async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReconcileResponse>> {
    info!("Reconciliation requested");
    let report = state.coordinator.reconcile().await?;
    Ok(Json(report.into()))
}

/// Remove every peer, tunnel and route
#[utoipa::path(
    post,
    path = "/api/v1/reset",
    responses(
        (status = 200, description = "Reset report", body = ReconcileResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse)
    ),
    tag = "maintenance"
)]
pub async fn reset(State(state): State<Arc<AppState>>) -> Json<ReconcileResponse> {
    warn!("Reset requested: removing all peers, tunnels and routes");
    Json(state.coordinator.reset().await.into())
}

/// Get the base domain
#[utoipa::path(
    get,
    path = "/api/v1/settings/domain",
    responses(
        (status = 200, description = "Current base domain", body = DomainSettings),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse)
    ),
    tag = "settings"
)]
pub async fn get_domain(State(state): State<Arc<AppState>>) -> ApiResult<Json<DomainSettings>> {
    let base_domain = state.coordinator.base_domain().await?;
    Ok(Json(DomainSettings { base_domain }))
}

/// Set the base domain
///
/// Routes already written keep their old host until their tunnel is replaced.
#[utoipa::path(
    put,
    path = "/api/v1/settings/domain",
    request_body = UpdateDomainRequest,
    responses(
        (status = 200, description = "Base domain updated", body = DomainSettings),
        (status = 400, description = "Invalid domain", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse)
    ),
    tag = "settings"
)]
pub async fn set_domain(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<UpdateDomainRequest>,
) -> ApiResult<Json<DomainSettings>> {
    let domain = state.coordinator.set_base_domain(&req.base_domain).await?;
    Ok(Json(DomainSettings {
        base_domain: Some(domain),
    }))
}
