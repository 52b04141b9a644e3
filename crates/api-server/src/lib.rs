//! HTTP control/inspection surface
//!
//! Binds the engine's control operations one-to-one onto an axum
//! router. Reads are open; writes require the operator bearer token;
//! the grant path additionally passes a per-client rate limiter.

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    middleware as axum_middleware,
    routing::{delete, get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod auth;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod state;

use access_engine::control::parse_backend;
use access_engine::{
    Binding, BindingCheck, CycleReport, Device, ErrorCategory, GrantOutcome, GrantRequest,
    ManualBindOutcome, RevokeOutcome, RevokeReason, RuleSnapshot, Session,
};
use auth::Operator;
use error::{ApiError, ApiResult};
use models::*;
use state::{ApiConfig, AppState};

/// Liveness probe
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// grantAccess
async fn grant_session(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    _op: Operator,
    Json(request): Json<GrantRequest>,
) -> ApiResult<(StatusCode, Json<GrantOutcome>)> {
    if let Some(ConnectInfo(addr)) = connect {
        if !state.limiter.allow(addr.ip()).await {
            warn!(client = %addr, "grant rate limit exceeded");
            return Err(ApiError::rate_limited("too many authentication attempts"));
        }
    }

    match state.control.grant(request).await {
        Ok(outcome) => {
            metrics::GRANTS_TOTAL.inc();
            Ok((StatusCode::CREATED, Json(outcome)))
        }
        Err(e) => {
            if e.category() == ErrorCategory::EnforcerFailed {
                metrics::GRANT_FAILURES_TOTAL.inc();
            }
            Err(e.into())
        }
    }
}

/// revokeAccess
async fn revoke_session(
    State(state): State<Arc<AppState>>,
    _op: Operator,
    Path(session_id): Path<String>,
    Query(query): Query<RevokeQuery>,
) -> ApiResult<Json<RevokeOutcome>> {
    let reason: RevokeReason = query
        .reason
        .as_deref()
        .unwrap_or("USER_LOGOUT")
        .parse()
        .map_err(ApiError::from)?;

    let outcome = state.control.revoke(&session_id, reason).await?;
    metrics::REVOKES_TOTAL.inc();
    Ok(Json(outcome))
}

/// forceDisconnect
async fn disconnect_session(
    State(state): State<Arc<AppState>>,
    _op: Operator,
    Path(session_id): Path<String>,
    Json(body): Json<DisconnectBody>,
) -> ApiResult<Json<RevokeOutcome>> {
    let outcome = state
        .control
        .force_disconnect(&session_id, &body.operator_id, &body.reason)
        .await?;
    metrics::REVOKES_TOTAL.inc();
    Ok(Json(outcome))
}

/// extend
async fn extend_session(
    State(state): State<Arc<AppState>>,
    _op: Operator,
    Path(session_id): Path<String>,
    Json(body): Json<ExtendBody>,
) -> ApiResult<Json<ExtendResponse>> {
    let new_expires_at = state.control.extend(&session_id, body.additional_secs).await?;
    Ok(Json(ExtendResponse {
        session_id,
        new_expires_at,
    }))
}

/// listActiveSessions
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult<Json<Vec<Session>>> {
    let sessions = state
        .control
        .list_active_sessions(query.mac.as_deref())
        .await?;
    Ok(Json(sessions))
}

/// listBindings
async fn list_bindings(State(state): State<Arc<AppState>>) -> Json<Vec<Binding>> {
    Json(state.control.list_bindings().await)
}

/// validate
async fn validate_identity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ValidateQuery>,
) -> ApiResult<Json<BindingCheck>> {
    let check = state.control.validate(&query.mac, &query.ip).await?;
    Ok(Json(check))
}

/// snapshotRules
async fn rules_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RulesQuery>,
) -> ApiResult<Json<RuleSnapshot>> {
    let backend = match query.backend.as_deref() {
        Some(raw) => Some(parse_backend(raw).map_err(ApiError::from)?),
        None => None,
    };
    Ok(Json(state.control.snapshot_rules(backend).await))
}

/// manualBind
async fn manual_bind(
    State(state): State<Arc<AppState>>,
    _op: Operator,
    Json(body): Json<ManualBindBody>,
) -> ApiResult<(StatusCode, Json<ManualBindOutcome>)> {
    let outcome = state
        .control
        .manual_bind(&body.mac, &body.ip, body.duration_secs)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// manualUnbind
async fn manual_unbind(
    State(state): State<Arc<AppState>>,
    _op: Operator,
    Path(mac): Path<String>,
) -> ApiResult<Json<UnbindResponse>> {
    let retired = state.control.manual_unbind(&mac).await?;
    Ok(Json(UnbindResponse { mac, retired }))
}

/// triggerCleanup
async fn trigger_cleanup(
    State(state): State<Arc<AppState>>,
    _op: Operator,
) -> Json<CycleReport> {
    Json(state.control.trigger_cleanup().await)
}

/// hasActiveSession predicate for the portal facade
async fn client_active(
    State(state): State<Arc<AppState>>,
    Path(mac): Path<String>,
) -> ApiResult<Json<ActiveResponse>> {
    let active = state.control.has_active_session(&mac).await?;
    Ok(Json(ActiveResponse { mac, active }))
}

async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<Device>> {
    Json(state.control.list_devices().await)
}

async fn block_device(
    State(state): State<Arc<AppState>>,
    _op: Operator,
    Path(mac): Path<String>,
    Json(body): Json<BlockBody>,
) -> ApiResult<Json<Device>> {
    let device = state
        .control
        .block_device(&mac, &body.reason, &body.operator_id)
        .await?;
    Ok(Json(device))
}

async fn unblock_device(
    State(state): State<Arc<AppState>>,
    _op: Operator,
    Path(mac): Path<String>,
    Json(body): Json<UnblockBody>,
) -> ApiResult<Json<Device>> {
    let device = state.control.unblock_device(&mac, &body.operator_id).await?;
    Ok(Json(device))
}

async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Json<serde_json::Value> {
    let events = state.control.recent_events(query.limit.unwrap_or(100));
    Json(serde_json::json!({
        "events": events,
        "dropped": state.control.dropped_events(),
    }))
}

/// Assemble the full router
pub fn router(state: Arc<AppState>) -> Router {
    let cors_layer = cors::build_cors_layer(&state.allowed_origins);

    Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .route("/sessions", post(grant_session).get(list_sessions))
                .route("/sessions/:id", delete(revoke_session))
                .route("/sessions/:id/disconnect", post(disconnect_session))
                .route("/sessions/:id/extend", post(extend_session))
                .route("/bindings", post(manual_bind).get(list_bindings))
                .route("/bindings/:mac", delete(manual_unbind))
                .route("/validate", get(validate_identity))
                .route("/rules", get(rules_snapshot))
                .route("/cleanup", post(trigger_cleanup))
                .route("/clients/:mac/active", get(client_active))
                .route("/devices", get(list_devices))
                .route("/devices/:mac/block", post(block_device))
                .route("/devices/:mac/unblock", post(unblock_device))
                .route("/events", get(recent_events)),
        )
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(axum_middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves
pub async fn serve(
    config: ApiConfig,
    control: Arc<access_engine::ControlApi>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let state = Arc::new(AppState::new(control, &config));
    if state.operator_token.is_none() {
        warn!("operator token not configured; write operations are unauthenticated");
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(listen_addr = %config.listen_addr, "control API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use access_engine::{AccessEngine, EngineConfig};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn test_app(operator_token: Option<&str>) -> (Router, AccessEngine) {
        let engine = AccessEngine::start(EngineConfig::simulation()).await.unwrap();
        let config = ApiConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            operator_token: operator_token.map(str::to_string),
            allowed_origins: Vec::new(),
        };
        let state = Arc::new(AppState::new(engine.control(), &config));
        (router(state), engine)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, engine) = test_app(None).await;

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_grant_and_validate_round_trip() {
        let (app, engine) = test_app(None).await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"mac":"aa:bb:cc:dd:ee:01","ip":"192.168.4.10",
                           "duration_secs":3600,"auth_method":"voucher"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let outcome: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(outcome["session_id"].is_string());

        let response = app
            .oneshot(
                Request::get("/api/v1/validate?mac=aa:bb:cc:dd:ee:01&ip=192.168.4.10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let check: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(check["result"], "OK");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_writes_require_operator_token() {
        let (app, engine) = test_app(Some("hunter2")).await;

        // Missing token is rejected.
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"mac":"aa:bb:cc:dd:ee:01","ip":"192.168.4.10","auth_method":"voucher"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // The right token passes.
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer hunter2")
                    .body(Body::from(
                        r#"{"mac":"aa:bb:cc:dd:ee:01","ip":"192.168.4.10","auth_method":"voucher"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // Reads stay open.
        let response = app
            .oneshot(Request::get("/api/v1/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_mac_maps_to_bad_request() {
        let (app, engine) = test_app(None).await;

        let response = app
            .oneshot(
                Request::post("/api/v1/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"mac":"not-a-mac","ip":"192.168.4.10","auth_method":"voucher"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["category"], "INVALID_INPUT");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_session_revoke_is_404() {
        let (app, engine) = test_app(None).await;

        let response = app
            .oneshot(
                Request::delete("/api/v1/sessions/no-such-session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        engine.shutdown().await;
    }
}
