use crate::infra::AppState;
use admissions::workflows::admissions::{
    admissions_router, AdmissionsService, AdmissionsStore, DocumentStorage, PaymentGateway,
};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Extension;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// Admissions API plus the operational endpoints.
pub(crate) fn with_admissions_routes<S, G, D>(
    service: Arc<AdmissionsService<S, G, D>>,
) -> axum::Router
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    admissions_router(service)
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
