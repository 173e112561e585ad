//! Read-only audit API over the alert store.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::store::AlertStore;

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn AlertStore>,
}

/// Build the audit router.
pub fn audit_routes(store: Arc<dyn AlertStore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/latest", get(latest_run))
        .route("/api/state", get(current_state))
        .route("/api/state/{run_id}", get(state_as_of))
        .layer(cors)
        .with_state(ApiState { store })
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "prepper-alerts"
    }))
}

// ── Runs ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn list_runs(State(state): State<ApiState>, Query(q): Query<RunsQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match state.store.list_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => {
            warn!(error = %e, "list_runs failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn latest_run(State(state): State<ApiState>) -> Response {
    match state.store.latest_run(None).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "No runs recorded"),
        Err(e) => {
            warn!(error = %e, "latest_run failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ── State ───────────────────────────────────────────────────────────

async fn current_state(State(state): State<ApiState>) -> Response {
    match state.store.load_state().await {
        Ok(book) => Json(book).into_response(),
        Err(e) => {
            warn!(error = %e, "load_state failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn state_as_of(State(state): State<ApiState>, Path(run_id): Path<String>) -> Response {
    match state.store.state_as_of(&run_id).await {
        Ok(Some(book)) => Json(book).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            format!("No state snapshot for run {run_id}"),
        ),
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "state_as_of failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::pipeline::decision::{AlertPhase, AlertStateBook, CategoryState};
    use crate::pipeline::types::{Category, IncidentKey, Severity};
    use crate::store::{LibSqlBackend, RunRecord, StateWrite};

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn seeded() -> (Arc<LibSqlBackend>, String) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut book = AlertStateBook::default();
        book.set(
            &IncidentKey {
                location_id: "home".into(),
                category: Category::Hazmat,
            },
            CategoryState {
                phase: AlertPhase::Cooling,
                last_alert_at: Some(at),
                last_severity: Some(Severity::URGENT),
                cooldown_until: Some(at + chrono::Duration::minutes(60)),
            },
        );
        let run_id = Uuid::new_v4();
        store
            .persist_run(&RunRecord {
                run_id,
                started_at: at,
                finished_at: at,
                dry_run: false,
                degraded: false,
                signals_in: 1,
                signals_out: 1,
                sources: Vec::new(),
                deliveries: Vec::new(),
                seen: Vec::new(),
                surge_samples: Vec::new(),
                state: Some(StateWrite::Replace(book)),
            })
            .await
            .unwrap();
        (store, run_id.to_string())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (status, body) = get_json(audit_routes(store), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn runs_are_listed() {
        let (store, run_id) = seeded().await;
        let (status, body) = get_json(audit_routes(store.clone()), "/api/runs?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["run_id"], run_id);

        let (status, body) = get_json(audit_routes(store), "/api/runs/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state_persisted"], true);
    }

    #[tokio::test]
    async fn latest_run_missing_is_404() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (status, _) = get_json(audit_routes(store), "/api/runs/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn state_current_and_point_in_time() {
        let (store, run_id) = seeded().await;
        let (status, current) = get_json(audit_routes(store.clone()), "/api/state").await;
        assert_eq!(status, StatusCode::OK);

        let (status, as_of) =
            get_json(audit_routes(store.clone()), &format!("/api/state/{run_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current, as_of);

        let (status, _) = get_json(audit_routes(store), "/api/state/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
