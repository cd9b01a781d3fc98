use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::narrative::NarrativeService;
use crate::store::ActivityStore;
use crate::{brief, dropoff, insights, ranking, scoring, upsell};

/// Shared state handed to every admin route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ActivityStore>,
    pub narrator: Option<Arc<dyn NarrativeService>>,
    pub config: Arc<PipelineConfig>,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Pipeline(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Pipeline(err) => {
                let status = match &err {
                    PipelineError::Input { .. } => StatusCode::BAD_REQUEST,
                    PipelineError::UnknownUser(_) => StatusCode::NOT_FOUND,
                    PipelineError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    PipelineError::MalformedRow { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let message = match &err {
                    PipelineError::DependencyUnavailable { .. } => {
                        format!("{err}; check the database connection and retry")
                    }
                    _ => err.to_string(),
                };
                (status, message)
            }
        };

        if status.is_server_error() {
            error!(%status, %message, "admin request failed");
        }
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

fn success<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ScoreBody {
    pub user_id: Option<String>,
}

/// POST /api/admin/engagement/score
async fn run_scoring(State(app): State<AppState>, body: Bytes) -> Result<Json<Value>, AppError> {
    let body: ScoreBody = if body.is_empty() {
        ScoreBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::BadRequest(format!("invalid request body: {err}")))?
    };

    let run = scoring::run_scoring(
        app.store.as_ref(),
        &app.config,
        body.user_id.as_deref(),
        Utc::now(),
    )
    .await?;
    Ok(success(run))
}

/// GET /api/admin/engagement/dropoff
async fn get_dropoff_signals(State(app): State<AppState>) -> Result<Json<Value>, AppError> {
    let scan = dropoff::detect_dropoff(app.store.as_ref(), &app.config, Utc::now()).await?;
    Ok(success(scan))
}

#[derive(Debug, Deserialize)]
pub struct TopParams {
    pub limit: Option<usize>,
}

/// GET /api/admin/engagement/top?limit=K
async fn get_top_engaged(
    State(app): State<AppState>,
    Query(params): Query<TopParams>,
) -> Result<Json<Value>, AppError> {
    let limit = params.limit.unwrap_or(app.config.top_k);
    if limit == 0 {
        return Err(AppError::BadRequest("limit must be at least 1".into()));
    }
    let top = ranking::top_engaged(app.store.as_ref(), &app.config, limit).await?;
    Ok(success(top))
}

/// GET /api/admin/engagement/recommendations
async fn get_recommendations(State(app): State<AppState>) -> Result<Json<Value>, AppError> {
    let recs = insights::recommend(app.store.as_ref(), &app.config, Utc::now()).await?;
    Ok(success(recs))
}

/// POST /api/admin/engagement/brief
async fn generate_brief(State(app): State<AppState>) -> Result<Json<Value>, AppError> {
    let brief = brief::generate_brief(
        app.store.as_ref(),
        app.narrator.as_deref(),
        &app.config,
        Utc::now(),
    )
    .await?;
    Ok(success(brief))
}

/// POST /api/admin/engagement/upsell-sweep
async fn run_upsell_sweep(State(app): State<AppState>) -> Result<Json<Value>, AppError> {
    let candidates = upsell::run_upsell_sweep(app.store.as_ref(), &app.config).await?;
    Ok(success(candidates))
}

async fn health() -> Json<Value> {
    success(json!({ "status": "ok" }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/admin/engagement/score", post(run_scoring))
        .route("/api/admin/engagement/dropoff", get(get_dropoff_signals))
        .route("/api/admin/engagement/top", get(get_top_engaged))
        .route("/api/admin/engagement/recommendations", get(get_recommendations))
        .route("/api/admin/engagement/brief", post(generate_brief))
        .route("/api/admin/engagement/upsell-sweep", post(run_upsell_sweep))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down admin server");
        })
        .await?;
    Ok(())
}
