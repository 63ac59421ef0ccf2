//! Axum JSON API over the reference store.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bloc_core::translate_tag;
use bloc_store::{
    Circuit, CircuitFilter, MatchedVia, MergeOutcome, Problem, ProblemFilter,
    QuestionnaireSubmission, Sector, Store, StoreError, Strictness, TagsMode,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "bloc-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/sectors", get(sectors_handler))
        .route("/api/sectors/{slug}/problems", get(sector_problems_handler))
        .route("/api/problems", get(problems_handler))
        .route("/api/circuits", get(circuits_handler))
        .route("/api/circuits/{id}/problems", get(circuit_problems_handler))
        .route("/api/questionnaire/submit", post(submit_handler))
        .route("/api/questionnaire/available-tags", get(available_tags_handler))
        .route("/api/questionnaire/search-problems", get(search_problems_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: Store, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving bloc API");
    axum::serve(listener, app(AppState { store })).await?;
    Ok(())
}

/// Store taxonomy mapped to coarse HTTP classes with stable messages;
/// storage internals surface only as a generic failure.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            StoreError::NotFound(what) => (StatusCode::NOT_FOUND, what.clone()),
            StoreError::Conflict(what) => (StatusCode::CONFLICT, what.clone()),
            StoreError::Validation(what) => (StatusCode::UNPROCESSABLE_ENTITY, what.clone()),
            StoreError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage failure".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProblemsQuery {
    min_grade: Option<String>,
    max_grade: Option<String>,
    sector_slug: Option<String>,
    /// Comma-separated style tags, e.g. `tags=mur,dalle`.
    tags: Option<String>,
    #[serde(default)]
    tags_mode: TagsMode,
}

#[derive(Debug, Deserialize, Default)]
struct CircuitsQuery {
    sector_slug: Option<String>,
    /// Comma-separated difficulty bands, e.g. `levels=PD,AD`.
    levels: Option<String>,
    #[serde(default)]
    matching: Strictness,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TagOption {
    tag: String,
    translated: String,
    count: i64,
}

#[derive(Debug, Serialize)]
struct SubmissionResponse {
    status: &'static str,
    update_code: String,
    new_problems: usize,
    new_tags: usize,
    total_problems: usize,
    matched_via: Option<MatchedVia>,
}

impl From<MergeOutcome> for SubmissionResponse {
    fn from(outcome: MergeOutcome) -> Self {
        Self {
            status: if outcome.created { "created" } else { "updated" },
            update_code: outcome.update_code,
            new_problems: outcome.new_problems,
            new_tags: outcome.new_tags,
            total_problems: outcome.total_problems,
            matched_via: outcome.matched_via,
        }
    }
}

fn split_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|joined| {
            joined
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Welcome to the bloc API" }))
}

async fn sectors_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Sector>>, ApiError> {
    Ok(Json(state.store.list_sectors().await?))
}

async fn sector_problems_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(slug): AxumPath<String>,
) -> Result<Json<Vec<Problem>>, ApiError> {
    Ok(Json(state.store.sector_problems(&slug).await?))
}

async fn problems_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProblemsQuery>,
) -> Result<Json<Vec<Problem>>, ApiError> {
    let filter = ProblemFilter {
        min_grade: query.min_grade,
        max_grade: query.max_grade,
        sector_slug: query.sector_slug,
        tags: split_csv(&query.tags),
        tags_mode: query.tags_mode,
    };
    Ok(Json(state.store.problems(&filter).await?))
}

async fn circuits_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CircuitsQuery>,
) -> Result<Json<Vec<Circuit>>, ApiError> {
    let filter = CircuitFilter {
        sector_slug: query.sector_slug,
        levels: split_csv(&query.levels),
        matching: query.matching,
    };
    Ok(Json(state.store.circuits(&filter).await?))
}

async fn circuit_problems_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Vec<Problem>>, ApiError> {
    Ok(Json(state.store.circuit_problems(&id).await?))
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<QuestionnaireSubmission>,
) -> Result<Json<SubmissionResponse>, ApiError> {
    let outcome = state.store.submit_questionnaire(&submission).await?;
    Ok(Json(outcome.into()))
}

async fn available_tags_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TagOption>>, ApiError> {
    let tags = state
        .store
        .available_tags()
        .await?
        .into_iter()
        .map(|entry| TagOption {
            translated: translate_tag(&entry.tag),
            tag: entry.tag,
            count: entry.count,
        })
        .collect();
    Ok(Json(tags))
}

async fn search_problems_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Problem>>, ApiError> {
    let limit = query.limit.unwrap_or(20);
    Ok(Json(state.store.search_problems(&query.q, limit).await?))
}
