use crate::errors::JobError;
use crate::http_rate_limit::{RateDecision, SlidingWindowLimiter};
use crate::metrics_defs::API_RATE_LIMITED;
use crate::orchestrator::{Orchestrator, StartImportRequest};
use crate::types::{ImportJob, JobId};
use axum::{
    Json, Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::counter;
use std::sync::Arc;
use uuid::Uuid;

const ANONYMOUS_CALLER: &str = "anonymous";

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// Any failure while starting a job is reported to the caller as a bad request.
    #[error("{0}")]
    StartRejected(JobError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("{0}")]
    InvalidBody(String),
    #[error("malformed request body: {0}")]
    MalformedBody(#[from] JsonRejection),
    #[error("import job {0} not found")]
    UnknownJob(String),
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("too many requests")]
    RateLimited,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::StartRejected(_) | ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Job(e) => match e {
                JobError::NotFound(_) => StatusCode::NOT_FOUND,
                JobError::AlreadyFinished(_) => StatusCode::CONFLICT,
                JobError::Validation(_)
                | JobError::InvalidRequest(_)
                | JobError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
                JobError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::MalformedBody(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::UnknownJob(_) | ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    success: bool,
    error: String,
    timestamp: DateTime<Utc>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "job api request failed");
        }

        let body = Json(ApiErrorResponse {
            success: false,
            error: self.to_string(),
            timestamp: Utc::now(),
        });
        (status, body).into_response()
    }
}

#[derive(Clone)]
struct ApiState {
    orchestrator: Orchestrator,
    limiter: Arc<SlidingWindowLimiter>,
}

pub fn router(orchestrator: Orchestrator, limiter: SlidingWindowLimiter) -> Router {
    let state = ApiState {
        orchestrator,
        limiter: Arc::new(limiter),
    };

    // Only job starts count against the caller's window.
    let limit_starts = middleware::from_fn_with_state(state.clone(), rate_limit);

    Router::new()
        .route(
            "/imports",
            post(start_import)
                .route_layer(limit_starts)
                .get(list_imports),
        )
        .route("/imports/{job_id}", get(get_import))
        .route("/imports/{job_id}/cancel", post(cancel_import))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
}

/// First `X-Forwarded-For` entry, or a shared key for callers without one.
fn caller_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|caller| !caller.is_empty())
        .unwrap_or(ANONYMOUS_CALLER)
        .to_string()
}

fn set_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    let reset_secs = decision.reset_after.as_secs_f64().ceil() as u64;
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_secs));
}

async fn rate_limit(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let caller = caller_key(request.headers());
    let decision = state.limiter.check(&caller);

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        counter!(API_RATE_LIMITED).increment(1);
        tracing::warn!(caller = %caller, limit = decision.limit, "job api rate limit exceeded");
        ApiError::RateLimited.into_response()
    };
    set_rate_headers(response.headers_mut(), &decision);
    response
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StartImportBody {
    #[serde(default)]
    job_name: String,
    target_usernames: Option<Vec<Value>>,
    approved_preview_ids: Option<Vec<Value>>,
}

/// Every entry has to be a JSON string.
fn string_list(field: &str, values: Option<Vec<Value>>) -> Result<Option<Vec<String>>, ApiError> {
    let Some(values) = values else {
        return Ok(None);
    };
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::String(s) => Ok(s),
            other => Err(ApiError::InvalidBody(format!(
                "{field}[{index}] must be a string, got {other}"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartImportResponse {
    success: bool,
    job_id: JobId,
    message: String,
    target_usernames: Vec<String>,
    estimated_completion: DateTime<Utc>,
}

async fn start_import(
    State(state): State<ApiState>,
    body: Result<Json<StartImportBody>, JsonRejection>,
) -> Result<Json<StartImportResponse>, ApiError> {
    let Json(body) = body?;
    let request = StartImportRequest {
        job_name: body.job_name,
        target_usernames: string_list("targetUsernames", body.target_usernames)?,
        approved_preview_ids: string_list("approvedPreviewIds", body.approved_preview_ids)?,
    };

    let (started, _handle) = state
        .orchestrator
        .start_job(request)
        .await
        .map_err(ApiError::StartRejected)?;

    Ok(Json(StartImportResponse {
        success: true,
        job_id: started.job_id,
        message: started.message,
        target_usernames: started.target_usernames,
        estimated_completion: started.estimated_completion,
    }))
}

#[derive(Serialize)]
struct JobList {
    jobs: Vec<ImportJob>,
}

async fn list_imports(State(state): State<ApiState>) -> Result<Json<JobList>, ApiError> {
    let jobs = state.orchestrator.list_jobs().await?;
    Ok(Json(JobList { jobs }))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::UnknownJob(raw.to_string()))
}

async fn get_import(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<ImportJob>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.orchestrator.get_job(job_id).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    success: bool,
    job_id: JobId,
    message: &'static str,
}

async fn cancel_import(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let job_id = parse_job_id(&job_id)?;
    state.orchestrator.cancel_job(job_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            success: true,
            job_id,
            message: "cancellation requested",
        }),
    ))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}
