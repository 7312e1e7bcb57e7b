use crate::lifecycle::{CycleOutcome, Dispatcher};
use crate::render::Template;
use crate::storage::{StorageError, TemplateStore};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Shared state for the trigger and template API
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub templates: Arc<dyn TemplateStore>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        error!(error = %e, "Template store error");
        ApiError::InternalError(e.to_string())
    }
}

/// Body of `PUT /templates/:id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub body: String,
    pub sender_field: String,
}

/// GET /_/health
pub async fn health_check() -> &'static str {
    "OK"
}

/// POST /checkandsend
///
/// Runs one dispatch cycle. Record and batch failures are part of the
/// report; only a cycle that could not list its batches answers 500.
pub async fn check_and_send(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CycleOutcome>, ApiError> {
    info!("Dispatch cycle requested over HTTP");

    match state.dispatcher.run_cycle().await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            error!(error = %e, "Requested dispatch cycle failed");
            Err(ApiError::InternalError(e.to_string()))
        }
    }
}

/// GET /templates
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Template>>, ApiError> {
    Ok(Json(state.templates.list_templates().await?))
}

/// GET /templates/:id
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Template>, ApiError> {
    state
        .templates
        .get_template(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No template with id '{}'", id)))
}

/// PUT /templates/:id
pub async fn put_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TemplateRequest>,
) -> Result<Json<Template>, ApiError> {
    let template = Template {
        id,
        body: request.body,
        sender_field: request.sender_field,
        updated_at: Utc::now(),
    };
    state.templates.put_template(&template).await?;

    info!(template_id = %template.id, "Template saved over HTTP");
    Ok(Json(template))
}

/// DELETE /templates/:id
pub async fn remove_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.templates.remove_template(&id).await? {
        info!(template_id = %id, "Template removed over HTTP");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No template with id '{}'", id)))
    }
}
