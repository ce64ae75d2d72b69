//! REST API handlers.
//!
//! Handlers delegate to [`FunctionStore`](crate::functions::FunctionStore);
//! errors render through `AdapterError`'s `IntoResponse` as
//! `{"error": <kind>, "message": <text>}`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::AdapterError;
use crate::functions::{DeployRequest, FunctionDefinition, FunctionWithFiles};

use super::ApiState;

#[derive(Serialize)]
pub struct DeletedResponse {
    pub name: String,
    pub deleted: bool,
}

/// GET /functions
pub async fn list_functions(State(state): State<ApiState>) -> Result<Json<Vec<FunctionWithFiles>>, AdapterError> {
    Ok(Json(state.functions.list().await?))
}

/// GET /functions/{name}
pub async fn get_function(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<FunctionWithFiles>, AdapterError> {
    Ok(Json(state.functions.get(&name).await?))
}

/// POST /functions
pub async fn deploy_function(
    State(state): State<ApiState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FunctionDefinition>), AdapterError> {
    let Json(request) = payload.map_err(|e| AdapterError::Validation(e.body_text()))?;
    let definition = state.functions.deploy(request).await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

/// DELETE /functions/{name}
pub async fn delete_function(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<DeletedResponse>, AdapterError> {
    state.functions.delete(&name).await?;
    Ok(Json(DeletedResponse { name, deleted: true }))
}
