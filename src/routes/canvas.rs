//! Canvas catalog and bootstrap routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use tracing::error;

use crate::repo::CanvasMeta;
use crate::services::canvas::{self, CanvasError, CanvasView};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateCanvasBody {
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// `GET /api/canvas/:id` — full current state for page-load bootstrap.
pub async fn get_canvas(
    State(state): State<AppState>,
    Path(canvas_id): Path<String>,
) -> Result<Json<CanvasView>, StatusCode> {
    let view = canvas::canvas_view(&state, &canvas_id)
        .await
        .map_err(canvas_error_to_status)?;
    Ok(Json(view))
}

/// `POST /api/canvas` — create a canvas.
pub async fn create_canvas(
    State(state): State<AppState>,
    Json(body): Json<CreateCanvasBody>,
) -> Result<(StatusCode, Json<CanvasMeta>), StatusCode> {
    let meta = canvas::create_canvas(&state, &body.name, body.is_private, body.width, body.height)
        .await
        .map_err(canvas_error_to_status)?;
    Ok((StatusCode::CREATED, Json(meta)))
}

/// `GET /api/pubs` — list community pubs.
pub async fn list_pubs(State(state): State<AppState>) -> Result<Json<Vec<CanvasMeta>>, StatusCode> {
    let pubs = canvas::list_pubs(&state)
        .await
        .map_err(canvas_error_to_status)?;
    Ok(Json(pubs))
}

pub(crate) fn canvas_error_to_status(err: CanvasError) -> StatusCode {
    match err {
        CanvasError::UnknownCanvas(_) => StatusCode::NOT_FOUND,
        CanvasError::NotAPub(_) | CanvasError::Invalid(_) | CanvasError::Closed => StatusCode::BAD_REQUEST,
        CanvasError::Grid(_) | CanvasError::Repo(_) => {
            error!(error = %err, "canvas request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
