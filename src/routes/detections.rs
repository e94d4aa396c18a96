use crate::{server::SharedState, store::StoredDetection};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

pub async fn get_detection(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StoredDetection>, StatusCode> {
    state.metrics.record_request("/detections");
    state.store.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}
