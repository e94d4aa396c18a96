use crate::{acquisition::DetectionError, server::SharedState, store::StoredDetection};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use tracing::instrument;

/// Runs one acquisition session and returns its merged result.
#[instrument(skip(state))]
pub async fn detect_objects(
    State(state): State<SharedState>,
) -> Result<Json<StoredDetection>, DetectionError> {
    state.metrics.record_request("/detect_objects");

    let result = state.detector.run().await?;
    let stored = state.store.insert(result, Utc::now());

    tracing::info!("Stored detection {}", stored.id);
    Ok(Json(stored))
}

impl IntoResponse for DetectionError {
    fn into_response(self) -> Response {
        let status = match self {
            DetectionError::Handshake(_) | DetectionError::Transport(_) => StatusCode::BAD_GATEWAY,
            DetectionError::ProbeAttemptsExhausted(_) | DetectionError::ProbeDeadlineExceeded(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            DetectionError::Channel(_) | DetectionError::Sink(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, HandshakeError};
    use crate::sink::SinkError;
    use crate::transport::TransportError;
    use tokio::time::Duration;

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (
                DetectionError::Handshake(HandshakeError::Closed),
                StatusCode::BAD_GATEWAY,
            ),
            (
                DetectionError::Transport(TransportError::Closed),
                StatusCode::BAD_GATEWAY,
            ),
            (
                DetectionError::ProbeAttemptsExhausted(5),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                DetectionError::ProbeDeadlineExceeded(Duration::from_secs(60)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                DetectionError::Channel(ChannelError::RequestOutstanding(1)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                DetectionError::Sink(SinkError::Io(std::io::Error::other("disk full"))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
