use crate::detection::DetectionResult;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write detection result: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize detection result: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Final destination of a merged detection result.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(
        &self,
        result: &DetectionResult,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: ResultSink + ?Sized> ResultSink for Arc<S> {
    async fn persist(
        &self,
        result: &DetectionResult,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        (**self).persist(result, timestamp).await
    }
}

#[derive(Serialize)]
struct PersistedDetection<'a> {
    timestamp: String,
    result: &'a DetectionResult,
}

/// Writes each result to its own `detected_objects_<uuid>.json` file.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    directory: PathBuf,
}

impl JsonFileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    #[instrument(skip(self, result))]
    async fn persist(
        &self,
        result: &DetectionResult,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let document = PersistedDetection {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            result,
        };
        let body = serde_json::to_vec_pretty(&document)?;

        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self
            .directory
            .join(format!("detected_objects_{}.json", Uuid::new_v4()));
        tokio::fs::write(&path, body).await?;

        tracing::info!("Detection result saved to {}", path.display());
        Ok(())
    }
}
