use crate::config::CameraConfig;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::instrument;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to build camera client: {0}")]
    ClientBuildFailed(reqwest::Error),
    #[error("Failed to fetch frame: {0}")]
    FetchFrameFailed(#[from] reqwest::Error),
    #[error("Camera answered with status {0}")]
    UnexpectedStatus(u16),
    #[error("Camera returned an empty frame")]
    EmptyFrame,
    #[error("Camera returned a payload that is not a JPEG image")]
    NotJpeg,
}

/// Anything that can hand out encoded JPEG frames.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Bytes, CameraError>;
}

/// Network camera exposing a single-shot JPEG endpoint.
#[derive(Debug, Clone)]
pub struct HttpCamera {
    client: reqwest::Client,
    url: String,
}

impl HttpCamera {
    pub fn new(camera_config: &CameraConfig) -> Result<Self, CameraError> {
        let client = reqwest::Client::builder()
            .timeout(camera_config.get_request_timeout())
            .build()
            .map_err(CameraError::ClientBuildFailed)?;

        Ok(Self {
            client,
            url: camera_config.url.clone(),
        })
    }
}

#[async_trait]
impl FrameSource for HttpCamera {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn capture(&self) -> Result<Bytes, CameraError> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CameraError::UnexpectedStatus(status.as_u16()));
        }

        let frame = response.bytes().await?;
        check_jpeg(&frame)?;

        tracing::debug!("Captured frame of {} bytes", frame.len());
        Ok(frame)
    }
}

fn check_jpeg(frame: &[u8]) -> Result<(), CameraError> {
    if frame.is_empty() {
        return Err(CameraError::EmptyFrame);
    }
    if !frame.starts_with(&JPEG_SOI) {
        return Err(CameraError::NotJpeg);
    }
    Ok(())
}
