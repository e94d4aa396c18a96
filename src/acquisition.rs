use crate::{
    camera::FrameSource,
    channel::{ChannelError, HandshakeError, InferenceChannel},
    config::{AcquisitionConfig, InferenceConfig},
    detection::DetectionResult,
    frame::Frame,
    parser::RoundOutcome,
    protocol::{SetupMessage, DEFAULT_SYSTEM_INSTRUCTION},
    sink::{ResultSink, SinkError},
    telemetry::Metrics,
    transport::{Connector, Transport, TransportError},
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Inference session handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Inference transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Inference session error: {0}")]
    Channel(#[from] ChannelError),
    #[error("No usable response after {0} probing rounds")]
    ProbeAttemptsExhausted(u64),
    #[error("No usable response within {0:?}")]
    ProbeDeadlineExceeded(Duration),
    #[error("Failed to persist detection result: {0}")]
    Sink(#[from] SinkError),
}

/// Where the loop currently stands.
#[derive(Debug)]
enum Phase {
    Probing,
    Confirming { frame: Frame, round: u32 },
    Done,
    Aborted(TransportError),
}

/// Probes the camera until the model recognises something, then asks again on
/// the same frame a few times to catch objects missed the first time.
pub struct AcquisitionLoop<C, F, S> {
    connector: C,
    frame_source: F,
    sink: S,
    setup: SetupMessage,
    handshake_timeout: Duration,
    settings: AcquisitionConfig,
    metrics: Option<Arc<Metrics>>,
}

impl<C, F, S> AcquisitionLoop<C, F, S>
where
    C: Connector,
    F: FrameSource,
    S: ResultSink,
{
    pub fn new(
        connector: C,
        frame_source: F,
        sink: S,
        inference: &InferenceConfig,
        settings: AcquisitionConfig,
    ) -> Self {
        let instruction = inference
            .system_instruction
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_INSTRUCTION);

        Self {
            connector,
            frame_source,
            sink,
            setup: SetupMessage::new(&inference.model, instruction),
            handshake_timeout: inference.get_handshake_timeout(),
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn model(&self) -> &str {
        &self.setup.setup.model
    }

    /// Runs one full session and persists its result.
    ///
    /// The session is closed on every path out of here. If the returned future
    /// is dropped instead (an HTTP client hanging up), the channel is dropped
    /// with it and the transport is released by its `Drop` impl, without a
    /// close handshake.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<DetectionResult, DetectionError> {
        let mut channel =
            InferenceChannel::open(&self.connector, &self.setup, self.handshake_timeout).await?;

        let outcome = match self.drive(&mut channel).await {
            Ok(result) => self
                .sink
                .persist(&result, Utc::now())
                .await
                .map(|_| result)
                .map_err(DetectionError::from),
            Err(e) => Err(e),
        };

        channel.close().await;

        match &outcome {
            Ok(result) => {
                tracing::info!(
                    "Detection finished on frame {} with {} object(s): {:?}",
                    result.frame,
                    result.objects.len(),
                    result.objects
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_detected_objects(result.objects.len() as u64);
                }
            }
            Err(e) => tracing::error!("Detection failed: {}", e),
        }

        outcome
    }

    async fn drive<T: Transport>(
        &self,
        channel: &mut InferenceChannel<T>,
    ) -> Result<DetectionResult, DetectionError> {
        let started = Instant::now();
        let mut ordinal: u64 = 1;
        let mut attempts: u64 = 0;
        let mut result = DetectionResult::default();
        let mut phase = Phase::Probing;

        loop {
            phase = match phase {
                Phase::Probing => {
                    self.check_probe_guards(attempts, started)?;

                    let data = match self.frame_source.capture().await {
                        Ok(data) => data,
                        Err(e) => {
                            tracing::warn!("Error capturing frame: {}", e);
                            sleep(self.settings.get_probe_delay()).await;
                            phase = Phase::Probing;
                            continue;
                        }
                    };
                    let frame = Frame::new(ordinal, data);
                    attempts += 1;

                    match self.round(channel, &frame, "probing").await? {
                        RoundOutcome::Usable(labels) => {
                            tracing::info!(
                                "[{}] Valid response received: {:?}",
                                frame.label(),
                                labels
                            );
                            result = DetectionResult::new(frame.ordinal());
                            result.merge(labels);
                            Phase::Confirming { frame, round: 1 }
                        }
                        RoundOutcome::TransportError(e) => Phase::Aborted(e),
                        outcome => {
                            match outcome {
                                RoundOutcome::ParseError(detail) => tracing::warn!(
                                    "[{}] Reply does not match the expected contract: {}",
                                    frame.label(),
                                    detail
                                ),
                                RoundOutcome::Empty => {
                                    tracing::info!("[{}] Reply listed no objects", frame.label())
                                }
                                _ => tracing::info!("[{}] Response timeout", frame.label()),
                            }
                            ordinal += 1;
                            sleep(self.settings.get_probe_delay()).await;
                            Phase::Probing
                        }
                    }
                }
                Phase::Confirming { round, .. } if round > self.settings.confirmation_rounds => {
                    Phase::Done
                }
                Phase::Confirming { frame, round } => {
                    if round > 1 {
                        sleep(self.settings.get_confirm_delay()).await;
                    }
                    let confirmation = frame.relabel(format!("Additional {}", round));

                    match self.round(channel, &confirmation, "confirming").await? {
                        RoundOutcome::Usable(labels) => {
                            let added = result.merge(labels);
                            tracing::info!(
                                "[{}] {} new object(s) from confirmation",
                                confirmation.label(),
                                added
                            );
                            Phase::Confirming {
                                frame,
                                round: round + 1,
                            }
                        }
                        RoundOutcome::TransportError(e) => Phase::Aborted(e),
                        outcome => {
                            tracing::info!(
                                "[{}] Confirmation skipped ({})",
                                confirmation.label(),
                                outcome.kind()
                            );
                            Phase::Confirming {
                                frame,
                                round: round + 1,
                            }
                        }
                    }
                }
                Phase::Done => return Ok(result),
                Phase::Aborted(e) => return Err(DetectionError::Transport(e)),
            };
        }
    }

    async fn round<T: Transport>(
        &self,
        channel: &mut InferenceChannel<T>,
        frame: &Frame,
        phase: &'static str,
    ) -> Result<RoundOutcome, ChannelError> {
        let started = Instant::now();
        let outcome = channel
            .send_and_await(frame, self.settings.get_response_timeout())
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_round(phase, outcome.kind(), started.elapsed().as_millis() as u64);
        }
        Ok(outcome)
    }

    fn check_probe_guards(&self, attempts: u64, started: Instant) -> Result<(), DetectionError> {
        if let Some(max_attempts) = self.settings.max_probe_attempts {
            if attempts >= max_attempts {
                return Err(DetectionError::ProbeAttemptsExhausted(attempts));
            }
        }
        if let Some(max_duration) = self.settings.get_max_probe_duration() {
            if started.elapsed() >= max_duration {
                return Err(DetectionError::ProbeDeadlineExceeded(max_duration));
            }
        }
        Ok(())
    }
}
