use crate::{
    frame::Frame,
    parser::{ResponseParser, RoundOutcome},
    protocol::{ClientContentMessage, ServerMessage, SetupMessage},
    transport::{Connector, Transport, TransportError},
};
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingSetupAck,
    Ready,
    Closed,
    Failed,
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Failed to connect to inference service: {0}")]
    Connect(TransportError),
    #[error("Failed to encode setup message: {0}")]
    Encode(serde_json::Error),
    #[error("Failed to send setup message: {0}")]
    Send(TransportError),
    #[error("Connection closed before setup was acknowledged")]
    Closed,
    #[error("Transport failed before setup was acknowledged: {0}")]
    Transport(TransportError),
    #[error("Setup was not acknowledged within {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Session is not ready (state: {0:?})")]
    NotReady(SessionState),
    #[error("Request {0} is still outstanding")]
    RequestOutstanding(u64),
    #[error("Failed to encode frame message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One live session with the inference service.
///
/// At most one request is in flight at any time. Replies that show up while
/// nothing is outstanding (late answers to timed-out rounds) are discarded
/// before the next frame goes out.
///
/// The service carries no request id, so a stale reply that lands after the
/// next frame was sent is indistinguishable from the answer to that frame and
/// is taken as such. Callers that need a clean slate leave a pause between
/// rounds long enough for late answers to arrive.
///
/// Dropping the channel without [`close`](Self::close) releases the transport
/// through its own `Drop`, which for [`WsTransport`](crate::transport::WsTransport)
/// stops the reader without sending a Close frame.
pub struct InferenceChannel<T: Transport> {
    transport: T,
    state: SessionState,
    outstanding: Option<u64>,
    next_request_id: u64,
}

impl<T: Transport> InferenceChannel<T> {
    /// Connects, sends the setup message and waits for its acknowledgement.
    #[instrument(skip_all)]
    pub async fn open<C>(
        connector: &C,
        setup: &SetupMessage,
        ack_timeout: Duration,
    ) -> Result<Self, HandshakeError>
    where
        C: Connector<Transport = T>,
    {
        tracing::debug!("Session state: {:?}", SessionState::Connecting);
        let transport = connector.connect().await.map_err(HandshakeError::Connect)?;
        Self::handshake(transport, setup, ack_timeout).await
    }

    pub async fn handshake(
        mut transport: T,
        setup: &SetupMessage,
        ack_timeout: Duration,
    ) -> Result<Self, HandshakeError> {
        let message = serde_json::to_string(setup).map_err(HandshakeError::Encode)?;

        let result = async {
            transport.send(message).await.map_err(HandshakeError::Send)?;
            tracing::debug!("Session state: {:?}", SessionState::AwaitingSetupAck);

            match timeout(ack_timeout, transport.recv()).await {
                Ok(Some(Ok(ack))) => {
                    tracing::debug!("Setup acknowledged: {}", ack);
                    Ok(())
                }
                Ok(Some(Err(e))) => Err(HandshakeError::Transport(e)),
                Ok(None) => Err(HandshakeError::Closed),
                Err(_) => Err(HandshakeError::Timeout(ack_timeout)),
            }
        }
        .await;

        if let Err(e) = result {
            if let Err(close_err) = transport.close().await {
                tracing::warn!(
                    "Failed to close transport after handshake failure: {}",
                    close_err
                );
            }
            return Err(e);
        }

        tracing::info!("Inference session ready");
        Ok(Self {
            transport,
            state: SessionState::Ready,
            outstanding: None,
            next_request_id: 1,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sends one frame and waits at most `response_timeout` for its reply.
    ///
    /// A timed-out request is not retracted. Transport failures are reported as
    /// [`RoundOutcome::TransportError`] and leave the session `Failed`.
    #[instrument(skip(self, frame), fields(label = frame.label()))]
    pub async fn send_and_await(
        &mut self,
        frame: &Frame,
        response_timeout: Duration,
    ) -> Result<RoundOutcome, ChannelError> {
        if self.state != SessionState::Ready {
            return Err(ChannelError::NotReady(self.state));
        }
        if let Some(request_id) = self.outstanding {
            return Err(ChannelError::RequestOutstanding(request_id));
        }

        if let Err(e) = self.discard_unsolicited() {
            return Ok(self.fail(e));
        }

        let message = serde_json::to_string(&ClientContentMessage::jpeg_frame(frame.data()))?;
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.outstanding = Some(request_id);

        if let Err(e) = self.transport.send(message).await {
            return Ok(self.fail(e));
        }
        tracing::info!(
            "[{}] Frame sent as request {}, waiting for response...",
            frame.label(),
            request_id
        );

        let outcome = match timeout(response_timeout, self.transport.recv()).await {
            Err(_) => {
                tracing::warn!(
                    "[{}] No response to request {} within {:?}",
                    frame.label(),
                    request_id,
                    response_timeout
                );
                RoundOutcome::Timeout
            }
            Ok(None) => return Ok(self.fail(TransportError::Closed)),
            Ok(Some(Err(e))) => return Ok(self.fail(e)),
            Ok(Some(Ok(raw))) => {
                let outcome = ResponseParser::parse(&raw);
                if let RoundOutcome::ParseError(ref detail) = outcome {
                    tracing::warn!(
                        turn_complete = ends_turn(&raw),
                        "[{}] Unexpected response format ({}): {}",
                        frame.label(),
                        detail,
                        raw
                    );
                }
                outcome
            }
        };

        self.outstanding = None;
        Ok(outcome)
    }

    /// Releases the transport. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close inference transport cleanly: {}", e);
        }
        self.state = SessionState::Closed;
        self.outstanding = None;
        tracing::info!("Inference session closed");
    }

    fn discard_unsolicited(&mut self) -> Result<(), TransportError> {
        let mut discarded = 0;
        let mut turns_ended = 0;
        while let Some(message) = self.transport.try_recv() {
            let raw = message?;
            tracing::debug!("Discarding unsolicited message: {}", raw);
            discarded += 1;
            if ends_turn(&raw) {
                turns_ended += 1;
            }
        }
        if discarded > 0 {
            tracing::warn!(
                turns_ended,
                "Discarded {} late or unsolicited message(s)",
                discarded
            );
        }
        Ok(())
    }

    fn fail(&mut self, error: TransportError) -> RoundOutcome {
        tracing::error!("Inference transport failed: {}", error);
        self.state = SessionState::Failed;
        self.outstanding = None;
        RoundOutcome::TransportError(error)
    }
}

fn ends_turn(raw: &str) -> bool {
    serde_json::from_str::<ServerMessage>(raw)
        .map(|message| message.is_turn_complete())
        .unwrap_or(false)
}
