use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::instrument;

const INBOX_CAPACITY: usize = 32;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("Received a message that is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("Connection closed by peer")]
    Closed,
    #[error("Connection attempt timed out")]
    ConnectTimeout,
    #[error("Maximum connection retries exceeded.")]
    MaxRetriesExceeded,
}

/// Message pipe to the inference service.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: String) -> Result<(), TransportError>;

    /// Waits for the next inbound message. `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Next already-received message, without waiting.
    fn try_recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport + 'static;

    async fn connect(&self) -> Result<Self::Transport, TransportError>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsTransport {
    sink: WsSink,
    inbox: mpsc::Receiver<Result<String, TransportError>>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(address: &str) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(address).await?;
        let (sink, mut source) = stream.split();
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);

        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let forwarded = match message {
                    Ok(Message::Text(text)) => Ok(text.as_str().to_owned()),
                    Ok(Message::Binary(bytes)) => {
                        String::from_utf8(bytes.to_vec()).map_err(TransportError::from)
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!("Inference service closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => Err(TransportError::from(e)),
                };

                let failed = forwarded.is_err();
                if inbox_tx.send(forwarded).await.is_err() || failed {
                    break;
                }
            }
            tracing::debug!("WebSocket reader stopped");
        });

        Ok(Self {
            sink,
            inbox,
            reader,
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        self.sink.send(Message::text(message)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbox.recv().await
    }

    fn try_recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbox.try_recv().ok()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.reader.abort();
        self.inbox.close();
        match self.sink.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Dials the WebSocket endpoint with jittered exponential backoff.
#[derive(Clone)]
pub struct WsConnector {
    address: String,
    max_retries: u32,
    attempt_timeout: Duration,
}

impl WsConnector {
    pub fn new(address: impl Into<String>, max_retries: u32, attempt_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            max_retries: max_retries.max(1),
            attempt_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<WsTransport, TransportError> {
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let mut last_error = TransportError::MaxRetriesExceeded;

        for retry_count in 0..self.max_retries {
            match timeout(self.attempt_timeout, WsTransport::connect(&self.address)).await {
                Ok(Ok(transport)) => return Ok(transport),
                Ok(Err(e)) => {
                    tracing::error!(
                        "Failed to connect to inference service (attempt {}/{}): {}",
                        retry_count + 1,
                        self.max_retries,
                        e
                    );
                    last_error = e;
                }
                Err(_) => {
                    tracing::error!(
                        "Connection timeout (attempt {}/{})",
                        retry_count + 1,
                        self.max_retries
                    );
                    last_error = TransportError::ConnectTimeout;
                }
            }

            if retry_count + 1 < self.max_retries {
                let jitter = rand::random::<f32>() * 0.2 + 0.9;
                sleep(retry_delay.mul_f32(jitter)).await;
                retry_delay = (retry_delay * 2).min(max_retry_delay);
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{InferenceChannel, SessionState},
        frame::Frame,
        parser::RoundOutcome,
        protocol::SetupMessage,
        testing::{jpeg, reply, SETUP_ACK},
    };
    use std::{
        future::Future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tokio::{net::TcpListener, time::Instant};
    use tokio_tungstenite::accept_async;

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Accepts one WebSocket client on a loopback port and hands it to `script`.
    async fn serve<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let socket = accept_async(stream).await.unwrap();
            script(socket).await;
        });
        address
    }

    async fn next_text(socket: &mut ServerSocket) -> String {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            other => panic!("unexpected client message: {:?}", other),
        }
    }

    async fn drain(mut socket: ServerSocket) {
        while let Some(Ok(_)) = socket.next().await {}
    }

    #[tokio::test]
    async fn test_text_and_binary_frames_are_forwarded() {
        let address = serve(|mut socket| async move {
            next_text(&mut socket).await;
            socket
                .send(Message::binary(SETUP_ACK.as_bytes().to_vec()))
                .await
                .unwrap();
            socket.send(Message::text("plain text")).await.unwrap();
            drain(socket).await;
        })
        .await;

        let mut transport = WsTransport::connect(&address).await.unwrap();
        transport.send("hello".to_string()).await.unwrap();

        assert_eq!(transport.recv().await.unwrap().unwrap(), SETUP_ACK);
        assert_eq!(transport.recv().await.unwrap().unwrap(), "plain text");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_binary_frame_ends_the_inbox() {
        let address = serve(|mut socket| async move {
            socket
                .send(Message::binary(vec![0xFF, 0xFE, 0xFD]))
                .await
                .unwrap();
            drain(socket).await;
        })
        .await;

        let mut transport = WsTransport::connect(&address).await.unwrap();

        assert!(matches!(
            transport.recv().await,
            Some(Err(TransportError::InvalidUtf8(_)))
        ));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_peer_close_ends_the_inbox() {
        let address = serve(|mut socket| async move {
            socket.close(None).await.ok();
            drain(socket).await;
        })
        .await;

        let mut transport = WsTransport::connect(&address).await.unwrap();

        assert!(transport.recv().await.is_none());
        assert!(transport.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_try_recv_returns_queued_messages_without_waiting() {
        let address = serve(|mut socket| async move {
            next_text(&mut socket).await;
            socket.send(Message::text("one")).await.unwrap();
            socket.send(Message::text("two")).await.unwrap();
            drain(socket).await;
        })
        .await;

        let mut transport = WsTransport::connect(&address).await.unwrap();
        assert!(transport.try_recv().is_none());

        transport.send("go".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "one");

        let queued = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(message) = transport.try_recv() {
                    break message;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("second message should be queued");
        assert_eq!(queued.unwrap(), "two");
        assert!(transport.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_connector_reports_last_error_on_refused_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let connector = WsConnector::new(address, 2, Duration::from_secs(1));
        let result = connector.connect().await;

        assert!(matches!(result, Err(TransportError::WebSocket(_))));
    }

    #[tokio::test]
    async fn test_connector_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let connector = WsConnector::new(address, 2, Duration::from_millis(100));
        let started = Instant::now();
        let result = connector.connect().await;

        assert!(matches!(result, Err(TransportError::ConnectTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(200));

        let both_attempts = timeout(Duration::from_secs(5), async {
            while accepted.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(both_attempts.is_ok());
    }

    #[tokio::test]
    async fn test_channel_discards_late_reply_over_live_socket() {
        let address = serve(|mut socket| async move {
            next_text(&mut socket).await;
            socket
                .send(Message::binary(SETUP_ACK.as_bytes().to_vec()))
                .await
                .unwrap();

            // Answer the first frame only after the client gave up on it.
            next_text(&mut socket).await;
            sleep(Duration::from_millis(400)).await;
            socket.send(Message::text(reply("* Stale"))).await.unwrap();
            socket
                .send(Message::text(r#"{"serverContent":{"turnComplete":true}}"#))
                .await
                .unwrap();

            next_text(&mut socket).await;
            socket
                .send(Message::binary(reply("* Fresh\n* Lamp").into_bytes()))
                .await
                .unwrap();
            socket.close(None).await.ok();
            drain(socket).await;
        })
        .await;

        let transport = WsTransport::connect(&address).await.unwrap();
        let setup = SetupMessage::new("models/test", "list objects");
        let mut channel = InferenceChannel::handshake(transport, &setup, Duration::from_secs(5))
            .await
            .unwrap();
        let frame = Frame::new(1, jpeg());

        let first = channel
            .send_and_await(&frame, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(matches!(first, RoundOutcome::Timeout));

        sleep(Duration::from_secs(1)).await;

        let second = channel
            .send_and_await(&frame, Duration::from_secs(5))
            .await
            .unwrap();
        match second {
            RoundOutcome::Usable(labels) => assert_eq!(labels, vec!["Fresh", "Lamp"]),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let third = channel
            .send_and_await(&frame, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(third, RoundOutcome::TransportError(_)));
        assert_eq!(channel.state(), SessionState::Failed);

        channel.close().await;
        assert_eq!(channel.state(), SessionState::Closed);
    }
}
