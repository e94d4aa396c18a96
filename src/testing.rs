//! Scripted stand-ins for the camera, the inference service and the sink.

use crate::{
    camera::{CameraError, FrameSource},
    detection::DetectionResult,
    sink::{ResultSink, SinkError},
    transport::{Connector, Transport, TransportError},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

pub(crate) const SETUP_ACK: &str = r#"{"setupComplete":{}}"#;

pub(crate) fn reply(text: &str) -> String {
    serde_json::json!({
        "serverContent": { "modelTurn": { "parts": [{ "text": text }] } }
    })
    .to_string()
}

pub(crate) fn jpeg() -> Bytes {
    Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10])
}

enum SetupBehavior {
    Ack,
    Close,
    Silent,
}

/// What the fake service does after receiving a frame.
enum Step {
    Reply(String),
    Silence,
    /// Nothing within the round, the reply lands before the next send.
    Late(String),
    Disconnect,
}

#[derive(Default)]
struct LogInner {
    sent: Vec<String>,
    close_calls: usize,
    dropped: bool,
}

#[derive(Clone, Default)]
pub(crate) struct TransportLog(Arc<Mutex<LogInner>>);

impl TransportLog {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.0.lock().sent.clone()
    }

    /// Frame messages only, setup excluded.
    pub(crate) fn frames_sent(&self) -> usize {
        self.0
            .lock()
            .sent
            .iter()
            .filter(|message| message.contains("\"clientContent\""))
            .count()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.0.lock().close_calls
    }

    pub(crate) fn closed(&self) -> bool {
        self.close_calls() > 0
    }

    pub(crate) fn dropped(&self) -> bool {
        self.0.lock().dropped
    }
}

pub(crate) struct ScriptedTransport {
    setup: SetupBehavior,
    setup_done: bool,
    steps: VecDeque<Step>,
    inbox: VecDeque<String>,
    deferred: Vec<String>,
    disconnected: bool,
    log: TransportLog,
}

impl ScriptedTransport {
    fn with_setup(setup: SetupBehavior) -> Self {
        Self {
            setup,
            setup_done: false,
            steps: VecDeque::new(),
            inbox: VecDeque::new(),
            deferred: Vec::new(),
            disconnected: false,
            log: TransportLog::default(),
        }
    }

    pub(crate) fn acknowledging() -> Self {
        Self::with_setup(SetupBehavior::Ack)
    }

    pub(crate) fn closing_on_setup() -> Self {
        Self::with_setup(SetupBehavior::Close)
    }

    pub(crate) fn silent_on_setup() -> Self {
        Self::with_setup(SetupBehavior::Silent)
    }

    pub(crate) fn reply(mut self, message: String) -> Self {
        self.steps.push_back(Step::Reply(message));
        self
    }

    pub(crate) fn silence(mut self) -> Self {
        self.steps.push_back(Step::Silence);
        self
    }

    pub(crate) fn late_reply(mut self, message: String) -> Self {
        self.steps.push_back(Step::Late(message));
        self
    }

    pub(crate) fn disconnect(mut self) -> Self {
        self.steps.push_back(Step::Disconnect);
        self
    }

    pub(crate) fn log(&self) -> TransportLog {
        self.log.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        if self.disconnected {
            return Err(TransportError::Closed);
        }
        self.log.0.lock().sent.push(message);

        if !self.setup_done {
            self.setup_done = true;
            match self.setup {
                SetupBehavior::Ack => self.inbox.push_back(SETUP_ACK.to_string()),
                SetupBehavior::Close => self.disconnected = true,
                SetupBehavior::Silent => {}
            }
            return Ok(());
        }

        match self.steps.pop_front().unwrap_or(Step::Silence) {
            Step::Reply(message) => self.inbox.push_back(message),
            Step::Silence => {}
            Step::Late(message) => self.deferred.push(message),
            Step::Disconnect => self.disconnected = true,
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if let Some(message) = self.inbox.pop_front() {
            return Some(Ok(message));
        }
        if self.disconnected {
            return None;
        }
        std::future::pending().await
    }

    fn try_recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbox.extend(self.deferred.drain(..));
        self.inbox.pop_front().map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.log.0.lock().close_calls += 1;
        self.disconnected = true;
        Ok(())
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.log.0.lock().dropped = true;
    }
}

pub(crate) struct ScriptedConnector {
    transport: Mutex<Option<ScriptedTransport>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub(crate) fn new(transport: ScriptedTransport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            transport: Mutex::new(None),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self) -> Result<ScriptedTransport, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.transport
            .lock()
            .take()
            .ok_or(TransportError::MaxRetriesExceeded)
    }
}

/// Hands out scripted captures, then valid frames forever.
#[derive(Default)]
pub(crate) struct ScriptedCamera {
    captures: Mutex<VecDeque<Result<Bytes, CameraError>>>,
    calls: AtomicUsize,
}

impl ScriptedCamera {
    pub(crate) fn failing_first(failures: usize) -> Self {
        let camera = Self::default();
        {
            let mut captures = camera.captures.lock();
            for _ in 0..failures {
                captures.push_back(Err(CameraError::EmptyFrame));
            }
        }
        camera
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for ScriptedCamera {
    async fn capture(&self) -> Result<Bytes, CameraError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.captures.lock().pop_front().unwrap_or_else(|| Ok(jpeg()))
    }
}

#[derive(Default)]
pub(crate) struct MemorySink {
    persisted: Mutex<Vec<(DetectionResult, DateTime<Utc>)>>,
    failing: bool,
}

impl MemorySink {
    pub(crate) fn failing() -> Self {
        Self {
            persisted: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub(crate) fn persisted(&self) -> Vec<DetectionResult> {
        self.persisted
            .lock()
            .iter()
            .map(|(result, _)| result.clone())
            .collect()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn persist(
        &self,
        result: &DetectionResult,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        if self.failing {
            return Err(SinkError::Io(std::io::Error::other("disk full")));
        }
        self.persisted.lock().push((result.clone(), timestamp));
        Ok(())
    }
}
