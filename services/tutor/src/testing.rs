//! In-memory transport and audio backends for the unit tests.

use crate::audio::capture::{CapturePreferences, InputBackend, InputStream, SampleCallback};
use crate::audio::playback::{OutputBackend, OutputSink};
use crate::audio::AudioError;
use async_trait::async_trait;
use gemini_live::{Connector, FrameSink, FrameStream, LiveError, Transport, TransportEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// How the fake server answers one connection.
#[derive(Debug, Clone)]
pub enum Script {
    /// Opening the transport fails.
    Refuse,
    /// Acknowledges the Setup frame.
    Accept,
    /// Never answers.
    Silent,
    /// Answers the Setup frame with an error frame.
    Reject(String),
    /// Closes the connection with this code instead of acknowledging.
    CloseDuringHandshake(u16),
}

type Inbox = mpsc::UnboundedSender<Option<TransportEvent>>;

struct FakeServer {
    inbox: Inbox,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

pub struct FakeConnector {
    default: Script,
    scripts: Mutex<VecDeque<Script>>,
    opened: AtomicUsize,
    servers: Mutex<Vec<FakeServer>>,
}

impl FakeConnector {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            scripts: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Queues a script for the next connection, ahead of the default.
    pub fn push_script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Frames the client sent on the latest connection.
    pub fn sent(&self) -> Vec<String> {
        self.servers
            .lock()
            .last()
            .map(|server| server.sent.lock().clone())
            .unwrap_or_default()
    }

    /// Delivers an event on the latest connection.
    pub fn push(&self, event: TransportEvent) {
        if let Some(server) = self.servers.lock().last() {
            let _ = server.inbox.send(Some(event));
        }
    }

    /// Ends the latest connection's stream without a close frame.
    pub fn end_stream(&self) {
        if let Some(server) = self.servers.lock().last() {
            let _ = server.inbox.send(None);
        }
    }

    /// Whether the client closed the latest connection.
    pub fn sink_closed(&self) -> bool {
        self.servers
            .lock()
            .last()
            .is_some_and(|server| server.closed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self) -> Result<Transport, LiveError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        if let Script::Refuse = script {
            return Err(LiveError::Transport("connection refused".into()));
        }

        let (inbox, events) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.servers.lock().push(FakeServer {
            inbox: inbox.clone(),
            sent: sent.clone(),
            closed: closed.clone(),
        });
        Ok(Transport {
            sink: Box::new(FakeSink {
                script,
                inbox,
                sent,
                closed,
            }),
            stream: Box::new(FakeStream { events }),
        })
    }
}

struct FakeSink {
    script: Script,
    inbox: Inbox,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send(&mut self, frame: String) -> Result<(), LiveError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LiveError::Transport("sink closed".into()));
        }
        let is_setup = frame.starts_with("{\"setup\"");
        self.sent.lock().push(frame);
        if !is_setup {
            return Ok(());
        }
        let reply = match &self.script {
            Script::Accept => Some(TransportEvent::Frame(r#"{"setupComplete":{}}"#.into())),
            Script::Reject(message) => Some(TransportEvent::Frame(
                serde_json::json!({"error": {"message": message}}).to_string(),
            )),
            Script::CloseDuringHandshake(code) => Some(TransportEvent::Closed {
                code: Some(*code),
                reason: "closed by test".into(),
            }),
            Script::Silent | Script::Refuse => None,
        };
        if let Some(reply) = reply {
            let _ = self.inbox.send(Some(reply));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LiveError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeStream {
    events: mpsc::UnboundedReceiver<Option<TransportEvent>>,
}

#[async_trait]
impl FrameStream for FakeStream {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await.flatten()
    }
}

type SharedCallback = Arc<Mutex<Option<SampleCallback>>>;

/// A microphone the test feeds by hand.
pub struct FakeInput {
    sample_rate: u32,
    deny: bool,
    callback: SharedCallback,
    preferences: Mutex<Option<CapturePreferences>>,
}

impl FakeInput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            deny: false,
            callback: Arc::new(Mutex::new(None)),
            preferences: Mutex::new(None),
        }
    }

    /// A microphone the user refused access to.
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::new(48_000)
        }
    }

    /// Pushes samples through the device callback, as the hardware would.
    pub fn feed(&self, samples: &[f32]) {
        if let Some(callback) = self.callback.lock().as_mut() {
            callback(samples);
        }
    }

    pub fn is_open(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn last_preferences(&self) -> Option<CapturePreferences> {
        *self.preferences.lock()
    }
}

struct FakeInputStream {
    sample_rate: u32,
    callback: SharedCallback,
}

impl InputStream for FakeInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for FakeInputStream {
    fn drop(&mut self) {
        self.callback.lock().take();
    }
}

impl InputBackend for FakeInput {
    fn open(
        &self,
        preferences: CapturePreferences,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        if self.deny {
            return Err(AudioError::Unavailable("permission denied".into()));
        }
        *self.preferences.lock() = Some(preferences);
        *self.callback.lock() = Some(on_samples);
        Ok(Box::new(FakeInputStream {
            sample_rate: self.sample_rate,
            callback: self.callback.clone(),
        }))
    }
}

/// One `schedule` call seen by the fake speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub start: f64,
    pub samples: usize,
    pub sample_rate: u32,
}

#[derive(Default)]
struct FakeSpeaker {
    now: Mutex<f64>,
    scheduled: Mutex<Vec<Scheduled>>,
    cleared: AtomicUsize,
    resumed: AtomicUsize,
}

impl OutputSink for FakeSpeaker {
    fn now(&self) -> f64 {
        *self.now.lock()
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.resumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn schedule(&self, start: f64, samples: Vec<f32>, sample_rate: u32) {
        self.scheduled.lock().push(Scheduled {
            start,
            samples: samples.len(),
            sample_rate,
        });
    }

    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

/// A speaker with a hand-driven clock.
pub struct FakeOutput {
    speaker: Arc<FakeSpeaker>,
    unavailable: bool,
    opened: AtomicUsize,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self {
            speaker: Arc::new(FakeSpeaker::default()),
            unavailable: false,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new()
        }
    }

    pub fn set_now(&self, now: f64) {
        *self.speaker.now.lock() = now;
    }

    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.speaker.scheduled.lock().clone()
    }

    pub fn cleared(&self) -> usize {
        self.speaker.cleared.load(Ordering::SeqCst)
    }

    pub fn resumed(&self) -> usize {
        self.speaker.resumed.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl OutputBackend for FakeOutput {
    fn open(&self, _sample_rate: u32) -> Result<Arc<dyn OutputSink>, AudioError> {
        if self.unavailable {
            return Err(AudioError::NoDevice("output"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.speaker.clone())
    }
}
