//! Connection lifecycle, inbound dispatch and the caller-facing operations
//! of a voice session.
//!
//! Every path that ends a connection (explicit disconnect, error frame,
//! close event, stream end, failed handshake) goes through the same teardown,
//! which bumps an epoch counter. Work started under an older epoch (a
//! handshake still in flight, a reader about to report a close) checks the
//! epoch before touching shared state and becomes a no-op once superseded.

use super::state::{ConnectionStatus, Gate, SessionState};
use crate::audio::{AudioCaptureEngine, AudioPlaybackEngine, InputBackend, OutputBackend};
use gambit_core::{ContextSnapshot, ConversationContext, GameEvent, Side};
use gemini_live::close::ABNORMAL_CLOSURE;
use gemini_live::{
    CloseKind, Connector, ContentPart, FrameSink, FrameStream, InboundFrame, LiveError,
    SetupConfig, Transport, TransportEvent, classify_close, decode_frame, encode_audio_input,
    encode_setup, encode_user_turn,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Connection parameters of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub setup: SetupConfig,
    /// Upper bound on transport open plus handshake acknowledgment.
    pub handshake_timeout: Duration,
    /// Connect calls allowed without a successful handshake in between.
    pub max_reconnect_attempts: u32,
    /// Capacity of the outbound frame queue.
    pub outbound_capacity: usize,
}

impl SessionConfig {
    pub fn new(setup: SetupConfig) -> Self {
        Self {
            setup,
            handshake_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            outbound_capacity: 64,
        }
    }
}

/// Why a connect attempt did not end with an active session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("A connection attempt is already in progress")]
    Busy,
    #[error("Session is in a fatal state: {0}")]
    Fatal(String),
    #[error("Gave up after {0} failed connection attempts")]
    AttemptsExhausted(u32),
    #[error("Handshake not acknowledged within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Live(#[from] LiveError),
    #[error("Server rejected the session: {0}")]
    Rejected(String),
    #[error("Connection closed during handshake (code {code:?}): {reason}")]
    Closed {
        code: Option<u16>,
        reason: String,
        kind: CloseKind,
    },
    #[error("Connection ended before the handshake completed")]
    Ended,
    #[error("Connection attempt was cancelled by a disconnect")]
    Superseded,
}

impl ConnectError {
    /// Whether the failure rules out any further attempt in this session.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectError::Fatal(_) | ConnectError::AttemptsExhausted(_) | ConnectError::Rejected(_) => {
                true
            }
            ConnectError::Closed { kind, .. } => *kind == CloseKind::Fatal,
            _ => false,
        }
    }
}

struct Link {
    outbound: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    // Exits on its own once `outbound` and every clone of it are dropped.
    _writer: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    context: ConversationContext,
    capture: Mutex<AudioCaptureEngine>,
    playback: AudioPlaybackEngine,
    link: Mutex<Option<Link>>,
    epoch: AtomicU64,
}

/// A realtime voice conversation with the tutor.
///
/// A session that has gone Fatal stays Fatal; create a new one to retry.
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        input: Arc<dyn InputBackend>,
        output: Arc<dyn OutputBackend>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state,
                context: ConversationContext::new(),
                capture: Mutex::new(AudioCaptureEngine::new(input)),
                playback: AudioPlaybackEngine::new(output),
                link: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Connects if possible. Returns `true` once the session is active,
    /// including when it already was.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(ConnectError::Busy) => {
                debug!("Connect ignored; attempt already in progress");
                false
            }
            Err(e) => {
                warn!(error = %e, "Connect failed");
                false
            }
        }
    }

    /// Like [`connect`](Self::connect), but says why an attempt failed.
    #[instrument(skip(self), fields(attempt = tracing::field::Empty))]
    pub async fn try_connect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let max_attempts = inner.config.max_reconnect_attempts;
        let mut gate = Gate::Busy;
        inner.state.send_if_modified(|state| {
            gate = state.begin_attempt(max_attempts);
            matches!(gate, Gate::Proceed(_) | Gate::Exhausted(_))
        });

        let attempt = match gate {
            Gate::Proceed(attempt) => attempt,
            Gate::AlreadyActive => return Ok(()),
            Gate::Busy => return Err(ConnectError::Busy),
            Gate::Fatal => {
                let reason = inner.state.borrow().last_error.clone().unwrap_or_default();
                return Err(ConnectError::Fatal(reason));
            }
            Gate::Exhausted(max) => {
                error!(max_attempts = max, "Reconnect budget exhausted");
                return Err(ConnectError::AttemptsExhausted(max));
            }
        };
        tracing::Span::current().record("attempt", attempt);
        let epoch = inner.epoch.load(Ordering::SeqCst);
        info!("Connecting to Live API");

        let timeout = inner.config.handshake_timeout;
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, inner.handshake()) => outcome,
            _ = superseded(inner.state.subscribe()) => return Err(ConnectError::Superseded),
        };

        let transport = match outcome {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                inner.terminate(epoch, e.is_fatal(), e.to_string());
                return Err(e);
            }
            Err(_) => {
                let e = ConnectError::Timeout(timeout);
                inner.terminate(epoch, false, e.to_string());
                return Err(e);
            }
        };

        match Inner::activate(inner, epoch, transport) {
            Ok(()) => {
                info!("Live session active");
                Ok(())
            }
            Err(mut stale) => {
                debug!("Handshake finished after disconnect; closing late transport");
                let _ = stale.sink.close().await;
                Err(ConnectError::Superseded)
            }
        }
    }

    /// Tears the connection down. Safe to call in any state, any number of times.
    pub fn disconnect(&self) {
        self.inner.cleanup();
    }

    /// Replaces the game context used by later prompts. Never touches the network.
    pub fn push_context(&self, position: &str, side: Side, participant_name: &str) {
        self.inner.context.update(position, side, participant_name);
    }

    pub fn context(&self) -> ContextSnapshot {
        self.inner.context.snapshot()
    }

    /// Sends the prompt for `event` as a completed user turn. Dropped when
    /// the session is not active; never queued for later.
    pub fn send_event(&self, event: &GameEvent) {
        let prompt = event.prompt(&self.inner.context.snapshot());
        self.inner.send_user_turn(event.kind(), &prompt);
    }

    /// Sends free-form text as a completed user turn, with the same
    /// delivery rules as [`send_event`](Self::send_event).
    pub fn send_chat(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.inner.send_user_turn("chat", text);
    }

    /// Starts streaming the microphone. Cuts off any tutor speech first.
    ///
    /// Returns `false` when the session is not active, capture is already
    /// running or the microphone cannot be opened.
    pub fn start_capture(&self) -> bool {
        let inner = &self.inner;
        let link = inner.link.lock();
        let Some(outbound) = link.as_ref().map(|link| link.outbound.clone()) else {
            debug!("Not connected; capture not started");
            return false;
        };
        if !inner.state.borrow().connected() {
            return false;
        }
        let mut capture = inner.capture.lock();
        if capture.is_running() {
            debug!("Capture already running");
            return false;
        }

        inner.interrupt();

        let started = device_work(|| {
            capture.start(move |chunk| match encode_audio_input(&chunk) {
                Ok(frame) => {
                    if let Err(e) = outbound.try_send(frame) {
                        debug!(error = %e, "Dropping microphone chunk");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode microphone chunk"),
            })
        });

        match started {
            Ok(()) => {
                // Still under the link lock: a teardown cannot run before this lands.
                inner.state.send_modify(|state| state.listening = true);
                true
            }
            Err(e) => {
                warn!(error = %e, "Could not start microphone capture");
                false
            }
        }
    }

    /// Stops streaming the microphone. No-op when not capturing.
    pub fn stop_capture(&self) {
        let was_running = {
            let mut capture = self.inner.capture.lock();
            let running = capture.is_running();
            device_work(|| capture.stop());
            running
        };
        if was_running {
            self.inner
                .state
                .send_if_modified(|state| std::mem::replace(&mut state.listening, false));
        }
    }

    /// Cuts off the tutor: drops queued audio and plays the next chunk immediately.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Watches the session state; the receiver sees every published change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.cleanup();
    }
}

/// Runs audio device open/close, which blocks on OS threads, without
/// stalling the other tasks of a multi-threaded runtime.
fn device_work<R>(work: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

/// Resolves once the status leaves Connecting, i.e. a teardown raced the handshake.
async fn superseded(mut state: watch::Receiver<SessionState>) {
    let _ = state.wait_for(|state| !state.connecting()).await;
}

impl Inner {
    /// Opens a transport, sends Setup and waits for the acknowledgment.
    async fn handshake(&self) -> Result<Transport, ConnectError> {
        let mut transport = self.connector.open().await?;
        let setup = encode_setup(&self.config.setup)?;
        transport.sink.send(setup).await?;
        debug!(model = %self.config.setup.model, "Setup frame sent");

        loop {
            match transport.stream.next_event().await {
                Some(TransportEvent::Frame(raw)) => match decode_frame(&raw) {
                    InboundFrame::HandshakeAck => return Ok(transport),
                    InboundFrame::Error { message } => return Err(ConnectError::Rejected(message)),
                    InboundFrame::Content(_) | InboundFrame::Unknown => {
                        debug!("Ignoring frame received before handshake acknowledgment");
                    }
                },
                Some(TransportEvent::Closed { code, reason }) => {
                    return Err(ConnectError::Closed {
                        code,
                        reason,
                        kind: classify_close(code),
                    });
                }
                Some(TransportEvent::Error(e)) => return Err(LiveError::Transport(e).into()),
                None => return Err(ConnectError::Ended),
            }
        }
    }

    /// Promotes a verified handshake to an active session, unless a teardown
    /// happened meanwhile, in which case the transport is handed back.
    fn activate(self: &Arc<Self>, epoch: u64, transport: Transport) -> Result<(), Transport> {
        let mut link = self.link.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch || !self.state.borrow().connecting() {
            return Err(transport);
        }

        if let Err(e) = device_work(|| self.playback.init()) {
            warn!(error = %e, "Playback unavailable; tutor audio will not be heard");
        }

        self.state.send_modify(|state| {
            state.status = ConnectionStatus::Active;
            state.reconnect_attempts = 0;
            state.last_error = None;
        });

        let (outbound, queue) = mpsc::channel(self.config.outbound_capacity);
        let Transport { sink, stream } = transport;
        *link = Some(Link {
            outbound,
            reader: tokio::spawn(read_loop(self.clone(), epoch, stream)),
            _writer: tokio::spawn(write_loop(sink, queue)),
        });
        Ok(())
    }

    fn send_user_turn(&self, kind: &str, text: &str) {
        let outbound = {
            let link = self.link.lock();
            match link.as_ref() {
                Some(link) if self.state.borrow().connected() => link.outbound.clone(),
                _ => {
                    debug!(kind, "Not connected; dropping user turn");
                    return;
                }
            }
        };
        let frame = match encode_user_turn(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind, error = %e, "Failed to encode user turn");
                return;
            }
        };
        match outbound.try_send(frame) {
            Ok(()) => debug!(kind, "User turn queued"),
            Err(e) => warn!(kind, error = %e, "Dropping user turn"),
        }
    }

    fn interrupt(&self) {
        self.playback.interrupt();
        self.state
            .send_if_modified(|state| std::mem::replace(&mut state.speaking, false));
    }

    fn handle_content(&self, epoch: u64, part: ContentPart) {
        if part.interrupted {
            debug!("Server interrupted the tutor");
            self.interrupt();
        }

        let mut scheduled = false;
        for chunk in &part.audio {
            scheduled |= self.playback.play_chunk(chunk).is_some();
        }

        if let Some(heard) = &part.input_transcript {
            info!(transcript = %heard, "Participant said");
        }

        let text = part.text.as_deref().or(part.output_transcript.as_deref());
        self.state.send_if_modified(|state| {
            // Teardown bumps the epoch before it resets the flags.
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            let mut changed = false;
            if scheduled && !state.speaking {
                state.speaking = true;
                changed = true;
            }
            if let Some(text) = text {
                state.append_transcript(text);
                changed = true;
            }
            if part.turn_complete {
                state.close_turn();
                changed = true;
            }
            changed
        });
    }

    /// Ends the connection of `epoch` if it is still the current one.
    fn terminate(&self, epoch: u64, fatal: bool, message: String) {
        let mut link = self.link.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.teardown(&mut link);
        if fatal {
            error!(%message, "Session failed");
        } else {
            warn!(%message, "Session closed");
        }
        self.state.send_modify(|state| {
            state.reset_flags();
            if fatal {
                state.mark_fatal(message);
            } else {
                state.mark_closed(Some(message));
            }
        });
    }

    fn cleanup(&self) {
        let mut link = self.link.lock();
        self.teardown(&mut link);
        self.state.send_if_modified(|state| {
            let before = (state.status, state.listening, state.speaking);
            state.reset_flags();
            if matches!(
                state.status,
                ConnectionStatus::Connecting | ConnectionStatus::Active
            ) {
                state.status = ConnectionStatus::Closed;
            }
            before != (state.status, state.listening, state.speaking)
        });
    }

    fn teardown(&self, link: &mut Option<Link>) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        device_work(|| self.capture.lock().stop());
        self.playback.stop();
        if let Some(link) = link.take() {
            link.reader.abort();
            debug!("Transport released");
        }
    }
}

async fn read_loop(inner: Arc<Inner>, epoch: u64, mut stream: Box<dyn FrameStream>) {
    while let Some(event) = stream.next_event().await {
        match event {
            TransportEvent::Frame(raw) => match decode_frame(&raw) {
                InboundFrame::Content(part) => inner.handle_content(epoch, part),
                InboundFrame::HandshakeAck => debug!("Ignoring repeated handshake acknowledgment"),
                InboundFrame::Error { message } => {
                    inner.terminate(epoch, true, format!("Server error: {message}"));
                    return;
                }
                InboundFrame::Unknown => debug!(len = raw.len(), "Discarding unrecognised frame"),
            },
            TransportEvent::Closed { code, reason } => {
                let fatal = classify_close(code) == CloseKind::Fatal;
                inner.terminate(
                    epoch,
                    fatal,
                    format!("Connection closed (code {code:?}): {reason}"),
                );
                return;
            }
            TransportEvent::Error(e) => {
                inner.terminate(epoch, false, format!("Transport error: {e}"));
                return;
            }
        }
    }
    inner.terminate(
        epoch,
        classify_close(Some(ABNORMAL_CLOSURE)) == CloseKind::Fatal,
        format!("Connection ended without a close frame ({ABNORMAL_CLOSURE})"),
    );
}

async fn write_loop(mut sink: Box<dyn FrameSink>, mut queue: mpsc::Receiver<String>) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "Failed to send frame; writer stopping");
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Transport close failed");
    }
}
