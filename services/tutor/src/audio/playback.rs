//! Gapless, cursor-scheduled playback of the tutor's voice.

use super::AudioError;
use gemini_live::AudioChunk;
use gemini_live::pcm::{LIVE_OUTPUT_SAMPLE_RATE, convert_i16_to_f32};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rate the output device is opened at.
pub const PLAYBACK_SAMPLE_RATE: u32 = LIVE_OUTPUT_SAMPLE_RATE;

/// A clocked audio output that plays buffers at absolute times.
pub trait OutputSink: Send + Sync {
    /// Current position of the output clock, in seconds.
    fn now(&self) -> f64;
    /// Resumes a suspended output.
    fn resume(&self) -> Result<(), AudioError>;
    /// Plays `samples` (mono, at `sample_rate`) starting at `start` on the clock.
    fn schedule(&self, start: f64, samples: Vec<f32>, sample_rate: u32);
    /// Cancels every scheduled buffer, including one already sounding.
    fn clear(&self);
}

/// Opens output sinks.
pub trait OutputBackend: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn OutputSink>, AudioError>;
}

/// Where a chunk landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub start: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Default)]
struct PlaybackState {
    sink: Option<Arc<dyn OutputSink>>,
    cursor: f64,
    active: bool,
}

/// Plays inbound chunks back to back on a single output clock.
///
/// Each chunk starts at `max(cursor, now)` and moves the cursor to its end,
/// so consecutive chunks never overlap and never leave a gap while audio is
/// still queued.
pub struct AudioPlaybackEngine {
    backend: Arc<dyn OutputBackend>,
    state: Mutex<PlaybackState>,
}

impl AudioPlaybackEngine {
    pub fn new(backend: Arc<dyn OutputBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(PlaybackState::default()),
        }
    }

    /// Ensures the output exists and is running, then accepts chunks.
    ///
    /// The device is opened once and reused across sessions.
    pub fn init(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        let sink = match &state.sink {
            Some(sink) => {
                sink.resume()?;
                sink.clone()
            }
            None => {
                let sink = self.backend.open(PLAYBACK_SAMPLE_RATE)?;
                info!(sample_rate = PLAYBACK_SAMPLE_RATE, "Playback output opened");
                state.sink = Some(sink.clone());
                sink
            }
        };
        state.cursor = sink.now();
        state.active = true;
        Ok(())
    }

    /// Schedules a chunk right after the previous one, or now if the queue
    /// has drained. Ignored while the engine is inactive or the chunk is empty.
    pub fn play_chunk(&self, chunk: &AudioChunk) -> Option<ScheduledBuffer> {
        if chunk.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        if !state.active {
            debug!("Playback inactive; dropping chunk");
            return None;
        }
        let sink = state.sink.clone()?;
        let start = state.cursor.max(sink.now());
        let duration = chunk.duration_secs();
        sink.schedule(
            start,
            convert_i16_to_f32(chunk.samples()),
            chunk.sample_rate(),
        );
        state.cursor = start + duration;
        Some(ScheduledBuffer { start, duration })
    }

    /// Silences output and stops accepting chunks until re-armed.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.active = false;
        if let Some(sink) = state.sink.clone() {
            sink.clear();
            state.cursor = sink.now();
        }
    }

    /// Re-arms the engine on the existing output and rebases the cursor to
    /// now. A no-op before the output has been opened by [`init`](Self::init).
    pub fn resume(&self) {
        let mut state = self.state.lock();
        let Some(sink) = state.sink.clone() else {
            return;
        };
        if let Err(e) = sink.resume() {
            warn!(error = %e, "Failed to resume playback output");
        }
        state.cursor = sink.now();
        state.active = true;
    }

    /// Barge-in: drops the queued backlog and keeps playing. Chunks arriving
    /// afterwards start immediately instead of after the old backlog.
    ///
    /// Same as [`stop`](Self::stop) then [`resume`](Self::resume), under one
    /// lock, and only while active: a stopped engine stays stopped.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        let Some(sink) = state.sink.clone() else {
            return;
        };
        sink.clear();
        if let Err(e) = sink.resume() {
            warn!(error = %e, "Failed to resume playback output");
        }
        state.cursor = sink.now();
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// End time of the last scheduled chunk on the output clock.
    pub fn cursor(&self) -> f64 {
        self.state.lock().cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOutput;
    use approx::assert_relative_eq;

    fn chunk(samples: usize) -> AudioChunk {
        AudioChunk::mono(vec![1000; samples], PLAYBACK_SAMPLE_RATE)
    }

    fn engine(output: &Arc<FakeOutput>) -> AudioPlaybackEngine {
        AudioPlaybackEngine::new(output.clone())
    }

    #[test]
    fn test_chunks_are_scheduled_back_to_back() {
        let output = Arc::new(FakeOutput::new());
        output.set_now(2.0);
        let playback = engine(&output);
        playback.init().unwrap();

        let first = playback.play_chunk(&chunk(2400)).unwrap();
        let second = playback.play_chunk(&chunk(4800)).unwrap();
        let third = playback.play_chunk(&chunk(1200)).unwrap();

        assert_relative_eq!(first.start, 2.0);
        assert_relative_eq!(first.duration, 0.1);
        assert_relative_eq!(second.start, 2.1);
        assert_relative_eq!(third.start, 2.3);
        assert_relative_eq!(playback.cursor(), 2.35);

        let scheduled = output.scheduled();
        assert_eq!(scheduled.len(), 3);
        assert_eq!(scheduled[1].samples, 4800);
        assert_eq!(scheduled[1].sample_rate, PLAYBACK_SAMPLE_RATE);
    }

    #[test]
    fn test_drained_queue_starts_at_now() {
        let output = Arc::new(FakeOutput::new());
        let playback = engine(&output);
        playback.init().unwrap();
        playback.play_chunk(&chunk(2400)).unwrap();

        output.set_now(5.0);
        let next = playback.play_chunk(&chunk(2400)).unwrap();
        assert_relative_eq!(next.start, 5.0);
    }

    #[test]
    fn test_interrupt_clears_backlog_and_rebases_cursor() {
        let output = Arc::new(FakeOutput::new());
        output.set_now(1.0);
        let playback = engine(&output);
        playback.init().unwrap();
        for _ in 0..5 {
            playback.play_chunk(&chunk(24_000)).unwrap();
        }
        assert_relative_eq!(playback.cursor(), 6.0);

        output.set_now(1.5);
        playback.interrupt();
        assert_eq!(output.cleared(), 1);
        assert!(playback.is_active());
        assert_relative_eq!(playback.cursor(), 1.5);

        let next = playback.play_chunk(&chunk(2400)).unwrap();
        assert_relative_eq!(next.start, 1.5);
    }

    #[test]
    fn test_inactive_engine_drops_chunks() {
        let output = Arc::new(FakeOutput::new());
        let playback = engine(&output);
        assert!(playback.play_chunk(&chunk(100)).is_none());

        playback.init().unwrap();
        playback.stop();
        assert!(!playback.is_active());
        assert!(playback.play_chunk(&chunk(100)).is_none());
        assert!(output.scheduled().is_empty());
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let output = Arc::new(FakeOutput::new());
        let playback = engine(&output);
        playback.init().unwrap();
        assert!(playback.play_chunk(&chunk(0)).is_none());
        assert_relative_eq!(playback.cursor(), 0.0);
    }

    #[test]
    fn test_init_reuses_output_and_resumes_it() {
        let output = Arc::new(FakeOutput::new());
        let playback = engine(&output);
        playback.init().unwrap();
        playback.stop();
        playback.init().unwrap();
        assert_eq!(output.opened(), 1);
        assert_eq!(output.resumed(), 1);
        assert!(playback.is_active());
    }

    #[test]
    fn test_failed_open_keeps_engine_inactive() {
        let output = Arc::new(FakeOutput::unavailable());
        let playback = engine(&output);
        assert!(playback.init().is_err());
        assert!(!playback.is_active());
    }

    #[test]
    fn test_interrupt_does_not_rearm_stopped_engine() {
        let output = Arc::new(FakeOutput::new());
        let playback = engine(&output);
        playback.interrupt();
        assert_eq!(output.cleared(), 0);

        playback.init().unwrap();
        playback.stop();
        playback.interrupt();
        assert!(!playback.is_active());
        assert_eq!(output.cleared(), 1);
        assert!(playback.play_chunk(&chunk(100)).is_none());
    }

    #[test]
    fn test_resume_before_init_is_noop() {
        let output = Arc::new(FakeOutput::new());
        engine(&output).resume();
        assert_eq!(output.resumed(), 0);
    }
}
