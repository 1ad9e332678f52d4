//! Microphone capture: native-rate float samples in, 16 kHz PCM16 chunks out.
//!
//! The device callback only copies samples into a bounded SPSC ring and wakes
//! the worker; it never blocks and drops samples when the ring is full. A
//! worker thread drains fixed-size blocks, resamples each one on its own
//! (no phase carried between blocks) and hands the result to the caller.

use super::AudioError;
use gemini_live::AudioChunk;
use gemini_live::pcm::{LIVE_INPUT_SAMPLE_RATE, convert_f32_to_i16};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rate every outgoing chunk is resampled to.
pub const TARGET_SAMPLE_RATE: u32 = LIVE_INPUT_SAMPLE_RATE;
/// Number of native-rate samples resampled together.
pub const BLOCK_SIZE: usize = 4096;
const RING_CAPACITY: usize = BLOCK_SIZE * 16;

/// Input processing the capture asks the platform for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePreferences {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl Default for CapturePreferences {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

/// Receives mono float samples from the device callback.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A source of microphone audio.
pub trait InputBackend: Send + Sync {
    /// Opens the microphone exclusively and starts pushing mono samples at
    /// the device's native rate into `on_samples`.
    fn open(
        &self,
        preferences: CapturePreferences,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>, AudioError>;
}

/// An open input stream. Dropping it releases the device and the callback.
pub trait InputStream: Send {
    /// Native sample rate chosen by the hardware.
    fn sample_rate(&self) -> u32;
}

/// Nearest-neighbour resampling of one block.
///
/// With `ratio = native / target`, the output holds `floor(len / ratio)`
/// samples and sample `i` is `input[floor(i * ratio)]`.
pub fn decimate(input: &[f32], native_rate: u32, target_rate: u32) -> Vec<f32> {
    if input.is_empty() || native_rate == 0 || target_rate == 0 {
        return Vec::new();
    }
    if native_rate == target_rate {
        return input.to_vec();
    }
    let ratio = native_rate as f64 / target_rate as f64;
    let output_len = (input.len() as f64 / ratio).floor() as usize;
    (0..output_len)
        .map(|i| input[((i as f64 * ratio) as usize).min(input.len() - 1)])
        .collect()
}

/// Resamples a native-rate block to 16 kHz and packs it as PCM16.
pub fn encode_block(block: &[f32], native_rate: u32) -> AudioChunk {
    let resampled = decimate(block, native_rate, TARGET_SAMPLE_RATE);
    AudioChunk::mono(convert_f32_to_i16(&resampled), TARGET_SAMPLE_RATE)
}

struct RunningCapture {
    stream: Box<dyn InputStream>,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Owns the microphone while capture is running.
pub struct AudioCaptureEngine {
    backend: Arc<dyn InputBackend>,
    preferences: CapturePreferences,
    running: Option<RunningCapture>,
}

impl AudioCaptureEngine {
    pub fn new(backend: Arc<dyn InputBackend>) -> Self {
        Self {
            backend,
            preferences: CapturePreferences::default(),
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Starts capturing; `on_chunk` runs on the capture worker thread for
    /// every 16 kHz chunk. Fails if capture is already running or the
    /// microphone cannot be opened, leaving the engine stopped.
    pub fn start<F>(&mut self, on_chunk: F) -> Result<(), AudioError>
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        if self.running.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        let (mut producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
        let stop = Arc::new(AtomicBool::new(false));
        let (rate_tx, rate_rx) = mpsc::sync_channel::<u32>(1);

        let worker_stop = stop.clone();
        let worker = thread::Builder::new()
            .name("gambit-capture-worker".into())
            .spawn(move || {
                // The sender is dropped without a value when opening fails.
                if let Ok(native_rate) = rate_rx.recv() {
                    run_worker(consumer, native_rate, &worker_stop, on_chunk);
                }
            })
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        let waker = worker.thread().clone();
        let on_samples: SampleCallback = Box::new(move |samples: &[f32]| {
            producer.push_slice(samples);
            if producer.occupied_len() >= BLOCK_SIZE {
                waker.unpark();
            }
        });

        let stream = match self.backend.open(self.preferences, on_samples) {
            Ok(stream) => stream,
            Err(e) => {
                drop(rate_tx);
                let _ = worker.join();
                return Err(e);
            }
        };

        let native_rate = stream.sample_rate();
        if rate_tx.send(native_rate).is_err() {
            drop(stream);
            let _ = worker.join();
            return Err(AudioError::Stream("capture worker exited early".into()));
        }
        info!(native_rate, target_rate = TARGET_SAMPLE_RATE, "Microphone capture started");

        self.running = Some(RunningCapture {
            stream,
            stop,
            worker,
        });
        Ok(())
    }

    /// Releases the microphone and stops the worker. No-op when not running.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        drop(running.stream);
        running.stop.store(true, Ordering::Release);
        running.worker.thread().unpark();
        if running.worker.join().is_err() {
            warn!("Capture worker panicked");
        }
        info!("Microphone capture stopped");
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<F>(
    mut consumer: ringbuf::HeapCons<f32>,
    native_rate: u32,
    stop: &AtomicBool,
    mut on_chunk: F,
) where
    F: FnMut(AudioChunk),
{
    let mut block = vec![0.0f32; BLOCK_SIZE];
    let mut emitted: u64 = 0;
    loop {
        while !stop.load(Ordering::Acquire) && consumer.occupied_len() >= BLOCK_SIZE {
            consumer.pop_slice(&mut block);
            on_chunk(encode_block(&block, native_rate));
            emitted += 1;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        thread::park_timeout(Duration::from_millis(100));
    }
    debug!(emitted, "Capture worker finished");
}
