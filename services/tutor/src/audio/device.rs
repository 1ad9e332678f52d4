//! cpal-backed microphone and speaker.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on its
//! own thread for its whole life. The thread is told to shut down by dropping
//! the sending half of a channel it blocks on.

use super::AudioError;
use super::capture::{CapturePreferences, InputBackend, InputStream, SampleCallback};
use super::playback::{OutputBackend, OutputSink};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use parking_lot::Mutex;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, AudioError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .map_err(|e| AudioError::Resample(e.to_string()))
}

/// Resamples one mono buffer in a single pass.
///
/// The resampler's startup delay is flushed out and trimmed off, so the
/// result starts at the first input sample and holds exactly
/// `len * to_rate / from_rate` frames. Back-to-back buffers therefore line
/// up on the output clock without a shift or a clipped tail.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let to_err = |e: rubato::ResampleError| AudioError::Resample(e.to_string());
    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let mut resampler = create_resampler(from_rate as f64, to_rate as f64, samples.len())?;
    let delay = resampler.output_delay();

    let mut output = resampler
        .process(&[samples], None)
        .map_err(to_err)?
        .pop()
        .unwrap_or_default();
    while output.len() < delay + expected {
        let tail = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(to_err)?
            .pop()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        output.extend(tail);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Averages interleaved frames down to mono, reusing its buffer across calls.
struct Downmixer {
    channels: usize,
    mono: Vec<f32>,
}

impl Downmixer {
    fn new(channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
            mono: Vec::new(),
        }
    }

    fn mix<T: Copy>(&mut self, data: &[T], to_f32: impl Fn(T) -> f32) -> &[f32] {
        self.mono.clear();
        if self.channels == 1 {
            self.mono.extend(data.iter().map(|&s| to_f32(s)));
        } else {
            let scale = 1.0 / self.channels as f32;
            self.mono.extend(
                data.chunks_exact(self.channels)
                    .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() * scale),
            );
        }
        &self.mono
    }
}

/// The default system microphone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

struct CpalInputStream {
    sample_rate: u32,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl InputBackend for CpalInput {
    fn open(
        &self,
        preferences: CapturePreferences,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        // cpal exposes no voice-processing switches; the platform default
        // input path applies whatever the OS is configured for.
        debug!(?preferences, "Opening default input device");

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<u32, AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("gambit-mic".into())
            .spawn(move || run_input(on_samples, ready_tx, shutdown_rx))
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Box::new(CpalInputStream {
                sample_rate,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Stream("microphone thread exited".into()))
            }
        }
    }
}

fn build_input(
    mut on_samples: SampleCallback,
) -> Result<(cpal::Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(AudioError::NoDevice("input"))?;
    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::Unavailable(e.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let mut downmix = Downmixer::new(config.channels);
    let on_error = |err: cpal::StreamError| error!("Input stream error: {err}");

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                on_samples(downmix.mix(data, |s| s));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                on_samples(downmix.mix(data, |s| s as f32 / 32768.0));
            },
            on_error,
            None,
        ),
        other => return Err(AudioError::UnsupportedFormat(other.to_string())),
    }
    .map_err(|e| AudioError::Unavailable(e.to_string()))?;

    stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
    info!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "Input stream running"
    );
    Ok((stream, config.sample_rate.0))
}

fn run_input(
    on_samples: SampleCallback,
    ready: SyncSender<Result<u32, AudioError>>,
    shutdown: Receiver<()>,
) {
    match build_input(on_samples) {
        Ok((stream, rate)) => {
            if ready.send(Ok(rate)).is_err() {
                return;
            }
            // Blocks until the owning handle drops its sender.
            let _ = shutdown.recv();
            drop(stream);
            debug!("Input stream released");
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

struct PendingBuffer {
    start_frame: u64,
    samples: Vec<f32>,
}

impl PendingBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled mono buffers into the output callback.
///
/// The clock is the number of frames handed to the device, so it only
/// advances while the stream is actually rendering.
pub struct Mixer {
    device_rate: u32,
    frames_rendered: AtomicU64,
    pending: Mutex<VecDeque<PendingBuffer>>,
}

impl Mixer {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            frames_rendered: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Seconds of audio rendered so far.
    pub fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    /// Queues device-rate samples to start at `start_secs` on the clock.
    pub fn enqueue(&self, start_secs: f64, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        let start_frame = (start_secs.max(0.0) * self.device_rate as f64).round() as u64;
        let mut pending = self.pending.lock();
        let at = pending
            .iter()
            .position(|b| b.start_frame > start_frame)
            .unwrap_or(pending.len());
        pending.insert(
            at,
            PendingBuffer {
                start_frame,
                samples,
            },
        );
    }

    /// Drops every queued buffer, including the one currently sounding.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fills an interleaved output buffer and advances the clock.
    ///
    /// Renders silence rather than waiting if the queue is being modified.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        out.fill(0.0);
        let first = self.frames_rendered.load(Ordering::Acquire);
        let last = first + frames as u64;

        if let Some(mut pending) = self.pending.try_lock() {
            for buffer in pending.iter() {
                if buffer.start_frame >= last {
                    break;
                }
                let from = buffer.start_frame.max(first);
                let to = buffer.end_frame().min(last);
                for frame in from..to {
                    let sample = buffer.samples[(frame - buffer.start_frame) as usize];
                    let base = (frame - first) as usize * channels;
                    for slot in &mut out[base..base + channels] {
                        *slot += sample;
                    }
                }
            }
            pending.retain(|b| b.end_frame() > last);
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }
        self.frames_rendered.store(last, Ordering::Release);
    }
}

enum Control {
    Play,
}

/// The default system speaker.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

struct CpalSpeaker {
    mixer: Arc<Mixer>,
    control: Option<Sender<Control>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputSink for CpalSpeaker {
    fn now(&self) -> f64 {
        self.mixer.now()
    }

    fn resume(&self) -> Result<(), AudioError> {
        match &self.control {
            Some(control) => control
                .send(Control::Play)
                .map_err(|_| AudioError::Stream("speaker thread exited".into())),
            None => Err(AudioError::Stream("speaker closed".into())),
        }
    }

    fn schedule(&self, start: f64, samples: Vec<f32>, sample_rate: u32) {
        let device_rate = self.mixer.device_rate();
        let samples = if sample_rate == device_rate {
            samples
        } else {
            match resample(&samples, sample_rate, device_rate) {
                Ok(resampled) => resampled,
                Err(e) => {
                    warn!(error = %e, "Dropping playback buffer");
                    return;
                }
            }
        };
        self.mixer.enqueue(start, samples);
    }

    fn clear(&self) {
        self.mixer.clear();
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.control.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl OutputBackend for CpalOutput {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn OutputSink>, AudioError> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<Arc<Mixer>, AudioError>>(1);
        let (control_tx, control_rx) = mpsc::channel::<Control>();

        let thread = thread::Builder::new()
            .name("gambit-speaker".into())
            .spawn(move || run_output(sample_rate, ready_tx, control_rx))
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(mixer)) => Ok(Arc::new(CpalSpeaker {
                mixer,
                control: Some(control_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Stream("speaker thread exited".into()))
            }
        }
    }
}

/// Prefers an f32 configuration at the requested rate, else the device default.
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig, AudioError> {
    let wanted = cpal::SampleRate(sample_rate);
    if let Ok(ranges) = device.supported_output_configs() {
        for range in ranges {
            if range.sample_format() == SampleFormat::F32
                && range.channels() <= 2
                && range.min_sample_rate() <= wanted
                && wanted <= range.max_sample_rate()
            {
                return Ok(range.with_sample_rate(wanted).config());
            }
        }
    }
    let fallback = device
        .default_output_config()
        .map_err(|e| AudioError::Unavailable(e.to_string()))?;
    if fallback.sample_format() != SampleFormat::F32 {
        return Err(AudioError::UnsupportedFormat(fallback.sample_format().to_string()));
    }
    Ok(fallback.config())
}

fn build_output(sample_rate: u32) -> Result<(cpal::Stream, Arc<Mixer>), AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice("output"))?;
    let config = output_config(&device, sample_rate)?;
    let mixer = Arc::new(Mixer::new(config.sample_rate.0));
    let channels = config.channels as usize;

    let render_mixer = mixer.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render_mixer.render(data, channels);
            },
            |err: cpal::StreamError| error!("Output stream error: {err}"),
            None,
        )
        .map_err(|e| AudioError::Unavailable(e.to_string()))?;
    stream.play().map_err(|e| AudioError::Stream(e.to_string()))?;
    info!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels,
        "Output stream running"
    );
    Ok((stream, mixer))
}

fn run_output(
    sample_rate: u32,
    ready: SyncSender<Result<Arc<Mixer>, AudioError>>,
    control: Receiver<Control>,
) {
    let (stream, mixer) = match build_output(sample_rate) {
        Ok(built) => built,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(mixer)).is_err() {
        return;
    }
    while let Ok(Control::Play) = control.recv() {
        if let Err(e) = stream.play() {
            warn!(error = %e, "Failed to resume output stream");
        }
    }
    drop(stream);
    debug!("Output stream released");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_frames() {
        let mut downmix = Downmixer::new(2);
        assert_eq!(downmix.mix(&[1.0f32, 0.0, 0.5, 0.5], |s| s), &[0.5, 0.5]);
        let mut mono = Downmixer::new(1);
        assert_eq!(mono.mix(&[16384i16], |s| s as f32 / 32768.0), &[0.5]);
    }

    #[test]
    fn test_mixer_renders_scheduled_buffer_at_its_start() {
        let mixer = Mixer::new(10);
        mixer.enqueue(0.3, vec![0.1, 0.2, 0.3]);

        let mut out = vec![9.0; 5];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.1, 0.2]);
        assert!((mixer.now() - 0.5).abs() < 1e-9);

        let mut out = vec![0.0; 5];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.3, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(mixer.pending_len(), 0);
    }

    #[test]
    fn test_mixer_duplicates_mono_to_every_channel() {
        let mixer = Mixer::new(4);
        mixer.enqueue(0.0, vec![0.25, -0.25]);
        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 2);
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_mixer_clear_silences_immediately() {
        let mixer = Mixer::new(4);
        mixer.enqueue(0.0, vec![0.5; 8]);
        let mut out = vec![0.0; 2];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.5, 0.5]);

        mixer.clear();
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0]);
        assert!((mixer.now() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mixer_keeps_queue_sorted_by_start() {
        let mixer = Mixer::new(2);
        mixer.enqueue(1.0, vec![0.2, 0.2]);
        mixer.enqueue(0.0, vec![0.1, 0.1]);
        let mut out = vec![0.0; 4];
        mixer.render(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_resample_changes_length_by_ratio() {
        let input = vec![0.0f32; 2400];
        assert_eq!(resample(&input, 24_000, 48_000).unwrap().len(), 4800);
        assert_eq!(resample(&input, 24_000, 44_100).unwrap().len(), 4410);
        assert_eq!(resample(&input, 24_000, 24_000).unwrap().len(), 2400);
    }

    #[test]
    fn test_resample_is_not_shifted_by_filter_delay() {
        // A step from silence to a constant level: after trimming the delay,
        // the step lands where it was in the input and the tail keeps its level.
        let mut input = vec![0.0f32; 1200];
        input.extend(std::iter::repeat_n(0.5f32, 1200));
        let output = resample(&input, 24_000, 48_000).unwrap();

        assert_eq!(output.len(), 4800);
        assert!(output[2380].abs() < 0.05, "early step: {}", output[2380]);
        assert!((output[2420] - 0.5).abs() < 0.05, "late step: {}", output[2420]);
        assert!((output[4780] - 0.5).abs() < 0.05, "clipped tail: {}", output[4780]);
    }
}
