//! Microphone and speaker devices backed by cpal.
//!
//! cpal streams are not `Send`, so each stream lives on its own OS thread
//! for as long as it plays. The handles here only hold the thread's stop
//! channel and the state shared with the audio callback.

use cpal::{
    FromSample, Sample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use gemini_realtime::{AudioError, CaptureDevice, PlaybackDevice, ScheduledBuffer, audio::StreamResampler};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc as std_mpsc},
    thread,
};
use tokio::sync::mpsc;
use tracing::{error, info};

fn stream_error(e: cpal::StreamError) {
    error!(error = %e, "Audio stream error");
}

fn device_error(e: impl std::fmt::Display) -> AudioError {
    AudioError::Device(e.to_string())
}

/// An OS thread keeping one cpal stream alive.
struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamThread {
    /// Builds a stream on a fresh thread and returns it with its sample rate.
    fn spawn<F>(name: &str, build: F) -> Result<(Self, u32), AudioError>
    where
        F: FnOnce() -> Result<(cpal::Stream, u32), AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match build() {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    // Blocks until stopped or the handle is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(device_error)?;

        let rate = ready_rx
            .recv()
            .map_err(|_| AudioError::Device("audio thread exited during setup".into()))??;
        Ok((
            Self {
                stop_tx,
                handle: Some(handle),
            },
            rate,
        ))
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

// --- Capture ---

/// The default input device, downmixed to mono.
#[derive(Default)]
pub struct CpalCapture {
    stream: Option<StreamThread>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<u32, AudioError> {
        let (stream, rate) = StreamThread::spawn("parley-capture", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| AudioError::Device("no input device available".into()))?;
            let supported = device.default_input_config().map_err(device_error)?;
            let sample_format = supported.sample_format();
            let config: cpal::StreamConfig = supported.into();
            let stream = match sample_format {
                cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, sink),
                cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, sink),
                cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, sink),
                other => return Err(AudioError::Device(format!("unsupported sample format {other}"))),
            }
            .map_err(device_error)?;
            stream.play().map_err(device_error)?;
            info!(device = %device.name().unwrap_or_default(), rate = config.sample_rate.0, "Microphone open.");
            Ok((stream, config.sample_rate.0))
        })?;
        self.stream = Some(stream);
        Ok(rate)
    }

    fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sink: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32)
                .collect();
            // Never block the audio thread; a full queue drops the block.
            let _ = sink.try_send(mono);
        },
        stream_error,
        None,
    )
}

// --- Playback ---

struct QueuedBuffer {
    start_frame: u64,
    samples: Vec<f32>,
}

/// Buffers waiting for the output callback, positioned on the device clock.
#[derive(Default)]
struct PlaybackQueue {
    buffers: VecDeque<QueuedBuffer>,
    frames_played: u64,
}

impl PlaybackQueue {
    fn next_sample(&mut self) -> f32 {
        let frame = self.frames_played;
        self.frames_played += 1;
        while let Some(front) = self.buffers.front() {
            if frame < front.start_frame {
                return 0.0;
            }
            let offset = (frame - front.start_frame) as usize;
            if offset < front.samples.len() {
                return front.samples[offset];
            }
            self.buffers.pop_front();
        }
        0.0
    }
}

type SharedQueue = Arc<Mutex<PlaybackQueue>>;

fn lock(queue: &SharedQueue) -> MutexGuard<'_, PlaybackQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Input frames per resampler chunk; 10 ms of 24 kHz model audio.
const RESAMPLE_CHUNK: usize = 240;

/// Scheduled buffers closer than this to the previous buffer's end continue it.
const CONTIGUOUS_TOLERANCE_SECS: f64 = 0.001;

/// Converts scheduled buffers into device-rate buffers on the device clock.
///
/// Back-to-back buffers share one resampler, so its filter state and any
/// partial chunk carry over and the output stays continuous. A gap starts a
/// fresh stream at the buffer's own start frame.
struct Renderer {
    device_rate: u32,
    stream: Option<ResampledStream>,
}

struct ResampledStream {
    in_rate: u32,
    resampler: StreamResampler,
    /// Where the previous input buffer ended, in seconds on the device clock.
    input_end: f64,
    /// Device frame the next resampled sample lands on.
    write_frame: u64,
    /// Leading filter delay still to be trimmed from the output.
    skip: usize,
}

impl ResampledStream {
    fn emit(&mut self, mut samples: Vec<f32>, out: &mut Vec<QueuedBuffer>) {
        let skipped = self.skip.min(samples.len());
        samples.drain(..skipped);
        self.skip -= skipped;
        if samples.is_empty() {
            return;
        }
        let start_frame = self.write_frame;
        self.write_frame += samples.len() as u64;
        out.push(QueuedBuffer {
            start_frame,
            samples,
        });
    }
}

impl Renderer {
    fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            stream: None,
        }
    }

    fn frame_at(&self, seconds: f64) -> u64 {
        (seconds * self.device_rate as f64).round() as u64
    }

    fn render(&mut self, buffer: ScheduledBuffer) -> Result<Vec<QueuedBuffer>, AudioError> {
        let start_frame = self.frame_at(buffer.start_time);
        if buffer.sample_rate == self.device_rate {
            self.stream = None;
            return Ok(vec![QueuedBuffer {
                start_frame,
                samples: buffer.samples,
            }]);
        }

        let mut out = Vec::new();
        let continues = self.stream.as_ref().is_some_and(|s| {
            s.in_rate == buffer.sample_rate
                && (buffer.start_time - s.input_end).abs() < CONTIGUOUS_TOLERANCE_SECS
        });
        if !continues {
            if let Some(mut previous) = self.stream.take() {
                let tail = previous.resampler.flush()?;
                previous.emit(tail, &mut out);
            }
            let resampler = StreamResampler::new(buffer.sample_rate, self.device_rate, RESAMPLE_CHUNK)?;
            self.stream = Some(ResampledStream {
                in_rate: buffer.sample_rate,
                skip: resampler.output_delay(),
                resampler,
                input_end: buffer.start_time,
                write_frame: start_frame,
            });
        }

        if let Some(stream) = self.stream.as_mut() {
            stream.input_end = buffer.start_time + buffer.duration();
            let resampled = stream.resampler.process(&buffer.samples)?;
            stream.emit(resampled, &mut out);
        }
        Ok(out)
    }

    fn reset(&mut self) {
        self.stream = None;
    }
}

/// The default output device, playing scheduled mono buffers on every channel.
pub struct CpalPlayback {
    queue: SharedQueue,
    renderer: Renderer,
    stream: Option<StreamThread>,
}

impl CpalPlayback {
    pub fn open() -> Result<Self, AudioError> {
        let queue = SharedQueue::default();
        let (stream, device_rate) = open_output(queue.clone())?;
        Ok(Self {
            queue,
            renderer: Renderer::new(device_rate),
            stream: Some(stream),
        })
    }
}

fn open_output(queue: SharedQueue) -> Result<(StreamThread, u32), AudioError> {
    StreamThread::spawn("parley-playback", move || {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::Device("no output device available".into()))?;
        let supported = device.default_output_config().map_err(device_error)?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, queue),
            cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, queue),
            cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, queue),
            other => return Err(AudioError::Device(format!("unsupported sample format {other}"))),
        }
        .map_err(device_error)?;
        stream.play().map_err(device_error)?;
        info!(device = %device.name().unwrap_or_default(), rate = config.sample_rate.0, "Speaker open.");
        Ok((stream, config.sample_rate.0))
    })
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: SharedQueue,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = lock(&queue);
            for frame in data.chunks_mut(channels) {
                let value = T::from_sample(queue.next_sample());
                frame.iter_mut().for_each(|s| *s = value);
            }
        },
        stream_error,
        None,
    )
}

impl PlaybackDevice for CpalPlayback {
    fn current_time(&self) -> f64 {
        lock(&self.queue).frames_played as f64 / self.renderer.device_rate as f64
    }

    fn schedule(&mut self, buffer: ScheduledBuffer) -> Result<(), AudioError> {
        let rendered = self.renderer.render(buffer)?;
        lock(&self.queue).buffers.extend(rendered);
        Ok(())
    }

    fn clear(&mut self) {
        self.renderer.reset();
        lock(&self.queue).buffers.clear();
    }

    fn reset(&mut self) -> Result<(), AudioError> {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        self.renderer.reset();
        *lock(&self.queue) = PlaybackQueue::default();
        let (stream, device_rate) = open_output(self.queue.clone())?;
        self.renderer = Renderer::new(device_rate);
        self.stream = Some(stream);
        Ok(())
    }
}
