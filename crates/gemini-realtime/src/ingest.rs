//! Microphone capture to fixed-size PCM16 blocks at the ingest rate.

use crate::{
    audio::{INGEST_SAMPLE_RATE, StreamResampler, f32_to_pcm16},
    error::AudioError,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, trace};

/// A microphone delivering mono float samples.
pub trait CaptureDevice: Send {
    /// Starts capturing into `sink` and returns the device sample rate.
    fn start(&mut self, sink: mpsc::Sender<Vec<f32>>) -> Result<u32, AudioError>;
    /// Stops capturing and releases the device. Must tolerate a failed start.
    fn stop(&mut self);
}

/// Receiver of encoded microphone blocks, normally a live session.
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn is_ready(&self) -> bool;
    async fn send_audio(&self, samples: &[i16]);
    /// Resolves once the sink will never accept audio again.
    async fn closed(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    pub sample_rate: u32,
    /// Samples per emitted block.
    pub block_size: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            sample_rate: INGEST_SAMPLE_RATE,
            block_size: 2048,
        }
    }
}

/// Stops the wrapped device exactly once, on whichever exit path comes first.
struct CaptureGuard {
    device: Box<dyn CaptureDevice>,
    stopped: bool,
}

impl CaptureGuard {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.device.stop();
            info!("Audio capture stopped.");
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct AudioIngestPipeline;

impl AudioIngestPipeline {
    /// Starts `capture` and streams blocks to `sink` until the handle is
    /// stopped or dropped, the sink closes, or the device closes its channel.
    pub fn start(
        capture: Box<dyn CaptureDevice>,
        sink: Arc<dyn AudioSink>,
        settings: IngestSettings,
    ) -> Result<IngestHandle, AudioError> {
        let (samples_tx, samples_rx) = mpsc::channel::<Vec<f32>>(64);
        let mut guard = CaptureGuard {
            device: capture,
            stopped: false,
        };
        let device_rate = guard.device.start(samples_tx)?;
        let resampler = StreamResampler::new(device_rate, settings.sample_rate, 1024)?;
        info!(device_rate, target_rate = settings.sample_rate, "Audio capture started.");

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_ingest(guard, resampler, samples_rx, stop_rx, sink, settings));
        Ok(IngestHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }
}

#[instrument(skip_all)]
async fn run_ingest(
    mut guard: CaptureGuard,
    mut resampler: StreamResampler,
    mut samples_rx: mpsc::Receiver<Vec<f32>>,
    mut stop_rx: oneshot::Receiver<()>,
    sink: Arc<dyn AudioSink>,
    settings: IngestSettings,
) {
    let mut block: Vec<f32> = Vec::with_capacity(settings.block_size * 2);
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = sink.closed() => {
                info!("Audio sink closed.");
                break;
            }
            samples = samples_rx.recv() => {
                let Some(samples) = samples else { break };
                match resampler.process(&samples) {
                    Ok(out) => block.extend_from_slice(&out),
                    Err(e) => {
                        tracing::error!(error = %e, "Resampling microphone audio failed");
                        break;
                    }
                }
                while block.len() >= settings.block_size {
                    let chunk: Vec<f32> = block.drain(..settings.block_size).collect();
                    if sink.is_ready() {
                        sink.send_audio(&f32_to_pcm16(&chunk)).await;
                    } else {
                        trace!("Session not ready, dropping microphone block");
                    }
                }
            }
        }
    }
    guard.stop();
    debug!("Ingest task finished.");
}

/// Owner of a running capture. Dropping it stops the capture.
pub struct IngestHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl IngestHandle {
    /// Stops the capture and waits until the device has been released.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IngestHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
