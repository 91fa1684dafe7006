//! Gapless scheduling of model audio onto a playback device.

use crate::{
    audio::{decode_base64, pcm16_bytes_to_f32},
    config::EgressSettings,
    error::AudioError,
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Decoded samples bound to a start time on the device clock.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub samples: Vec<f32>,
    /// Seconds on the device's playback clock.
    pub start_time: f64,
    pub sample_rate: u32,
}

impl ScheduledBuffer {
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// An output device with its own monotonic playback clock.
pub trait PlaybackDevice: Send {
    /// Current position of the playback clock, in seconds.
    fn current_time(&self) -> f64;
    fn schedule(&mut self, buffer: ScheduledBuffer) -> Result<(), AudioError>;
    /// Drops every queued buffer that has not finished playing.
    fn clear(&mut self);
    /// Tears down and recreates the underlying device context.
    fn reset(&mut self) -> Result<(), AudioError>;
}

/// Audio as it arrives from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPayload {
    /// Base64 PCM16 from an `inlineData` part.
    Encoded(String),
    /// PCM16 bytes from a binary frame.
    Raw(Vec<u8>),
}

pub struct AudioEgressScheduler {
    device: Box<dyn PlaybackDevice>,
    settings: EgressSettings,
    next_play_time: Option<f64>,
    /// Wall-clock instant at which the last scheduled buffer finishes.
    last_activity: Option<Instant>,
}

impl AudioEgressScheduler {
    pub fn new(device: Box<dyn PlaybackDevice>, settings: EgressSettings) -> Self {
        Self {
            device,
            settings,
            next_play_time: None,
            last_activity: None,
        }
    }

    pub fn next_play_time(&self) -> Option<f64> {
        self.next_play_time
    }

    /// Decodes and schedules one payload. Returns the scheduled start and
    /// duration, or `None` if the payload was not audio.
    pub fn enqueue(
        &mut self,
        payload: AudioPayload,
        now: Instant,
    ) -> Result<Option<(f64, f64)>, AudioError> {
        let bytes = match payload {
            AudioPayload::Encoded(data) => match decode_base64(&data) {
                Some(bytes) => bytes,
                None => return Ok(None),
            },
            AudioPayload::Raw(bytes) => bytes,
        };
        if bytes.len() < self.settings.min_payload_bytes {
            trace!(len = bytes.len(), "Dropping short non-audio payload");
            return Ok(None);
        }

        let samples = pcm16_bytes_to_f32(bytes);
        let clock = self.device.current_time();
        let earliest = clock + self.settings.lookahead.as_secs_f64();
        let start_time = match self.next_play_time {
            Some(next) => next.max(earliest),
            None => earliest,
        };
        let buffer = ScheduledBuffer {
            samples,
            start_time,
            sample_rate: self.settings.sample_rate,
        };
        let duration = buffer.duration();
        self.device.schedule(buffer)?;

        self.next_play_time = Some(start_time + duration);
        let until_end = (start_time + duration - clock).max(0.0);
        self.last_activity = Some(now + std::time::Duration::from_secs_f64(until_end));
        Ok(Some((start_time, duration)))
    }

    /// Discards queued audio, e.g. when the model is interrupted.
    pub fn flush(&mut self) {
        self.device.clear();
        self.next_play_time = None;
    }

    /// Recreates the device and forgets the cursor. Queued audio is lost.
    pub fn reset(&mut self) -> Result<(), AudioError> {
        self.device.clear();
        self.next_play_time = None;
        self.last_activity = None;
        self.device.reset()
    }

    /// Resets the device once after audio has been silent for the configured
    /// threshold. Returns `true` if a reset happened.
    pub fn check_health(&mut self, now: Instant) -> Result<bool, AudioError> {
        match self.last_activity {
            Some(last) if now.saturating_duration_since(last) >= self.settings.silence_reset_after => {
                info!("Playback idle, recreating audio device");
                self.reset()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

enum EgressCommand {
    Play(AudioPayload),
    Clear,
    Reset,
}

/// Handle to the task that exclusively owns the playback device.
#[derive(Clone)]
pub struct EgressHandle {
    tx: mpsc::UnboundedSender<EgressCommand>,
}

impl EgressHandle {
    /// Spawns the egress task. It ends when every handle is dropped.
    pub fn spawn(scheduler: AudioEgressScheduler) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_egress(scheduler, rx));
        (Self { tx }, task)
    }

    pub fn play(&self, payload: AudioPayload) {
        let _ = self.tx.send(EgressCommand::Play(payload));
    }

    pub fn clear(&self) {
        let _ = self.tx.send(EgressCommand::Clear);
    }

    pub fn reset(&self) {
        let _ = self.tx.send(EgressCommand::Reset);
    }
}

#[instrument(skip_all)]
async fn run_egress(mut scheduler: AudioEgressScheduler, mut rx: mpsc::UnboundedReceiver<EgressCommand>) {
    let mut health = tokio::time::interval(scheduler.settings.health_check_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = rx.recv() => {
                let result = match command {
                    Some(EgressCommand::Play(payload)) => {
                        scheduler.enqueue(payload, Instant::now()).map(|_| ())
                    }
                    Some(EgressCommand::Clear) => {
                        scheduler.flush();
                        Ok(())
                    }
                    Some(EgressCommand::Reset) => scheduler.reset(),
                    None => break,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Playback failed");
                }
            }
            _ = health.tick() => {
                if let Err(e) = scheduler.check_health(Instant::now()) {
                    warn!(error = %e, "Failed to recreate playback device");
                }
            }
        }
    }
    scheduler.device.clear();
    debug!("Egress task finished.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    #[derive(Default)]
    struct DeviceLog {
        clock: f64,
        scheduled: Vec<ScheduledBuffer>,
        clears: usize,
        resets: usize,
    }

    #[derive(Clone, Default)]
    struct FakeDevice(Arc<Mutex<DeviceLog>>);

    impl PlaybackDevice for FakeDevice {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().clock
        }
        fn schedule(&mut self, buffer: ScheduledBuffer) -> Result<(), AudioError> {
            self.0.lock().unwrap().scheduled.push(buffer);
            Ok(())
        }
        fn clear(&mut self) {
            self.0.lock().unwrap().clears += 1;
        }
        fn reset(&mut self) -> Result<(), AudioError> {
            self.0.lock().unwrap().resets += 1;
            Ok(())
        }
    }

    fn scheduler() -> (AudioEgressScheduler, FakeDevice) {
        let device = FakeDevice::default();
        (
            AudioEgressScheduler::new(Box::new(device.clone()), EgressSettings::default()),
            device,
        )
    }

    /// `n` samples of PCM16 silence.
    fn pcm(n: usize) -> Vec<u8> {
        vec![0; n * 2]
    }

    #[test]
    fn buffers_never_overlap_and_starts_never_decrease() {
        let (mut scheduler, device) = scheduler();
        let now = Instant::now();
        // Clock jumps forward and stalls, payload sizes vary, as under jitter.
        let arrivals = [(0.0, 480), (0.0, 2400), (0.01, 240), (0.5, 1200), (0.5, 33), (0.52, 4800), (3.0, 96)];
        for (clock, samples) in arrivals {
            device.0.lock().unwrap().clock = clock;
            scheduler.enqueue(AudioPayload::Raw(pcm(samples)), now).unwrap();
        }

        let log = device.0.lock().unwrap();
        assert_eq!(log.scheduled.len(), arrivals.len());
        for pair in log.scheduled.windows(2) {
            assert!(pair[1].start_time >= pair[0].start_time);
            assert!(pair[0].start_time + pair[0].duration() <= pair[1].start_time + 1e-9);
        }
    }

    #[test]
    fn consecutive_buffers_are_gapless() {
        let (mut scheduler, _device) = scheduler();
        let now = Instant::now();
        let (first, duration) = scheduler.enqueue(AudioPayload::Raw(pcm(2400)), now).unwrap().unwrap();
        assert_abs_diff_eq!(first, 0.05, epsilon = 1e-9);
        assert_abs_diff_eq!(duration, 0.1, epsilon = 1e-9);
        let (second, _) = scheduler.enqueue(AudioPayload::Raw(pcm(2400)), now).unwrap().unwrap();
        assert_abs_diff_eq!(second, first + duration, epsilon = 1e-9);
    }

    #[test]
    fn late_arrival_starts_at_clock_plus_lookahead() {
        let (mut scheduler, device) = scheduler();
        let now = Instant::now();
        scheduler.enqueue(AudioPayload::Raw(pcm(240)), now).unwrap();
        device.0.lock().unwrap().clock = 2.0;
        let (start, _) = scheduler.enqueue(AudioPayload::Raw(pcm(240)), now).unwrap().unwrap();
        assert_abs_diff_eq!(start, 2.05, epsilon = 1e-9);
    }

    #[test]
    fn odd_payloads_are_padded_and_short_ones_dropped() {
        let (mut scheduler, device) = scheduler();
        let now = Instant::now();
        assert_eq!(scheduler.enqueue(AudioPayload::Raw(vec![1; 63]), now).unwrap(), None);
        assert_eq!(scheduler.enqueue(AudioPayload::Encoded("%%%".into()), now).unwrap(), None);
        assert!(scheduler.enqueue(AudioPayload::Raw(vec![1; 65]), now).unwrap().is_some());

        let log = device.0.lock().unwrap();
        assert_eq!(log.scheduled.len(), 1);
        assert_eq!(log.scheduled[0].samples.len(), 33);
    }

    #[test]
    fn encoded_payloads_are_decoded() {
        let (mut scheduler, device) = scheduler();
        let encoded = crate::audio::encode_pcm16_base64(&[16384; 64]);
        scheduler.enqueue(AudioPayload::Encoded(encoded), Instant::now()).unwrap();
        let log = device.0.lock().unwrap();
        assert_abs_diff_eq!(log.scheduled[0].samples[0], 0.5, epsilon = 1e-4);
    }

    #[test]
    fn flush_clears_device_and_reseeds_cursor() {
        let (mut scheduler, device) = scheduler();
        scheduler.enqueue(AudioPayload::Raw(pcm(24_000)), Instant::now()).unwrap();
        scheduler.flush();
        assert_eq!(scheduler.next_play_time(), None);
        assert_eq!(device.0.lock().unwrap().clears, 1);
    }

    #[test]
    fn health_check_resets_once_per_idle_period() {
        let (mut scheduler, device) = scheduler();
        let now = Instant::now();
        assert!(!scheduler.check_health(now + Duration::from_secs(60)).unwrap());

        // 0.1s of audio, so activity ends shortly after `now`.
        scheduler.enqueue(AudioPayload::Raw(pcm(2400)), now).unwrap();
        assert!(!scheduler.check_health(now + Duration::from_secs(20)).unwrap());
        assert!(scheduler.check_health(now + Duration::from_secs(31)).unwrap());
        assert!(!scheduler.check_health(now + Duration::from_secs(90)).unwrap());
        assert_eq!(device.0.lock().unwrap().resets, 1);
        assert_eq!(scheduler.next_play_time(), None);
    }

    #[tokio::test]
    async fn egress_task_plays_and_stops_with_handles() {
        let (scheduler, device) = scheduler();
        let (handle, task) = EgressHandle::spawn(scheduler);
        handle.play(AudioPayload::Raw(pcm(240)));
        handle.clear();
        handle.reset();
        drop(handle);
        task.await.unwrap();

        let log = device.0.lock().unwrap();
        assert_eq!(log.scheduled.len(), 1);
        assert_eq!(log.resets, 1);
        // clear, reset's clear, shutdown clear
        assert_eq!(log.clears, 3);
    }
}
