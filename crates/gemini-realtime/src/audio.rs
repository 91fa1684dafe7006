//! PCM16 conversions, base64 wire encoding and resampling.

use crate::error::AudioError;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate of microphone audio sent to the service.
pub const INGEST_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of model audio received from the service.
pub const EGRESS_SAMPLE_RATE: u32 = 24_000;
/// MIME type announced for realtime audio input.
pub const INGEST_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Converts float samples in `[-1, 1]` to PCM16, clamping out-of-range input.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts PCM16 samples to floats in `[-1, 1)`.
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Encodes PCM16 samples as little-endian bytes in base64.
pub fn encode_pcm16_base64(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Option<Vec<u8>> {
    match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::debug!(error = %e, "Discarding audio payload with invalid base64");
            None
        }
    }
}

/// Interprets little-endian PCM16 bytes, zero-padding a trailing half sample.
pub fn pcm16_bytes_to_f32(mut bytes: Vec<u8>) -> Vec<f32> {
    if bytes.len() % 2 == 1 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

/// A mono resampler for continuous streams fed in arbitrarily sized pieces.
///
/// Input is buffered until the resampler's fixed chunk size is available, so
/// consecutive calls produce a seamless output stream.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> Result<Self, AudioError> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(
                FastFixedIn::<f32>::new(
                    out_rate as f64 / in_rate as f64,
                    1.0,
                    PolynomialDegree::Cubic,
                    chunk_size,
                    1,
                )
                .map_err(|e| AudioError::Resampler(e.to_string()))?,
            )
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feeds `input` and returns whatever output is ready.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };
        self.pending.extend_from_slice(input);

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let mut res = resampler
                .process(&[chunk], None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;
            out.append(&mut res[0]);
        }
        Ok(out)
    }

    /// Output samples by which the resampled stream lags its input.
    pub fn output_delay(&self) -> usize {
        self.inner.as_ref().map_or(0, |r| r.output_delay())
    }

    /// Drops buffered input and filter state.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.inner.as_mut() {
            resampler.reset();
        }
    }

    /// Resamples whatever input is still buffered, padding the last chunk.
    pub fn flush(&mut self) -> Result<Vec<f32>, AudioError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let input = [std::mem::take(&mut self.pending)];
        let mut res = resampler
            .process_partial(Some(&input[..]), None)
            .map_err(|e| AudioError::Resampler(e.to_string()))?;
        Ok(std::mem::take(&mut res[0]))
    }
}
