//! WAV encoding and audio math utilities.
//!
//! Pure functions — no I/O, no async runtime.

use base64::Engine;

/// Clip to `[-1, 1]`, scale by `i16::MAX`, and cast to signed 16-bit PCM.
/// Shared by the subprocess playback backend and the WAV encoder so both
/// paths produce byte-identical samples.
pub fn to_i16_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Write a minimal WAV container (1 channel, 16-bit, little-endian PCM).
pub fn write_wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let file_len = 36 + data_len;
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_len.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

/// Encode float32 PCM as a base64 WAV container for the browser-audio frame.
pub fn encode_wav_base64(samples: &[f32], sample_rate: u32) -> String {
    let pcm = to_i16_pcm(samples);
    let wav = write_wav_bytes(&pcm, sample_rate);
    base64::engine::general_purpose::STANDARD.encode(wav)
}

/// Apply a linear fade-in/fade-out envelope to a copy of `samples`.
///
/// `fade_in_ms`/`fade_out_ms` are converted to sample counts via
/// `sample_rate`; windows are clamped so they never overlap past the
/// buffer's midpoint on very short clips.
pub fn apply_fades(samples: &[f32], sample_rate: u32, fade_in_ms: f32, fade_out_ms: f32) -> Vec<f32> {
    let len = samples.len();
    let mut out = samples.to_vec();
    if len == 0 {
        return out;
    }

    let fade_in_n = ((sample_rate as f32 * fade_in_ms / 1000.0) as usize).min(len);
    let fade_out_n = ((sample_rate as f32 * fade_out_ms / 1000.0) as usize).min(len - fade_in_n.min(len));

    for i in 0..fade_in_n {
        let gain = i as f32 / fade_in_n as f32;
        out[i] *= gain;
    }

    for i in 0..fade_out_n {
        let idx = len - 1 - i;
        let gain = i as f32 / fade_out_n as f32;
        out[idx] *= gain;
    }

    out
}

/// Mouth-open estimator: RMS over a short window centered on the current
/// playback position, mapped through `(rms * 3.8)^0.75` and clamped to
/// `[0, 1]`.
pub fn mouth_open_at(samples: &[f32], sample_rate: u32, elapsed_secs: f64) -> f32 {
    if samples.is_empty() || sample_rate == 0 {
        return 0.0;
    }

    let center = (elapsed_secs.max(0.0) * sample_rate as f64) as i64;
    let half_window = (sample_rate as i64 / 80).max(1);
    let start = (center - half_window).max(0) as usize;
    let end = ((center + half_window).max(0) as usize).min(samples.len());

    if end <= start {
        return 0.0;
    }

    let window = &samples[start..end];
    let sum_sq: f64 = window.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / window.len() as f64).sqrt() as f32;

    (rms * 3.8).powf(0.75).clamp(0.0, 1.0)
}
