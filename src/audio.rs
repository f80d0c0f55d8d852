//! Audio format conversion and WAV framing (§6.3).
//!
//! Wire in: 48 kHz, 2 channels, 16-bit signed little-endian PCM.
//! Pipeline internal: 16 kHz, 1 channel, 16-bit signed little-endian PCM.
//! Wire out: WAV-framed PCM at whatever rate the TTS produced.

use crate::error::{GatewayError, Result};
use std::io::Cursor;

/// RMS energy of a block of 16-bit PCM samples (little-endian).
pub fn compute_rms_i16le(pcm: &[u8]) -> f64 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Downsample 48 kHz stereo 16-bit PCM to 16 kHz mono 16-bit PCM.
///
/// Averages L+R to mono, then averages groups of 3 samples as an anti-alias
/// low-pass before decimation (chosen over naive every-third-sample
/// decimation per the design notes' open-question resolution: averaging
/// reduces aliasing). Any trailing partial group of fewer than 3 mono
/// samples is dropped.
pub fn downsample_48k_stereo_to_16k_mono(pcm: &[u8]) -> Vec<u8> {
    // Each stereo frame is 4 bytes: L(i16 LE) + R(i16 LE).
    let frame_count = pcm.len() / 4;
    let mut mono: Vec<f64> = Vec::with_capacity(frame_count);
    for frame in pcm[..frame_count * 4].chunks_exact(4) {
        let l = i16::from_le_bytes([frame[0], frame[1]]) as f64;
        let r = i16::from_le_bytes([frame[2], frame[3]]) as f64;
        mono.push((l + r) / 2.0);
    }

    let usable = (mono.len() / 3) * 3;
    let mut out = Vec::with_capacity((usable / 3) * 2);
    for group in mono[..usable].chunks_exact(3) {
        let avg = (group[0] + group[1] + group[2]) / 3.0;
        let sample = avg.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Encode mono 16-bit PCM at `sample_rate` as a WAV byte buffer
/// (`RIFF…WAVE…fmt …data`).
pub fn encode_wav_mono_i16(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| GatewayError::Model(format!("failed to create wav writer: {e}")))?;
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| GatewayError::Model(format!("failed to write wav sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| GatewayError::Model(format!("failed to finalize wav: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Generate a short looping "thinking" tone: a pure sine windowed with a
/// raised-(1-cos)/2 envelope.
///
/// The design notes call out two candidate envelope formulas, `(1+cos)/2`
/// and `(1-cos)/2`; this uses the latter because it starts and ends at zero
/// amplitude, avoiding click artifacts when the bridge loops the clip.
pub fn generate_thinking_sound_wav(
    freq_hz: f32,
    duration_ms: u64,
    sample_rate: u32,
) -> Result<Vec<u8>> {
    let n = ((duration_ms as f64 / 1000.0) * sample_rate as f64).round() as usize;
    let mut pcm = Vec::with_capacity(n * 2);
    for i in 0..n {
        let t = i as f32 / sample_rate as f32;
        let phase = 2.0 * std::f32::consts::PI * i as f32 / n.max(1) as f32;
        let envelope = (1.0 - phase.cos()) / 2.0;
        let sine = (2.0 * std::f32::consts::PI * freq_hz * t).sin();
        let sample = (sine * envelope * i16::MAX as f32 * 0.5)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    encode_wav_mono_i16(&pcm, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        let pcm = vec![0u8; 200];
        assert_eq!(compute_rms_i16le(&pcm), 0.0);
    }

    #[test]
    fn rms_of_full_scale_square_wave_is_near_max() {
        let mut pcm = Vec::new();
        for _ in 0..100 {
            pcm.extend_from_slice(&i16::MAX.to_le_bytes());
        }
        let rms = compute_rms_i16le(&pcm);
        assert!((rms - i16::MAX as f64).abs() < 1.0);
    }

    #[test]
    fn downsample_produces_one_third_the_frames() {
        // 48 stereo frames -> 48 mono samples -> 16 groups of 3 -> 16 samples.
        let mut pcm = Vec::new();
        for i in 0..48u16 {
            let v = (i as i16).to_le_bytes();
            pcm.extend_from_slice(&v); // L
            pcm.extend_from_slice(&v); // R
        }
        let out = downsample_48k_stereo_to_16k_mono(&pcm);
        assert_eq!(out.len(), 16 * 2);
    }

    #[test]
    fn downsample_drops_trailing_partial_group() {
        // 49 mono samples after averaging -> trailing 1 sample dropped.
        let mut pcm = Vec::new();
        for i in 0..49u16 {
            let v = (i as i16).to_le_bytes();
            pcm.extend_from_slice(&v);
            pcm.extend_from_slice(&v);
        }
        let out = downsample_48k_stereo_to_16k_mono(&pcm);
        assert_eq!(out.len(), 16 * 2);
    }

    #[test]
    fn wav_encoding_round_trips_sample_count() {
        let pcm: Vec<u8> = (0..1000i16)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let wav = encode_wav_mono_i16(&pcm, 16_000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 1000);
    }

    #[test]
    fn thinking_sound_endpoints_are_near_silent() {
        let wav = generate_thinking_sound_wav(220.0, 600, 24_000).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert!(samples.first().unwrap().abs() < 500);
        assert!(samples.last().unwrap().abs() < 500);
    }
}
