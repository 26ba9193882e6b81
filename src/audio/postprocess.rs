//! Turn a raw model waveform into a playable 16-bit WAV.
//!
//! Order: mono → clip → resample (only when rates differ) → filter → clip →
//! peak-normalise → PCM16 encode.

use std::str::FromStr;

use tracing::debug;

use super::{clip_in_place, filter, peak, resample::resample_mono, wav, AudioError, Result};

/// Peak level after normalisation.
pub const TARGET_PEAK: f32 = 0.95;

/// Below this peak the waveform is treated as silence and left unscaled.
const SILENCE_PEAK: f32 = 1e-6;

/// Zero-phase clean-up filter applied after resampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostFilter {
    /// First-order Butterworth high-pass.
    HighPass { cutoff_hz: f32 },
    /// Fourth-order Butterworth band-pass.
    BandPass { low_hz: f32, high_hz: f32 },
    None,
}

impl Default for PostFilter {
    fn default() -> Self {
        PostFilter::HighPass { cutoff_hz: 60.0 }
    }
}

impl FromStr for PostFilter {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "highpass" | "high" => Ok(PostFilter::default()),
            "bandpass" | "band" => Ok(PostFilter::BandPass { low_hz: 80.0, high_hz: 7000.0 }),
            "none" | "off" => Ok(PostFilter::None),
            other => Err(AudioError::InvalidArg(format!(
                "unknown post filter '{other}' (expected highpass, bandpass or none)"
            ))),
        }
    }
}

impl PostFilter {
    /// Apply the filter to `samples` recorded at `sample_rate`.
    pub fn apply(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let nyq = sample_rate as f64 / 2.0;
        match *self {
            PostFilter::HighPass { cutoff_hz } => {
                let wn = (cutoff_hz as f64 / nyq).max(1e-4).min(0.99);
                let sos = filter::butter_highpass(1, wn)?;
                Ok(filter::filtfilt(&sos, samples))
            }
            PostFilter::BandPass { low_hz, high_hz } => {
                let low = (low_hz as f64 / nyq).max(0.001);
                let high = (high_hz as f64 / nyq).min(0.999);
                let sos = filter::butter_bandpass(4, low, high)?;
                Ok(filter::filtfilt(&sos, samples))
            }
            PostFilter::None => Ok(samples.to_vec()),
        }
    }
}

/// Scale so the absolute peak equals [`TARGET_PEAK`]; near-silent input is
/// left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let p = peak(samples);
    if p > SILENCE_PEAK {
        let gain = TARGET_PEAK / p;
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

/// Run the full chain on already-mono samples and return the cleaned
/// waveform at `target_rate`.
pub fn process(
    samples: &[f32],
    model_rate: u32,
    target_rate: u32,
    post_filter: PostFilter,
) -> Result<Vec<f32>> {
    let mut audio = samples.to_vec();
    clip_in_place(&mut audio);

    if model_rate != target_rate {
        debug!(model_rate, target_rate, "resampling model output");
        audio = resample_mono(&audio, model_rate, target_rate)?;
    }

    let mut audio = post_filter.apply(&audio, target_rate)?;
    clip_in_place(&mut audio);
    peak_normalize(&mut audio);
    Ok(audio)
}

/// [`process`] followed by 16-bit PCM WAV encoding.
///
/// `channels > 1` means `samples` is interleaved and is averaged to mono
/// first.
pub fn to_wav_bytes(
    samples: &[f32],
    channels: usize,
    model_rate: u32,
    target_rate: u32,
    post_filter: PostFilter,
) -> Result<Vec<u8>> {
    let mono = super::downmix_mono(samples, channels);
    let audio = process(&mono, model_rate, target_rate, post_filter)?;
    wav::encode_pcm16(&audio, target_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Cursor;

    fn tone(rate: u32, n: usize, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn parse_filters() {
        assert_eq!("highpass".parse::<PostFilter>().unwrap(), PostFilter::default());
        assert!(matches!("BandPass".parse::<PostFilter>().unwrap(), PostFilter::BandPass { .. }));
        assert_eq!("none".parse::<PostFilter>().unwrap(), PostFilter::None);
        assert!("lowpass".parse::<PostFilter>().is_err());
    }

    #[test]
    fn normalises_peak() {
        let out = process(&tone(16_000, 16_000, 0.2), 16_000, 16_000, PostFilter::None).unwrap();
        assert_abs_diff_eq!(peak(&out), TARGET_PEAK, epsilon = 1e-6);
    }

    #[test]
    fn silence_stays_silent() {
        let out = process(&vec![0.0; 1000], 16_000, 16_000, PostFilter::default()).unwrap();
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn wav_header_uses_target_rate() {
        let input = tone(22_050, 22_050, 0.5);
        let bytes =
            to_wav_bytes(&input, 1, 22_050, 16_000, PostFilter::default()).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().bits_per_sample, 16);
        assert_eq!(reader.len(), 16_000);
    }

    #[test]
    fn stereo_input_is_downmixed() {
        let mono = tone(16_000, 800, 0.5);
        let stereo: Vec<f32> = mono.iter().flat_map(|&s| [s, s]).collect();
        let bytes = to_wav_bytes(&stereo, 2, 16_000, 16_000, PostFilter::None).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 800);
    }

    #[test]
    fn loud_input_is_clipped_before_normalising() {
        let out = process(&[3.0, -3.0, 0.5], 16_000, 16_000, PostFilter::None).unwrap();
        assert_abs_diff_eq!(out[0], 0.95, epsilon = 1e-6);
        assert_abs_diff_eq!(out[2], 0.475, epsilon = 1e-6);
    }
}
