//! Audio helpers shared by the inference engine, the Parquet decoder and the
//! trainer.
//!
//! Everything here works on mono `f32` samples in `[-1.0, 1.0]`.

#[cfg(feature = "pipeline")]
pub mod decode;
pub mod filter;
pub mod postprocess;
pub mod resample;
pub mod wav;

/// Errors raised by the audio helpers.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("cannot decode audio: {0}")]
    Decode(String),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Average interleaved frames down to one channel.
pub fn downmix_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Clamp every sample into `[-1.0, 1.0]`.
pub fn clip_in_place(samples: &mut [f32]) {
    for s in samples.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
}

/// Largest absolute sample value (0.0 for empty input).
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, &s| m.max(s.abs()))
}

/// Duration in seconds of `n` samples at `sample_rate`.
pub fn duration_secs(n: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    n as f64 / sample_rate as f64
}
