//! One-shot sample-rate conversion with a windowed-sinc [`rubato`] resampler.
//!
//! The output length is always `floor(len · to / from)` so every caller
//! (inference post-processing, Parquet decoding, training data loading) gets
//! the same frame count for the same input.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use super::{AudioError, Result};

const CHUNK_SIZE: usize = 1024;

/// Number of output samples produced for `len` input samples.
pub fn output_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 {
        return 0;
    }
    (len as u128 * to_rate as u128 / from_rate as u128) as usize
}

/// Resample a mono waveform from `from_rate` to `to_rate`.
///
/// Equal rates return the input unchanged.
pub fn resample_mono(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(AudioError::InvalidArg(
            "sample rates must be greater than 0".into(),
        ));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, 1)
        .map_err(|e| AudioError::Resample(format!("cannot create resampler: {e}")))?;

    let expected = output_len(samples.len(), from_rate, to_rate);
    let delay = resampler.output_delay();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + CHUNK_SIZE);

    let mut pos = 0;
    while samples.len() - pos >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let chunk = [&samples[pos..pos + n]];
        let produced = resampler
            .process(&chunk, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        out.extend_from_slice(&produced[0]);
        pos += n;
    }
    if pos < samples.len() {
        let tail = [&samples[pos..]];
        let produced = resampler
            .process_partial(Some(&tail), None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        out.extend_from_slice(&produced[0]);
    }

    // Flush the filter delay line.
    let mut guard = 0;
    while out.len() < expected + delay && guard < 64 {
        let produced = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        if produced[0].is_empty() {
            break;
        }
        out.extend_from_slice(&produced[0]);
        guard += 1;
    }

    let mut out: Vec<f32> = out.into_iter().skip(delay).collect();
    out.resize(expected, 0.0);

    debug!(from_rate, to_rate, input = samples.len(), output = out.len(), "resampled");
    Ok(out)
}
