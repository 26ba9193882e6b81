//! Differentiable log-mel spectrogram and the mel L1 loss.
//!
//! The STFT is a strided convolution with a windowed DFT basis, so
//! gradients flow back to the generated waveform. Parameters match the
//! usual VITS front-end: `n_fft = win = 1024`, `hop = 256`, periodic Hann
//! window, centred frames with reflect padding, power spectrum, 80 HTK mel
//! bands over 0–8 kHz without area normalisation.

use std::f64::consts::PI;

use candle_core::{DType, Device, Result, Tensor};

pub const N_FFT: usize = 1024;
pub const HOP_LENGTH: usize = 256;
pub const N_MELS: usize = 80;
pub const F_MIN: f64 = 0.0;
pub const F_MAX: f64 = 8_000.0;

/// Floor applied before the logarithm.
const LOG_FLOOR: f64 = 1e-5;

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular HTK filterbank, `[n_freqs, n_mels]` row-major.
pub fn mel_filterbank(
    n_freqs: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<f32> {
    let nyquist = sample_rate as f64 / 2.0;
    let freqs: Vec<f64> = (0..n_freqs)
        .map(|i| nyquist * i as f64 / (n_freqs - 1).max(1) as f64)
        .collect();
    let (m_min, m_max) = (hz_to_mel(f_min), hz_to_mel(f_max));
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(m_min + (m_max - m_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut fb = vec![0f32; n_freqs * n_mels];
    for (f, &freq) in freqs.iter().enumerate() {
        for m in 0..n_mels {
            let down = (freq - points[m]) / (points[m + 1] - points[m]);
            let up = (points[m + 2] - freq) / (points[m + 2] - points[m + 1]);
            fb[f * n_mels + m] = down.min(up).max(0.0) as f32;
        }
    }
    fb
}

/// Periodic Hann window of length `n`.
fn hann(n: usize) -> Vec<f64> {
    (0..n).map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos()).collect()
}

/// Reflect-padding indices for a signal of length `len`.
fn reflect_indices(len: usize, pad: usize) -> Vec<u32> {
    let last = len as i64 - 1;
    (-(pad as i64)..(len + pad) as i64)
        .map(|i| {
            let i = i.abs();
            let i = if i > last { 2 * last - i } else { i };
            i as u32
        })
        .collect()
}

pub struct MelSpectrogram {
    /// `[2·n_freqs, 1, n_fft]`: cosine rows then sine rows.
    basis: Tensor,
    /// `[n_freqs, n_mels]`
    filterbank: Tensor,
    n_freqs: usize,
    sample_rate: u32,
}

impl MelSpectrogram {
    pub fn new(sample_rate: u32, device: &Device) -> Result<Self> {
        let n_freqs = N_FFT / 2 + 1;
        let window = hann(N_FFT);
        let mut basis = vec![0f32; 2 * n_freqs * N_FFT];
        for k in 0..n_freqs {
            for (n, w) in window.iter().enumerate() {
                let phase = 2.0 * PI * (k * n % N_FFT) as f64 / N_FFT as f64;
                basis[k * N_FFT + n] = (w * phase.cos()) as f32;
                basis[(n_freqs + k) * N_FFT + n] = (-w * phase.sin()) as f32;
            }
        }
        let fb = mel_filterbank(n_freqs, N_MELS, sample_rate, F_MIN, F_MAX);
        Ok(Self {
            basis: Tensor::from_vec(basis, (2 * n_freqs, 1, N_FFT), device)?,
            filterbank: Tensor::from_vec(fb, (n_freqs, N_MELS), device)?,
            n_freqs,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// `[B, 1, T]` → mel power `[B, frames, n_mels]`, `frames = T / hop + 1`.
    /// `T` must exceed `n_fft / 2`.
    pub fn forward(&self, wav: &Tensor) -> Result<Tensor> {
        let t = wav.dim(2)?;
        let pad = N_FFT / 2;
        if t <= pad {
            candle_core::bail!("waveform of {t} samples is too short for a {N_FFT}-point STFT");
        }
        let idx = Tensor::new(reflect_indices(t, pad).as_slice(), wav.device())?;
        let padded = wav.contiguous()?.index_select(&idx, 2)?;
        let spec = padded.conv1d(&self.basis, 0, HOP_LENGTH, 1, 1)?;
        let re = spec.narrow(1, 0, self.n_freqs)?;
        let im = spec.narrow(1, self.n_freqs, self.n_freqs)?;
        let power = (re.sqr()? + im.sqr()?)?;
        power.transpose(1, 2)?.broadcast_matmul(&self.filterbank)
    }

    /// `log(max(mel, 1e-5))`
    pub fn log_mel(&self, wav: &Tensor) -> Result<Tensor> {
        self.forward(wav)?.maximum(LOG_FLOOR)?.log()
    }

    /// Mean absolute difference of log-mel spectrograms.
    pub fn loss(&self, generated: &Tensor, target: &Tensor) -> Result<Tensor> {
        let g = self.log_mel(generated)?;
        let t = self.log_mel(&target.to_dtype(DType::F32)?)?;
        (g - t)?.abs()?.mean_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reflect_padding_mirrors_edges() {
        assert_eq!(reflect_indices(5, 2), vec![2, 1, 0, 1, 2, 3, 4, 3, 2]);
    }

    #[test]
    fn filterbank_is_triangular_and_bounded() {
        let fb = mel_filterbank(513, 80, 16_000, 0.0, 8_000.0);
        assert_eq!(fb.len(), 513 * 80);
        assert!(fb.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // DC sits at the left edge of the first band.
        assert_eq!(fb[0], 0.0);
        // Every band gets some weight.
        for m in 0..80 {
            assert!((0..513).any(|f| fb[f * 80 + m] > 0.0), "empty band {m}");
        }
    }

    #[test]
    fn frame_count_and_peak_band() {
        let dev = Device::Cpu;
        let sr = 16_000u32;
        let n = 4_096;
        let tone: Vec<f32> =
            (0..n).map(|i| (2.0 * std::f32::consts::PI * 1_000.0 * i as f32 / sr as f32).sin()).collect();
        let wav = Tensor::from_vec(tone, (1, 1, n), &dev).unwrap();
        let mel = MelSpectrogram::new(sr, &dev).unwrap();
        let out = mel.forward(&wav).unwrap();
        assert_eq!(out.dims(), &[1, n / HOP_LENGTH + 1, N_MELS]);

        // The loudest band of a middle frame contains 1 kHz.
        let frame = out.get(0).unwrap().get(8).unwrap().to_vec1::<f32>().unwrap();
        let best = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        let m_lo = hz_to_mel(0.0);
        let m_hi = hz_to_mel(8_000.0);
        let step = (m_hi - m_lo) / 81.0;
        let centre = mel_to_hz(m_lo + step * (best + 1) as f64);
        assert!((centre - 1_000.0).abs() < 120.0, "peak band centred at {centre} Hz");
    }

    #[test]
    fn identical_signals_have_zero_loss() {
        let dev = Device::Cpu;
        let wav = Tensor::randn(0f32, 0.3, (2, 1, 2_000), &dev).unwrap();
        let mel = MelSpectrogram::new(16_000, &dev).unwrap();
        let l = mel.loss(&wav, &wav).unwrap().to_scalar::<f32>().unwrap();
        assert_abs_diff_eq!(l, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn batched_loss_on_cropped_views() {
        let dev = Device::Cpu;
        let gen = Tensor::randn(0f32, 0.3, (3, 1, 2_500), &dev).unwrap();
        let target = Tensor::randn(0f32, 0.3, (3, 1, 2_200), &dev).unwrap();
        let gen = gen.narrow(2, 0, 2_000).unwrap();
        let target = target.narrow(2, 0, 2_000).unwrap();
        assert!(!gen.is_contiguous());
        let mel = MelSpectrogram::new(16_000, &dev).unwrap();
        let l = mel.loss(&gen, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!(l.is_finite() && l > 0.0);
        let same = mel.loss(&gen, &gen).unwrap().to_scalar::<f32>().unwrap();
        assert_abs_diff_eq!(same, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn mel_scale_round_trips() {
        assert_abs_diff_eq!(mel_to_hz(hz_to_mel(440.0)), 440.0, epsilon = 1e-9);
    }
}
