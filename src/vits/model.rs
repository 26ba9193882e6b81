//! Text → waveform forward pass.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder};

use super::{
    decoder::HifiGan,
    duration::DurationPredictor,
    flow::ResidualCouplingBlock,
    layers::padding_mask,
    text_encoder::TextEncoder,
    Mode, SynthesisParams, VitsConfig,
};

/// Result of [`VitsModel::forward`].
pub struct VitsOutput {
    /// `[b, samples]`, zero past each item's length.
    pub waveform: Tensor,
    /// Valid samples per batch item.
    pub sequence_lengths: Vec<usize>,
    /// Latent frames fed to the decoder, `[b, flow_size, frames]`.
    pub spectrogram: Tensor,
}

pub struct VitsModel {
    text_encoder: TextEncoder,
    duration_predictor: DurationPredictor,
    flow: ResidualCouplingBlock,
    decoder: HifiGan,
    embed_speaker: Option<Embedding>,
    config: VitsConfig,
}

impl VitsModel {
    pub fn new(config: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let embed_speaker = if config.num_speakers > 1 {
            Some(candle_nn::embedding(
                config.num_speakers,
                config.speaker_embedding_size,
                vb.pp("embed_speaker"),
            )?)
        } else {
            None
        };
        Ok(Self {
            text_encoder: TextEncoder::new(config, vb.pp("text_encoder"))?,
            duration_predictor: DurationPredictor::new(config, vb.pp("duration_predictor"))?,
            flow: ResidualCouplingBlock::new(config, vb.pp("flow"))?,
            decoder: HifiGan::new(config, vb.pp("decoder"))?,
            embed_speaker,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &VitsConfig {
        &self.config
    }

    /// `input_ids` and `attention_mask` are `[b, t]` i64; `speaker_ids` is
    /// `[b]` i64 and is ignored by single-speaker checkpoints.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        speaker_ids: Option<&Tensor>,
        params: &SynthesisParams,
        mode: Mode,
    ) -> Result<VitsOutput> {
        let (noise_scale, noise_scale_duration, speaking_rate) = params.resolve(&self.config);
        let mask = padding_mask(attention_mask)?;
        let encoded = self.text_encoder.forward(input_ids, &mask, mode)?;

        let speaker = match (&self.embed_speaker, speaker_ids) {
            (Some(embed), Some(ids)) => Some(embed.forward(ids)?.unsqueeze(2)?),
            _ => None,
        };

        let log_durations = self.duration_predictor.log_durations(
            &encoded.hidden,
            &mask,
            speaker.as_ref(),
            noise_scale_duration,
            mode,
        )?;

        let durations = frame_durations(&log_durations, &mask, 1.0 / speaking_rate)?;
        let (path, output_mask, frames) = alignment_path(&durations, mask.device())?;

        // [b, flow, t] × [b, t, frames]
        let path_t = path.transpose(1, 2)?.contiguous()?;
        let means = encoded.prior_means.matmul(&path_t)?;
        let log_variances = encoded.prior_log_variances.matmul(&path_t)?;

        let noise = means.randn_like(0.0, 1.0)?;
        let z = (means + (noise * log_variances.exp()?)?.affine(noise_scale, 0.0)?)?;
        let latents = self.flow.reverse(&z, &output_mask, speaker.as_ref(), mode)?;
        let spectrogram = latents.broadcast_mul(&output_mask)?;

        let waveform = self.decoder.forward(&spectrogram, speaker.as_ref(), mode)?.squeeze(1)?;
        let hop = self.config.hop_length();
        Ok(VitsOutput {
            waveform,
            sequence_lengths: frames.iter().map(|f| f * hop).collect(),
            spectrogram,
        })
    }
}

/// `ceil(exp(log_dur) · mask · length_scale)` per token, on host.
fn frame_durations(log_durations: &Tensor, mask: &Tensor, length_scale: f64) -> Result<Vec<Vec<usize>>> {
    let scaled = log_durations.exp()?.broadcast_mul(mask)?.affine(length_scale, 0.0)?;
    let rows = scaled.squeeze(1)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(|d| d.ceil().max(0.0) as usize).collect())
        .collect())
}

/// Hard monotonic alignment from token durations.
///
/// Returns the path `[b, frames, tokens]`, the frame mask `[b, 1, frames]`
/// and the frame count of every item (at least one).
fn alignment_path(
    durations: &[Vec<usize>],
    device: &candle_core::Device,
) -> Result<(Tensor, Tensor, Vec<usize>)> {
    let batch = durations.len();
    let tokens = durations.first().map_or(0, Vec::len);
    let lengths: Vec<usize> = durations.iter().map(|d| d.iter().sum::<usize>().max(1)).collect();
    let frames = lengths.iter().copied().max().unwrap_or(1);

    let mut path = vec![0f32; batch * frames * tokens];
    let mut frame_mask = vec![0f32; batch * frames];
    for (b, row) in durations.iter().enumerate() {
        let mut start = 0;
        for (j, &d) in row.iter().enumerate() {
            for f in start..(start + d).min(frames) {
                path[(b * frames + f) * tokens + j] = 1.0;
            }
            start += d;
        }
        for f in 0..lengths[b] {
            frame_mask[b * frames + f] = 1.0;
        }
    }
    Ok((
        Tensor::from_vec(path, (batch, frames, tokens), device)?,
        Tensor::from_vec(frame_mask, (batch, 1, frames), device)?,
        lengths,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn path_follows_durations() {
        let (path, mask, lengths) =
            alignment_path(&[vec![2, 0, 1], vec![1, 1, 0]], &Device::Cpu).unwrap();
        assert_eq!(lengths, vec![3, 2]);
        assert_eq!(path.dims(), &[2, 3, 3]);
        let p = path.to_vec3::<f32>().unwrap();
        assert_eq!(p[0], vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0]]);
        assert_eq!(p[1], vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 0.0]]);
        assert_eq!(mask.to_vec3::<f32>().unwrap()[1], vec![vec![1.0, 1.0, 0.0]]);
    }

    #[test]
    fn empty_durations_still_give_one_frame() {
        let (_, mask, lengths) = alignment_path(&[vec![0, 0]], &Device::Cpu).unwrap();
        assert_eq!(lengths, vec![1]);
        assert_eq!(mask.dims(), &[1, 1, 1]);
    }

    #[test]
    fn durations_respect_mask_and_rate() {
        let dev = Device::Cpu;
        let log_d = Tensor::new(&[[[0f32, 1.0, 1.0]]], &dev).unwrap();
        let mask = Tensor::new(&[[[1f32, 1.0, 0.0]]], &dev).unwrap();
        // exp(1) = 2.718 → ceil 3, or 6 at half speed.
        assert_eq!(frame_durations(&log_d, &mask, 1.0).unwrap(), vec![vec![1, 3, 0]]);
        assert_eq!(frame_durations(&log_d, &mask, 2.0).unwrap(), vec![vec![2, 6, 0]]);
    }

    #[test]
    fn tiny_model_produces_waveform() {
        let dev = Device::Cpu;
        let cfg = VitsConfig::tiny(12);
        let vm = VarMap::new();
        let model = VitsModel::new(&cfg, VarBuilder::from_varmap(&vm, DType::F32, &dev)).unwrap();
        let ids = Tensor::new(&[[0i64, 3, 0, 5, 0], [0, 7, 0, 0, 0]], &dev).unwrap();
        let mask = Tensor::new(&[[1i64, 1, 1, 1, 1], [1, 1, 1, 0, 0]], &dev).unwrap();
        let out = model
            .forward(&ids, &mask, None, &SynthesisParams::default(), Mode::Eval)
            .unwrap();
        let (b, samples) = out.waveform.dims2().unwrap();
        assert_eq!(b, 2);
        assert_eq!(out.sequence_lengths.len(), 2);
        assert_eq!(samples, out.sequence_lengths.iter().copied().max().unwrap());
        assert!(out.sequence_lengths.iter().all(|&n| n % cfg.hop_length() == 0 && n > 0));
    }

    #[test]
    fn multi_speaker_model_accepts_ids() {
        let dev = Device::Cpu;
        let cfg = VitsConfig { num_speakers: 3, speaker_embedding_size: 4, ..VitsConfig::tiny(12) };
        let vm = VarMap::new();
        let model = VitsModel::new(&cfg, VarBuilder::from_varmap(&vm, DType::F32, &dev)).unwrap();
        let ids = Tensor::new(&[[0i64, 3, 0, 5, 0]], &dev).unwrap();
        let mask = Tensor::ones((1, 5), DType::I64, &dev).unwrap();
        let spk = Tensor::new(&[2i64], &dev).unwrap();
        let out = model
            .forward(&ids, &mask, Some(&spk), &SynthesisParams::default(), Mode::Train)
            .unwrap();
        assert_eq!(out.waveform.dims()[0], 1);
    }
}
