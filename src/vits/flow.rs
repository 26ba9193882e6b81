//! Prior flow: residual coupling layers over a non-causal WaveNet.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{
    layers::{self, conv1d, dropout, flip, sigmoid, ConvCfg},
    Mode, VitsConfig,
};

pub struct WaveNet {
    in_layers: Vec<layers::Conv1d>,
    res_skip_layers: Vec<layers::Conv1d>,
    cond_layer: Option<layers::Conv1d>,
    hidden: usize,
    dropout: f64,
}

impl WaveNet {
    pub fn new(cfg: &VitsConfig, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let k = cfg.wavenet_kernel_size;
        let cond_layer = if cfg.speaker_embedding_size > 0 {
            Some(conv1d(
                cfg.speaker_embedding_size,
                2 * h * num_layers,
                1,
                ConvCfg::default(),
                vb.pp("cond_layer"),
            )?)
        } else {
            None
        };
        let mut in_layers = Vec::with_capacity(num_layers);
        let mut res_skip_layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let dilation = cfg.wavenet_dilation_rate.pow(i as u32);
            in_layers.push(conv1d(h, 2 * h, k, ConvCfg::same(k, dilation), vb.pp("in_layers").pp(i))?);
            let out = if i + 1 < num_layers { 2 * h } else { h };
            res_skip_layers.push(conv1d(
                h,
                out,
                1,
                ConvCfg::default(),
                vb.pp("res_skip_layers").pp(i),
            )?);
        }
        Ok(Self { in_layers, res_skip_layers, cond_layer, hidden: h, dropout: cfg.wavenet_dropout })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        speaker: Option<&Tensor>,
        mode: Mode,
    ) -> Result<Tensor> {
        let h = self.hidden;
        let cond = match (&self.cond_layer, speaker) {
            (Some(layer), Some(g)) => Some(layer.forward(g)?),
            _ => None,
        };
        let mut x = x.clone();
        let mut output = x.zeros_like()?;
        let last = self.in_layers.len().saturating_sub(1);
        for (i, (in_layer, res_skip)) in
            self.in_layers.iter().zip(&self.res_skip_layers).enumerate()
        {
            let mut acts = in_layer.forward(&x)?;
            if let Some(c) = &cond {
                acts = acts.broadcast_add(&c.narrow(1, i * 2 * h, 2 * h)?)?;
            }
            let (a, b) = layers::split_channels(&acts, h)?;
            let acts = (a.tanh()? * sigmoid(&b)?)?;
            let acts = dropout(&acts, self.dropout, mode)?;
            let rs = res_skip.forward(&acts)?;
            if i < last {
                let (res, skip) = layers::split_channels(&rs, h)?;
                x = (x + res)?.broadcast_mul(mask)?;
                output = (output + skip)?;
            } else {
                output = (output + rs)?;
            }
        }
        output.broadcast_mul(mask)
    }
}

struct ResidualCouplingLayer {
    conv_pre: layers::Conv1d,
    wavenet: WaveNet,
    conv_post: layers::Conv1d,
    half: usize,
}

impl ResidualCouplingLayer {
    fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let half = cfg.flow_size / 2;
        let h = cfg.hidden_size;
        Ok(Self {
            conv_pre: conv1d(half, h, 1, ConvCfg::default(), vb.pp("conv_pre"))?,
            wavenet: WaveNet::new(cfg, cfg.prior_encoder_num_wavenet_layers, vb.pp("wavenet"))?,
            conv_post: conv1d(h, half, 1, ConvCfg::default(), vb.pp("conv_post"))?,
            half,
        })
    }

    /// Mean-only coupling, inverse direction.
    fn reverse(
        &self,
        x: &Tensor,
        mask: &Tensor,
        speaker: Option<&Tensor>,
        mode: Mode,
    ) -> Result<Tensor> {
        let (first, second) = layers::split_channels(x, self.half)?;
        let h = self.conv_pre.forward(&first)?.broadcast_mul(mask)?;
        let h = self.wavenet.forward(&h, mask, speaker, mode)?;
        let mean = self.conv_post.forward(&h)?.broadcast_mul(mask)?;
        let second = (second - mean)?.broadcast_mul(mask)?;
        Tensor::cat(&[&first, &second], 1)
    }
}

/// Stack of coupling layers mapping prior samples to latent frames.
pub struct ResidualCouplingBlock {
    flows: Vec<ResidualCouplingLayer>,
}

impl ResidualCouplingBlock {
    pub fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let flows = (0..cfg.prior_encoder_num_flows)
            .map(|i| ResidualCouplingLayer::new(cfg, vb.pp("flows").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { flows })
    }

    /// `[b, flow_size, frames]` → same shape.
    pub fn reverse(
        &self,
        z: &Tensor,
        mask: &Tensor,
        speaker: Option<&Tensor>,
        mode: Mode,
    ) -> Result<Tensor> {
        let mut x = z.clone();
        for flow in self.flows.iter().rev() {
            x = flip(&x, 1)?;
            x = flow.reverse(&x, mask, speaker, mode)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn coupling_keeps_shape_and_masks_padding() {
        let dev = Device::Cpu;
        let cfg = VitsConfig::tiny(10);
        let vm = VarMap::new();
        let block =
            ResidualCouplingBlock::new(&cfg, VarBuilder::from_varmap(&vm, DType::F32, &dev)).unwrap();
        let z = Tensor::randn(0f32, 1.0, (1, 8, 12), &dev).unwrap();
        let values: Vec<f32> = (0..12).map(|i| if i < 9 { 1.0 } else { 0.0 }).collect();
        let mask = Tensor::from_vec(values, (1, 1, 12), &dev).unwrap();
        let out = block.reverse(&z, &mask, None, Mode::Eval).unwrap();
        assert_eq!(out.dims(), &[1, 8, 12]);
    }

    #[test]
    fn wavenet_output_is_masked() {
        let dev = Device::Cpu;
        let cfg = VitsConfig::tiny(10);
        let vm = VarMap::new();
        let wn = WaveNet::new(&cfg, 2, VarBuilder::from_varmap(&vm, DType::F32, &dev)).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 16, 6), &dev).unwrap();
        let mask = Tensor::new(&[[[1f32, 1.0, 1.0, 1.0, 0.0, 0.0]]], &dev).unwrap();
        let out = wn.forward(&x, &mask, None, Mode::Eval).unwrap();
        let tail = out.narrow(2, 4, 2).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(tail.to_scalar::<f32>().unwrap(), 0.0);
    }
}
