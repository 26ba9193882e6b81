//! HiFi-GAN vocoder turning latent frames into a waveform.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{
    layers::{self, conv1d, conv_transpose1d, leaky_relu, ConvCfg},
    Mode, VitsConfig,
};

const RESBLOCK_SLOPE: f64 = 0.1;
const FINAL_SLOPE: f64 = 0.01;

struct ResBlock {
    convs1: Vec<layers::Conv1d>,
    convs2: Vec<layers::Conv1d>,
    slope: f64,
}

impl ResBlock {
    fn new(channels: usize, kernel: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for (j, &d) in dilations.iter().enumerate() {
            convs1.push(conv1d(channels, channels, kernel, ConvCfg::same(kernel, d), vb.pp("convs1").pp(j))?);
            convs2.push(conv1d(channels, channels, kernel, ConvCfg::same(kernel, 1), vb.pp("convs2").pp(j))?);
        }
        Ok(Self { convs1, convs2, slope: RESBLOCK_SLOPE })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (c1, c2) in self.convs1.iter().zip(&self.convs2) {
            let h = c1.forward(&leaky_relu(&x, self.slope)?)?;
            let h = c2.forward(&leaky_relu(&h, self.slope)?)?;
            x = (x + h)?;
        }
        Ok(x)
    }
}

pub struct HifiGan {
    conv_pre: layers::Conv1d,
    upsampler: Vec<layers::ConvTranspose1d>,
    resblocks: Vec<ResBlock>,
    conv_post: layers::Conv1d,
    cond: Option<layers::Conv1d>,
    kernels_per_stage: usize,
    slope: f64,
}

impl HifiGan {
    pub fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let init = cfg.upsample_initial_channel;
        let conv_pre = conv1d(
            cfg.flow_size,
            init,
            7,
            ConvCfg { padding: 3, ..ConvCfg::default() },
            vb.pp("conv_pre"),
        )?;

        let mut upsampler = Vec::with_capacity(cfg.upsample_rates.len());
        let mut resblocks = Vec::new();
        let mut channels = init;
        for (i, (&rate, &kernel)) in
            cfg.upsample_rates.iter().zip(&cfg.upsample_kernel_sizes).enumerate()
        {
            let out = init / 2usize.pow(i as u32 + 1);
            upsampler.push(conv_transpose1d(
                init / 2usize.pow(i as u32),
                out,
                kernel,
                rate,
                (kernel - rate) / 2,
                vb.pp("upsampler").pp(i),
            )?);
            for (j, (&k, dilations)) in cfg
                .resblock_kernel_sizes
                .iter()
                .zip(&cfg.resblock_dilation_sizes)
                .enumerate()
            {
                let idx = i * cfg.resblock_kernel_sizes.len() + j;
                resblocks.push(ResBlock::new(out, k, dilations, vb.pp("resblocks").pp(idx))?);
            }
            channels = out;
        }

        let conv_post = conv1d(
            channels,
            1,
            7,
            ConvCfg { padding: 3, bias: false, ..ConvCfg::default() },
            vb.pp("conv_post"),
        )?;
        let cond = if cfg.speaker_embedding_size > 0 {
            Some(conv1d(cfg.speaker_embedding_size, init, 1, ConvCfg::default(), vb.pp("cond"))?)
        } else {
            None
        };

        Ok(Self {
            conv_pre,
            upsampler,
            resblocks,
            conv_post,
            cond,
            kernels_per_stage: cfg.resblock_kernel_sizes.len(),
            slope: cfg.leaky_relu_slope,
        })
    }

    /// `[b, flow_size, frames]` → `[b, 1, frames · hop]` in `[-1, 1]`.
    pub fn forward(&self, x: &Tensor, speaker: Option<&Tensor>, mode: Mode) -> Result<Tensor> {
        let mut x = self.conv_pre.forward(x)?;
        if let (Some(cond), Some(g)) = (&self.cond, speaker) {
            x = x.broadcast_add(&cond.forward(g)?)?;
        }
        for (i, up) in self.upsampler.iter().enumerate() {
            x = up.forward(&leaky_relu(&x, self.slope)?, mode)?;
            let blocks = &self.resblocks[i * self.kernels_per_stage..(i + 1) * self.kernels_per_stage];
            let mut acc = blocks[0].forward(&x)?;
            for block in &blocks[1..] {
                acc = (acc + block.forward(&x)?)?;
            }
            x = (acc / self.kernels_per_stage as f64)?;
        }
        let x = leaky_relu(&x, FINAL_SLOPE)?;
        self.conv_post.forward(&x)?.tanh()
    }
}
