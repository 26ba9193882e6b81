//! Duration predictors: the stochastic flow-based one used by MMS-TTS and
//! the plain convolutional fallback.
//!
//! Both see detached encoder states, so durations never carry gradients; the
//! spline flow therefore runs on host `f32` buffers.

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use super::{
    layers::{self, conv1d, dropout, flip, layer_norm, ConvCfg, LayerNorm},
    Mode, VitsConfig,
};

const MIN_BIN_WIDTH: f32 = 1e-3;
const MIN_BIN_HEIGHT: f32 = 1e-3;
const MIN_DERIVATIVE: f32 = 1e-3;

// ─────────────────────────────────────────────────────────────────────────────
// Rational-quadratic spline (inverse direction)
// ─────────────────────────────────────────────────────────────────────────────

fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = xs.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Knot positions (`K + 1` values from `-bound` to `bound`) from unnormalised
/// bin sizes.
fn knots(unnormalized: &[f32], min_size: f32, bound: f32) -> Vec<f32> {
    let k = unnormalized.len();
    let sizes = softmax(unnormalized);
    let mut cum = Vec::with_capacity(k + 1);
    cum.push(-bound);
    let mut acc = 0.0f32;
    for s in sizes {
        acc += min_size + (1.0 - min_size * k as f32) * s;
        cum.push(2.0 * bound * acc - bound);
    }
    cum[k] = bound;
    cum
}

/// Invert the unconstrained rational-quadratic spline at `y`.
///
/// `widths` and `heights` hold `K` unnormalised values, `derivatives` the
/// `K − 1` inner knot slopes. Outside `[-bound, bound]` the map is the
/// identity.
pub(crate) fn spline_inverse(
    y: f32,
    widths: &[f32],
    heights: &[f32],
    derivatives: &[f32],
    bound: f32,
) -> f32 {
    if y < -bound || y > bound {
        return y;
    }
    let k = widths.len();
    let cumwidths = knots(widths, MIN_BIN_WIDTH, bound);
    let cumheights = knots(heights, MIN_BIN_HEIGHT, bound);

    // Boundary slopes are pinned so the spline meets the identity tails.
    let edge = ((1.0 - MIN_DERIVATIVE).exp() - 1.0).ln();
    let mut derivs = Vec::with_capacity(k + 1);
    derivs.push(MIN_DERIVATIVE + softplus(edge));
    derivs.extend(derivatives.iter().map(|&d| MIN_DERIVATIVE + softplus(d)));
    derivs.push(MIN_DERIVATIVE + softplus(edge));

    let mut locations = cumheights.clone();
    locations[k] += 1e-6;
    let bin = locations
        .iter()
        .filter(|&&loc| y >= loc)
        .count()
        .saturating_sub(1)
        .min(k - 1);

    let x_lo = cumwidths[bin];
    let w = cumwidths[bin + 1] - cumwidths[bin];
    let y_lo = cumheights[bin];
    let h = cumheights[bin + 1] - cumheights[bin];
    let delta = h / w;
    let d0 = derivs[bin];
    let d1 = derivs[bin + 1];

    let i1 = d0 + d1 - 2.0 * delta;
    let i2 = y - y_lo;
    let i3 = i2 * i1;
    let a = h * (delta - d0) + i3;
    let b = h * d0 - i3;
    let c = -delta * i2;
    let disc = (b * b - 4.0 * a * c).max(0.0);
    let root = (2.0 * c) / (-b - disc.sqrt());
    root * w + x_lo
}

// ─────────────────────────────────────────────────────────────────────────────
// Dilated depth-separable convolutions
// ─────────────────────────────────────────────────────────────────────────────

struct DilatedDepthSeparableConv {
    convs_dilated: Vec<layers::Conv1d>,
    convs_pointwise: Vec<layers::Conv1d>,
    norms_1: Vec<LayerNorm>,
    norms_2: Vec<LayerNorm>,
    dropout: f64,
}

impl DilatedDepthSeparableConv {
    fn new(cfg: &VitsConfig, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let k = cfg.duration_predictor_kernel_size;
        let ch = cfg.hidden_size;
        let mut s = Self {
            convs_dilated: Vec::new(),
            convs_pointwise: Vec::new(),
            norms_1: Vec::new(),
            norms_2: Vec::new(),
            dropout,
        };
        for i in 0..cfg.depth_separable_num_layers {
            let dilation = k.pow(i as u32);
            let dcfg = ConvCfg { groups: ch, ..ConvCfg::same(k, dilation) };
            s.convs_dilated
                .push(conv1d(ch, ch, k, dcfg, vb.pp("convs_dilated").pp(i))?);
            s.convs_pointwise
                .push(conv1d(ch, ch, 1, ConvCfg::default(), vb.pp("convs_pointwise").pp(i))?);
            s.norms_1.push(layer_norm(ch, 1e-5, vb.pp("norms_1").pp(i))?);
            s.norms_2.push(layer_norm(ch, 1e-5, vb.pp("norms_2").pp(i))?);
        }
        Ok(s)
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        conditioning: Option<&Tensor>,
        mode: Mode,
    ) -> Result<Tensor> {
        let mut x = match conditioning {
            Some(g) => x.broadcast_add(g)?,
            None => x.clone(),
        };
        for i in 0..self.convs_dilated.len() {
            let h = self.convs_dilated[i].forward(&x.broadcast_mul(mask)?)?;
            let h = self.norms_1[i].forward_channels(&h)?.gelu_erf()?;
            let h = self.convs_pointwise[i].forward(&h)?;
            let h = self.norms_2[i].forward_channels(&h)?.gelu_erf()?;
            let h = dropout(&h, self.dropout, mode)?;
            x = (x + h)?;
        }
        x.broadcast_mul(mask)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Flows
// ─────────────────────────────────────────────────────────────────────────────

struct ElementwiseAffine {
    translate: Tensor,
    log_scale: Tensor,
}

impl ElementwiseAffine {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            translate: vb.get_with_hints((channels, 1), "translate", Init::Const(0.0))?,
            log_scale: vb.get_with_hints((channels, 1), "log_scale", Init::Const(0.0))?,
        })
    }

    fn reverse(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        x.broadcast_sub(&self.translate)?
            .broadcast_mul(&self.log_scale.neg()?.exp()?)?
            .broadcast_mul(mask)
    }
}

struct ConvFlow {
    conv_pre: layers::Conv1d,
    conv_dds: DilatedDepthSeparableConv,
    conv_proj: layers::Conv1d,
    half_channels: usize,
    num_bins: usize,
    tail_bound: f32,
    filter_channels: usize,
}

impl ConvFlow {
    fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let half = cfg.depth_separable_channels / 2;
        let bins = cfg.duration_predictor_flow_bins;
        let ch = cfg.hidden_size;
        Ok(Self {
            conv_pre: conv1d(half, ch, 1, ConvCfg::default(), vb.pp("conv_pre"))?,
            conv_dds: DilatedDepthSeparableConv::new(cfg, 0.0, vb.pp("conv_dds"))?,
            conv_proj: conv1d(ch, half * (bins * 3 - 1), 1, ConvCfg::default(), vb.pp("conv_proj"))?,
            half_channels: half,
            num_bins: bins,
            tail_bound: cfg.duration_predictor_tail_bound as f32,
            filter_channels: ch,
        })
    }

    fn reverse(
        &self,
        x: &Tensor,
        mask: &Tensor,
        conditioning: &Tensor,
        mode: Mode,
    ) -> Result<Tensor> {
        let (first, second) = layers::split_channels(x, self.half_channels)?;
        let h = self.conv_pre.forward(&first)?;
        let h = self.conv_dds.forward(&h, mask, Some(conditioning), mode)?;
        let h = self.conv_proj.forward(&h)?.broadcast_mul(mask)?;

        let (b, c, t) = second.dims3()?;
        let params = h.to_vec3::<f32>()?;
        let targets = second.to_vec3::<f32>()?;
        let per = 3 * self.num_bins - 1;
        let scale = (self.filter_channels as f32).sqrt();
        let k = self.num_bins;

        let mut out = Vec::with_capacity(b * c * t);
        for bi in 0..b {
            for ci in 0..c {
                for ti in 0..t {
                    let p: Vec<f32> = (0..per).map(|j| params[bi][ci * per + j][ti]).collect();
                    let widths: Vec<f32> = p[..k].iter().map(|v| v / scale).collect();
                    let heights: Vec<f32> = p[k..2 * k].iter().map(|v| v / scale).collect();
                    out.push(spline_inverse(
                        targets[bi][ci][ti],
                        &widths,
                        &heights,
                        &p[2 * k..],
                        self.tail_bound,
                    ));
                }
            }
        }
        let second = Tensor::from_vec(out, (b, c, t), x.device())?;
        Tensor::cat(&[&first, &second], 1)?.broadcast_mul(mask)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Predictors
// ─────────────────────────────────────────────────────────────────────────────

pub struct StochasticDurationPredictor {
    conv_pre: layers::Conv1d,
    conv_proj: layers::Conv1d,
    conv_dds: DilatedDepthSeparableConv,
    cond: Option<layers::Conv1d>,
    affine: ElementwiseAffine,
    conv_flows: Vec<ConvFlow>,
    channels: usize,
}

impl StochasticDurationPredictor {
    pub fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let ch = cfg.hidden_size;
        let cond = if cfg.speaker_embedding_size > 0 {
            Some(conv1d(cfg.speaker_embedding_size, ch, 1, ConvCfg::default(), vb.pp("cond"))?)
        } else {
            None
        };
        let flows = vb.pp("flows");
        let affine = ElementwiseAffine::new(cfg.depth_separable_channels, flows.pp(0))?;
        let conv_flows = (1..=cfg.duration_predictor_num_flows)
            .map(|i| ConvFlow::new(cfg, flows.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            conv_pre: conv1d(ch, ch, 1, ConvCfg::default(), vb.pp("conv_pre"))?,
            conv_proj: conv1d(ch, ch, 1, ConvCfg::default(), vb.pp("conv_proj"))?,
            conv_dds: DilatedDepthSeparableConv::new(
                cfg,
                cfg.duration_predictor_dropout,
                vb.pp("conv_dds"),
            )?,
            cond,
            affine,
            conv_flows,
            channels: cfg.depth_separable_channels,
        })
    }

    /// Sample log-durations `[b, 1, t]` from noise scaled by `noise_scale`.
    pub fn sample(
        &self,
        hidden: &Tensor,
        mask: &Tensor,
        speaker: Option<&Tensor>,
        noise_scale: f64,
        mode: Mode,
    ) -> Result<Tensor> {
        let mut x = self.conv_pre.forward(&hidden.detach())?;
        if let (Some(cond), Some(g)) = (&self.cond, speaker) {
            x = x.broadcast_add(&cond.forward(&g.detach())?)?;
        }
        let x = self.conv_dds.forward(&x, mask, None, mode)?;
        let inputs = self.conv_proj.forward(&x)?.broadcast_mul(mask)?;

        let (b, _, t) = inputs.dims3()?;
        let mut latents =
            (Tensor::randn(0f32, 1f32, (b, self.channels, t), inputs.device())? * noise_scale)?;
        // Reverse order, skipping the first conv flow (it only matters for
        // the training objective).
        for flow in self.conv_flows.iter().skip(1).rev() {
            latents = flip(&latents, 1)?;
            latents = flow.reverse(&latents, mask, &inputs, mode)?;
        }
        latents = flip(&latents, 1)?;
        latents = self.affine.reverse(&latents, mask)?;
        latents.narrow(1, 0, 1)
    }
}

pub struct DeterministicDurationPredictor {
    conv_1: layers::Conv1d,
    norm_1: LayerNorm,
    conv_2: layers::Conv1d,
    norm_2: LayerNorm,
    proj: layers::Conv1d,
    cond: Option<layers::Conv1d>,
    dropout: f64,
}

impl DeterministicDurationPredictor {
    pub fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let k = cfg.duration_predictor_kernel_size;
        let f = cfg.duration_predictor_filter_channels;
        let pad = ConvCfg { padding: k / 2, ..ConvCfg::default() };
        let cond = if cfg.speaker_embedding_size > 0 {
            Some(conv1d(
                cfg.speaker_embedding_size,
                cfg.hidden_size,
                1,
                ConvCfg::default(),
                vb.pp("cond"),
            )?)
        } else {
            None
        };
        Ok(Self {
            conv_1: conv1d(cfg.hidden_size, f, k, pad, vb.pp("conv_1"))?,
            norm_1: layer_norm(f, cfg.layer_norm_eps, vb.pp("norm_1"))?,
            conv_2: conv1d(f, f, k, pad, vb.pp("conv_2"))?,
            norm_2: layer_norm(f, cfg.layer_norm_eps, vb.pp("norm_2"))?,
            proj: conv1d(f, 1, 1, ConvCfg::default(), vb.pp("proj"))?,
            cond,
            dropout: cfg.duration_predictor_dropout,
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: &Tensor,
        speaker: Option<&Tensor>,
        mode: Mode,
    ) -> Result<Tensor> {
        let mut x = hidden.detach();
        if let (Some(cond), Some(g)) = (&self.cond, speaker) {
            x = x.broadcast_add(&cond.forward(&g.detach())?)?;
        }
        let x = self.conv_1.forward(&x.broadcast_mul(mask)?)?.relu()?;
        let x = dropout(&self.norm_1.forward_channels(&x)?, self.dropout, mode)?;
        let x = self.conv_2.forward(&x.broadcast_mul(mask)?)?.relu()?;
        let x = dropout(&self.norm_2.forward_channels(&x)?, self.dropout, mode)?;
        self.proj.forward(&x.broadcast_mul(mask)?)?.broadcast_mul(mask)
    }
}

/// Whichever predictor the checkpoint was trained with.
pub enum DurationPredictor {
    Stochastic(StochasticDurationPredictor),
    Deterministic(DeterministicDurationPredictor),
}

impl DurationPredictor {
    pub fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.use_stochastic_duration_prediction {
            Ok(Self::Stochastic(StochasticDurationPredictor::new(cfg, vb)?))
        } else {
            Ok(Self::Deterministic(DeterministicDurationPredictor::new(cfg, vb)?))
        }
    }

    /// Log-durations `[b, 1, t]`.
    pub fn log_durations(
        &self,
        hidden: &Tensor,
        mask: &Tensor,
        speaker: Option<&Tensor>,
        noise_scale_duration: f64,
        mode: Mode,
    ) -> Result<Tensor> {
        match self {
            Self::Stochastic(p) => p.sample(hidden, mask, speaker, noise_scale_duration, mode),
            Self::Deterministic(p) => p.forward(hidden, mask, speaker, mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    /// Forward evaluation of the same spline, for checking the inverse.
    fn spline_forward(x: f32, w: &[f32], h: &[f32], d: &[f32], bound: f32) -> f32 {
        let k = w.len();
        let cw = knots(w, MIN_BIN_WIDTH, bound);
        let ch = knots(h, MIN_BIN_HEIGHT, bound);
        let edge = ((1.0 - MIN_DERIVATIVE).exp() - 1.0).ln();
        let mut ds = vec![MIN_DERIVATIVE + softplus(edge)];
        ds.extend(d.iter().map(|&v| MIN_DERIVATIVE + softplus(v)));
        ds.push(MIN_DERIVATIVE + softplus(edge));
        let bin = cw.iter().filter(|&&c| x >= c).count().saturating_sub(1).min(k - 1);
        let width = cw[bin + 1] - cw[bin];
        let height = ch[bin + 1] - ch[bin];
        let delta = height / width;
        let theta = (x - cw[bin]) / width;
        let tt = theta * (1.0 - theta);
        let num = height * (delta * theta * theta + ds[bin] * tt);
        let den = delta + (ds[bin] + ds[bin + 1] - 2.0 * delta) * tt;
        ch[bin] + num / den
    }

    #[test]
    fn spline_inverse_undoes_forward() {
        let w = [0.3, -0.2, 0.5, 0.0];
        let h = [-0.4, 0.1, 0.2, 0.7];
        let d = [0.2, -0.5, 1.0];
        for &x in &[-4.5f32, -1.0, 0.0, 0.7, 3.9] {
            let y = spline_forward(x, &w, &h, &d, 5.0);
            let back = spline_inverse(y, &w, &h, &d, 5.0);
            assert_abs_diff_eq!(back, x, epsilon = 1e-3);
        }
    }

    #[test]
    fn spline_is_identity_outside_bound() {
        let z = [0.0f32; 4];
        assert_eq!(spline_inverse(7.5, &z, &z, &[0.0; 3], 5.0), 7.5);
        assert_eq!(spline_inverse(-6.0, &z, &z, &[0.0; 3], 5.0), -6.0);
    }

    #[test]
    fn knots_span_bound() {
        let k = knots(&[0.0, 0.0], 1e-3, 5.0);
        assert_eq!(k.len(), 3);
        assert_eq!(k[0], -5.0);
        assert_eq!(k[2], 5.0);
        assert_abs_diff_eq!(k[1], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn predictors_give_one_channel() {
        let dev = Device::Cpu;
        let hidden = Tensor::randn(0f32, 1.0, (2, 16, 7), &dev).unwrap();
        let mask = Tensor::ones((2, 1, 7), DType::F32, &dev).unwrap();
        for stochastic in [true, false] {
            let cfg = VitsConfig {
                use_stochastic_duration_prediction: stochastic,
                ..VitsConfig::tiny(10)
            };
            let vm = VarMap::new();
            let dp =
                DurationPredictor::new(&cfg, VarBuilder::from_varmap(&vm, DType::F32, &dev)).unwrap();
            let out = dp.log_durations(&hidden, &mask, None, 0.4, Mode::Eval).unwrap();
            assert_eq!(out.dims(), &[2, 1, 7]);
        }
    }
}
