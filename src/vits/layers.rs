//! Building blocks shared by the VITS sub-networks.
//!
//! Everything here is composed from differentiable tensor ops so the same
//! code serves inference and fine-tuning.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use super::Mode;

/// Kernel of a (possibly weight-normalised) convolution.
///
/// Checkpoints store either the fused `weight`, the classic `weight_g` /
/// `weight_v` pair, or the newer `parametrizations.weight.original0/1`
/// pair. Normalised kernels are recomputed on every forward as
/// `v · g / ‖v‖` (norm over every axis but the first).
#[derive(Debug, Clone)]
pub enum ConvWeight {
    Plain(Tensor),
    Normed { g: Tensor, v: Tensor },
}

impl ConvWeight {
    pub fn load(vb: &VarBuilder, shape: (usize, usize, usize), init: Init) -> Result<Self> {
        let g_shape = (shape.0, 1, 1);
        if vb.contains_tensor("weight") {
            return Ok(Self::Plain(vb.get_with_hints(shape, "weight", init)?));
        }
        if vb.contains_tensor("weight_g") && vb.contains_tensor("weight_v") {
            return Ok(Self::Normed {
                g: vb.get_with_hints(g_shape, "weight_g", Init::Const(1.0))?,
                v: vb.get_with_hints(shape, "weight_v", init)?,
            });
        }
        let param = vb.pp("parametrizations").pp("weight");
        if param.contains_tensor("original0") && param.contains_tensor("original1") {
            return Ok(Self::Normed {
                g: param.get_with_hints(g_shape, "original0", Init::Const(1.0))?,
                v: param.get_with_hints(shape, "original1", init)?,
            });
        }
        Ok(Self::Plain(vb.get_with_hints(shape, "weight", init)?))
    }

    /// The effective kernel.
    pub fn tensor(&self) -> Result<Tensor> {
        match self {
            Self::Plain(w) => Ok(w.clone()),
            Self::Normed { g, v } => {
                let norm = v.sqr()?.sum_keepdim(2)?.sum_keepdim(1)?.sqrt()?;
                v.broadcast_mul(&g.broadcast_div(&norm)?)
            }
        }
    }
}

/// Geometry of a 1-D convolution.
#[derive(Debug, Clone, Copy)]
pub struct ConvCfg {
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize,
    pub bias: bool,
}

impl Default for ConvCfg {
    fn default() -> Self {
        Self { padding: 0, dilation: 1, groups: 1, bias: true }
    }
}

impl ConvCfg {
    /// "Same" padding for an odd kernel.
    pub fn same(kernel: usize, dilation: usize) -> Self {
        Self { padding: (kernel * dilation - dilation) / 2, dilation, ..Self::default() }
    }
}

#[derive(Debug, Clone)]
pub struct Conv1d {
    weight: ConvWeight,
    bias: Option<Tensor>,
    cfg: ConvCfg,
}

pub fn conv1d(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    cfg: ConvCfg,
    vb: VarBuilder,
) -> Result<Conv1d> {
    let shape = (out_channels, in_channels / cfg.groups, kernel);
    let weight = ConvWeight::load(&vb, shape, candle_nn::init::DEFAULT_KAIMING_NORMAL)?;
    let bias = if cfg.bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Conv1d { weight, bias, cfg })
}

impl Conv1d {
    /// `[b, c_in, t] → [b, c_out, t']`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.tensor()?;
        let y = x.conv1d(&w, self.cfg.padding, 1, self.cfg.dilation, self.cfg.groups)?;
        match &self.bias {
            Some(b) => y.broadcast_add(&b.reshape((1, (), 1))?),
            None => Ok(y),
        }
    }
}

/// Transposed convolution used by the HiFi-GAN upsampler.
///
/// In [`Mode::Train`] it is evaluated as zero-insertion followed by an
/// ordinary convolution with the flipped, transposed kernel, which keeps the
/// op inside candle's autograd. Both paths give the same result.
#[derive(Debug, Clone)]
pub struct ConvTranspose1d {
    weight: ConvWeight,
    bias: Option<Tensor>,
    kernel: usize,
    stride: usize,
    padding: usize,
}

pub fn conv_transpose1d(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> Result<ConvTranspose1d> {
    let weight = ConvWeight::load(
        &vb,
        (in_channels, out_channels, kernel),
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bias = Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?);
    Ok(ConvTranspose1d { weight, bias, kernel, stride, padding })
}

impl ConvTranspose1d {
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        let w = self.weight.tensor()?;
        let y = match mode {
            Mode::Eval => x.conv_transpose1d(&w, self.padding, 0, self.stride, 1, 1)?,
            Mode::Train => self.forward_as_conv(x, &w)?,
        };
        match &self.bias {
            Some(b) => y.broadcast_add(&b.reshape((1, (), 1))?),
            None => Ok(y),
        }
    }

    fn forward_as_conv(&self, x: &Tensor, w: &Tensor) -> Result<Tensor> {
        let (b, c, t) = x.dims3()?;
        let s = self.stride;
        let upsampled = if s > 1 {
            let zeros = Tensor::zeros((b, c, t, s - 1), x.dtype(), x.device())?;
            Tensor::cat(&[&x.unsqueeze(3)?, &zeros], 3)?
                .reshape((b, c, t * s))?
                .narrow(2, 0, (t - 1) * s + 1)?
        } else {
            x.clone()
        };
        let edge = self.kernel - 1 - self.padding;
        let padded = upsampled.pad_with_zeros(2, edge, edge)?;
        let kernel = flip(&w.transpose(0, 1)?.contiguous()?, 2)?;
        padded.conv1d(&kernel, 0, 1, 1, 1)
    }
}

/// Layer norm over the last axis, written out so gradients flow through it.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    Ok(LayerNorm {
        weight: vb.get_with_hints(size, "weight", Init::Const(1.0))?,
        bias: vb.get_with_hints(size, "bias", Init::Const(0.0))?,
        eps,
    })
}

impl LayerNorm {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }

    /// Normalise the channel axis of a `[b, c, t]` tensor.
    pub fn forward_channels(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(&x.transpose(1, 2)?)?.transpose(1, 2)
    }
}

pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    (x.neg()?.exp()? + 1.0)?.recip()
}

pub fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    candle_nn::ops::leaky_relu(x, slope)
}

/// Reverse `x` along `dim`.
pub fn flip(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)?;
    let idx: Vec<u32> = (0..n as u32).rev().collect();
    let idx = Tensor::new(idx.as_slice(), x.device())?;
    x.contiguous()?.index_select(&idx, dim)
}

/// Dropout that is only active in training.
pub fn dropout(x: &Tensor, p: f64, mode: Mode) -> Result<Tensor> {
    if mode.is_train() && p > 0.0 {
        candle_nn::ops::dropout(x, p as f32)
    } else {
        Ok(x.clone())
    }
}

/// `[b, t]` 0/1 mask → `[b, 1, t]` float mask.
pub fn padding_mask(attention_mask: &Tensor) -> Result<Tensor> {
    attention_mask.to_dtype(DType::F32)?.unsqueeze(1)
}

/// First `len` channels and the remainder, split along axis 1.
pub fn split_channels(x: &Tensor, len: usize) -> Result<(Tensor, Tensor)> {
    let total = x.dim(1)?;
    Ok((x.narrow(1, 0, len)?, x.narrow(1, len, total - len)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn flip_reverses_axis() {
        let x = Tensor::new(&[[[1f32, 2.0], [3.0, 4.0], [5.0, 6.0]]], &Device::Cpu).unwrap();
        let y = flip(&x, 1).unwrap();
        assert_eq!(y.to_vec3::<f32>().unwrap(), vec![vec![vec![5.0, 6.0], vec![3.0, 4.0], vec![1.0, 2.0]]]);
    }

    #[test]
    fn flip_accepts_strided_views() {
        // [2, 3, 2] → narrow on the last axis leaves a non-contiguous view.
        let x = Tensor::arange(0f32, 12.0, &Device::Cpu).unwrap().reshape((2, 3, 2)).unwrap();
        let view = x.narrow(2, 1, 1).unwrap();
        assert!(!view.is_contiguous());
        let y = flip(&view, 1).unwrap();
        assert_eq!(
            y.to_vec3::<f32>().unwrap(),
            vec![vec![vec![5.0], vec![3.0], vec![1.0]], vec![vec![11.0], vec![9.0], vec![7.0]]]
        );
    }

    #[test]
    fn weight_norm_matches_fused_kernel() {
        let dev = Device::Cpu;
        let v = Tensor::new(&[[[3f32, 4.0]], [[0.0, 2.0]]], &dev).unwrap();
        let g = Tensor::new(&[[[10f32]], [[1.0]]], &dev).unwrap();
        let w = ConvWeight::Normed { g, v }.tensor().unwrap();
        assert_eq!(
            w.to_vec3::<f32>().unwrap(),
            vec![vec![vec![6.0, 8.0]], vec![vec![0.0, 1.0]]]
        );
    }

    #[test]
    fn transposed_conv_paths_agree() {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let up = conv_transpose1d(3, 2, 8, 4, 2, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 5), &dev).unwrap();
        let a = up.forward(&x, Mode::Eval).unwrap();
        let b = up.forward(&x, Mode::Train).unwrap();
        assert_eq!(a.dims(), &[2, 2, 20]);
        assert_eq!(a.dims(), b.dims());
        let diff = (a - b).unwrap().abs().unwrap().max_keepdim(2).unwrap().max_keepdim(1).unwrap();
        let diff = diff.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(diff.iter().all(|&d| d < 1e-4), "{diff:?}");
    }

    #[test]
    fn layer_norm_zero_mean_unit_var() {
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let ln = layer_norm(4, 1e-5, VarBuilder::from_varmap(&vm, DType::F32, &dev)).unwrap();
        let x = Tensor::new(&[[1f32, 2.0, 3.0, 4.0]], &dev).unwrap();
        let y = ln.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let mean: f32 = y[0].iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        approx::assert_abs_diff_eq!(y[0][3], 1.3416, epsilon = 1e-3);
    }

    #[test]
    fn sigmoid_of_zero_is_half() {
        let x = Tensor::new(&[0f32], &Device::Cpu).unwrap();
        approx::assert_abs_diff_eq!(sigmoid(&x).unwrap().to_vec1::<f32>().unwrap()[0], 0.5);
    }
}
