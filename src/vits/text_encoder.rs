//! Transformer text encoder with windowed relative-position attention.

use candle_core::{Result, Tensor, D};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder};
use rand::Rng;

use super::{
    layers::{self, conv1d, dropout, layer_norm, ConvCfg, LayerNorm},
    Mode, VitsConfig,
};

/// Additive logit bias for padded key positions.
const MASKED: f64 = -1e9;

// ─────────────────────────────────────────────────────────────────────────────
// Relative position helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Slice (zero-padding if needed) `[1, 2w+1, d]` relative embeddings to the
/// `2·len − 1` offsets a sequence of `len` can use.
pub(crate) fn relative_embeddings(rel: &Tensor, window: usize, len: usize) -> Result<Tensor> {
    let pad = len.saturating_sub(window + 1);
    let rel = if pad > 0 { rel.pad_with_zeros(1, pad, pad)? } else { rel.clone() };
    let start = (window + 1).saturating_sub(len);
    rel.narrow(1, start, 2 * len - 1)
}

/// `[bh, l, 2l−1]` relative logits → `[bh, l, l]` absolute logits.
pub(crate) fn relative_to_absolute(x: &Tensor) -> Result<Tensor> {
    let (bh, l, _) = x.dims3()?;
    let x = x.pad_with_zeros(2, 0, 1)?.reshape((bh, l * 2 * l))?;
    x.pad_with_zeros(1, 0, l - 1)?
        .reshape((bh, l + 1, 2 * l - 1))?
        .narrow(1, 0, l)?
        .narrow(2, l - 1, l)
}

/// `[bh, l, l]` absolute weights → `[bh, l, 2l−1]` relative weights.
pub(crate) fn absolute_to_relative(x: &Tensor) -> Result<Tensor> {
    let (bh, l, _) = x.dims3()?;
    let x = x.pad_with_zeros(2, 0, l - 1)?.reshape((bh, l * (2 * l - 1)))?;
    x.pad_with_zeros(1, l, 0)?.reshape((bh, l, 2 * l))?.narrow(2, 1, 2 * l - 1)
}

// ─────────────────────────────────────────────────────────────────────────────
// Attention
// ─────────────────────────────────────────────────────────────────────────────

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    emb_rel: Option<(Tensor, Tensor, usize)>,
    num_heads: usize,
    head_dim: usize,
    dropout: f64,
}

impl Attention {
    fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let head_dim = cfg.head_dim();
        let emb_rel = match cfg.window_size {
            Some(w) if w > 0 => {
                let init = Init::Randn { mean: 0.0, stdev: (head_dim as f64).powf(-0.5) };
                let k = vb.get_with_hints((1, 2 * w + 1, head_dim), "emb_rel_k", init)?;
                let v = vb.get_with_hints((1, 2 * w + 1, head_dim), "emb_rel_v", init)?;
                Some((k, v, w))
            }
            _ => None,
        };
        Ok(Self {
            q_proj: candle_nn::linear_b(h, h, cfg.use_bias, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear_b(h, h, cfg.use_bias, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear_b(h, h, cfg.use_bias, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear_b(h, h, cfg.use_bias, vb.pp("out_proj"))?,
            emb_rel,
            num_heads: cfg.num_attention_heads,
            head_dim,
            dropout: cfg.attention_dropout,
        })
    }

    /// `x: [b, t, h]`, `key_bias: [b, 1, 1, t]` (0 or [`MASKED`]).
    fn forward(&self, x: &Tensor, key_bias: &Tensor, mode: Mode) -> Result<Tensor> {
        let (b, t, h) = x.dims3()?;
        let heads = |y: Tensor| -> Result<Tensor> {
            y.reshape((b, t, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((b * self.num_heads, t, self.head_dim))
        };
        let scaling = (self.head_dim as f64).powf(-0.5);
        let q = heads((self.q_proj.forward(x)? * scaling)?)?;
        let k = heads(self.k_proj.forward(x)?)?;
        let v = heads(self.v_proj.forward(x)?)?;

        let mut scores = q.matmul(&k.t()?.contiguous()?)?;
        if let Some((rel_k, _, window)) = &self.emb_rel {
            let rel_k = relative_embeddings(rel_k, *window, t)?;
            let logits = q.broadcast_matmul(&rel_k.t()?.contiguous()?)?;
            scores = (scores + relative_to_absolute(&logits)?)?;
        }
        let scores = scores
            .reshape((b, self.num_heads, t, t))?
            .broadcast_add(key_bias)?
            .reshape((b * self.num_heads, t, t))?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = dropout(&probs, self.dropout, mode)?;

        let mut out = probs.matmul(&v)?;
        if let Some((_, rel_v, window)) = &self.emb_rel {
            let rel_v = relative_embeddings(rel_v, *window, t)?;
            let weights = absolute_to_relative(&probs)?;
            out = (out + weights.broadcast_matmul(&rel_v)?)?;
        }
        let out = out
            .reshape((b, self.num_heads, t, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, h))?;
        self.out_proj.forward(&out)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feed-forward
// ─────────────────────────────────────────────────────────────────────────────

struct FeedForward {
    conv_1: layers::Conv1d,
    conv_2: layers::Conv1d,
    pad: (usize, usize),
    dropout: f64,
}

impl FeedForward {
    fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let k = cfg.ffn_kernel_size;
        let pad = if k > 1 { ((k - 1) / 2, k / 2) } else { (0, 0) };
        Ok(Self {
            conv_1: conv1d(cfg.hidden_size, cfg.ffn_dim, k, ConvCfg::default(), vb.pp("conv_1"))?,
            conv_2: conv1d(cfg.ffn_dim, cfg.hidden_size, k, ConvCfg::default(), vb.pp("conv_2"))?,
            pad,
            dropout: cfg.activation_dropout,
        })
    }

    /// `x: [b, t, h]`, `mask: [b, 1, t]`.
    fn forward(&self, x: &Tensor, mask: &Tensor, mode: Mode) -> Result<Tensor> {
        let x = x.transpose(1, 2)?.broadcast_mul(mask)?;
        let x = self.conv_1.forward(&x.pad_with_zeros(2, self.pad.0, self.pad.1)?)?.relu()?;
        let x = dropout(&x, self.dropout, mode)?.broadcast_mul(mask)?;
        let x = self.conv_2.forward(&x.pad_with_zeros(2, self.pad.0, self.pad.1)?)?;
        x.broadcast_mul(mask)?.transpose(1, 2)
    }
}

struct EncoderLayer {
    attention: Attention,
    layer_norm: LayerNorm,
    feed_forward: FeedForward,
    final_layer_norm: LayerNorm,
    dropout: f64,
}

impl EncoderLayer {
    fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: Attention::new(cfg, vb.pp("attention"))?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            feed_forward: FeedForward::new(cfg, vb.pp("feed_forward"))?,
            final_layer_norm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("final_layer_norm"),
            )?,
            dropout: cfg.hidden_dropout,
        })
    }

    fn forward(&self, x: &Tensor, key_bias: &Tensor, mask: &Tensor, mode: Mode) -> Result<Tensor> {
        let attn = dropout(&self.attention.forward(x, key_bias, mode)?, self.dropout, mode)?;
        let x = self.layer_norm.forward(&(x + attn)?)?;
        let ff = dropout(&self.feed_forward.forward(&x, mask, mode)?, self.dropout, mode)?;
        self.final_layer_norm.forward(&(x + ff)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TextEncoder
// ─────────────────────────────────────────────────────────────────────────────

/// Output of [`TextEncoder::forward`].
pub struct TextEncoding {
    /// `[b, hidden, t]`
    pub hidden: Tensor,
    /// `[b, flow, t]`
    pub prior_means: Tensor,
    /// `[b, flow, t]`
    pub prior_log_variances: Tensor,
}

pub struct TextEncoder {
    embed_tokens: Embedding,
    layers: Vec<EncoderLayer>,
    project: layers::Conv1d,
    hidden_size: usize,
    flow_size: usize,
    layerdrop: f64,
}

impl TextEncoder {
    pub fn new(cfg: &VitsConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let enc = vb.pp("encoder").pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::new(cfg, enc.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let project = conv1d(
            cfg.hidden_size,
            cfg.flow_size * 2,
            1,
            ConvCfg::default(),
            vb.pp("project"),
        )?;
        Ok(Self {
            embed_tokens,
            layers,
            project,
            hidden_size: cfg.hidden_size,
            flow_size: cfg.flow_size,
            layerdrop: cfg.layerdrop,
        })
    }

    /// `input_ids: [b, t]` (i64), `mask: [b, 1, t]` (f32).
    pub fn forward(&self, input_ids: &Tensor, mask: &Tensor, mode: Mode) -> Result<TextEncoding> {
        let x = (self.embed_tokens.forward(input_ids)? * (self.hidden_size as f64).sqrt())?;
        let mask_btc = mask.transpose(1, 2)?;
        let mut x = x.broadcast_mul(&mask_btc)?;

        // [b, 1, t] → [b, 1, 1, t] additive bias on padded keys.
        let key_bias = ((mask.unsqueeze(1)? - 1.0)? * -MASKED)?;
        let mut rng = rand::thread_rng();
        for layer in &self.layers {
            if mode.is_train() && self.layerdrop > 0.0 && rng.gen::<f64>() < self.layerdrop {
                continue;
            }
            x = layer.forward(&x, &key_bias, mask, mode)?;
        }
        let hidden = x.broadcast_mul(&mask_btc)?.transpose(1, 2)?;

        let stats = self.project.forward(&hidden)?.broadcast_mul(mask)?;
        let (prior_means, prior_log_variances) = layers::split_channels(&stats, self.flow_size)?;
        Ok(TextEncoding { hidden, prior_means, prior_log_variances })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn seq(bh: usize, l: usize, w: usize) -> Tensor {
        let n = bh * l * w;
        Tensor::arange(0f32, n as f32, &Device::Cpu).unwrap().reshape((bh, l, w)).unwrap()
    }

    #[test]
    fn relative_to_absolute_picks_offsets() {
        // Entry [i, j] of the result is relative offset (j - i), stored at
        // column (l - 1) + (j - i) of the input row i.
        let l = 3;
        let x = seq(1, l, 2 * l - 1);
        let abs = relative_to_absolute(&x).unwrap().to_vec3::<f32>().unwrap();
        for i in 0..l {
            for j in 0..l {
                let col = l - 1 + j - i;
                assert_eq!(abs[0][i][j], (i * (2 * l - 1) + col) as f32);
            }
        }
    }

    #[test]
    fn absolute_to_relative_inverts_layout() {
        let l = 4;
        let x = seq(2, l, l);
        let rel = absolute_to_relative(&x).unwrap();
        assert_eq!(rel.dims(), &[2, l, 2 * l - 1]);
        let back = relative_to_absolute(&rel).unwrap();
        assert_eq!(back.to_vec3::<f32>().unwrap(), x.to_vec3::<f32>().unwrap());
    }

    #[test]
    fn relative_embeddings_pad_and_slice() {
        let rel = Tensor::ones((1, 5, 3), DType::F32, &Device::Cpu).unwrap();
        // Long sequence: padded with zeros to 2l-1 entries.
        let long = relative_embeddings(&rel, 2, 6).unwrap();
        assert_eq!(long.dims(), &[1, 11, 3]);
        // Short sequence: central slice.
        let short = relative_embeddings(&rel, 2, 2).unwrap();
        assert_eq!(short.dims(), &[1, 3, 3]);
    }

    #[test]
    fn encoder_output_shapes() {
        let dev = Device::Cpu;
        let cfg = VitsConfig::tiny(12);
        let vm = VarMap::new();
        let enc = TextEncoder::new(&cfg, VarBuilder::from_varmap(&vm, DType::F32, &dev)).unwrap();
        let ids = Tensor::new(&[[1i64, 2, 3, 4, 0], [5, 6, 0, 0, 0]], &dev).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 1., 1.], [1., 1., 1., 0., 0.]], &dev)
            .unwrap()
            .unsqueeze(1)
            .unwrap();
        let out = enc.forward(&ids, &mask, Mode::Eval).unwrap();
        assert_eq!(out.hidden.dims(), &[2, cfg.hidden_size, 5]);
        assert_eq!(out.prior_means.dims(), &[2, cfg.flow_size, 5]);
        assert_eq!(out.prior_log_variances.dims(), &[2, cfg.flow_size, 5]);
        let padded = out.prior_means.narrow(0, 1, 1).unwrap().narrow(2, 3, 2).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(padded.to_scalar::<f32>().unwrap(), 0.0);
    }
}
