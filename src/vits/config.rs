//! `config.json` of a Hugging Face VITS checkpoint.
//!
//! Every field carries the default of the MMS-TTS checkpoints, so a
//! `config.json` that only names a handful of keys still yields a usable
//! configuration.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Sample rate assumed when a config names none.
pub const DEFAULT_SAMPLING_RATE: u32 = 16_000;

macro_rules! default_fn {
    ($name:ident, $ty:ty, $value:expr) => {
        fn $name() -> $ty {
            $value
        }
    };
}

default_fn!(d_vocab_size, usize, 38);
default_fn!(d_hidden_size, usize, 192);
default_fn!(d_num_hidden_layers, usize, 6);
default_fn!(d_num_attention_heads, usize, 2);
default_fn!(d_window_size, Option<usize>, Some(4));
default_fn!(d_true, bool, true);
default_fn!(d_ffn_dim, usize, 768);
default_fn!(d_layerdrop, f64, 0.1);
default_fn!(d_ffn_kernel_size, usize, 3);
default_fn!(d_flow_size, usize, 192);
default_fn!(d_dropout, f64, 0.1);
default_fn!(d_layer_norm_eps, f64, 1e-5);
default_fn!(d_num_speakers, usize, 1);
default_fn!(d_upsample_initial_channel, usize, 512);
default_fn!(d_upsample_rates, Vec<usize>, vec![8, 8, 2, 2]);
default_fn!(d_upsample_kernel_sizes, Vec<usize>, vec![16, 16, 4, 4]);
default_fn!(d_resblock_kernel_sizes, Vec<usize>, vec![3, 7, 11]);
default_fn!(d_resblock_dilation_sizes, Vec<Vec<usize>>, vec![vec![1, 3, 5]; 3]);
default_fn!(d_leaky_relu_slope, f64, 0.1);
default_fn!(d_depth_separable_channels, usize, 2);
default_fn!(d_depth_separable_num_layers, usize, 3);
default_fn!(d_flow_bins, usize, 10);
default_fn!(d_tail_bound, f64, 5.0);
default_fn!(d_dp_kernel_size, usize, 3);
default_fn!(d_dp_dropout, f64, 0.5);
default_fn!(d_dp_num_flows, usize, 4);
default_fn!(d_dp_filter_channels, usize, 256);
default_fn!(d_prior_num_flows, usize, 4);
default_fn!(d_prior_wavenet_layers, usize, 4);
default_fn!(d_wavenet_kernel_size, usize, 5);
default_fn!(d_one_usize, usize, 1);
default_fn!(d_one_f64, f64, 1.0);
default_fn!(d_noise_scale, f64, 0.667);
default_fn!(d_noise_scale_duration, f64, 0.8);

/// Hyper-parameters of a VITS checkpoint (`VitsConfig` on the Hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitsConfig {
    #[serde(default = "d_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "d_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "d_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "d_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "d_window_size")]
    pub window_size: Option<usize>,
    #[serde(default = "d_true")]
    pub use_bias: bool,
    #[serde(default = "d_ffn_dim")]
    pub ffn_dim: usize,
    #[serde(default = "d_layerdrop")]
    pub layerdrop: f64,
    #[serde(default = "d_ffn_kernel_size")]
    pub ffn_kernel_size: usize,
    #[serde(default = "d_flow_size")]
    pub flow_size: usize,
    #[serde(default = "d_dropout")]
    pub hidden_dropout: f64,
    #[serde(default = "d_dropout")]
    pub attention_dropout: f64,
    #[serde(default = "d_dropout")]
    pub activation_dropout: f64,
    #[serde(default = "d_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "d_true")]
    pub use_stochastic_duration_prediction: bool,
    #[serde(default = "d_num_speakers")]
    pub num_speakers: usize,
    #[serde(default)]
    pub speaker_embedding_size: usize,
    #[serde(default = "d_upsample_initial_channel")]
    pub upsample_initial_channel: usize,
    #[serde(default = "d_upsample_rates")]
    pub upsample_rates: Vec<usize>,
    #[serde(default = "d_upsample_kernel_sizes")]
    pub upsample_kernel_sizes: Vec<usize>,
    #[serde(default = "d_resblock_kernel_sizes")]
    pub resblock_kernel_sizes: Vec<usize>,
    #[serde(default = "d_resblock_dilation_sizes")]
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    #[serde(default = "d_leaky_relu_slope")]
    pub leaky_relu_slope: f64,
    #[serde(default = "d_depth_separable_channels")]
    pub depth_separable_channels: usize,
    #[serde(default = "d_depth_separable_num_layers")]
    pub depth_separable_num_layers: usize,
    #[serde(default = "d_flow_bins")]
    pub duration_predictor_flow_bins: usize,
    #[serde(default = "d_tail_bound")]
    pub duration_predictor_tail_bound: f64,
    #[serde(default = "d_dp_kernel_size")]
    pub duration_predictor_kernel_size: usize,
    #[serde(default = "d_dp_dropout")]
    pub duration_predictor_dropout: f64,
    #[serde(default = "d_dp_num_flows")]
    pub duration_predictor_num_flows: usize,
    #[serde(default = "d_dp_filter_channels")]
    pub duration_predictor_filter_channels: usize,
    #[serde(default = "d_prior_num_flows")]
    pub prior_encoder_num_flows: usize,
    #[serde(default = "d_prior_wavenet_layers")]
    pub prior_encoder_num_wavenet_layers: usize,
    #[serde(default = "d_wavenet_kernel_size")]
    pub wavenet_kernel_size: usize,
    #[serde(default = "d_one_usize")]
    pub wavenet_dilation_rate: usize,
    #[serde(default)]
    pub wavenet_dropout: f64,
    #[serde(default = "d_one_f64")]
    pub speaking_rate: f64,
    #[serde(default = "d_noise_scale")]
    pub noise_scale: f64,
    #[serde(default = "d_noise_scale_duration")]
    pub noise_scale_duration: f64,
    #[serde(default, alias = "sample_rate")]
    pub sampling_rate: Option<u32>,

    /// Keys this crate does not interpret (`architectures`, `model_type`, …),
    /// kept so a re-saved `config.json` stays loadable by other tools.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for VitsConfig {
    fn default() -> Self {
        // Every field has a serde default, so an empty object is a full config.
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!("empty VITS config must parse"))
    }
}

impl VitsConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Cannot read config: {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("Cannot write {}", path.display()))
    }

    /// Output rate of the decoder.
    pub fn sample_rate(&self) -> u32 {
        self.sampling_rate.unwrap_or(DEFAULT_SAMPLING_RATE)
    }

    /// Waveform samples produced per spectrogram frame.
    pub fn hop_length(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    /// A tiny configuration for tests and smoke runs.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            window_size: Some(2),
            ffn_dim: 32,
            flow_size: 8,
            upsample_initial_channel: 16,
            upsample_rates: vec![4, 4],
            upsample_kernel_sizes: vec![8, 8],
            resblock_kernel_sizes: vec![3],
            resblock_dilation_sizes: vec![vec![1, 3]],
            duration_predictor_filter_channels: 16,
            prior_encoder_num_flows: 2,
            prior_encoder_num_wavenet_layers: 2,
            wavenet_kernel_size: 3,
            layerdrop: 0.0,
            ..Self::default()
        }
    }
}
