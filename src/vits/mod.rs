//! VITS text-to-speech network on candle.
//!
//! The module tree follows the Hugging Face `VitsModel` layout so checkpoint
//! tensor names map one-to-one onto `VarBuilder` paths:
//!
//! | prefix               | module                                         |
//! |----------------------|------------------------------------------------|
//! | `text_encoder`       | [`text_encoder::TextEncoder`]                  |
//! | `duration_predictor` | [`duration::DurationPredictor`]                |
//! | `flow`               | [`flow::ResidualCouplingBlock`]                |
//! | `decoder`            | [`decoder::HifiGan`]                           |
//! | `embed_speaker`      | speaker embedding (multi-speaker checkpoints)  |
//!
//! Only the inference path (text → waveform) is modelled; the posterior
//! encoder stored in checkpoints is carried through fine-tuning untouched.

pub mod config;
pub mod decoder;
pub mod duration;
pub mod flow;
pub mod layers;
pub mod model;
pub mod text_encoder;
pub mod weights;

pub use config::VitsConfig;
pub use model::{VitsModel, VitsOutput};

/// Whether dropout and layer-drop are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

/// Per-call sampling parameters. `None` falls back to the value in
/// [`VitsConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SynthesisParams {
    pub noise_scale: Option<f64>,
    pub noise_scale_duration: Option<f64>,
    pub speaking_rate: Option<f64>,
}

impl SynthesisParams {
    pub(crate) fn resolve(&self, cfg: &VitsConfig) -> (f64, f64, f64) {
        (
            self.noise_scale.unwrap_or(cfg.noise_scale),
            self.noise_scale_duration.unwrap_or(cfg.noise_scale_duration),
            self.speaking_rate.unwrap_or(cfg.speaking_rate),
        )
    }
}
