//! Model backends behind the inference engine.
//!
//! A backend turns one tokenised utterance into a mono waveform at its own
//! sample rate. Two implementations exist:
//!
//! | Backend        | Files                                      | Sampling overrides |
//! |----------------|--------------------------------------------|--------------------|
//! | [`CandleVits`] | `config.json` + `model.safetensors` / `.bin` | honoured           |
//! | [`OnnxVits`]   | `config.json` + `model.onnx`               | baked into graph   |
//!
//! The exported ONNX graph takes two positional inputs:
//!
//! | Name             | Shape          | dtype |
//! |------------------|----------------|-------|
//! | `input_ids`      | `[1, seq_len]` | int64 |
//! | `attention_mask` | `[1, seq_len]` | int64 |
//!
//! and returns the waveform as output 0 (`[1, T]` or `[1, 1, T]`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use tracing::debug;

use crate::vits::{weights, Mode, SynthesisParams, VitsConfig, VitsModel};

/// Name of the model configuration inside a checkpoint directory.
pub const CONFIG_FILE: &str = "config.json";

/// Text-to-waveform backend.
pub trait Synthesizer: Send + Sync {
    /// Rate of the samples returned by [`Synthesizer::synthesize_ids`].
    fn sample_rate(&self) -> u32;

    /// Short description of where the computation runs.
    fn device(&self) -> String;

    /// Run the model on one token sequence. An empty result means the model
    /// produced no audio.
    fn synthesize_ids(
        &self,
        ids: &[i64],
        speaker_id: Option<i64>,
        params: &SynthesisParams,
    ) -> Result<Vec<f32>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Candle backend
// ─────────────────────────────────────────────────────────────────────────────

/// The VITS network evaluated with candle on CPU.
pub struct CandleVits {
    model: VitsModel,
    device: Device,
}

impl CandleVits {
    /// Load `config.json` and the weights in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let device = Device::Cpu;
        let config = VitsConfig::from_file(&dir.join(CONFIG_FILE))?;
        let vb = weights::var_builder(dir, &device)?;
        let model = VitsModel::new(&config, vb)
            .with_context(|| format!("Checkpoint in {} does not match its config", dir.display()))?;
        Ok(Self { model, device })
    }

    pub fn from_model(model: VitsModel) -> Self {
        Self { model, device: Device::Cpu }
    }

    pub fn config(&self) -> &VitsConfig {
        self.model.config()
    }
}

impl Synthesizer for CandleVits {
    fn sample_rate(&self) -> u32 {
        self.model.config().sample_rate()
    }

    fn device(&self) -> String {
        "cpu".to_string()
    }

    fn synthesize_ids(
        &self,
        ids: &[i64],
        speaker_id: Option<i64>,
        params: &SynthesisParams,
    ) -> Result<Vec<f32>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let n = ids.len();
        let input_ids = Tensor::from_vec(ids.to_vec(), (1, n), &self.device)?;
        let attention_mask = Tensor::from_vec(vec![1i64; n], (1, n), &self.device)?;
        let speaker = speaker_id
            .map(|s| Tensor::from_vec(vec![s], 1, &self.device))
            .transpose()?;

        let out = self
            .model
            .forward(&input_ids, &attention_mask, speaker.as_ref(), params, Mode::Eval)
            .context("VITS forward pass failed")?;
        let len = out.sequence_lengths.first().copied().unwrap_or(0);
        let wave = out.waveform.narrow(1, 0, len)?.flatten_all()?.to_vec1::<f32>()?;
        debug!(tokens = n, samples = wave.len(), "candle forward");
        Ok(wave)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ONNX backend
// ─────────────────────────────────────────────────────────────────────────────

/// ONNX graph locations probed inside a checkpoint directory.
pub const ONNX_FILES: [&str; 2] = ["model.onnx", "onnx/model.onnx"];

/// First exported graph present in `dir`.
pub fn find_onnx(dir: &Path) -> Option<PathBuf> {
    ONNX_FILES.iter().map(|f| dir.join(f)).find(|p| p.is_file())
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxVits;

#[cfg(feature = "onnx")]
mod onnx {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use anyhow::{Context, Result};
    use ort::{session::Session, value::Tensor};
    use tracing::warn;

    use super::{Synthesizer, CONFIG_FILE};
    use crate::vits::{SynthesisParams, VitsConfig};

    /// An exported VITS graph run through ONNX Runtime.
    pub struct OnnxVits {
        session: Mutex<Session>,
        sample_rate: u32,
        warned_overrides: AtomicBool,
    }

    impl OnnxVits {
        /// Load `model_path`; the sample rate comes from `config.json` next
        /// to it (or one level up for `onnx/model.onnx`).
        pub fn load(dir: &Path, model_path: &Path) -> Result<Self> {
            let config_path = dir.join(CONFIG_FILE);
            let sample_rate = if config_path.is_file() {
                VitsConfig::from_file(&config_path)?.sample_rate()
            } else {
                VitsConfig::default().sample_rate()
            };

            let session = Session::builder()
                .context("Failed to create ORT session builder")?
                .commit_from_file(model_path)
                .with_context(|| format!("Cannot load ONNX model: {}", model_path.display()))?;

            Ok(Self {
                session: Mutex::new(session),
                sample_rate,
                warned_overrides: AtomicBool::new(false),
            })
        }
    }

    impl Synthesizer for OnnxVits {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn device(&self) -> String {
            "cpu (onnxruntime)".to_string()
        }

        fn synthesize_ids(
            &self,
            ids: &[i64],
            speaker_id: Option<i64>,
            params: &SynthesisParams,
        ) -> Result<Vec<f32>> {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let overridden = *params != SynthesisParams::default() || speaker_id.is_some();
            if overridden && !self.warned_overrides.swap(true, Ordering::Relaxed) {
                warn!("ONNX graph has fixed sampling parameters; noise, rate and speaker overrides are ignored");
            }

            let n = ids.len();
            let t_ids = Tensor::<i64>::from_array(([1usize, n], ids.to_vec()))
                .context("Failed to build input_ids tensor")?;
            let t_mask = Tensor::<i64>::from_array(([1usize, n], vec![1i64; n]))
                .context("Failed to build attention_mask tensor")?;

            let mut session = self.session.lock().expect("ORT session mutex poisoned");
            let outputs = session
                .run(ort::inputs![t_ids, t_mask])
                .context("ONNX inference failed")?;
            let (_shape, audio) = outputs[0]
                .try_extract_tensor::<f32>()
                .context("Failed to extract audio tensor")?;
            Ok(audio.to_vec())
        }
    }
}

/// Build the backend for a checkpoint directory: candle when loadable
/// weights exist, otherwise an exported ONNX graph.
pub fn load_backend(dir: &Path) -> Result<Box<dyn Synthesizer>> {
    if weights::has_loadable_weights(dir) {
        return Ok(Box::new(CandleVits::load(dir)?));
    }
    if let Some(graph) = find_onnx(dir) {
        #[cfg(feature = "onnx")]
        {
            return Ok(Box::new(OnnxVits::load(dir, &graph)?));
        }
        #[cfg(not(feature = "onnx"))]
        anyhow::bail!(
            "{} only holds an ONNX graph; rebuild with the `onnx` feature",
            graph.display()
        );
    }
    // Surfaces the "unsupported format" / "no weights" error.
    Ok(Box::new(CandleVits::load(dir)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_backend() -> CandleVits {
        let cfg = VitsConfig::tiny(12);
        let vm = VarMap::new();
        let model =
            VitsModel::new(&cfg, VarBuilder::from_varmap(&vm, DType::F32, &Device::Cpu)).unwrap();
        CandleVits::from_model(model)
    }

    #[test]
    fn candle_backend_returns_hop_multiple() {
        let backend = tiny_backend();
        let wave = backend
            .synthesize_ids(&[0, 4, 0, 5, 0], None, &SynthesisParams::default())
            .unwrap();
        assert!(!wave.is_empty());
        assert_eq!(wave.len() % backend.config().hop_length(), 0);
        assert_eq!(backend.sample_rate(), 16_000);
    }

    #[test]
    fn empty_ids_give_no_audio() {
        let backend = tiny_backend();
        let wave = backend.synthesize_ids(&[], None, &SynthesisParams::default()).unwrap();
        assert!(wave.is_empty());
    }

    #[test]
    fn saved_checkpoint_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = VitsConfig::tiny(12);
        let vm = VarMap::new();
        VitsModel::new(&cfg, VarBuilder::from_varmap(&vm, DType::F32, &Device::Cpu)).unwrap();
        weights::save(&vm, dir.path()).unwrap();
        cfg.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let backend = load_backend(dir.path()).unwrap();
        let wave = backend.synthesize_ids(&[0, 1, 0], None, &SynthesisParams::default()).unwrap();
        assert!(!wave.is_empty());
    }

    #[test]
    fn onnx_lookup_checks_subdir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_onnx(dir.path()).is_none());
        std::fs::create_dir(dir.path().join("onnx")).unwrap();
        std::fs::write(dir.path().join("onnx/model.onnx"), b"").unwrap();
        assert_eq!(find_onnx(dir.path()).unwrap(), dir.path().join("onnx/model.onnx"));
    }
}
