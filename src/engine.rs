//! Inference engine: text in, normalised 16-bit WAV out, with latency.
//!
//! The process-wide engine is loaded lazily on the first
//! [`synthesize`] call and reused afterwards.

use std::{
    path::PathBuf,
    str::FromStr,
    time::Instant,
};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    audio::{postprocess::{self, PostFilter}, wav},
    download::{self, ModelSource, DEFAULT_MODEL},
    model::{load_backend, Synthesizer},
    preprocess::{self, TextPreprocessor},
    tokenize::VitsTokenizer,
    vits::SynthesisParams,
};

/// Noise scale used for inference (lower than the checkpoint default for a
/// steadier voice).
pub const DEFAULT_NOISE_SCALE: f64 = 0.333;
pub const DEFAULT_NOISE_SCALE_DURATION: f64 = 0.4;

/// WAV output rate.
pub const DEFAULT_TARGET_SAMPLE_RATE: u32 = 16_000;

/// Length of the silent fallback when the model yields no audio.
const SILENCE_SECS: usize = 2;

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Engine configuration, read from `TTS_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub project_root: PathBuf,
    pub model_path: String,
    pub use_pretrained: bool,
    pub noise_scale: f64,
    pub noise_scale_duration: f64,
    /// `None` keeps the checkpoint's own rate.
    pub speaking_rate: Option<f64>,
    pub post_filter: PostFilter,
    pub target_sample_rate: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            model_path: DEFAULT_MODEL.to_string(),
            use_pretrained: false,
            noise_scale: DEFAULT_NOISE_SCALE,
            noise_scale_duration: DEFAULT_NOISE_SCALE_DURATION,
            speaking_rate: None,
            post_filter: PostFilter::default(),
            target_sample_rate: DEFAULT_TARGET_SAMPLE_RATE,
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Parse `raw` or keep `default`, logging values that do not parse.
fn parse_or<T: FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(v) => match v.trim().parse() {
            Ok(x) => x,
            Err(_) => {
                warn!("Ignoring {key}={v:?}: not a valid value");
                default
            }
        },
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from any key → value lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let post_filter = match get("TTS_POST_FILTER") {
            None => d.post_filter,
            Some(v) => v.parse().unwrap_or_else(|e| {
                warn!("{e}; using the default high-pass filter");
                d.post_filter
            }),
        };
        Self {
            project_root: get("TTS_PROJECT_ROOT").map(PathBuf::from).unwrap_or(d.project_root),
            model_path: get("TTS_MODEL_PATH")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(d.model_path),
            use_pretrained: get("TTS_USE_PRETRAINED").is_some_and(|v| is_truthy(&v)),
            noise_scale: parse_or("TTS_NOISE_SCALE", get("TTS_NOISE_SCALE"), d.noise_scale),
            noise_scale_duration: parse_or(
                "TTS_NOISE_SCALE_DURATION",
                get("TTS_NOISE_SCALE_DURATION"),
                d.noise_scale_duration,
            ),
            speaking_rate: get("TTS_SPEAKING_RATE")
                .map(|v| parse_or("TTS_SPEAKING_RATE", Some(v), f64::NAN))
                .filter(|r| r.is_finite() && *r > 0.0),
            post_filter,
            target_sample_rate: parse_or(
                "TTS_TARGET_SAMPLE_RATE",
                get("TTS_TARGET_SAMPLE_RATE"),
                d.target_sample_rate,
            ),
        }
    }

    fn params(&self) -> SynthesisParams {
        SynthesisParams {
            noise_scale: Some(self.noise_scale),
            noise_scale_duration: Some(self.noise_scale_duration),
            speaking_rate: self.speaking_rate,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one synthesis call.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Complete 16-bit PCM mono WAV file.
    pub wav_bytes: Vec<u8>,
    /// Time spent inside the model, in milliseconds.
    pub latency_ms: f64,
    /// Rate written in the WAV header.
    pub sample_rate: u32,
    pub num_samples: usize,
}

pub struct TtsEngine {
    backend: Box<dyn Synthesizer>,
    tokenizer: VitsTokenizer,
    preprocessor: TextPreprocessor,
    settings: EngineSettings,
    source: Option<ModelSource>,
}

impl TtsEngine {
    /// Resolve the model source, fetch it if needed and build the backend.
    pub fn load(settings: EngineSettings) -> Result<Self> {
        let source = download::resolve_source(
            &settings.project_root,
            &settings.model_path,
            settings.use_pretrained,
        );
        let dir = download::materialize(&source)?;
        let tokenizer = VitsTokenizer::from_dir(&dir)?;
        let backend = load_backend(&dir)
            .with_context(|| format!("Failed to load model from {}", dir.display()))?;
        let mut engine = Self::with_backend(backend, tokenizer, settings);
        engine.source = Some(source);
        Ok(engine)
    }

    /// Wrap an already constructed backend.
    pub fn with_backend(
        backend: Box<dyn Synthesizer>,
        tokenizer: VitsTokenizer,
        settings: EngineSettings,
    ) -> Self {
        info!(
            "[TTS] noise_scale={}, noise_scale_duration={}",
            settings.noise_scale, settings.noise_scale_duration
        );
        info!("[TTS] Ready: device={}, sr={}", backend.device(), backend.sample_rate());
        Self { backend, tokenizer, preprocessor: TextPreprocessor::new(), settings, source: None }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn source(&self) -> Option<&ModelSource> {
        self.source.as_ref()
    }

    /// Rate of the raw model output.
    pub fn model_sample_rate(&self) -> u32 {
        self.backend.sample_rate()
    }

    /// Synthesize `text`. `speaker_id` is parsed as an integer; anything
    /// unparseable is treated as no speaker.
    pub fn synthesize(&self, text: &str, speaker_id: Option<&str>) -> Result<Synthesis> {
        let speaker = speaker_id.and_then(|s| s.trim().parse::<i64>().ok());
        let params = self.settings.params();
        let model_rate = self.backend.sample_rate();

        let mut audio = Vec::new();
        let mut latency_ms = 0.0;
        for chunk in preprocess::prepare(&self.preprocessor, text) {
            let ids = self.tokenizer.encode(&chunk);
            let started = Instant::now();
            let wave = self.backend.synthesize_ids(&ids, speaker, &params)?;
            latency_ms += started.elapsed().as_secs_f64() * 1000.0;
            debug!(chars = chunk.chars().count(), samples = wave.len(), "chunk synthesized");
            audio.extend(wave);
        }

        if audio.is_empty() {
            warn!("Model returned no audio; writing {SILENCE_SECS} s of silence");
            audio = vec![0.0; SILENCE_SECS * model_rate as usize];
        }

        let target = self.settings.target_sample_rate;
        let cleaned = postprocess::process(&audio, model_rate, target, self.settings.post_filter)?;
        let wav_bytes = wav::encode_pcm16(&cleaned, target)?;
        Ok(Synthesis { wav_bytes, latency_ms, sample_rate: target, num_samples: cleaned.len() })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-wide handle
// ─────────────────────────────────────────────────────────────────────────────

static ENGINE: OnceCell<TtsEngine> = OnceCell::new();

/// The shared engine, loaded from the environment on first use.
pub fn global() -> Result<&'static TtsEngine> {
    ENGINE.get_or_try_init(|| TtsEngine::load(EngineSettings::from_env()))
}

/// Synthesize with the shared engine.
pub fn synthesize(text: &str, speaker_id: Option<&str>) -> Result<Synthesis> {
    global()?.synthesize(text, speaker_id)
}
