//! # kinyatts
//!
//! Kinyarwanda text-to-speech built on the MMS VITS checkpoints.
//!
//! ## Quick start
//!
//! ```no_run
//! // Loads the fine-tuned model from `artifacts/final_model` when present,
//! // otherwise `facebook/mms-tts-kin` from the Hugging Face Hub.
//! let out = kinyatts::synthesize("Muraho, amakuru yawe?", None).unwrap();
//! std::fs::write("muraho.wav", &out.wav_bytes).unwrap();
//! println!("Latency: {:.0} ms", out.latency_ms);
//! ```
//!
//! ## Synthesis pipeline
//! 1. **Text cleaning**: HTML, URLs, e-mails and symbols removed, digits
//!    spelled out in Kinyarwanda, whitespace collapsed.
//! 2. **Chunking**: long texts split into ≤ 400-char sentence chunks.
//! 3. **Tokenisation**: characters mapped through the checkpoint's
//!    `vocab.json`, interleaved with the blank token.
//! 4. **Inference**: VITS on candle (safetensors / PyTorch weights) or on
//!    ONNX Runtime (`model.onnx`, feature `onnx`).
//! 5. **Post-processing**: resampling to the target rate, optional
//!    Butterworth filter, peak normalisation to 0.95, 16-bit PCM WAV.
//!
//! ## Other tools
//! * [`pipeline`] (feature `pipeline`) turns Parquet audio shards into
//!   16 kHz WAV files plus a `metadata.csv` index.
//! * [`train`] fine-tunes a checkpoint with waveform + mel L1 losses.
//! * [`ffi`] exposes the engine through a C ABI.

pub mod audio;
pub mod download;
pub mod engine;

// C FFI: kinyatts_synthesize_to_file / kinyatts_free_error.
pub mod ffi;

pub mod logging;
pub mod metadata;
pub mod model;
#[cfg(feature = "pipeline")]
pub mod pipeline;
pub mod preprocess;
pub mod tokenize;
pub mod train;
pub mod vits;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use engine::{synthesize, EngineSettings, Synthesis, TtsEngine};
pub use model::Synthesizer;
pub use tokenize::VitsTokenizer;
