//! Character-level VITS tokeniser, the one shipped with MMS-TTS checkpoints.
//!
//! The vocabulary (`vocab.json`) maps single characters to ids. Text is
//! optionally normalised (lower-cased except where a vocabulary entry matches
//! verbatim), filtered to known characters, split into characters and, when
//! `add_blank` is set, interleaved with the blank id 0:
//!
//! ```text
//! "abc" → [0, a, 0, b, 0, c, 0]
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Id used between characters when `add_blank` is on.
pub const BLANK_ID: i64 = 0;

/// Token sequences are cut to this length when training.
pub const MAX_TOKENS: usize = 300;

fn default_true() -> bool {
    true
}

fn default_pad() -> String {
    "<pad>".to_string()
}

fn default_unk() -> String {
    "<unk>".to_string()
}

/// Deserialised `tokenizer_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default = "default_true")]
    pub add_blank: bool,

    #[serde(default = "default_true")]
    pub normalize: bool,

    #[serde(default = "default_pad")]
    pub pad_token: String,

    #[serde(default = "default_unk")]
    pub unk_token: String,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub is_uroman: bool,

    #[serde(default)]
    pub phonemize: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            add_blank: true,
            normalize: true,
            pad_token: default_pad(),
            unk_token: default_unk(),
            language: Some("kin".to_string()),
            is_uroman: false,
            phonemize: false,
        }
    }
}

/// Token ids plus the matching attention mask for a padded batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    /// Row-major `[batch, max_len]`.
    pub input_ids: Vec<i64>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<i64>,
    pub batch: usize,
    pub max_len: usize,
}

#[derive(Debug, Clone)]
pub struct VitsTokenizer {
    vocab: HashMap<String, i64>,
    /// Vocabulary entries sorted longest first, for normalisation.
    by_length: Vec<String>,
    config: TokenizerConfig,
}

impl VitsTokenizer {
    /// Build a tokenizer from an in-memory vocabulary.
    pub fn new(vocab: HashMap<String, i64>, config: TokenizerConfig) -> Result<Self> {
        if config.is_uroman {
            bail!(
                "tokenizer requires uroman romanisation (is_uroman = true), which is not supported"
            );
        }
        if config.phonemize {
            bail!("tokenizer requires a phonemizer front-end, which is not supported");
        }
        let mut by_length: Vec<String> = vocab.keys().cloned().collect();
        by_length.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
        Ok(Self { vocab, by_length, config })
    }

    /// Load `vocab.json` and (optionally) `tokenizer_config.json` from `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let vocab_path = dir.join("vocab.json");
        let bytes = fs::read(&vocab_path)
            .with_context(|| format!("Cannot read vocabulary: {}", vocab_path.display()))?;
        let vocab: HashMap<String, i64> = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", vocab_path.display()))?;

        let cfg_path = dir.join("tokenizer_config.json");
        let config = if cfg_path.exists() {
            let bytes = fs::read(&cfg_path)
                .with_context(|| format!("Cannot read {}", cfg_path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", cfg_path.display()))?
        } else {
            TokenizerConfig::default()
        };
        Self::new(vocab, config)
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn pad_id(&self) -> i64 {
        self.vocab.get(&self.config.pad_token).copied().unwrap_or(BLANK_ID)
    }

    fn unk_id(&self) -> i64 {
        self.vocab.get(&self.config.unk_token).copied().unwrap_or(BLANK_ID)
    }

    /// Lower-case everything except spans that match a vocabulary entry.
    pub fn normalize(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        'scan: while let Some(c) = rest.chars().next() {
            for entry in &self.by_length {
                if !entry.is_empty() && rest.starts_with(entry.as_str()) {
                    out.push_str(entry);
                    rest = &rest[entry.len()..];
                    continue 'scan;
                }
            }
            out.extend(c.to_lowercase());
            rest = &rest[c.len_utf8()..];
        }
        out
    }

    /// Encode one utterance to token ids.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let prepared = if self.config.normalize {
            let normalized = self.normalize(text);
            normalized
                .chars()
                .filter(|c| self.vocab.contains_key(c.to_string().as_str()))
                .collect::<String>()
                .trim()
                .to_string()
        } else {
            text.to_string()
        };

        let unk = self.unk_id();
        let tokens = prepared
            .chars()
            .map(|c| self.vocab.get(c.to_string().as_str()).copied().unwrap_or(unk));

        if self.config.add_blank {
            let mut ids = vec![BLANK_ID];
            for t in tokens {
                ids.push(t);
                ids.push(BLANK_ID);
            }
            ids
        } else {
            tokens.collect()
        }
    }

    /// Encode, truncate to `max_len` and right-pad to the longest sequence.
    pub fn encode_batch(&self, texts: &[&str], max_len: usize) -> EncodedBatch {
        let mut seqs: Vec<Vec<i64>> = texts.iter().map(|t| self.encode(t)).collect();
        for s in seqs.iter_mut() {
            s.truncate(max_len);
        }
        let longest = seqs.iter().map(Vec::len).max().unwrap_or(0);
        let pad = self.pad_id();

        let mut input_ids = Vec::with_capacity(seqs.len() * longest);
        let mut attention_mask = Vec::with_capacity(seqs.len() * longest);
        for s in &seqs {
            input_ids.extend_from_slice(s);
            input_ids.extend(std::iter::repeat(pad).take(longest - s.len()));
            attention_mask.extend(std::iter::repeat(1).take(s.len()));
            attention_mask.extend(std::iter::repeat(0).take(longest - s.len()));
        }
        EncodedBatch { input_ids, attention_mask, batch: seqs.len(), max_len: longest }
    }

    /// Write `vocab.json`, `tokenizer_config.json` and
    /// `special_tokens_map.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;

        let ordered: BTreeMap<i64, &str> =
            self.vocab.iter().map(|(k, &v)| (v, k.as_str())).collect();
        let mut vocab = serde_json::Map::new();
        for (id, tok) in ordered {
            vocab.insert(tok.to_string(), serde_json::Value::from(id));
        }
        write_json(&dir.join("vocab.json"), &serde_json::Value::Object(vocab))?;

        let mut cfg = serde_json::to_value(&self.config)?;
        if let Some(obj) = cfg.as_object_mut() {
            obj.insert("tokenizer_class".into(), "VitsTokenizer".into());
        }
        write_json(&dir.join("tokenizer_config.json"), &cfg)?;

        let special = serde_json::json!({
            "pad_token": self.config.pad_token,
            "unk_token": self.config.unk_token,
        });
        write_json(&dir.join("special_tokens_map.json"), &special)
    }
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("Cannot write {}", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
