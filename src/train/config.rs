//! Fine-tuning configuration (YAML).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::DEFAULT_MODEL;

/// Hyper-parameters and paths of a fine-tuning run. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub project_root: PathBuf,
    pub metadata_csv: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub final_model_dir: PathBuf,
    pub base_model: String,
    pub resume_from: Option<PathBuf>,
    pub epochs: usize,
    pub batch_size: usize,
    pub sample_rate: u32,
    pub learning_rate: f64,
    pub resume_lr: f64,
    pub max_train_samples: Option<usize>,
    pub max_audio_sec: f64,
    pub seed: u64,
    pub checkpoint_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            metadata_csv: PathBuf::from("data/processed/metadata.csv"),
            checkpoint_dir: PathBuf::from("artifacts/checkpoints"),
            final_model_dir: PathBuf::from("artifacts/final_model"),
            base_model: DEFAULT_MODEL.to_string(),
            resume_from: None,
            epochs: 50,
            batch_size: 4,
            sample_rate: 16_000,
            learning_rate: 5e-6,
            resume_lr: 2e-6,
            max_train_samples: None,
            max_audio_sec: 12.0,
            seed: 42,
            checkpoint_every: 5,
        }
    }
}

/// A parsed config file together with its resolved paths.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TrainConfig,
    /// The YAML as written by the user, saved next to exported models.
    pub raw: serde_yaml::Value,
    pub root: PathBuf,
}

impl LoadedConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config: {}", path.display()))?;
        Self::from_yaml(&text, path)
    }

    pub fn from_yaml(text: &str, path: &Path) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        // An empty file parses to null; treat it as "all defaults".
        let config: TrainConfig = if raw.is_null() {
            TrainConfig::default()
        } else {
            serde_yaml::from_value(raw.clone())
                .with_context(|| format!("Invalid training config {}", path.display()))?
        };
        let root = resolve_root(&config.project_root, path);
        Ok(Self { config, raw, root })
    }

    fn under_root(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn metadata_csv(&self) -> PathBuf {
        self.under_root(&self.config.metadata_csv)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.under_root(&self.config.checkpoint_dir)
    }

    pub fn final_model_dir(&self) -> PathBuf {
        self.under_root(&self.config.final_model_dir)
    }

    pub fn resume_from(&self) -> Option<PathBuf> {
        self.config.resume_from.as_deref().map(|p| self.under_root(p))
    }

    /// The configuration as YAML, for `config.yaml` in exported models.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.raw)?)
    }
}

fn absolute(p: &Path) -> PathBuf {
    if p.is_absolute() {
        return p.to_path_buf();
    }
    std::env::current_dir().map(|cwd| cwd.join(p)).unwrap_or_else(|_| p.to_path_buf())
}

/// `project_root` made absolute; when it has no `config/` directory the
/// root is the parent of the directory holding the config file.
pub fn resolve_root(project_root: &Path, config_path: &Path) -> PathBuf {
    let root = absolute(project_root);
    let root = root.canonicalize().unwrap_or(root);
    if root.join("config").is_dir() {
        return root;
    }
    let config_path = absolute(config_path);
    let config_path = config_path.canonicalize().unwrap_or(config_path);
    config_path
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or(root)
}
