//! Model source resolution and HuggingFace Hub download.
//!
//! The engine prefers a fine-tuned checkpoint under the project root and
//! falls back to a pretrained model, named either by a local directory or by
//! a Hub repository id.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use tracing::{info, warn};

use crate::{model::CONFIG_FILE, vits::weights};

/// Pretrained Kinyarwanda checkpoint.
pub const DEFAULT_MODEL: &str = "facebook/mms-tts-kin";

/// Where fine-tuning writes its best model, relative to the project root.
pub const FINAL_MODEL_DIR: &str = "artifacts/final_model";

/// Tokenizer files fetched alongside the config.
const TOKENIZER_FILES: [&str; 2] = ["vocab.json", "tokenizer_config.json"];

/// Optional files fetched when the repository has them.
const OPTIONAL_FILES: [&str; 1] = ["special_tokens_map.json"];

/// Which model the engine should load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A fine-tuned checkpoint directory.
    FineTuned(PathBuf),
    /// A pretrained model: local directory path or Hub repo id.
    Pretrained(String),
}

impl ModelSource {
    pub fn describe(&self) -> String {
        match self {
            ModelSource::FineTuned(dir) => dir.display().to_string(),
            ModelSource::Pretrained(id) => id.clone(),
        }
    }
}

/// Whether `dir` holds a usable checkpoint: a config plus at least one
/// recognised weight file.
pub fn is_checkpoint_dir(dir: &Path) -> bool {
    dir.join(CONFIG_FILE).is_file() && weights::has_weights(dir)
}

/// Decide between the fine-tuned model under `project_root` and
/// `model_path`.
pub fn resolve_source(project_root: &Path, model_path: &str, use_pretrained: bool) -> ModelSource {
    let local = project_root.join(FINAL_MODEL_DIR);
    if !use_pretrained && is_checkpoint_dir(&local) {
        info!("[TTS] Loading fine-tuned model: {}", local.display());
        return ModelSource::FineTuned(local);
    }
    if !use_pretrained && local.is_dir() {
        warn!(
            "[TTS] No weights in {}, falling back to pretrained {model_path}",
            local.display()
        );
    }
    info!("[TTS] Loading pretrained model: {model_path}");
    ModelSource::Pretrained(model_path.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Download helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Download a single file from a HuggingFace repository.
fn hf_download(repo: &ApiRepo, repo_id: &str, filename: &str) -> Result<PathBuf> {
    repo.get(filename)
        .with_context(|| format!("Failed to download '{}' from '{}'", filename, repo_id))
}

/// Fetch a VITS checkpoint from the Hub and return its snapshot directory.
///
/// Files are cached in the HuggingFace Hub cache directory
/// (`~/.cache/huggingface/hub` by default).
pub fn fetch_from_hub(repo_id: &str) -> Result<PathBuf> {
    info!("Downloading {repo_id} from the HuggingFace Hub");
    let api = Api::new().context("Failed to initialise HuggingFace Hub client")?;
    let repo = api.model(repo_id.to_string());

    let config_path = hf_download(&repo, repo_id, CONFIG_FILE)?;
    for file in TOKENIZER_FILES {
        hf_download(&repo, repo_id, file)?;
    }
    for file in OPTIONAL_FILES {
        if repo.get(file).is_err() {
            warn!("{repo_id} has no {file}");
        }
    }

    // First weight format the repository publishes.
    let mut found = false;
    for file in weights::WEIGHT_FILES[..2].iter().chain(crate::model::ONNX_FILES.iter()) {
        if repo.get(file).is_ok() {
            found = true;
            break;
        }
    }
    if !found {
        bail!("'{repo_id}' publishes no loadable weights (safetensors, PyTorch or ONNX)");
    }

    config_path
        .parent()
        .map(Path::to_path_buf)
        .context("Downloaded config has no parent directory")
}

/// Local directory holding the files of `source`, downloading if needed.
pub fn materialize(source: &ModelSource) -> Result<PathBuf> {
    match source {
        ModelSource::FineTuned(dir) => Ok(dir.clone()),
        ModelSource::Pretrained(id) => {
            let path = Path::new(id);
            if path.is_dir() {
                Ok(path.to_path_buf())
            } else {
                fetch_from_hub(id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "{}").unwrap();
        std::fs::write(dir.join("model.safetensors"), b"").unwrap();
    }

    #[test]
    fn prefers_fine_tuned_model() {
        let root = tempfile::tempdir().unwrap();
        checkpoint(&root.path().join(FINAL_MODEL_DIR));
        let src = resolve_source(root.path(), DEFAULT_MODEL, false);
        assert_eq!(src, ModelSource::FineTuned(root.path().join(FINAL_MODEL_DIR)));
    }

    #[test]
    fn forced_pretrained_skips_local_model() {
        let root = tempfile::tempdir().unwrap();
        checkpoint(&root.path().join(FINAL_MODEL_DIR));
        let src = resolve_source(root.path(), DEFAULT_MODEL, true);
        assert_eq!(src, ModelSource::Pretrained(DEFAULT_MODEL.into()));
    }

    #[test]
    fn local_dir_without_weights_falls_back() {
        let root = tempfile::tempdir().unwrap();
        let local = root.path().join(FINAL_MODEL_DIR);
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join(CONFIG_FILE), "{}").unwrap();
        let src = resolve_source(root.path(), "some/repo", false);
        assert_eq!(src, ModelSource::Pretrained("some/repo".into()));
    }

    #[test]
    fn local_pretrained_path_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        let id = dir.path().to_string_lossy().into_owned();
        let path = materialize(&ModelSource::Pretrained(id)).unwrap();
        assert_eq!(path, dir.path());
    }
}
