//! Checkpoint weight files.
//!
//! A checkpoint directory may hold any of the four weight formats the Hub
//! publishes for `VitsModel`. Only safetensors and PyTorch pickles can be
//! read here; the TensorFlow and Flax files are recognised so the caller can
//! tell "no weights" from "weights in an unsupported format".

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

/// File name of the weights written by fine-tuning.
pub const SAFETENSORS_FILE: &str = "model.safetensors";

/// Weight files recognised in a checkpoint directory, in load preference.
pub const WEIGHT_FILES: [&str; 4] = [
    SAFETENSORS_FILE,
    "pytorch_model.bin",
    "tf_model.h5",
    "flax_model.msgpack",
];

/// First recognised weight file present in `dir`.
pub fn find_weights(dir: &Path) -> Option<PathBuf> {
    WEIGHT_FILES.iter().map(|f| dir.join(f)).find(|p| p.is_file())
}

pub fn has_weights(dir: &Path) -> bool {
    find_weights(dir).is_some()
}

/// Whether `dir` holds weights this crate can load.
pub fn has_loadable_weights(dir: &Path) -> bool {
    WEIGHT_FILES[..2].iter().any(|f| dir.join(f).is_file())
}

/// Read every tensor of the checkpoint in `dir` as f32.
pub fn load_tensors(dir: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = find_weights(dir)
        .with_context(|| format!("No weight file ({}) in {}", WEIGHT_FILES.join(", "), dir.display()))?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let raw: HashMap<String, Tensor> = match name {
        "model.safetensors" => candle_core::safetensors::load(&path, device)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        "pytorch_model.bin" => candle_core::pickle::read_all(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .into_iter()
            .collect(),
        other => bail!(
            "{} holds weights in an unsupported format ({other}); \
             convert them to model.safetensors",
            dir.display()
        ),
    };

    let mut tensors = HashMap::with_capacity(raw.len());
    for (name, t) in raw {
        let t = t.to_device(device)?.to_dtype(DType::F32)?;
        tensors.insert(name, t);
    }
    debug!("Read {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Read-only builder over the checkpoint in `dir`, for inference.
pub fn var_builder(dir: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let tensors = load_tensors(dir, device)?;
    Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
}

/// Load the checkpoint in `dir` into `varmap` as trainable variables.
///
/// Must run before the model is built from the same `varmap`, so the model
/// picks up these values instead of fresh initialisations. Tensors the
/// network does not use (posterior encoder, discriminator) stay in the map
/// and are written back by [`save`].
pub fn load_varmap(dir: &Path, varmap: &VarMap, device: &Device) -> Result<usize> {
    let tensors = load_tensors(dir, device)?;
    let count = tensors.len();
    let mut data = varmap.data().lock().expect("VarMap mutex poisoned");
    for (name, t) in tensors {
        data.insert(name, Var::from_tensor(&t)?);
    }
    info!("Loaded {count} tensors from {}", dir.display());
    Ok(count)
}

/// Write every variable of `varmap` to `dir/model.safetensors`.
pub fn save(varmap: &VarMap, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create {}", dir.display()))?;
    let path = dir.join(SAFETENSORS_FILE);
    varmap
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_format() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_weights(dir.path()));
        std::fs::write(dir.path().join("tf_model.h5"), b"x").unwrap();
        assert!(has_weights(dir.path()));
        assert!(!has_loadable_weights(dir.path()));
        let err = load_tensors(dir.path(), &Device::Cpu).unwrap_err().to_string();
        assert!(err.contains("unsupported"), "{err}");
    }

    #[test]
    fn varmap_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::Cpu;
        let vm = VarMap::new();
        let vb = VarBuilder::from_varmap(&vm, DType::F32, &dev);
        let w = vb
            .pp("decoder")
            .get_with_hints((2, 3), "weight", candle_nn::Init::Const(0.25))
            .unwrap();
        save(&vm, dir.path()).unwrap();
        assert!(has_loadable_weights(dir.path()));

        let reloaded = VarMap::new();
        assert_eq!(load_varmap(dir.path(), &reloaded, &dev).unwrap(), 1);
        let vb = VarBuilder::from_varmap(&reloaded, DType::F32, &dev);
        let back = vb
            .pp("decoder")
            .get_with_hints((2, 3), "weight", candle_nn::Init::Const(0.0))
            .unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
    }
}
