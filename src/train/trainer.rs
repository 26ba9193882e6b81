//! The fine-tuning loop.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use super::{
    config::LoadedConfig,
    dataset::{self, Batch, TtsDataset, MIN_SAMPLES},
    mel::MelSpectrogram,
    schedule::{clip_grad_norm, CosineAnnealing},
};
use crate::{
    download::{self, ModelSource},
    model::CONFIG_FILE,
    tokenize::VitsTokenizer,
    vits::{weights, Mode, SynthesisParams, VitsConfig, VitsModel},
};

const WEIGHT_DECAY: f64 = 0.01;
const MAX_GRAD_NORM: f64 = 1.0;
const MEL_WEIGHT: f64 = 2.0;

/// Losses of one optimisation step.
#[derive(Debug, Clone, Copy)]
pub struct StepLosses {
    pub total: f32,
    pub wav: f32,
    pub mel: f32,
}

/// Outcome of a full run.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub epochs: usize,
    pub steps: usize,
    pub best_loss: Option<f64>,
    pub final_model_dir: PathBuf,
}

/// Directory to resume from: it must exist, hold `config.json` and a
/// weight file.
pub fn resume_dir(resume: Option<&Path>) -> Option<PathBuf> {
    let path = resume?;
    if path.is_dir() && path.join(CONFIG_FILE).is_file() && weights::has_weights(path) {
        return Some(path.to_path_buf());
    }
    if path.is_dir() && !weights::has_weights(path) {
        warn!(
            "resume_from path has no weights ({}). Starting from base model instead.",
            path.display()
        );
    }
    None
}

pub struct Trainer {
    model: VitsModel,
    config: VitsConfig,
    tokenizer: VitsTokenizer,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    schedule: CosineAnnealing,
    mel: MelSpectrogram,
    device: Device,
    step: usize,
}

impl Trainer {
    /// Load the checkpoint in `model_dir` as trainable variables. The mel
    /// loss is computed at `sample_rate`, the rate the training audio is
    /// loaded at.
    pub fn from_checkpoint(
        model_dir: &Path,
        sample_rate: u32,
        lr: f64,
        total_steps: usize,
    ) -> Result<Self> {
        let device = Device::Cpu;
        let config = VitsConfig::from_file(&model_dir.join(CONFIG_FILE))?;
        let tokenizer = VitsTokenizer::from_dir(model_dir)?;
        let varmap = VarMap::new();
        weights::load_varmap(model_dir, &varmap, &device)?;
        Self::new(config, tokenizer, varmap, sample_rate, lr, total_steps)
    }

    /// Build the network over `varmap`; variables it already holds are used
    /// as initial weights.
    pub fn new(
        config: VitsConfig,
        tokenizer: VitsTokenizer,
        varmap: VarMap,
        sample_rate: u32,
        lr: f64,
        total_steps: usize,
    ) -> Result<Self> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = VitsModel::new(&config, vb).context("Checkpoint does not match its config")?;
        let vars = varmap.all_vars();
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW { lr, weight_decay: WEIGHT_DECAY, ..Default::default() },
        )?;
        let mel = MelSpectrogram::new(sample_rate, &device)?;
        Ok(Self {
            model,
            config,
            tokenizer,
            varmap,
            vars,
            optimizer,
            schedule: CosineAnnealing::new(lr, total_steps),
            mel,
            device,
            step: 0,
        })
    }

    pub fn tokenizer(&self) -> &VitsTokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// One forward/backward/update. `Ok(None)` when the generated audio is
    /// too short to score.
    pub fn train_step(&mut self, batch: &Batch) -> Result<Option<StepLosses>> {
        let speakers = (self.config.num_speakers > 1).then_some(&batch.speaker_ids);
        let out = self.model.forward(
            &batch.input_ids,
            &batch.attention_mask,
            speakers,
            &SynthesisParams::default(),
            Mode::Train,
        )?;
        let generated = out.waveform.unsqueeze(1)?;
        let min_len = generated.dim(2)?.min(batch.target.dim(2)?);
        if min_len < MIN_SAMPLES {
            debug!(min_len, "generated audio too short, batch skipped");
            return Ok(None);
        }
        let g = generated.narrow(2, 0, min_len)?;
        let t = batch.target.narrow(2, 0, min_len)?;

        let loss_wav = (&g - &t)?.abs()?.mean_all()?;
        let loss_mel = self.mel.loss(&g, &t)?;
        let loss = (&loss_wav + (&loss_mel * MEL_WEIGHT)?)?;

        let mut grads = loss.backward()?;
        clip_grad_norm(&mut grads, &self.vars, MAX_GRAD_NORM)?;
        self.optimizer.step(&grads)?;
        self.step += 1;
        self.optimizer.set_learning_rate(self.schedule.lr_at(self.step));

        Ok(Some(StepLosses {
            total: scalar(&loss)?,
            wav: scalar(&loss_wav)?,
            mel: scalar(&loss_mel)?,
        }))
    }

    /// Write weights, `config.json` and the tokenizer files to `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        weights::save(&self.varmap, dir)?;
        self.config.save(&dir.join(CONFIG_FILE))?;
        self.tokenizer.save(dir)?;
        Ok(())
    }
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

fn save_with_yaml(trainer: &Trainer, dir: &Path, loaded: &LoadedConfig) -> Result<()> {
    trainer.save(dir)?;
    let yaml = loaded.to_yaml()?;
    std::fs::write(dir.join("config.yaml"), yaml)
        .with_context(|| format!("Cannot write {}", dir.join("config.yaml").display()))?;
    Ok(())
}

/// Run fine-tuning as described by the YAML file at `config_path`.
pub fn run(config_path: &Path) -> Result<TrainSummary> {
    let loaded = LoadedConfig::from_file(config_path)?;
    let cfg = &loaded.config;
    let checkpoint_dir = loaded.checkpoint_dir();
    let final_dir = loaded.final_model_dir();
    for dir in [&checkpoint_dir, &final_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let rows = dataset::train_rows(&loaded.metadata_csv(), cfg.max_train_samples, &mut rng)?;

    let resume = resume_dir(loaded.resume_from().as_deref());
    let (model_dir, lr) = match &resume {
        Some(dir) => {
            info!("Resuming from: {}", dir.display());
            (dir.clone(), cfg.resume_lr)
        }
        None => {
            info!("Base model: {}", cfg.base_model);
            let dir = download::materialize(&ModelSource::Pretrained(cfg.base_model.clone()))?;
            (dir, cfg.learning_rate)
        }
    };
    info!(
        "Fine-tuning: {} samples, {} epochs, batch_size={}",
        rows.len(),
        cfg.epochs,
        cfg.batch_size
    );
    info!("Output: {}", final_dir.display());

    let data = TtsDataset::new(rows, &loaded.root, cfg.sample_rate, cfg.max_audio_sec);
    let steps_per_epoch = data.len() / cfg.batch_size.max(1);
    let total_steps = cfg.epochs * steps_per_epoch;
    let mut trainer = Trainer::from_checkpoint(&model_dir, cfg.sample_rate, lr, total_steps)?;
    info!("Device: cpu, lr={lr:e}");

    let log_every = (steps_per_epoch / 10).max(1);
    let mut best: Option<f64> = None;
    for epoch in 1..=cfg.epochs {
        let mut epoch_loss = 0f64;
        let mut n_batches = 0usize;

        for (batch_idx, indices) in
            dataset::epoch_batches(data.len(), cfg.batch_size, &mut rng).into_iter().enumerate()
        {
            let samples = indices.iter().map(|&i| data.get(i)).collect();
            let batch = match dataset::collate(samples, trainer.tokenizer(), trainer.device()) {
                Ok(Some(b)) => b,
                Ok(None) => continue,
                Err(e) => {
                    warn!("batch {batch_idx} skipped, collate failed: {e:#}");
                    continue;
                }
            };
            match trainer.train_step(&batch) {
                Ok(Some(losses)) => {
                    epoch_loss += losses.total as f64;
                    n_batches += 1;
                    if (batch_idx + 1) % log_every == 0 {
                        info!(
                            "Epoch {epoch}/{} step {}/{steps_per_epoch} loss={:.4} wav={:.4} mel={:.4}",
                            cfg.epochs,
                            batch_idx + 1,
                            losses.total,
                            losses.wav,
                            losses.mel
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("batch {batch_idx} skipped: {e:#}"),
            }
        }

        if n_batches > 0 {
            let avg = epoch_loss / n_batches as f64;
            info!("Epoch {epoch}/{} avg_loss={avg:.4} (batches={n_batches})", cfg.epochs);
            if best.map_or(true, |b| avg < b) {
                best = Some(avg);
                save_with_yaml(&trainer, &final_dir, &loaded)?;
                info!("  -> Saved best model to {}", final_dir.display());
            }
        } else {
            warn!("Epoch {epoch}/{} trained no batches", cfg.epochs);
        }
        if cfg.checkpoint_every > 0 && epoch % cfg.checkpoint_every == 0 {
            trainer.save(&checkpoint_dir)?;
            info!("  Checkpoint -> {}", checkpoint_dir.display());
        }
    }

    save_with_yaml(&trainer, &final_dir, &loaded)?;
    info!("Fine-tuning complete. Model saved to {}", final_dir.display());
    Ok(TrainSummary {
        epochs: cfg.epochs,
        steps: trainer.steps(),
        best_loss: best,
        final_model_dir: final_dir,
    })
}
