//! Training samples and batches.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use rand::{seq::SliceRandom, Rng};
use tracing::{debug, info};

use crate::{
    audio::{resample::resample_mono, wav},
    metadata::{self, MetadataRow},
    tokenize::{VitsTokenizer, MAX_TOKENS},
};

/// Clips shorter than this (0.1 s at 16 kHz) are not trained on.
pub const MIN_SAMPLES: usize = 1_600;

/// Smallest training split accepted.
pub const MIN_TRAIN_ROWS: usize = 20;

/// Read the metadata table and keep the `train` split, optionally
/// subsampled to `max_samples` rows.
pub fn train_rows(
    metadata_csv: &Path,
    max_samples: Option<usize>,
    rng: &mut impl Rng,
) -> Result<Vec<MetadataRow>> {
    if !metadata_csv.is_file() {
        bail!(
            "Processed metadata not found: {}. Run the data pipeline (kinyatts-decode) first.",
            metadata_csv.display()
        );
    }
    let mut rows: Vec<MetadataRow> = metadata::read_csv(metadata_csv)?
        .into_iter()
        .filter(|r| r.split == "train")
        .collect();
    if rows.len() < MIN_TRAIN_ROWS {
        bail!(
            "Need at least {MIN_TRAIN_ROWS} training samples, got {}. Run the data pipeline first.",
            rows.len()
        );
    }
    if let Some(max) = max_samples.filter(|&m| m > 0 && m < rows.len()) {
        rows = rows.choose_multiple(rng, max).cloned().collect();
        info!("Subsampled to {} train samples (max_train_samples={max})", rows.len());
    }
    Ok(rows)
}

/// One decoded utterance.
#[derive(Debug, Clone)]
pub struct Sample {
    pub text: String,
    pub audio: Vec<f32>,
    pub speaker_id: i64,
}

/// Lazily loads the audio of metadata rows.
pub struct TtsDataset {
    rows: Vec<MetadataRow>,
    root: PathBuf,
    sample_rate: u32,
    max_samples: usize,
}

impl TtsDataset {
    pub fn new(rows: Vec<MetadataRow>, root: &Path, sample_rate: u32, max_audio_sec: f64) -> Self {
        Self {
            rows,
            root: root.to_path_buf(),
            sample_rate,
            max_samples: (max_audio_sec * sample_rate as f64) as usize,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Load row `idx`. Missing, unreadable or too-short audio yields `None`.
    pub fn get(&self, idx: usize) -> Option<Sample> {
        let row = self.rows.get(idx)?;
        let path = Path::new(&row.path);
        let path = if path.is_absolute() { path.to_path_buf() } else { self.root.join(path) };
        if !path.is_file() {
            debug!("missing audio {}", path.display());
            return None;
        }
        let clip = match wav::read_mono(&path) {
            Ok(c) => c,
            Err(e) => {
                debug!("unreadable audio {}: {e}", path.display());
                return None;
            }
        };
        let mut audio = if clip.sample_rate != self.sample_rate {
            resample_mono(&clip.samples, clip.sample_rate, self.sample_rate).ok()?
        } else {
            clip.samples
        };
        audio.truncate(self.max_samples);
        if audio.len() < MIN_SAMPLES {
            return None;
        }
        Some(Sample { text: row.text.trim().to_string(), audio, speaker_id: row.speaker_id })
    }
}

/// Shuffled index batches of exactly `batch_size`; the remainder is dropped.
pub fn epoch_batches(len: usize, batch_size: usize, rng: &mut impl Rng) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order.chunks_exact(batch_size).map(<[usize]>::to_vec).collect()
}

/// Tensors of one training step.
pub struct Batch {
    /// `[B, L]` i64
    pub input_ids: Tensor,
    /// `[B, L]` i64
    pub attention_mask: Tensor,
    /// `[B, 1, T]` f32, zero-padded.
    pub target: Tensor,
    /// `[B]` i64
    pub speaker_ids: Tensor,
}

/// Tokenise and pad a batch; `None` when no sample survived loading.
pub fn collate(
    samples: Vec<Option<Sample>>,
    tokenizer: &VitsTokenizer,
    device: &Device,
) -> Result<Option<Batch>> {
    let samples: Vec<Sample> = samples.into_iter().flatten().collect();
    if samples.is_empty() {
        return Ok(None);
    }
    let b = samples.len();
    let texts: Vec<&str> = samples.iter().map(|s| s.text.as_str()).collect();
    let enc = tokenizer.encode_batch(&texts, MAX_TOKENS);

    let t = samples.iter().map(|s| s.audio.len()).max().unwrap_or(0);
    let mut target = vec![0f32; b * t];
    for (i, s) in samples.iter().enumerate() {
        target[i * t..i * t + s.audio.len()].copy_from_slice(&s.audio);
    }
    let speakers: Vec<i64> = samples.iter().map(|s| s.speaker_id).collect();

    Ok(Some(Batch {
        input_ids: Tensor::from_vec(enc.input_ids, (enc.batch, enc.max_len), device)
            .context("input_ids tensor")?,
        attention_mask: Tensor::from_vec(enc.attention_mask, (enc.batch, enc.max_len), device)
            .context("attention_mask tensor")?,
        target: Tensor::from_vec(target, (b, 1, t), device)?,
        speaker_ids: Tensor::from_vec(speakers, b, device)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    use crate::tokenize::TokenizerConfig;

    fn rows(dir: &Path, n: usize) -> Vec<MetadataRow> {
        (0..n)
            .map(|i| MetadataRow {
                split: if i % 5 == 4 { "test".into() } else { "train".into() },
                path: format!("wav/{i}.wav"),
                text: format!(" muraho {i} "),
                speaker_id: 0,
                duration_sec: 1.0,
            })
            .inspect(|r| {
                let p = dir.join(&r.path);
                std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            })
            .collect()
    }

    #[test]
    fn keeps_train_split_and_subsamples() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("metadata.csv");
        metadata::write_csv(&csv, &rows(dir.path(), 30)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        assert_eq!(train_rows(&csv, None, &mut rng).unwrap().len(), 24);
        assert_eq!(train_rows(&csv, Some(0), &mut rng).unwrap().len(), 24);
        let sub = train_rows(&csv, Some(21), &mut rng).unwrap();
        assert_eq!(sub.len(), 21);
        assert!(sub.iter().all(|r| r.split == "train"));
    }

    #[test]
    fn too_few_rows_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("metadata.csv");
        metadata::write_csv(&csv, &rows(dir.path(), 10)).unwrap();
        let err = train_rows(&csv, None, &mut ChaCha8Rng::seed_from_u64(1)).unwrap_err();
        assert!(err.to_string().contains("at least 20"));
        let missing = train_rows(&dir.path().join("nope.csv"), None, &mut ChaCha8Rng::seed_from_u64(1));
        assert!(missing.unwrap_err().to_string().contains("Run the data pipeline"));
    }

    #[test]
    fn dataset_loads_resamples_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let rs = rows(dir.path(), 3);
        // 0: fine at 8 kHz, 1: too short, 2: missing.
        wav::write_pcm16(&dir.path().join(&rs[0].path), &vec![0.1; 8_000], 8_000).unwrap();
        wav::write_pcm16(&dir.path().join(&rs[1].path), &vec![0.1; 500], 16_000).unwrap();
        let ds = TtsDataset::new(rs, dir.path(), 16_000, 0.5);
        let s = ds.get(0).unwrap();
        assert_eq!(s.audio.len(), 8_000);
        assert_eq!(s.text, "muraho 0");
        assert!(ds.get(1).is_none());
        assert!(ds.get(2).is_none());
        assert!(ds.get(9).is_none());
    }

    #[test]
    fn batches_drop_last() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let batches = epoch_batches(10, 4, &mut rng);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
        let mut seen: Vec<usize> = batches.concat();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn collate_pads_audio_and_tokens() {
        let vocab: HashMap<String, i64> =
            [("a", 1), ("b", 2), (" ", 3)].iter().map(|(k, v)| (k.to_string(), *v)).collect();
        let tok = VitsTokenizer::new(vocab, TokenizerConfig::default()).unwrap();
        let samples = vec![
            Some(Sample { text: "ab".into(), audio: vec![0.5; 3], speaker_id: 1 }),
            None,
            Some(Sample { text: "a".into(), audio: vec![0.25; 5], speaker_id: 2 }),
        ];
        let batch = collate(samples, &tok, &Device::Cpu).unwrap().unwrap();
        assert_eq!(batch.target.dims(), &[2, 1, 5]);
        let t = batch.target.to_vec3::<f32>().unwrap();
        assert_eq!(t[0][0], vec![0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(batch.input_ids.dims()[0], 2);
        assert_eq!(batch.speaker_ids.to_vec1::<i64>().unwrap(), vec![1, 2]);
        assert!(collate(vec![None, None], &tok, &Device::Cpu).unwrap().is_none());
    }
}
