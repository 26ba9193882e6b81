//! Parquet shards with an encoded `audio` column → 16 kHz WAV files plus
//! `metadata.csv`.
//!
//! Shards follow the Hub dataset naming `<split>-NNNNN-of-NNNNN.parquet`.
//! Rows of all shards of a split are numbered together from 0, and that
//! number names the WAV file (`wav/<split>_<i:06>.wav`), so skipped rows
//! leave gaps rather than shifting later files.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use arrow::{
    array::{Array, ArrayRef, AsArray},
    compute::cast,
    datatypes::{DataType, Int64Type},
    record_batch::RecordBatch,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    audio::{decode::decode_bytes, duration_secs, resample::resample_mono, wav},
    metadata::{self, round_duration, MetadataRow},
};

/// Rate of every WAV the pipeline writes.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Splits in output order.
pub const SPLITS: [&str; 3] = ["train", "validation", "test"];

/// Summary of a pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    pub rows: Vec<MetadataRow>,
    pub skipped: usize,
    pub csv_path: PathBuf,
}

/// Shards of `split` in `data_dir`, sorted by file name.
pub fn find_shards(data_dir: &Path, split: &str) -> Result<Vec<PathBuf>> {
    let pattern = Regex::new(&format!(r"^{}-.*-of-.*\.parquet$", regex::escape(split)))?;
    let entries = std::fs::read_dir(data_dir)
        .with_context(|| format!("Cannot list {}", data_dir.display()))?;
    let mut shards = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| pattern.is_match(n));
        if matches && path.is_file() {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

/// Decode encoded audio bytes to mono at [`TARGET_SAMPLE_RATE`].
pub fn decode_to_target(bytes: &[u8]) -> Result<Vec<f32>> {
    let audio = decode_bytes(bytes)?;
    if audio.sample_rate == TARGET_SAMPLE_RATE {
        return Ok(audio.samples);
    }
    Ok(resample_mono(&audio.samples, audio.sample_rate, TARGET_SAMPLE_RATE)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Column access
// ─────────────────────────────────────────────────────────────────────────────

/// Encoded bytes of row `i`: either a binary column or a struct with a
/// `bytes` field (the Hub `Audio` feature).
fn audio_bytes_at(col: &dyn Array, i: usize) -> Option<&[u8]> {
    if col.is_null(i) {
        return None;
    }
    match col.data_type() {
        DataType::Binary => Some(col.as_binary::<i32>().value(i)),
        DataType::LargeBinary => Some(col.as_binary::<i64>().value(i)),
        DataType::Struct(_) => {
            let field = col.as_struct().column_by_name("bytes")?;
            audio_bytes_at(field.as_ref(), i)
        }
        _ => None,
    }
}

fn text_at(col: Option<&ArrayRef>, i: usize) -> String {
    let Some(col) = col.filter(|c| !c.is_null(i)) else {
        return String::new();
    };
    match col.data_type() {
        DataType::Utf8 => col.as_string::<i32>().value(i).to_string(),
        DataType::LargeUtf8 => col.as_string::<i64>().value(i).to_string(),
        _ => String::new(),
    }
}

/// `speaker_id` column cast to i64; a missing column reads as zeros.
fn speaker_ids(batch: &RecordBatch) -> Result<Option<ArrayRef>> {
    match batch.column_by_name("speaker_id") {
        Some(col) => Ok(Some(cast(col.as_ref(), &DataType::Int64)?)),
        None => Ok(None),
    }
}

fn speaker_at(col: Option<&ArrayRef>, i: usize) -> i64 {
    match col {
        Some(c) if !c.is_null(i) => c.as_primitive::<Int64Type>().value(i),
        _ => 0,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

struct SplitWriter<'a> {
    split: &'a str,
    wav_dir: &'a Path,
    next_index: usize,
    rows: Vec<MetadataRow>,
    skipped: usize,
}

impl SplitWriter<'_> {
    fn batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let audio = batch
            .column_by_name("audio")
            .with_context(|| format!("{} shard has no 'audio' column", self.split))?;
        let text = batch.column_by_name("text");
        let speakers = speaker_ids(batch)?;

        for r in 0..batch.num_rows() {
            let i = self.next_index;
            self.next_index += 1;

            let Some(bytes) = audio_bytes_at(audio.as_ref(), r).filter(|b| !b.is_empty()) else {
                debug!(split = self.split, row = i, "no audio bytes");
                self.skipped += 1;
                continue;
            };
            let samples = match decode_to_target(bytes) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skip row {i}: {e:#}");
                    self.skipped += 1;
                    continue;
                }
            };

            let path = self.wav_dir.join(format!("{}_{i:06}.wav", self.split));
            wav::write_pcm16(&path, &samples, TARGET_SAMPLE_RATE)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            self.rows.push(MetadataRow {
                split: self.split.to_string(),
                path: path.to_string_lossy().into_owned(),
                text: text_at(text, r),
                speaker_id: speaker_at(speakers.as_ref(), r),
                duration_sec: round_duration(duration_secs(samples.len(), TARGET_SAMPLE_RATE)),
            });
        }
        Ok(())
    }
}

fn read_shard(path: &Path, writer: &mut SplitWriter<'_>) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Not a parquet file: {}", path.display()))?
        .build()?;
    for batch in reader {
        let batch = batch.with_context(|| format!("Corrupt record batch in {}", path.display()))?;
        writer.batch(&batch)?;
    }
    Ok(())
}

/// Decode every split found in `data_dir` into `out_dir/wav/` and write
/// `out_dir/metadata.csv`.
pub fn run(data_dir: &Path, out_dir: &Path) -> Result<PipelineReport> {
    let wav_dir = out_dir.join("wav");
    std::fs::create_dir_all(&wav_dir)
        .with_context(|| format!("Cannot create {}", wav_dir.display()))?;
    let out_dir = out_dir
        .canonicalize()
        .with_context(|| format!("Cannot resolve {}", out_dir.display()))?;
    let wav_dir = out_dir.join("wav");

    let mut rows = Vec::new();
    let mut skipped = 0;
    let mut any_shards = false;
    for split in SPLITS {
        let shards = find_shards(data_dir, split)?;
        if shards.is_empty() {
            continue;
        }
        any_shards = true;
        info!("{split}: {} shard(s)", shards.len());

        let mut writer =
            SplitWriter { split, wav_dir: &wav_dir, next_index: 0, rows: Vec::new(), skipped: 0 };
        for shard in &shards {
            read_shard(shard, &mut writer)?;
        }
        info!("{split}: {} rows written, {} skipped", writer.rows.len(), writer.skipped);
        skipped += writer.skipped;
        rows.extend(writer.rows);
    }
    if !any_shards {
        bail!("No parquet files found.");
    }

    let csv_path = out_dir.join("metadata.csv");
    metadata::write_csv(&csv_path, &rows)?;
    Ok(PipelineReport { rows, skipped, csv_path })
}
