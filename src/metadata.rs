//! The metadata table shared by the decoding pipeline and the trainer.
//!
//! `metadata.csv` has the header `split,path,text,speaker_id,duration_sec`;
//! every `path` names a 16-bit PCM WAV written by the pipeline.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub split: String,
    pub path: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub speaker_id: i64,
    #[serde(default)]
    pub duration_sec: f64,
}

/// Round to four decimals, the precision stored in the table.
pub fn round_duration(secs: f64) -> f64 {
    (secs * 10_000.0).round() / 10_000.0
}

pub fn write_csv(path: &Path, rows: &[MetadataRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Cannot create {}", path.display()))?;
    if rows.is_empty() {
        writer.write_record(["split", "path", "text", "speaker_id", "duration_sec"])?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(())
}

pub fn read_csv(path: &Path) -> Result<Vec<MetadataRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Cannot open {}", path.display()))?;
    reader
        .deserialize()
        .enumerate()
        .map(|(i, row)| row.with_context(|| format!("{}: bad row {}", path.display(), i + 1)))
        .collect()
}
