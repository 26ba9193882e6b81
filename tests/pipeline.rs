//! End-to-end Parquet → WAV + metadata.csv run on in-process fixtures.
#![cfg(feature = "pipeline")]

use std::{fs::File, path::Path, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, BinaryArray, Int32Array, StringArray, StructArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use parquet::arrow::ArrowWriter;

use kinyatts::{
    audio::wav,
    metadata,
    pipeline::{self, TARGET_SAMPLE_RATE},
};

fn tone(n: usize, rate: u32) -> Vec<u8> {
    let samples: Vec<f32> = (0..n).map(|i| (i as f32 * 0.05).sin() * 0.4).collect();
    wav::encode_pcm16(&samples, rate).unwrap()
}

/// Write one shard whose `audio` column is a `{bytes, path}` struct, as the
/// Hub `Audio` feature stores it.
fn write_shard(
    path: &Path,
    audio: Vec<Option<Vec<u8>>>,
    texts: Vec<&str>,
    speakers: Option<Vec<i32>>,
) {
    let bytes: BinaryArray = audio.iter().map(|b| b.as_deref()).collect();
    let paths = StringArray::from(vec![Some("clip.wav"); audio.len()]);
    let audio_col = StructArray::from(vec![
        (Arc::new(Field::new("bytes", DataType::Binary, true)), Arc::new(bytes) as ArrayRef),
        (Arc::new(Field::new("path", DataType::Utf8, true)), Arc::new(paths) as ArrayRef),
    ]);

    let mut fields = vec![
        Field::new("audio", audio_col.data_type().clone(), true),
        Field::new("text", DataType::Utf8, true),
    ];
    let mut columns: Vec<ArrayRef> =
        vec![Arc::new(audio_col), Arc::new(StringArray::from(texts))];
    if let Some(ids) = speakers {
        fields.push(Field::new("speaker_id", DataType::Int32, true));
        columns.push(Arc::new(Int32Array::from(ids)));
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();

    let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

#[test]
fn shards_become_wavs_and_metadata() {
    let data = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    // train shard 0: good 8 kHz clip, undecodable bytes, null audio.
    write_shard(
        &data.path().join("train-00000-of-00002.parquet"),
        vec![Some(tone(8_000, 8_000)), Some(b"not audio at all".to_vec()), None],
        vec!["muraho", "ntibisomeka", "nta majwi"],
        None,
    );
    // train shard 1: numbering continues across shards.
    write_shard(
        &data.path().join("train-00001-of-00002.parquet"),
        vec![Some(tone(16_000, 16_000))],
        vec!["amakuru"],
        None,
    );
    write_shard(
        &data.path().join("validation-00000-of-00001.parquet"),
        vec![Some(tone(4_000, 16_000))],
        vec!["yego"],
        Some(vec![3]),
    );

    let report = pipeline::run(data.path(), out.path()).unwrap();
    assert_eq!(report.rows.len(), 3);
    assert_eq!(report.skipped, 2);

    let rows = metadata::read_csv(&report.csv_path).unwrap();
    assert_eq!(rows, report.rows);

    let names: Vec<String> = rows
        .iter()
        .map(|r| Path::new(&r.path).file_name().unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["train_000000.wav", "train_000003.wav", "validation_000000.wav"]);
    assert!(rows.iter().all(|r| Path::new(&r.path).is_absolute()));

    assert_eq!(rows[0].split, "train");
    assert_eq!(rows[0].text, "muraho");
    assert_eq!(rows[0].speaker_id, 0);
    assert_eq!(rows[0].duration_sec, 1.0);
    assert_eq!(rows[2].split, "validation");
    assert_eq!(rows[2].speaker_id, 3);
    assert_eq!(rows[2].duration_sec, 0.25);

    let clip = wav::read_mono(Path::new(&rows[0].path)).unwrap();
    assert_eq!(clip.sample_rate, TARGET_SAMPLE_RATE);
    assert_eq!(clip.samples.len(), 16_000);
}
