//! One-epoch fine-tuning run on a tiny, randomly initialised checkpoint.

use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};

use kinyatts::{
    audio::wav,
    metadata::{self, MetadataRow},
    model::{load_backend, Synthesizer, CONFIG_FILE},
    tokenize::{TokenizerConfig, VitsTokenizer},
    train,
    vits::{weights, VitsConfig, VitsModel},
};

const WORDS: [&str; 5] = ["muraho", "amakuru", "yego", "oya", "murakoze"];

/// config.json + model.safetensors + tokenizer files in `dir`.
fn write_checkpoint(dir: &Path) {
    let vocab: HashMap<String, i64> = "_ abcdefghijklmnopqrstuvwxyz"
        .chars()
        .enumerate()
        .map(|(i, c)| (c.to_string(), i as i64))
        .collect();
    let tokenizer = VitsTokenizer::new(vocab, TokenizerConfig::default()).unwrap();
    // 256-sample hop, like the real checkpoints.
    let cfg = VitsConfig {
        upsample_rates: vec![8, 8, 4],
        upsample_kernel_sizes: vec![16, 16, 8],
        use_stochastic_duration_prediction: false,
        ..VitsConfig::tiny(tokenizer.vocab_size())
    };

    // Every token lasts ceil(exp(0.5)) = 2 frames whatever the other
    // weights are, so each utterance is generated at full length.
    let varmap = VarMap::new();
    {
        let mut data = varmap.data().lock().unwrap();
        let f = cfg.duration_predictor_filter_channels;
        data.insert(
            "duration_predictor.proj.weight".to_string(),
            Var::zeros((1, f, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        data.insert(
            "duration_predictor.proj.bias".to_string(),
            Var::new(&[0.5f32], &Device::Cpu).unwrap(),
        );
    }
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    VitsModel::new(&cfg, vb).unwrap();
    weights::save(&varmap, dir).unwrap();
    cfg.save(&dir.join(CONFIG_FILE)).unwrap();
    tokenizer.save(dir).unwrap();
}

fn write_dataset(root: &Path, n: usize) {
    let rows: Vec<MetadataRow> = (0..n)
        .map(|i| {
            let rel = format!("data/processed/wav/train_{i:06}.wav");
            let samples: Vec<f32> =
                (0..8_000).map(|t| ((t + i * 37) as f32 * 0.07).sin() * 0.3).collect();
            wav::write_pcm16(&root.join(&rel), &samples, 16_000).unwrap();
            MetadataRow {
                split: "train".into(),
                path: rel,
                text: format!("{} {}", WORDS[i % 5], WORDS[(i + 2) % 5]),
                speaker_id: 0,
                duration_sec: 0.5,
            }
        })
        .collect();
    metadata::write_csv(&root.join("data/processed/metadata.csv"), &rows).unwrap();
}

#[test]
fn one_epoch_exports_a_loadable_model() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    let base = root.join("base_model");
    std::fs::create_dir_all(&base).unwrap();
    write_checkpoint(&base);
    std::fs::create_dir_all(root.join("data/processed/wav")).unwrap();
    write_dataset(root, 24);

    let config_dir = root.join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    let yaml = format!(
        "project_root: {root}\nbase_model: {base}\nepochs: 1\nbatch_size: 4\n\
         learning_rate: 0.0001\nmax_audio_sec: 1.0\ncheckpoint_every: 1\n",
        root = root.display(),
        base = base.display(),
    );
    let config_path = config_dir.join("tiny.yaml");
    std::fs::write(&config_path, yaml).unwrap();

    let summary = train::run(&config_path).unwrap();
    assert_eq!(summary.epochs, 1);
    // 24 clips in batches of 4, none skipped.
    assert!(summary.steps > 0);
    assert_eq!(summary.steps, 6);
    assert!(summary.best_loss.is_some_and(f64::is_finite));

    let final_dir = root.join("artifacts/final_model");
    assert!(summary.final_model_dir.ends_with("artifacts/final_model"));
    for f in ["model.safetensors", "config.json", "vocab.json", "tokenizer_config.json", "config.yaml"] {
        assert!(final_dir.join(f).is_file(), "final model lacks {f}");
    }
    assert!(root.join("artifacts/checkpoints/model.safetensors").is_file());

    let saved: serde_yaml::Value =
        serde_yaml::from_str(&std::fs::read_to_string(final_dir.join("config.yaml")).unwrap())
            .unwrap();
    assert_eq!(saved["epochs"].as_u64(), Some(1));

    // The export is usable for inference.
    let backend = load_backend(&final_dir).unwrap();
    assert_eq!(backend.sample_rate(), 16_000);
}

#[test]
fn too_little_data_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    std::fs::create_dir_all(root.join("config")).unwrap();
    std::fs::create_dir_all(root.join("data/processed/wav")).unwrap();
    write_dataset(root, 5);
    let config_path = root.join("config/tiny.yaml");
    std::fs::write(&config_path, format!("project_root: {}\n", root.display())).unwrap();

    let err = train::run(&config_path).unwrap_err();
    assert!(format!("{err:#}").contains("at least 20"));
}
