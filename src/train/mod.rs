//! Fine-tuning of a pretrained VITS checkpoint on local recordings.
//!
//! The objective is the waveform L1 distance plus twice the log-mel L1
//! distance between generated and recorded speech. Runs are described by a
//! YAML file (see [`config::TrainConfig`]) and driven by [`trainer::run`].

pub mod config;
pub mod dataset;
pub mod mel;
pub mod schedule;
pub mod trainer;

pub use config::{LoadedConfig, TrainConfig};
pub use trainer::{run, TrainSummary, Trainer};
