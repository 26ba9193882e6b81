//! Fine-tune a VITS checkpoint.
//!
//! Usage:
//!   kinyatts-train --config config/mms_tts.yaml

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "kinyatts-train", about = "Fine-tune MMS-TTS (VITS) on processed recordings")]
struct Cli {
    /// Training YAML.
    #[arg(long, default_value = "config/mms_tts.yaml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    kinyatts::logging::init();
    let cli = Cli::parse();

    let summary = kinyatts::train::run(&cli.config)?;
    match summary.best_loss {
        Some(best) => info!("Best epoch loss {best:.4} after {} steps", summary.steps),
        None => info!("No batch was trained on; exported the starting weights"),
    }
    println!("Model saved to {}", summary.final_model_dir.display());
    Ok(())
}
