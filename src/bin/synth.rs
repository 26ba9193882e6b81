//! Synthesise one utterance to a WAV file.
//!
//! Usage:
//!   kinyatts-synth "Muraho, amakuru yawe?" [output.wav] [--speaker-id N]
//!
//! The model is chosen from the `TTS_*` environment variables.

use std::path::PathBuf;

use clap::{CommandFactory, Parser};

#[derive(Debug, Parser)]
#[command(name = "kinyatts-synth", about = "Kinyarwanda text-to-speech to a WAV file")]
struct Cli {
    /// Text to speak.
    text: Option<String>,
    /// Output WAV path.
    #[arg(default_value = "synthesis_output.wav")]
    output: PathBuf,
    /// Speaker id for multi-speaker checkpoints.
    #[arg(long)]
    speaker_id: Option<String>,
}

fn main() -> anyhow::Result<()> {
    kinyatts::logging::init();
    let cli = Cli::parse();

    let Some(text) = cli.text.filter(|t| !t.trim().is_empty()) else {
        eprintln!("{}", Cli::command().render_usage());
        std::process::exit(1);
    };

    let out = kinyatts::synthesize(&text, cli.speaker_id.as_deref())?;
    std::fs::write(&cli.output, &out.wav_bytes)?;

    println!("Latency: {:.0} ms", out.latency_ms);
    println!("WAV written: {}", cli.output.display());
    Ok(())
}
