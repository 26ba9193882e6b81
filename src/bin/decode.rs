//! Decode Parquet audio shards into 16 kHz WAV files and `metadata.csv`.
//!
//! Usage:
//!   kinyatts-decode <data_dir> <out_dir>

use std::path::PathBuf;

use clap::{CommandFactory, Parser};

#[derive(Debug, Parser)]
#[command(name = "kinyatts-decode", about = "Parquet audio shards to WAV + metadata.csv")]
struct Cli {
    /// Directory holding `<split>-*-of-*.parquet` shards.
    data_dir: Option<PathBuf>,
    /// Destination for `wav/` and `metadata.csv`.
    out_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    kinyatts::logging::init();
    let cli = Cli::parse();

    let (Some(data_dir), Some(out_dir)) = (cli.data_dir, cli.out_dir) else {
        eprintln!("{}", Cli::command().render_usage());
        std::process::exit(1);
    };

    let report = kinyatts::pipeline::run(&data_dir, &out_dir)?;
    println!("Wrote {} rows to {}", report.rows.len(), report.csv_path.display());
    Ok(())
}
