use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use store::Store;

/// Writes a dump of the store, optionally windowed by last-modified time.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// State directory of the store to export.
    #[arg(short = 'd', long, default_value = "/var/lib/pyzor", env = "PYZORD_HOME")]
    home: PathBuf,

    /// Output dump file.
    #[arg(short = 'f', long, default_value = "pyzor.dump")]
    file: PathBuf,

    /// Only export records modified at or after this time.
    #[arg(long, default_value = "0")]
    min: u32,

    /// Only export records modified at or before this time.
    #[arg(long, default_value_t = u32::MAX)]
    max: u32,

    #[command(flatten)]
    log: cli_common::LogArgs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli_common::init_logging(&cli.log);

    let store = Store::open_read_only(&cli.home, &store::Options::default())
        .context("opening the store read-only")?;

    let out = std::fs::File::create(&cli.file)
        .with_context(|| format!("creating {}", cli.file.display()))?;
    let written =
        artifacts::export_window(&store, std::io::BufWriter::new(out), cli.min, cli.max)?;

    tracing::info!(records = written, file = %cli.file.display(), "export finished");
    Ok(())
}
