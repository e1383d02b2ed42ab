use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use store::Store;

/// Loads a dump file, or a whole artifact directory of snapshots and
/// updates, into a stand-alone store.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// State directory of the target store.
    #[arg(short = 'd', long, default_value = "/var/lib/pyzor", env = "PYZORD_HOME")]
    home: PathBuf,

    /// A single dump file to import.
    #[arg(short = 'f', long, conflicts_with = "artifacts")]
    file: Option<PathBuf>,

    /// An artifact directory holding `snapshots/` and `updates/` to
    /// bootstrap and catch up from.
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Refuse to touch a store that already holds records.
    #[arg(long)]
    require_empty: bool,

    /// Store cache budget in MiB. Imports benefit from a large cache.
    #[arg(short = 'c', long, default_value = "512")]
    cache: usize,

    #[command(flatten)]
    log: cli_common::LogArgs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli_common::init_logging(&cli.log);

    pyzord::require_home(&cli.home)?;
    let options = pyzord::store_options(cli.cache);
    let mut store = Store::open(&cli.home, &options).context("opening the store")?;

    if cli.require_empty && !store.is_empty()? {
        anyhow::bail!(
            "the store already contains data; empty {} to reinitialize",
            cli.home.display()
        );
    }

    let started = std::time::Instant::now();

    let imported = match (&cli.file, &cli.artifacts) {
        (Some(file), None) => artifacts::import_dump(&mut store, file, |n| {
            tracing::info!(records = n, "import progress");
        })?,
        (None, Some(root)) => {
            let report = artifacts::ingest_directory(&mut store, root)?;
            tracing::info!(
                snapshot_records = report.snapshot_records,
                updates = report.updates_applied,
                "artifact ingest complete"
            );
            report.snapshot_records + report.update_records
        }
        _ => anyhow::bail!("exactly one of --file or --artifacts is required"),
    };

    store.checkpoint().context("checkpointing after import")?;

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        records = imported,
        elapsed,
        rate = (imported as f64 / elapsed.max(f64::EPSILON)) as u64,
        "import finished"
    );
    Ok(())
}
