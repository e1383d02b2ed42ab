use clap::Parser;
use std::path::PathBuf;

/// Publishes periodic snapshots and incremental updates of the store to a
/// web-served artifact directory.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// State directory of the store to publish.
    #[arg(short = 'd', long, default_value = "/var/lib/pyzor", env = "PYZORD_HOME")]
    home: PathBuf,

    /// Web root receiving `snapshots/` and `updates/`.
    #[arg(short = 'r', long, default_value = "/var/www/update.bohuno.com/pyzor")]
    root: PathBuf,

    /// Store cache budget in MiB.
    #[arg(short = 'c', long, default_value = "8")]
    cache: usize,

    #[command(flatten)]
    log: cli_common::LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli_common::init_logging(&cli.log);

    tracing::info!(
        home = %cli.home.display(),
        root = %cli.root.display(),
        "starting pyzord-updated"
    );

    pyzord::require_home(&cli.home)?;
    let options = pyzord::store_options(cli.cache);

    tokio::select! {
        signal = pyzord::shutdown_signal() => {
            signal?;
            tracing::info!("received a signal, stopping the server");
            std::process::exit(pyzord::EXIT_ON_SIGNAL);
        }
        result = artifacts::run_emitter(cli.root, cli.home, options) => result,
    }
}
