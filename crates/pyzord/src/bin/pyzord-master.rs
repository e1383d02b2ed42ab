use anyhow::Context;
use clap::Parser;
use relay::{master, Config};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use store::Store;
use tokio::net::TcpListener;

/// The single-writer reputation master: applies forwarded mutations,
/// replicates committed records to followers, and expires stale entries.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// State directory holding the store and the expiry watermark.
    #[arg(short = 'd', long, default_value = "/var/lib/pyzor", env = "PYZORD_HOME")]
    home: PathBuf,

    /// Address to accept forwarded mutations and followers on. The
    /// forwarding port is additionally bound on loopback for local
    /// front-ends.
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Port for the mutation forwarding channel.
    #[arg(short = 'p', long, default_value = "5555")]
    port: u16,

    /// Port for the replication channel.
    #[arg(long, default_value = "5000")]
    replication_port: u16,

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

    tracing::info!(home = %cli.home.display(), "starting pyzord-master");

    pyzord::require_home(&cli.home)?;
    let options = pyzord::store_options(cli.cache);
    let store = Store::open(&cli.home, &options).context("opening the master store")?;
    let pipeline = master::Pipeline::spawn(store);
    let config = Config::default();

    let forwarding = TcpListener::bind(SocketAddr::new(cli.listen, cli.port))
        .await
        .context("binding the forwarding listener")?;
    let replication = TcpListener::bind(SocketAddr::new(cli.listen, cli.replication_port))
        .await
        .context("binding the replication listener")?;

    tokio::spawn(master::serve_forwarding(
        forwarding,
        pipeline.clone(),
        config.clone(),
    ));
    if !cli.listen.is_loopback() {
        // Local front-ends reach the pipeline over loopback as well.
        let local = TcpListener::bind(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), cli.port))
            .await
            .context("binding the loopback forwarding listener")?;
        tokio::spawn(master::serve_forwarding(
            local,
            pipeline.clone(),
            config.clone(),
        ));
    }
    tokio::spawn(master::serve_replication(
        replication,
        pipeline.clone(),
        cli.home.clone(),
        options,
        config,
    ));

    tokio::spawn(master::checkpoint_loop(pipeline.clone()));
    tokio::spawn(master::expiry_loop(pipeline.clone(), cli.home.clone()));

    tokio::select! {
        signal = pyzord::shutdown_signal() => {
            signal?;
            tracing::info!("received a signal, stopping the server");
            // One last checkpoint so the write-ahead log is drained when
            // the process goes away.
            if let Err(err) = pipeline.checkpoint().await {
                tracing::warn!(%err, "final checkpoint failed");
            }
            std::process::exit(pyzord::EXIT_ON_SIGNAL);
        }
        () = pipeline.stopped() => {
            anyhow::bail!("the store pipeline stopped unexpectedly");
        }
    }
}
