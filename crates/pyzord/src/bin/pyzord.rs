use anyhow::Context;
use clap::Parser;
use relay::{slave, Applier, Config, Forwarder};
use server::{Frontend, ServerOutcome};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tokio::net::UdpSocket;

/// The read-only reputation slave: mirrors the master, serves the Pyzor
/// UDP protocol, and forwards reports upstream.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// State directory for the mirrored store.
    #[arg(short = 'd', long, default_value = "/var/lib/pyzor", env = "PYZORD_HOME")]
    home: PathBuf,

    /// Master address for the mutation forwarding channel.
    #[arg(short = 'm', long, default_value = "127.0.0.1:5555")]
    master: SocketAddr,

    /// Master address for the replication channel.
    #[arg(long, default_value = "127.0.0.1:5000")]
    master_replication: SocketAddr,

    /// Local address for the UDP query listener.
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Port for the UDP query listener.
    #[arg(short = 'p', long, default_value = "24441")]
    port: u16,

    /// Loopback port accepting mutation streams from other front-end
    /// processes on this host.
    #[arg(long, default_value = "5555")]
    forward_port: u16,

    /// Additional addresses allowed to issue admin operations.
    #[arg(long = "admin")]
    admin: Vec<IpAddr>,

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

    tracing::info!(home = %cli.home.display(), master = %cli.master, "starting pyzord");

    pyzord::require_home(&cli.home)?;
    let options = pyzord::store_options(cli.cache);
    let config = Config::default();

    // The applier mirrors the master into our store; the forwarder relays
    // local mutations upstream. Both reconnect on their own.
    let _applier = Applier::spawn(
        cli.master_replication,
        cli.home.clone(),
        options.clone(),
        config.clone(),
    );
    let forwarder = std::sync::Arc::new(Forwarder::spawn(cli.master, config.clone()));
    let mut up = forwarder.up();

    // Other front-end processes on this host forward through us.
    let local = tokio::net::TcpListener::bind(SocketAddr::new(
        std::net::IpAddr::from([127, 0, 0, 1]),
        cli.forward_port,
    ))
    .await
    .context("binding the local forwarding listener")?;
    tokio::spawn(slave::serve_local(local, forwarder.clone(), config.clone()));

    // The query store opens read-only once the applier materializes it.
    let store = slave::open_when_ready(&cli.home, &options, &config).await;
    let mut frontend = Frontend::new(store, forwarder);
    for address in cli.admin {
        frontend.add_admin_address(address);
    }

    let bind = SocketAddr::new(cli.listen, cli.port);

    let serve = async {
        loop {
            // The UDP socket is bound only while the upstream exists.
            up.wait_for(|up| *up)
                .await
                .context("the forwarder stopped")?;

            let socket = UdpSocket::bind(bind)
                .await
                .with_context(|| format!("binding the UDP listener on {bind}"))?;
            tracing::info!(%bind, "pyzor listener is up");

            match frontend.serve(socket, up.clone()).await? {
                ServerOutcome::Shutdown => return anyhow::Ok(()),
                ServerOutcome::UpstreamDown => continue,
            }
        }
    };

    tokio::select! {
        signal = pyzord::shutdown_signal() => {
            signal?;
            tracing::info!("received a signal, stopping the server");
            std::process::exit(pyzord::EXIT_ON_SIGNAL);
        }
        served = serve => {
            served?;
            tracing::info!("server exited gracefully");
            Ok(())
        }
    }
}
