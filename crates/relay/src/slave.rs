//! Slave-side transport: the upstream forwarder (local mutations are never
//! applied locally, only queued and relayed to the master) and the
//! replication applier, which is the sole writer of a follower store.

use crate::Config;
use anyhow::Context;
use reputation::{Frame, Mutation};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use store::{Options, Store};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Queues mutations from local front-ends and relays them upstream in
/// FIFO order, one write in flight at a time. The queue survives
/// disconnection and is drained head-first after every reconnect.
pub struct Forwarder {
    queue: mpsc::UnboundedSender<Mutation>,
    up: watch::Receiver<bool>,
}

impl Forwarder {
    pub fn spawn(master: SocketAddr, config: Config) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let (up_tx, up) = watch::channel(false);

        tokio::spawn(run_forwarder(master, config, rx, up_tx));

        Self { queue, up }
    }

    /// Enqueue a mutation for the master. Returns false once the
    /// forwarder has shut down.
    pub fn enqueue(&self, mutation: Mutation) -> bool {
        self.queue.send(mutation).is_ok()
    }

    /// Observe up/down transitions of the upstream connection. Front-ends
    /// bind their sockets only while this reads true.
    pub fn up(&self) -> watch::Receiver<bool> {
        self.up.clone()
    }
}

async fn run_forwarder(
    master: SocketAddr,
    config: Config,
    mut incoming: mpsc::UnboundedReceiver<Mutation>,
    up: watch::Sender<bool>,
) {
    let mut queue = VecDeque::new();

    loop {
        match TcpStream::connect(master).await {
            Ok(socket) => {
                tracing::info!(%master, queued = queue.len(), "connected to master");
                up.send_replace(true);

                let result = run_connected(socket, &config, &mut incoming, &mut queue).await;
                up.send_replace(false);

                match result {
                    Ok(()) => return, // Shutdown: every handle is gone.
                    Err(err) => tracing::warn!(%master, %err, "lost master connection"),
                }
            }
            Err(err) => {
                tracing::debug!(%master, %err, "could not connect to master");
            }
        }

        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn run_connected(
    socket: TcpStream,
    config: &Config,
    incoming: &mut mpsc::UnboundedReceiver<Mutation>,
    queue: &mut VecDeque<Mutation>,
) -> anyhow::Result<()> {
    let (reader, writer) = socket.into_split();

    tokio::select! {
        r = read_heartbeats(reader, config) => r,
        w = write_queue(writer, config, incoming, queue) => w,
    }
}

async fn read_heartbeats(mut reader: OwnedReadHalf, config: &Config) -> anyhow::Result<()> {
    let mut buffer = Vec::with_capacity(64);
    loop {
        let n = tokio::time::timeout(config.read_idle_timeout, reader.read_buf(&mut buffer))
            .await
            .context("master went silent")??;
        if n == 0 {
            anyhow::bail!("connection closed by master");
        }
        for frame in Frame::decode(&mut buffer)? {
            if !matches!(frame, Frame::Heartbeat) {
                anyhow::bail!("unexpected frame on the forwarding channel");
            }
        }
    }
}

async fn write_queue(
    mut writer: OwnedWriteHalf,
    config: &Config,
    incoming: &mut mpsc::UnboundedReceiver<Mutation>,
    queue: &mut VecDeque<Mutation>,
) -> anyhow::Result<()> {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut buf = Vec::with_capacity(64);

    loop {
        // Drain head-first. The head is popped only after its write
        // completes, so a connection loss leaves it queued for the retry.
        while let Some(head) = queue.front() {
            buf.clear();
            Frame::Mutation(*head).encode(&mut buf);
            writer.write_all(&buf).await.context("forwarding mutation")?;
            queue.pop_front();
        }

        tokio::select! {
            mutation = incoming.recv() => match mutation {
                Some(mutation) => queue.push_back(mutation),
                None if queue.is_empty() => return Ok(()),
                None => continue, // Flush the tail before shutting down.
            },
            _ = heartbeat.tick() => {
                buf.clear();
                Frame::Heartbeat.encode(&mut buf);
                writer.write_all(&buf).await.context("writing heartbeat")?;
            }
        }
    }
}

/// Accept mutation streams from front-end processes on this host and move
/// them onto the upstream queue. Nothing is applied locally.
pub async fn serve_local(
    listener: tokio::net::TcpListener,
    forwarder: std::sync::Arc<Forwarder>,
    config: Config,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await.context("accepting a front-end")?;
        tracing::debug!(%peer, "local front-end connected");

        let forwarder = forwarder.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = local_session(socket, &forwarder, &config).await {
                tracing::debug!(%peer, %err, "front-end session ended");
            }
        });
    }
}

async fn local_session(
    socket: TcpStream,
    forwarder: &Forwarder,
    config: &Config,
) -> anyhow::Result<()> {
    let (mut reader, writer) = socket.into_split();

    let receive = async {
        let mut buffer = Vec::with_capacity(4096);
        loop {
            let n = tokio::time::timeout(config.read_idle_timeout, reader.read_buf(&mut buffer))
                .await
                .context("front-end went silent")??;
            if n == 0 {
                anyhow::bail!("connection closed by front-end");
            }
            for frame in Frame::decode(&mut buffer)? {
                match frame {
                    Frame::Heartbeat => (),
                    Frame::Mutation(mutation) => {
                        if !forwarder.enqueue(mutation) {
                            anyhow::bail!("the upstream forwarder has shut down");
                        }
                    }
                    Frame::Put(..) => {
                        anyhow::bail!("unexpected replication frame from a front-end")
                    }
                }
            }
        }
    };

    tokio::select! {
        r = receive => r,
        w = write_heartbeats(writer, config) => w,
    }
}

/// The replication applier: connects to the master, announces the local
/// watermark, and installs streamed post-images into the follower store
/// in commit order.
pub struct Applier {
    up: watch::Receiver<bool>,
}

impl Applier {
    pub fn spawn(master: SocketAddr, home: PathBuf, options: Options, config: Config) -> Self {
        let (up_tx, up) = watch::channel(false);
        tokio::spawn(run_applier(master, home, options, config, up_tx));
        Self { up }
    }

    pub fn up(&self) -> watch::Receiver<bool> {
        self.up.clone()
    }
}

async fn run_applier(
    master: SocketAddr,
    home: PathBuf,
    options: Options,
    config: Config,
    up: watch::Sender<bool>,
) {
    // The follower store is created here; everything else on this host
    // opens it read-only.
    let mut store = loop {
        match Store::open(&home, &options) {
            Ok(store) => break store,
            Err(err) if err.is_unavailable() || err.is_transient() => {
                tracing::warn!(%err, "follower store is not ready; retrying");
                tokio::time::sleep(config.bootstrap_retry).await;
            }
            Err(err) => {
                tracing::error!(%err, "cannot open the follower store");
                return;
            }
        }
    };

    loop {
        match TcpStream::connect(master).await {
            Ok(socket) => {
                up.send_replace(true);
                if let Err(err) = run_replication(socket, &config, &mut store).await {
                    tracing::warn!(%master, %err, "replication interrupted");
                }
                up.send_replace(false);
            }
            Err(err) => {
                tracing::debug!(%master, %err, "could not reach master for replication");
            }
        }

        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn run_replication(
    socket: TcpStream,
    config: &Config,
    store: &mut Store,
) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();

    // Announce our watermark; the master streams everything at or after it.
    let since = store.last_updated()?.unwrap_or(0);
    writer
        .write_all(&since.to_be_bytes())
        .await
        .context("sending watermark")?;

    tokio::select! {
        r = apply_posts(reader, config, store) => r,
        w = write_heartbeats(writer, config) => w,
    }
}

async fn apply_posts(
    mut reader: OwnedReadHalf,
    config: &Config,
    store: &mut Store,
) -> anyhow::Result<()> {
    let mut buffer = Vec::with_capacity(8192);
    let mut checkpoint = tokio::time::interval(CHECKPOINT_INTERVAL);
    checkpoint.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval is immediate.
    checkpoint.tick().await;

    loop {
        tokio::select! {
            read = tokio::time::timeout(config.read_idle_timeout, reader.read_buf(&mut buffer)) => {
                let n = read.context("master went silent")??;
                if n == 0 {
                    anyhow::bail!("replication stream closed by master");
                }
                for frame in Frame::decode(&mut buffer)? {
                    match frame {
                        Frame::Heartbeat => (),
                        Frame::Put(digest, record) => store.put(&digest, &record)?,
                        Frame::Mutation(_) => {
                            anyhow::bail!("unexpected mutation frame on the replication channel")
                        }
                    }
                }
            }
            _ = checkpoint.tick() => {
                if let Err(err) = store.checkpoint() {
                    tracing::debug!(%err, "follower checkpoint skipped");
                }
            }
        }
    }
}

async fn write_heartbeats(mut writer: OwnedWriteHalf, config: &Config) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(config.heartbeat_interval);
    let mut buf = Vec::with_capacity(4);
    loop {
        tick.tick().await;
        buf.clear();
        Frame::Heartbeat.encode(&mut buf);
        writer.write_all(&buf).await.context("writing heartbeat")?;
    }
}

/// Open a read-only view of a store that another process or task owns,
/// retrying until the writer has materialized it.
pub async fn open_when_ready(home: &std::path::Path, options: &Options, config: &Config) -> Store {
    loop {
        match Store::open_read_only(home, options) {
            Ok(store) => return store,
            Err(err) if err.is_unavailable() => {
                tracing::info!("store is not online yet; retrying");
                tokio::time::sleep(config.bootstrap_retry).await;
            }
            Err(err) => {
                tracing::warn!(%err, "cannot open the store read-only; retrying");
                tokio::time::sleep(config.bootstrap_retry).await;
            }
        }
    }
}
