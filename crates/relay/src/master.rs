//! Master-side transport: the mutation pipeline actor that serializes all
//! writes, the forwarding acceptor that feeds it, and the replication
//! acceptor that streams committed post-images to followers.

use crate::Config;
use anyhow::Context;
use reputation::{unix_time, Digest, Frame, Mutation, Record, RETENTION_SECONDS};
use std::path::PathBuf;
use std::time::Duration;
use store::{ExpirePass, Options, Store};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Queue depth between sessions and the store task. Bounded so a flood
/// of forwarded mutations backpressures the sockets instead of memory.
const PIPELINE_DEPTH: usize = 1024;

/// Post-images buffered per replication subscriber before it is counted
/// as lagging and disconnected to re-bootstrap.
const REPLICATION_DEPTH: usize = 4096;

const CHECKPOINT_DELAY: Duration = Duration::from_secs(300);
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);

const EXPIRE_DELAY: Duration = Duration::from_secs(15);
const EXPIRE_INTERVAL: Duration = Duration::from_secs(60);
const EXPIRE_CATCHUP_INTERVAL: Duration = Duration::from_secs(1);

enum Command {
    Mutate(Mutation),
    Checkpoint(oneshot::Sender<Result<(), store::Error>>),
    Expire {
        from: u32,
        to: u32,
        now: u32,
        reply: oneshot::Sender<Result<ExpirePass, store::Error>>,
    },
}

/// Handle to the single-writer store task. All mutations flow through
/// one FIFO, so commit order is total and doubles as replication order.
#[derive(Clone)]
pub struct Pipeline {
    commands: mpsc::Sender<Command>,
    posts: broadcast::Sender<(Digest, Record)>,
}

impl Pipeline {
    /// Move `store` into a dedicated task on the event loop and return the
    /// handle feeding it. The task exits, closing the store, once every
    /// handle is gone.
    ///
    /// Store operations run inline on the loop: each is one bounded
    /// transaction (a single record, or a size-capped expiry batch), so
    /// driving the store from the loop stays deterministic without
    /// starving other tasks.
    pub fn spawn(mut store: Store) -> Self {
        let (commands, mut rx) = mpsc::channel(PIPELINE_DEPTH);
        let (posts, _) = broadcast::channel(REPLICATION_DEPTH);
        let publish = posts.clone();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Mutate(mutation) => match store.apply(&mutation) {
                        Ok(record) => {
                            // No subscribers is fine; send only fails then.
                            let _ = publish.send((mutation.digest, record));
                        }
                        Err(err) if err.is_transient() => {
                            tracing::warn!(digest = %mutation.digest, %err, "dropped mutation after retries");
                        }
                        Err(err) => {
                            tracing::error!(%err, "store failed; stopping the mutation pipeline");
                            return;
                        }
                    },
                    Command::Checkpoint(reply) => {
                        let _ = reply.send(store.checkpoint());
                    }
                    Command::Expire { from, to, now, reply } => {
                        let _ = reply.send(store.expire_pass(from, to, now));
                    }
                }
            }
        });

        Self { commands, posts }
    }

    pub async fn mutate(&self, mutation: Mutation) -> anyhow::Result<()> {
        self.commands
            .send(Command::Mutate(mutation))
            .await
            .map_err(|_| anyhow::anyhow!("mutation pipeline has stopped"))
    }

    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Checkpoint(reply))
            .await
            .map_err(|_| anyhow::anyhow!("mutation pipeline has stopped"))?;
        Ok(rx.await.context("pipeline stopped mid-checkpoint")??)
    }

    pub async fn expire(&self, from: u32, to: u32, now: u32) -> anyhow::Result<ExpirePass> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Expire { from, to, now, reply })
            .await
            .map_err(|_| anyhow::anyhow!("mutation pipeline has stopped"))?;
        Ok(rx.await.context("pipeline stopped mid-expiry")??)
    }

    /// Subscribe to committed post-images, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<(Digest, Record)> {
        self.posts.subscribe()
    }

    /// Resolves when the store task has stopped, which only happens on a
    /// fatal store error or full shutdown.
    pub async fn stopped(&self) {
        self.commands.closed().await
    }
}

/// Accept forwarding connections from slaves and feed their mutations into
/// the pipeline in arrival order.
pub async fn serve_forwarding(
    listener: TcpListener,
    pipeline: Pipeline,
    config: Config,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await.context("accepting a forwarder")?;
        tracing::info!(%peer, "forwarder connected");

        let pipeline = pipeline.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = forwarding_session(socket, &pipeline, &config).await {
                tracing::info!(%peer, %err, "forwarder session ended");
            }
        });
    }
}

async fn forwarding_session(
    socket: TcpStream,
    pipeline: &Pipeline,
    config: &Config,
) -> anyhow::Result<()> {
    let (reader, writer) = socket.into_split();

    tokio::select! {
        r = read_mutations(reader, pipeline, config) => r,
        w = write_heartbeats(writer, config) => w,
    }
}

async fn read_mutations(
    mut reader: OwnedReadHalf,
    pipeline: &Pipeline,
    config: &Config,
) -> anyhow::Result<()> {
    let mut buffer = Vec::with_capacity(4096);
    loop {
        let n = tokio::time::timeout(config.read_idle_timeout, reader.read_buf(&mut buffer))
            .await
            .context("peer went silent")??;
        if n == 0 {
            anyhow::bail!("connection closed by peer");
        }

        for frame in Frame::decode(&mut buffer)? {
            match frame {
                Frame::Heartbeat => (),
                Frame::Mutation(mutation) => pipeline.mutate(mutation).await?,
                Frame::Put(..) => anyhow::bail!("unexpected replication frame on the forwarding channel"),
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

/// Accept follower connections and stream post-images to each: first the
/// backlog since the follower's watermark, then live commits. The master
/// never waits for follower acknowledgement.
pub async fn serve_replication(
    listener: TcpListener,
    pipeline: Pipeline,
    home: PathBuf,
    options: Options,
    config: Config,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await.context("accepting a follower")?;
        tracing::info!(%peer, "follower connected");

        let pipeline = pipeline.clone();
        let home = home.clone();
        let options = options.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = replication_session(socket, &pipeline, home, options, &config).await {
                tracing::info!(%peer, %err, "follower session ended");
            }
        });
    }
}

async fn replication_session(
    socket: TcpStream,
    pipeline: &Pipeline,
    home: PathBuf,
    options: Options,
    config: &Config,
) -> anyhow::Result<()> {
    let (mut reader, writer) = socket.into_split();

    let since = reader
        .read_u32()
        .await
        .context("reading follower watermark")?;

    // Subscribe before scanning: a commit landing during the backlog scan
    // shows up twice, and post-image puts are idempotent.
    let live = pipeline.subscribe();

    tokio::select! {
        r = discard_heartbeats(reader, config) => r,
        w = stream_posts(writer, since, live, home, options, config) => w,
    }
}

async fn discard_heartbeats(mut reader: OwnedReadHalf, config: &Config) -> anyhow::Result<()> {
    let mut buffer = Vec::with_capacity(64);
    loop {
        let n = tokio::time::timeout(config.read_idle_timeout, reader.read_buf(&mut buffer))
            .await
            .context("peer went silent")??;
        if n == 0 {
            anyhow::bail!("connection closed by peer");
        }
        for frame in Frame::decode(&mut buffer)? {
            if !matches!(frame, Frame::Heartbeat) {
                anyhow::bail!("follower sent an unexpected frame");
            }
        }
    }
}

async fn stream_posts(
    mut writer: OwnedWriteHalf,
    since: u32,
    mut live: broadcast::Receiver<(Digest, Record)>,
    home: PathBuf,
    options: Options,
    config: &Config,
) -> anyhow::Result<()> {
    // The backlog scan runs on its own read-only connection so a slow or
    // large bootstrap never stalls the write pipeline.
    let (backlog_tx, mut backlog) = mpsc::channel::<(Digest, Record)>(4096);
    let scan = tokio::task::spawn_blocking(move || -> Result<usize, store::Error> {
        let snapshot = Store::open_read_only(&home, &options)?;
        snapshot.scan_updated(since, u32::MAX, |digest, record| {
            // A send failure means the session is gone; finish the scan.
            let _ = backlog_tx.blocking_send((digest, record));
        })
    });

    let mut buf = Vec::with_capacity(4096);
    while let Some((digest, record)) = backlog.recv().await {
        buf.clear();
        Frame::Put(digest, record).encode(&mut buf);
        writer.write_all(&buf).await.context("writing backlog")?;
    }
    let sent = scan.await.context("backlog scan panicked")??;
    tracing::debug!(since, sent, "follower backlog complete");

    let mut tick = tokio::time::interval(config.heartbeat_interval);
    loop {
        buf.clear();
        tokio::select! {
            post = live.recv() => match post {
                Ok((digest, record)) => Frame::Put(digest, record).encode(&mut buf),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The follower reconnects and re-bootstraps from its
                    // watermark, which covers whatever was dropped.
                    anyhow::bail!("follower lagged {skipped} commits behind");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tick.tick() => Frame::Heartbeat.encode(&mut buf),
        }
        writer.write_all(&buf).await.context("writing to follower")?;
    }
}

/// Periodic write-ahead-log checkpoint, bounding the crash-loss window.
pub async fn checkpoint_loop(pipeline: Pipeline) {
    tokio::time::sleep(CHECKPOINT_DELAY).await;
    loop {
        if let Err(err) = pipeline.checkpoint().await {
            tracing::error!(%err, "checkpoint failed");
        }
        tokio::time::sleep(CHECKPOINT_INTERVAL).await;
    }
}

/// The expiry control loop: resume from the persisted watermark, reset
/// stale records in bounded passes, and persist the new watermark.
pub async fn expiry_loop(pipeline: Pipeline, home: PathBuf) {
    tokio::time::sleep(EXPIRE_DELAY).await;
    loop {
        let delay = match run_expiry_pass(&pipeline, &home).await {
            Ok(pass) => {
                if pass.reset != 0 {
                    tracing::info!(reset = pass.reset, hit_cap = pass.hit_cap, "expired records");
                }
                if pass.hit_cap {
                    EXPIRE_CATCHUP_INTERVAL
                } else {
                    EXPIRE_INTERVAL
                }
            }
            Err(err) => {
                // Keep the old watermark and try again next interval.
                tracing::error!(%err, "expiry pass failed");
                EXPIRE_INTERVAL
            }
        };
        tokio::time::sleep(delay).await;
    }
}

async fn run_expiry_pass(pipeline: &Pipeline, home: &std::path::Path) -> anyhow::Result<ExpirePass> {
    let from = store::read_watermark(home)
        .context("reading expiry watermark")?
        .unwrap_or(0);
    let now = unix_time();
    let to = now.saturating_sub(RETENTION_SECONDS);

    let pass = pipeline.expire(from, to, now).await?;
    if let Some(watermark) = pass.last_seen {
        store::write_watermark(home, watermark).context("persisting expiry watermark")?;
    }
    Ok(pass)
}
