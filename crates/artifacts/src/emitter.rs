use crate::dir;
use anyhow::Context;
use reputation::{dump, unix_time};
use std::path::{Path, PathBuf};
use std::time::Duration;
use store::{Options, Store};

/// A fresh snapshot is cut once the newest one is this old.
const SNAPSHOT_INTERVAL: u32 = 4 * 60 * 60;
/// Snapshots older than eight hours are expired, with two extra hours of
/// margin for consumer clock skew.
const SNAPSHOT_EXPIRY: u32 = (8 * 60 * 60) + (2 * 60 * 60);

const RUN_DELAY: Duration = Duration::from_secs(5);
const RUN_INTERVAL: Duration = Duration::from_secs(5 * 60);
const STORE_DOWN_RETRY: Duration = Duration::from_secs(5);

/// Writes snapshot and update artifacts for one store into one root.
pub struct Emitter {
    snapshots: PathBuf,
    updates: PathBuf,
}

impl Emitter {
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        let snapshots = root.join("snapshots");
        let updates = root.join("updates");
        std::fs::create_dir_all(&snapshots).context("creating the snapshots directory")?;
        std::fs::create_dir_all(&updates).context("creating the updates directory")?;
        Ok(Self { snapshots, updates })
    }

    /// One emitter cycle: expire old artifacts, then cut either a
    /// snapshot or a delta.
    pub fn run_once(&self, store: &Store, now: u32) -> anyhow::Result<()> {
        if self.expire_snapshots(now)? {
            self.expire_updates()?;
        }
        if !self.make_snapshot(store, now)? {
            self.make_update(store, now)?;
        }
        Ok(())
    }

    /// Cut a full snapshot if the newest one is stale. Returns whether a
    /// snapshot was written.
    fn make_snapshot(&self, store: &Store, now: u32) -> anyhow::Result<bool> {
        let newest = dir::newest_snapshot(&self.snapshots)?.map(|(_, ts)| ts).unwrap_or(0);
        if now.saturating_sub(newest) < SNAPSHOT_INTERVAL {
            return Ok(false);
        }

        let timestamp = now - 1;
        let path = self.snapshots.join(dir::snapshot_name(timestamp));
        let tmp = tmp_sibling(&path);

        let written = write_dump(store, &tmp, 0, timestamp)
            .with_context(|| format!("writing snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)?;

        // Recreate the `current` hard link at the new snapshot.
        let current = self.snapshots.join("current");
        if current.exists() {
            std::fs::remove_file(&current)?;
        }
        std::fs::hard_link(&path, &current)?;

        tracing::info!(path = %path.display(), written, "snapshot created");
        Ok(true)
    }

    /// Cut a delta resuming from the last artifact. Without any prior
    /// artifact there is nothing to resume from and nothing is written.
    fn make_update(&self, store: &Store, now: u32) -> anyhow::Result<()> {
        let resume_from = match dir::newest_update(&self.updates)? {
            Some((_, _, to)) => Some(to),
            None => dir::newest_snapshot(&self.snapshots)?.map(|(_, ts)| ts),
        };
        let Some(from) = resume_from else {
            return Ok(());
        };

        let to = now - 1;
        let path = self.updates.join(dir::update_name(from, to));
        let tmp = tmp_sibling(&path);

        let written = write_dump(store, &tmp, from, to)
            .with_context(|| format!("writing update {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)?;

        tracing::info!(path = %path.display(), written, "update created");
        Ok(())
    }

    /// Remove snapshots older than the expiry horizon. Returns whether
    /// any were removed.
    fn expire_snapshots(&self, now: u32) -> anyhow::Result<bool> {
        let horizon = now.saturating_sub(SNAPSHOT_EXPIRY);
        let mut removed = false;
        for (path, ts) in dir::list_snapshots(&self.snapshots)? {
            if ts < horizon {
                tracing::debug!(path = %path.display(), "expiring snapshot");
                std::fs::remove_file(&path)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Remove updates no longer reachable from any remaining snapshot.
    fn expire_updates(&self) -> anyhow::Result<()> {
        let Some((_, oldest)) = dir::oldest_snapshot(&self.snapshots)? else {
            return Ok(());
        };
        for (path, _, to) in dir::list_updates(&self.updates)? {
            if to < oldest {
                tracing::debug!(path = %path.display(), "expiring update");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Dump every record with `updated` in `[min, max]` to a gzipped file.
fn write_dump(store: &Store, path: &Path, min: u32, max: u32) -> anyhow::Result<usize> {
    let file = std::fs::File::create(path)?;
    let mut writer = dump::Writer::new(std::io::BufWriter::new(file))?;

    // A failed entry write can leave a torn entry in the stream, so the
    // first failure aborts the dump rather than continuing misaligned.
    let mut failed = None;
    store.scan_updated(min, max, |digest, record| {
        if failed.is_none() {
            failed = writer.write(&digest, &record).err();
        }
    })?;
    if let Some(err) = failed {
        return Err(err).with_context(|| format!("writing dump {}", path.display()));
    }

    let (mut buffered, written) = writer.finish()?;
    std::io::Write::flush(&mut buffered)?;
    buffered.get_ref().sync_all()?;
    Ok(written)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// The emitter control loop: every five minutes, with a short initial
/// delay, and backing off while the store is not up yet.
pub async fn run_emitter(root: PathBuf, home: PathBuf, options: Options) -> anyhow::Result<()> {
    let emitter = Emitter::new(&root)?;

    tokio::time::sleep(RUN_DELAY).await;
    loop {
        // Each cycle takes a fresh read-only view so the emitter tracks
        // store availability the way the front-ends do.
        let store = match Store::open_read_only(&home, &options) {
            Ok(store) => store,
            Err(err) if err.is_unavailable() => {
                tokio::time::sleep(STORE_DOWN_RETRY).await;
                continue;
            }
            Err(err) => return Err(err).context("opening the store for the emitter"),
        };

        let started = std::time::Instant::now();
        if let Err(err) = emitter.run_once(&store, unix_time()) {
            tracing::error!(%err, "emitter cycle failed");
        }

        tokio::time::sleep(RUN_INTERVAL.saturating_sub(started.elapsed())).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use reputation::{Digest, Kind, Mutation};

    fn digest(i: u8) -> Digest {
        Digest([i; 20])
    }

    fn seeded_store(dir: &Path) -> Store {
        let mut store = Store::open(dir, &Options::default()).unwrap();
        for i in 1..=4u8 {
            store
                .apply(&Mutation::new(digest(i), Kind::Report, 1000 * i as u32))
                .unwrap();
        }
        store
    }

    fn read_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_first_cycle_cuts_a_snapshot_with_current_link() {
        let store_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = seeded_store(store_dir.path());

        let emitter = Emitter::new(root.path()).unwrap();
        emitter.run_once(&store, 50_000).unwrap();

        let snapshots = root.path().join("snapshots");
        assert_eq!(read_names(&snapshots), vec!["0000049999", "current"]);

        // `current` is a hard link to the snapshot, byte for byte.
        assert_eq!(
            std::fs::read(snapshots.join("0000049999")).unwrap(),
            std::fs::read(snapshots.join("current")).unwrap()
        );

        // The snapshot round-trips through the dump codec.
        let file = std::fs::File::open(snapshots.join("current")).unwrap();
        let mut reader = dump::Reader::new(file).unwrap();
        let mut n = 0;
        while reader.next().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 4);
    }

    #[test]
    fn test_second_cycle_cuts_a_delta_not_a_snapshot() {
        let store_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut store = seeded_store(store_dir.path());

        let emitter = Emitter::new(root.path()).unwrap();
        emitter.run_once(&store, 50_000).unwrap();

        // A record changes between cycles.
        store
            .apply(&Mutation::new(digest(9), Kind::Report, 50_100))
            .unwrap();

        emitter.run_once(&store, 50_300).unwrap();

        let updates = root.path().join("updates");
        assert_eq!(read_names(&updates), vec!["00000499990000050299"]);

        // The delta resumes from the snapshot and holds only the change.
        let file = std::fs::File::open(updates.join("00000499990000050299")).unwrap();
        let mut reader = dump::Reader::new(file).unwrap();
        let (d, r) = reader.next().unwrap().unwrap();
        assert_eq!(d, digest(9));
        assert_eq!(r.updated, 50_100);
        assert!(reader.next().unwrap().is_none());

        // The next delta resumes from the previous one.
        emitter.run_once(&store, 50_600).unwrap();
        assert_eq!(
            read_names(&updates),
            vec!["00000499990000050299", "00000502990000050599"]
        );
    }

    #[test]
    fn test_expiry_removes_stale_snapshots_and_orphan_updates() {
        let store_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let store = seeded_store(store_dir.path());
        let emitter = Emitter::new(root.path()).unwrap();

        let t0 = 100_000;
        emitter.run_once(&store, t0).unwrap(); // First snapshot.
        emitter.run_once(&store, t0 + 300).unwrap(); // First delta.
        let t_snap2 = t0 + 5 * 60 * 60;
        emitter.run_once(&store, t_snap2).unwrap(); // Second snapshot.
        emitter.run_once(&store, t_snap2 + 300).unwrap(); // Second delta.

        // Eleven hours after t0 the first snapshot has aged out, taking
        // the delta older than the oldest surviving snapshot with it.
        let t1 = t0 + 11 * 60 * 60;
        emitter.run_once(&store, t1).unwrap();

        let snapshots = read_names(&root.path().join("snapshots"));
        assert_eq!(
            snapshots,
            vec![
                dir::snapshot_name(t_snap2 - 1),
                dir::snapshot_name(t1 - 1),
                "current".to_string(),
            ]
        );
        assert_eq!(
            read_names(&root.path().join("updates")),
            vec![dir::update_name(t0 + 299, t_snap2 + 299)]
        );
    }
}
