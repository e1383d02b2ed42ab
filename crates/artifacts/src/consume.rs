//! The delta consumer: feeds third-party snapshots and updates into a
//! stand-alone store, in bounded transactional batches.

use crate::dir;
use anyhow::Context;
use reputation::dump;
use std::path::Path;
use store::Store;

/// Stream one dump file into the store. Returns the record count.
pub fn import_dump(
    store: &mut Store,
    path: &Path,
    progress: impl FnMut(usize),
) -> anyhow::Result<usize> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening dump {}", path.display()))?;
    let mut reader = dump::Reader::new(std::io::BufReader::new(file))
        .with_context(|| format!("reading dump header of {}", path.display()))?;

    let entries = std::iter::from_fn(|| reader.next().transpose());
    let n = store
        .import(entries, progress)
        .with_context(|| format!("importing {}", path.display()))?;
    Ok(n)
}

/// Dump records with `updated` in `[min, max]` into `sink`, as the export
/// tool does for operator-driven backups.
pub fn export_window(
    store: &Store,
    sink: impl std::io::Write,
    min: u32,
    max: u32,
) -> anyhow::Result<usize> {
    let mut writer = dump::Writer::new(sink)?;

    // Stop at the first failed entry write; carrying on after a torn
    // entry would misalign the rest of the stream.
    let mut failed = None;
    store.scan_all(|digest, record| {
        if failed.is_none() && record.updated >= min && record.updated <= max {
            failed = writer.write(&digest, &record).err();
        }
    })?;
    if let Some(err) = failed {
        return Err(err).context("writing dump entries");
    }

    let (_, written) = writer.finish()?;
    Ok(written)
}

#[derive(Debug, Default, PartialEq)]
pub struct IngestReport {
    pub snapshot_records: usize,
    pub updates_applied: usize,
    pub update_records: usize,
}

/// Bring a stand-alone store up to date from an artifact directory:
/// bootstrap an empty store from the newest snapshot, then apply every
/// update at or after the store's own high-water mark, oldest first.
pub fn ingest_directory(store: &mut Store, root: &Path) -> anyhow::Result<IngestReport> {
    let mut report = IngestReport::default();

    if store.is_empty()? {
        let Some((snapshot, ts)) = dir::newest_snapshot(&root.join("snapshots"))? else {
            anyhow::bail!("no snapshot to bootstrap from in {}", root.display());
        };
        report.snapshot_records = import_dump(store, &snapshot, |n| {
            tracing::info!(n, "bootstrapping from snapshot");
        })?;
        tracing::info!(ts, records = report.snapshot_records, "snapshot ingested");
    }

    let high_water = store.last_updated()?.unwrap_or(0);

    let mut updates = dir::list_updates(&root.join("updates"))?;
    updates.sort_by_key(|(_, from, to)| (*from, *to));

    for (path, from, _to) in updates {
        // Updates entirely behind our own state carry nothing new.
        if from < high_water {
            continue;
        }
        report.update_records += import_dump(store, &path, |_| ())?;
        report.updates_applied += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Emitter;
    use reputation::{Digest, Kind, Mutation};
    use store::Options;

    fn digest(i: u8) -> Digest {
        Digest([i; 20])
    }

    /// Snapshot plus delta from one store, ingested into another, leaves
    /// the two stores equal as mappings.
    #[test]
    fn test_snapshot_and_delta_round_trip() {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();

        let mut source = Store::open(source_dir.path(), &Options::default()).unwrap();
        for i in 1..=30u8 {
            source
                .apply(&Mutation::new(digest(i), Kind::Report, 1000 + i as u32))
                .unwrap();
        }

        let emitter = Emitter::new(root.path()).unwrap();
        emitter.run_once(&source, 50_000).unwrap();

        // Ten records change after the snapshot; the next cycle deltas them.
        for i in 1..=10u8 {
            source
                .apply(&Mutation::new(digest(i), Kind::Report, 60_000 + i as u32))
                .unwrap();
        }
        emitter.run_once(&source, 60_500).unwrap();

        let mut target = Store::open(target_dir.path(), &Options::default()).unwrap();
        let report = ingest_directory(&mut target, root.path()).unwrap();
        assert_eq!(report.snapshot_records, 30);
        assert_eq!(report.updates_applied, 1);
        assert_eq!(report.update_records, 10);

        for i in 1..=30u8 {
            assert_eq!(
                source.get(&digest(i)).unwrap(),
                target.get(&digest(i)).unwrap(),
                "digest {i} diverged"
            );
        }
        assert_eq!(target.get(&digest(5)).unwrap().unwrap().report_count, 2);
        assert_eq!(target.len().unwrap(), 30);
    }

    /// A second ingest pass skips updates already reflected in the store.
    #[test]
    fn test_reingest_skips_stale_updates() {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();

        let mut source = Store::open(source_dir.path(), &Options::default()).unwrap();
        source
            .apply(&Mutation::new(digest(1), Kind::Report, 1000))
            .unwrap();

        let emitter = Emitter::new(root.path()).unwrap();
        emitter.run_once(&source, 50_000).unwrap();

        source
            .apply(&Mutation::new(digest(2), Kind::Report, 60_000))
            .unwrap();
        emitter.run_once(&source, 60_500).unwrap();

        let mut target = Store::open(target_dir.path(), &Options::default()).unwrap();
        let first = ingest_directory(&mut target, root.path()).unwrap();
        assert_eq!(first.updates_applied, 1);

        let second = ingest_directory(&mut target, root.path()).unwrap();
        assert_eq!(second, IngestReport::default());
    }

    #[test]
    fn test_export_window_filters_by_updated() {
        let source_dir = tempfile::tempdir().unwrap();
        let mut source = Store::open(source_dir.path(), &Options::default()).unwrap();
        for (i, t) in [(1u8, 100u32), (2, 200), (3, 300)] {
            source.apply(&Mutation::new(digest(i), Kind::Report, t)).unwrap();
        }

        let mut encoded = Vec::new();
        let written = export_window(&source, &mut encoded, 150, 250).unwrap();
        assert_eq!(written, 1);

        let mut reader = dump::Reader::new(encoded.as_slice()).unwrap();
        let (d, r) = reader.next().unwrap().unwrap();
        assert_eq!(d, digest(2));
        assert_eq!(r.updated, 200);
        assert!(reader.next().unwrap().is_none());
    }
}
