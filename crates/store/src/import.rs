//! Batched bootstrap import: raw puts grouped into large transactions,
//! without per-record read-modify-write.

use super::{put_in, Error, Store};
use reputation::{Digest, Record};
use rusqlite::TransactionBehavior;

/// Records per import transaction. Callers guarantee no duplicate digests
/// within a batch.
pub const IMPORT_BATCH_SIZE: usize = 25_000;

impl Store {
    /// Insert `entries` in transactions of up to [`IMPORT_BATCH_SIZE`]
    /// records, reporting progress after each commit. Later duplicates
    /// overwrite earlier ones. Returns the number of records written.
    pub fn import<I, E>(
        &mut self,
        entries: I,
        mut progress: impl FnMut(usize),
    ) -> Result<usize, Error>
    where
        I: IntoIterator<Item = Result<(Digest, Record), E>>,
        Error: From<E>,
    {
        let mut entries = entries.into_iter();
        let mut total = 0;

        loop {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut in_batch = 0;
            while in_batch < IMPORT_BATCH_SIZE {
                let Some(entry) = entries.next() else { break };
                let (digest, record) = entry?;
                put_in(&tx, &digest, &record)?;
                in_batch += 1;
            }

            if in_batch == 0 {
                // An empty trailing transaction has nothing to commit.
                break;
            }
            tx.commit()?;

            total += in_batch;
            progress(total);

            if in_batch < IMPORT_BATCH_SIZE {
                break;
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Options;
    use std::convert::Infallible;

    fn entry(i: u32) -> (Digest, Record) {
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&i.to_be_bytes());
        let mut record = Record::default();
        record.report(1000 + i);
        (Digest(bytes), record)
    }

    #[test]
    fn test_import_overwrites_duplicates_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path(), &Options::default()).unwrap();

        let first = (0..100).map(entry).map(Ok::<_, Infallible>);
        assert_eq!(store.import(first, |_| ()).unwrap(), 100);

        // A second import of ten of the same digests with later times wins.
        let second = (0..10)
            .map(|i| {
                let (digest, mut record) = entry(i);
                record.report(9000);
                Ok::<_, Infallible>((digest, record))
            })
            .collect::<Vec<_>>();
        assert_eq!(store.import(second, |_| ()).unwrap(), 10);

        assert_eq!(store.len().unwrap(), 100);
        assert_eq!(store.get(&entry(3).0).unwrap().unwrap().updated, 9000);
        assert_eq!(store.get(&entry(50).0).unwrap().unwrap().updated, 1050);
    }

    #[test]
    fn test_progress_reports_cumulative_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path(), &Options::default()).unwrap();

        let mut seen = Vec::new();
        store
            .import((0..10).map(entry).map(Ok::<_, Infallible>), |n| seen.push(n))
            .unwrap();
        assert_eq!(seen, vec![10]);
    }
}
