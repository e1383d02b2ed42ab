//! The persistent signature store: a durable mapping from 20-byte digest to
//! reputation record, with a secondary index on last-modified time.
//!
//! One SQLite database in WAL mode holds both the primary table and the
//! `updated` index, so every put maintains the index under the same
//! transaction. `synchronous=NORMAL` elides the per-commit fsync; the
//! periodic checkpoint bounds the window of possible loss.

use reputation::{Digest, Kind, Mutation, Record, RETENTION_SECONDS};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
pub use error::Error;

mod expire;
pub use expire::{read_watermark, write_watermark, ExpirePass, MAX_RESETS_PER_PASS};

mod import;
pub use import::IMPORT_BATCH_SIZE;

/// How many times a read-modify-write is retried when it loses a lock
/// fight before the failure is surfaced as transient.
const APPLY_RETRIES: usize = 3;

/// Store tuning knobs. Defaults mirror a small front-end deployment;
/// masters and importers raise the cache.
#[derive(Clone, Debug)]
pub struct Options {
    /// Page cache budget in bytes.
    pub cache_size: usize,
    /// Database page size. Only effective for newly created stores.
    pub page_size: u32,
    /// How long a transaction waits on a lock before reporting Busy.
    pub busy_timeout: Duration,
    /// Optional at-rest encryption key, applied as a key pragma before any
    /// other statement. Opening an encrypted store without the right key
    /// surfaces `Corrupt`.
    pub encryption_key: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_size: 8 << 20,
            page_size: 4096,
            busy_timeout: Duration::from_secs(5),
            encryption_key: None,
        }
    }
}

impl Options {
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }
}

#[derive(Debug)]
pub struct Store {
    conn: Connection,
    home: PathBuf,
    read_only: bool,
}

impl Store {
    /// Open (creating if needed) the store under `<home>/db/`.
    pub fn open(home: &Path, options: &Options) -> Result<Self, Error> {
        let db_dir = home.join("db");
        std::fs::create_dir_all(&db_dir)?;

        let conn = Connection::open(db_dir.join("signatures.sqlite"))?;
        configure(&conn, options, false)?;

        Ok(Self {
            conn,
            home: home.to_owned(),
            read_only: false,
        })
    }

    /// Open an existing store read-only. Returns `Unavailable` while the
    /// database has not been created by its writer yet.
    pub fn open_read_only(home: &Path, options: &Options) -> Result<Self, Error> {
        let path = home.join("db").join("signatures.sqlite");
        if !path.exists() {
            return Err(Error::Unavailable);
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        configure(&conn, options, true)?;

        Ok(Self {
            conn,
            home: home.to_owned(),
            read_only: true,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Point lookup, reset records included.
    pub fn get(&self, digest: &Digest) -> Result<Option<Record>, Error> {
        let record = self
            .conn
            .query_row(
                "SELECT entered, updated, report_count, report_entered, report_updated,
                        whitelist_count, whitelist_entered, whitelist_updated
                 FROM signatures WHERE digest = ?1",
                [digest.as_bytes().as_slice()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Public presence check: a record counts as present while either
    /// counter is non-zero.
    pub fn lookup_active(&self, digest: &Digest) -> Result<Option<Record>, Error> {
        Ok(self.get(digest)?.filter(Record::is_active))
    }

    /// Strict presence check requiring both counters to be non-zero. The
    /// HTTP API collaborator expects these semantics; do not unify with
    /// `lookup_active` without product input.
    pub fn lookup_strict(&self, digest: &Digest) -> Result<Option<Record>, Error> {
        Ok(self
            .get(digest)?
            .filter(|r| r.report_count != 0 && r.whitelist_count != 0))
    }

    /// Upsert one record in its own transaction. The replication applier
    /// uses this to install post-images in commit order.
    pub fn put(&mut self, digest: &Digest, record: &Record) -> Result<(), Error> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        put_in(&tx, digest, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Apply one mutation as a read-modify-write transaction, retrying a
    /// bounded number of times on lock contention. Returns the post-image.
    pub fn apply(&mut self, mutation: &Mutation) -> Result<Record, Error> {
        let mut attempt = 0;
        loop {
            match self.try_apply(mutation) {
                Err(err) if err.is_transient() && attempt + 1 < APPLY_RETRIES => {
                    attempt += 1;
                    tracing::debug!(digest = %mutation.digest, attempt, "retrying contended mutation");
                }
                other => return other,
            }
        }
    }

    fn try_apply(&mut self, mutation: &Mutation) -> Result<Record, Error> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = tx
            .query_row(
                "SELECT entered, updated, report_count, report_entered, report_updated,
                        whitelist_count, whitelist_entered, whitelist_updated
                 FROM signatures WHERE digest = ?1",
                [mutation.digest.as_bytes().as_slice()],
                row_to_record,
            )
            .optional()?
            .unwrap_or_default();

        match mutation.kind {
            Kind::Report => record.report(mutation.time),
            Kind::Whitelist => record.whitelist(mutation.time),
            Kind::Erase => record.reset(mutation.time),
        }

        put_in(&tx, &mutation.digest, &record)?;
        tx.commit()?;
        Ok(record)
    }

    /// Visit records with `updated` in `[from, to]` in ascending `updated`
    /// order, ties enumerated exhaustively. Returns the visit count.
    pub fn scan_updated(
        &self,
        from: u32,
        to: u32,
        mut visit: impl FnMut(Digest, Record),
    ) -> Result<usize, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT digest, entered, updated, report_count, report_entered, report_updated,
                    whitelist_count, whitelist_entered, whitelist_updated
             FROM signatures WHERE updated >= ?1 AND updated <= ?2 ORDER BY updated ASC",
        )?;
        let mut rows = stmt.query(params![from, to])?;

        let mut n = 0;
        while let Some(row) = rows.next()? {
            visit(row_to_digest(row)?, row_to_record_at(row, 1)?);
            n += 1;
        }
        Ok(n)
    }

    /// Visit every record in unspecified order, suitable for full dumps.
    pub fn scan_all(&self, mut visit: impl FnMut(Digest, Record)) -> Result<usize, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT digest, entered, updated, report_count, report_entered, report_updated,
                    whitelist_count, whitelist_entered, whitelist_updated
             FROM signatures",
        )?;
        let mut rows = stmt.query([])?;

        let mut n = 0;
        while let Some(row) = rows.next()? {
            visit(row_to_digest(row)?, row_to_record_at(row, 1)?);
            n += 1;
        }
        Ok(n)
    }

    /// The largest `updated` value present, via the time index.
    pub fn last_updated(&self) -> Result<Option<u32>, Error> {
        let max: Option<u32> =
            self.conn
                .query_row("SELECT MAX(updated) FROM signatures", [], |row| row.get(0))?;
        Ok(max)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        let any: Option<i64> =
            self.conn
                .query_row("SELECT 1 FROM signatures LIMIT 1", [], |row| row.get(0))
                .optional()?;
        Ok(any.is_none())
    }

    pub fn len(&self) -> Result<u64, Error> {
        let n: u64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM signatures", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Flush the write-ahead log into the main database file and truncate
    /// it. Safe to run concurrently with readers.
    pub fn checkpoint(&self) -> Result<(), Error> {
        let (busy, log, moved): (i64, i64, i64) = self.conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if busy != 0 {
            tracing::debug!(log, moved, "checkpoint skipped while a reader held the log");
            return Err(Error::Busy);
        }
        tracing::debug!(log, moved, "checkpointed write-ahead log");
        Ok(())
    }

    /// Whether the public front-end should report this record as absent:
    /// a single never-confirmed report older than the retention horizon.
    pub fn is_publicly_hidden(record: &Record, now: u32) -> bool {
        record.report_count == 1 && now.saturating_sub(record.entered) > RETENTION_SECONDS
    }
}

fn configure(conn: &Connection, options: &Options, read_only: bool) -> Result<(), Error> {
    // The key pragma must come first; it is a no-op without an encrypting
    // build, where a previously-encrypted file then fails the read probe.
    if let Some(key) = &options.encryption_key {
        conn.pragma_update(None, "key", key)?;
    }

    if !read_only {
        conn.pragma_update(None, "page_size", options.page_size)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(Error::Corrupt(format!(
                "store requires WAL journaling, got {mode}"
            )));
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }

    conn.busy_timeout(options.busy_timeout)?;
    // Negative cache_size is a KiB budget rather than a page count.
    conn.pragma_update(None, "cache_size", -((options.cache_size as i64) / 1024))?;

    // Probe readability before anything else touches the file, so that a
    // wrong or missing key surfaces as Corrupt here.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |_| Ok(()))?;

    if !read_only {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signatures (
                 digest            BLOB PRIMARY KEY,
                 entered           INTEGER NOT NULL,
                 updated           INTEGER NOT NULL,
                 report_count      INTEGER NOT NULL,
                 report_entered    INTEGER NOT NULL,
                 report_updated    INTEGER NOT NULL,
                 whitelist_count   INTEGER NOT NULL,
                 whitelist_entered INTEGER NOT NULL,
                 whitelist_updated INTEGER NOT NULL
             ) WITHOUT ROWID;
             CREATE INDEX IF NOT EXISTS signatures_updated ON signatures (updated);",
        )?;
    }

    Ok(())
}

fn put_in(conn: &Connection, digest: &Digest, record: &Record) -> Result<(), Error> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO signatures
             (digest, entered, updated, report_count, report_entered, report_updated,
              whitelist_count, whitelist_entered, whitelist_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        digest.as_bytes().as_slice(),
        record.entered,
        record.updated,
        record.report_count,
        record.report_entered,
        record.report_updated,
        record.whitelist_count,
        record.whitelist_entered,
        record.whitelist_updated,
    ])?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    row_to_record_at(row, 0)
}

fn row_to_record_at(row: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<Record> {
    Ok(Record {
        entered: row.get(base)?,
        updated: row.get(base + 1)?,
        report_count: row.get(base + 2)?,
        report_entered: row.get(base + 3)?,
        report_updated: row.get(base + 4)?,
        whitelist_count: row.get(base + 5)?,
        whitelist_entered: row.get(base + 6)?,
        whitelist_updated: row.get(base + 7)?,
    })
}

fn row_to_digest(row: &rusqlite::Row<'_>) -> rusqlite::Result<Digest> {
    let bytes: Vec<u8> = row.get(0)?;
    Digest::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            "digest column is not 20 bytes".into(),
        )
    })
}
