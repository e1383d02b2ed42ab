//! The expiry pass: walk the time index from the persisted watermark and
//! reset stale single-report records.

use super::{put_in, row_to_digest, row_to_record_at, Error, Store};
use rusqlite::{params, TransactionBehavior};
use std::io::{Read, Write};
use std::path::Path;

/// Cap on resets per pass, keeping each transaction (and its lock
/// footprint) bounded.
pub const MAX_RESETS_PER_PASS: usize = 3600;

#[derive(Debug, Default, PartialEq)]
pub struct ExpirePass {
    /// Records reset by this pass.
    pub reset: usize,
    /// The last `updated` value seen by the walk; the next watermark.
    pub last_seen: Option<u32>,
    /// Whether the pass stopped at the cap rather than the horizon.
    pub hit_cap: bool,
}

impl Store {
    /// Run one expiry pass over `updated` in `[from, to)`, resetting records
    /// with at most one report. Confirmed records (two or more reports)
    /// are never expired. Each reset rewrites the primary record, which
    /// moves its index entry in the same transaction.
    pub fn expire_pass(&mut self, from: u32, to: u32, now: u32) -> Result<ExpirePass, Error> {
        if self.read_only {
            return Err(Error::Corrupt("expiry requires a writable store".to_string()));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut pass = ExpirePass::default();

        {
            let mut stmt = tx.prepare_cached(
                "SELECT digest, entered, updated, report_count, report_entered, report_updated,
                        whitelist_count, whitelist_entered, whitelist_updated
                 FROM signatures WHERE updated >= ?1 AND updated < ?2 ORDER BY updated ASC",
            )?;
            let mut rows = stmt.query(params![from, to])?;

            let mut resets = Vec::new();
            while let Some(row) = rows.next()? {
                let record = row_to_record_at(row, 1)?;
                pass.last_seen = Some(record.updated);

                if record.report_count <= 1 {
                    resets.push((row_to_digest(row)?, record));
                    if resets.len() == MAX_RESETS_PER_PASS {
                        pass.hit_cap = true;
                        break;
                    }
                }
            }
            drop(rows);
            drop(stmt);

            for (digest, mut record) in resets {
                record.reset(now);
                put_in(&tx, &digest, &record)?;
                pass.reset += 1;
            }
        }

        tx.commit()?;
        Ok(pass)
    }
}

/// Read the persisted expiry watermark at `<home>/expire_status`, a single
/// big-endian u32. Absent file means "start from zero".
pub fn read_watermark(home: &Path) -> std::io::Result<Option<u32>> {
    let path = home.join("expire_status");
    match std::fs::File::open(&path) {
        Ok(mut file) => {
            let mut buf = [0u8; 4];
            file.read_exact(&mut buf)?;
            Ok(Some(u32::from_be_bytes(buf)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Persist the expiry watermark. Written through a temporary sibling so a
/// torn write cannot corrupt the previous value.
pub fn write_watermark(home: &Path, watermark: u32) -> std::io::Result<()> {
    let path = home.join("expire_status");
    let tmp = home.join("expire_status.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&watermark.to_be_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)
}
