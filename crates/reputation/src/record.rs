/// Records with a single report older than this horizon are hidden from
/// public checks and eventually reset by the expiry loop.
pub const RETENTION_SECONDS: u32 = 3 * 28 * 86400;

/// The reputation counters kept for one digest. All times are seconds since
/// the epoch and zero means "never". A record is serialized as eight
/// big-endian u32 values, 32 bytes total.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Record {
    pub entered: u32,
    pub updated: u32,
    pub report_count: u32,
    pub report_entered: u32,
    pub report_updated: u32,
    pub whitelist_count: u32,
    pub whitelist_entered: u32,
    pub whitelist_updated: u32,
}

impl Record {
    pub const WIRE_SIZE: usize = 32;

    /// Count one spam report observed at time `t`.
    pub fn report(&mut self, t: u32) {
        self.report_count = self.report_count.wrapping_add(1);
        if self.report_entered == 0 {
            self.report_entered = t;
        }
        self.report_updated = self.report_updated.max(t);
        self.touch(t);
    }

    /// Count one ham (whitelist) report observed at time `t`.
    pub fn whitelist(&mut self, t: u32) {
        self.whitelist_count = self.whitelist_count.wrapping_add(1);
        if self.whitelist_entered == 0 {
            self.whitelist_entered = t;
        }
        self.whitelist_updated = self.whitelist_updated.max(t);
        self.touch(t);
    }

    /// Reset is a tombstone, not a delete: counts and per-kind update times
    /// are cleared but `entered` is preserved, and `updated` moves to the
    /// reset time so the record re-sorts to the head of the time index.
    pub fn reset(&mut self, t: u32) {
        self.report_count = 0;
        self.whitelist_count = 0;
        self.report_updated = 0;
        self.whitelist_updated = 0;
        self.updated = t;
    }

    fn touch(&mut self, t: u32) {
        if self.entered == 0 {
            self.entered = t;
        }
        self.updated = self.updated.max(t);
    }

    /// A record reads as absent once both counters are zero, which is how
    /// reset records disappear without being deleted.
    pub fn is_active(&self) -> bool {
        self.report_count != 0 || self.whitelist_count != 0
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        for (slot, value) in out.chunks_exact_mut(4).zip([
            self.entered,
            self.updated,
            self.report_count,
            self.report_entered,
            self.report_updated,
            self.whitelist_count,
            self.whitelist_entered,
            self.whitelist_updated,
        ]) {
            slot.copy_from_slice(&value.to_be_bytes());
        }
        out
    }

    pub fn decode(wire: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut fields = [0u32; 8];
        for (field, chunk) in fields.iter_mut().zip(wire.chunks_exact(4)) {
            *field = u32::from_be_bytes(chunk.try_into().unwrap());
        }
        let [entered, updated, report_count, report_entered, report_updated, whitelist_count, whitelist_entered, whitelist_updated] =
            fields;
        Self {
            entered,
            updated,
            report_count,
            report_entered,
            report_updated,
            whitelist_count,
            whitelist_entered,
            whitelist_updated,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_report_stamps_every_time_field() {
        let mut r = Record::default();
        r.report(1000);

        assert_eq!(r.entered, 1000);
        assert_eq!(r.updated, 1000);
        assert_eq!(r.report_count, 1);
        assert_eq!(r.report_entered, 1000);
        assert_eq!(r.report_updated, 1000);
        assert_eq!(r.whitelist_count, 0);
    }

    #[test]
    fn test_counts_accumulate_and_updated_is_monotone() {
        let mut r = Record::default();
        for t in [1000, 900, 1500] {
            r.report(t);
        }
        assert_eq!(r.report_count, 3);
        assert_eq!(r.entered, 1000); // First observation wins.
        assert_eq!(r.updated, 1500);
        assert_eq!(r.report_updated, 1500);
    }

    #[test]
    fn test_whitelist_then_report() {
        let mut r = Record::default();
        r.whitelist(1000);
        r.report(1500);

        assert_eq!(r.report_count, 1);
        assert_eq!(r.whitelist_count, 1);
        assert_eq!(r.entered, 1000);
        assert_eq!(r.updated, 1500);
        assert_eq!(r.whitelist_entered, 1000);
        assert_eq!(r.report_entered, 1500);
    }

    #[test]
    fn test_entered_zero_iff_never_mutated() {
        let r = Record::default();
        assert_eq!(r.entered, 0);
        assert!(!r.is_active());

        let mut r = Record::default();
        r.whitelist(7);
        assert_ne!(r.entered, 0);
        assert!(r.is_active());
    }

    #[test]
    fn test_reset_preserves_entered() {
        let mut r = Record::default();
        r.report(1000);
        r.report(1200);
        r.whitelist(1300);
        r.reset(2000);

        assert_eq!(r.report_count, 0);
        assert_eq!(r.whitelist_count, 0);
        assert_eq!(r.report_updated, 0);
        assert_eq!(r.whitelist_updated, 0);
        assert_eq!(r.updated, 2000);
        assert_eq!(r.entered, 1000);
        assert_eq!(r.report_entered, 1000);
        assert!(!r.is_active());
    }

    #[test]
    fn test_wire_round_trip() {
        let mut r = Record::default();
        r.report(123456789);
        r.whitelist(123456790);

        assert_eq!(Record::decode(&r.encode()), r);

        // Field order and endianness on the wire.
        let wire = r.encode();
        assert_eq!(&wire[0..4], &123456789u32.to_be_bytes()); // entered
        assert_eq!(&wire[4..8], &123456790u32.to_be_bytes()); // updated
        assert_eq!(&wire[8..12], &1u32.to_be_bytes()); // report_count
    }
}
