mod digest;
pub use digest::{Digest, ParseDigestError};

mod record;
pub use record::{Record, RETENTION_SECONDS};

mod mutation;
pub use mutation::{DecodeMutationError, Kind, Mutation, MUTATION_WIRE_SIZE};

pub mod frame;
pub use frame::Frame;

pub mod dump;

mod stats;
pub use stats::StatisticsRing;

/// Seconds since the epoch, truncated to the u32 range every wire format
/// and on-disk timestamp uses.
pub fn unix_time() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}
