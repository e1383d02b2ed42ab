//! Periodic snapshot/delta artifacts and their consumer.
//!
//! The emitter maintains `<root>/snapshots/` and `<root>/updates/`:
//! gzipped full dumps named by timestamp, a `current` hard link, and
//! incremental deltas covering a window of the time index. The consumer
//! ingests those artifacts into a stand-alone store.

pub mod dir;

mod emitter;
pub use emitter::{run_emitter, Emitter};

mod consume;
pub use consume::{export_window, import_dump, ingest_directory, IngestReport};
