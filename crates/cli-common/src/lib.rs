//! Helpers shared by all pyzord executables.

mod logging;

pub use logging::{init_logging, LogArgs, LogFormat};
