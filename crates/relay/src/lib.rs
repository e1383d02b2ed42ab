//! The replication transport: a single-leader protocol carrying forwarded
//! mutations upstream and committed post-images downstream, with
//! heartbeats on every channel.

use std::time::Duration;

pub mod master;
pub use master::Pipeline;

pub mod slave;
pub use slave::{Applier, Forwarder};

/// Channel timing. The defaults are the protocol constants; tests shrink
/// them to keep reconnect scenarios fast.
#[derive(Clone, Debug)]
pub struct Config {
    /// Heartbeat cadence on every connection, both directions.
    pub heartbeat_interval: Duration,
    /// A connection whose peer is silent this long is closed.
    pub read_idle_timeout: Duration,
    /// Delay between reconnect attempts after a failure.
    pub reconnect_delay: Duration,
    /// Delay between attempts to open a not-yet-materialized store.
    pub bootstrap_retry: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            read_idle_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            bootstrap_retry: Duration::from_secs(30),
        }
    }
}
