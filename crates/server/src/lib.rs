//! The Pyzor UDP front-end: parses text-protocol datagrams, answers
//! checks from a read-only store view, and relays reports upstream.

mod packet;
pub use packet::{Packet, ParseError, MAX_PACKET_SIZE};

mod udp;
pub use udp::{Frontend, MutationSink, ServerOutcome};
