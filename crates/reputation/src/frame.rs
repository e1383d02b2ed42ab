//! Tagged framing for the replication and forwarding channels.
//!
//! Every frame opens with a big-endian u32 tag so that heartbeats can never
//! be confused with the leading bytes of a fixed-size record.

use super::mutation::DecodeMutationError;
use super::{Digest, Mutation, Record, MUTATION_WIRE_SIZE};

/// Heartbeat, sent by either peer every three seconds. Carries no payload.
pub const TAG_HEARTBEAT: u32 = 0x4242_4242;
/// A forwarded mutation ("PYZM"), followed by the 28-byte mutation.
pub const TAG_MUTATION: u32 = 0x5059_5a4d;
/// A replicated post-image put ("PYZR"), followed by digest and record.
pub const TAG_PUT: u32 = 0x5059_5a52;

const PUT_WIRE_SIZE: usize = Digest::SIZE + Record::WIRE_SIZE;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Frame {
    Heartbeat,
    Mutation(Mutation),
    Put(Digest, Record),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("unknown frame tag {0:#010x}")]
    UnknownTag(u32),
    #[error(transparent)]
    Mutation(#[from] DecodeMutationError),
}

impl Frame {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Heartbeat => buf.extend_from_slice(&TAG_HEARTBEAT.to_be_bytes()),
            Frame::Mutation(m) => {
                buf.extend_from_slice(&TAG_MUTATION.to_be_bytes());
                buf.extend_from_slice(&m.encode());
            }
            Frame::Put(digest, record) => {
                buf.extend_from_slice(&TAG_PUT.to_be_bytes());
                buf.extend_from_slice(digest.as_bytes());
                buf.extend_from_slice(&record.encode());
            }
        }
    }

    /// Decode all complete frames contained within `buffer`.
    /// The unconsumed remainder is either empty or holds a partial frame
    /// which has not yet been fully read.
    pub fn decode(buffer: &mut Vec<u8>) -> Result<Vec<Frame>, Error> {
        let mut buf = buffer.as_slice();
        let mut consumed = 0;
        let mut out = Vec::new();

        loop {
            if buf.len() < 4 {
                break;
            }
            let tag = u32::from_be_bytes(buf[0..4].try_into().unwrap());

            let bound = match tag {
                TAG_HEARTBEAT => 4,
                TAG_MUTATION => 4 + MUTATION_WIRE_SIZE,
                TAG_PUT => 4 + PUT_WIRE_SIZE,
                unknown => return Err(Error::UnknownTag(unknown)),
            };
            if buf.len() < bound {
                break;
            }

            out.push(match tag {
                TAG_HEARTBEAT => Frame::Heartbeat,
                TAG_MUTATION => Frame::Mutation(Mutation::decode(&buf[4..bound])?),
                _ => {
                    let digest = Digest::try_from(&buf[4..4 + Digest::SIZE]).unwrap();
                    let record = Record::decode(buf[4 + Digest::SIZE..bound].try_into().unwrap());
                    Frame::Put(digest, record)
                }
            });
            consumed += bound;
            buf = &buf[bound..];
        }

        // Shift the unconsumed remainder to the front.
        let len = buffer.len();
        if consumed != 0 && consumed != len {
            buffer.copy_within(consumed..len, 0);
        }
        buffer.truncate(len - consumed);

        Ok(out)
    }
}
