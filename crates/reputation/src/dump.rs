//! The dump codec: the gzip-compressed record stream used by snapshots,
//! deltas and bootstrap imports.
//!
//! Layout is a 4-byte big-endian version header followed by raw
//! `digest || record` entries. There is no length framing and no trailer;
//! EOF ends the stream and a partial trailing entry is treated as EOF.

use super::{Digest, Record};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

pub const VERSION: u32 = 2;

const ENTRY_SIZE: usize = Digest::SIZE + Record::WIRE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported dump version {0}")]
    UnsupportedVersion(u32),
    #[error("dump is missing its version header")]
    MissingHeader,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Writes a versioned, gzipped record stream.
pub struct Writer<W: Write> {
    inner: GzEncoder<W>,
    written: usize,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> io::Result<Self> {
        let mut inner = GzEncoder::new(out, Compression::default());
        inner.write_all(&VERSION.to_be_bytes())?;
        Ok(Self { inner, written: 0 })
    }

    pub fn write(&mut self, digest: &Digest, record: &Record) -> io::Result<()> {
        self.inner.write_all(digest.as_bytes())?;
        self.inner.write_all(&record.encode())?;
        self.written += 1;
        Ok(())
    }

    /// Flush the gzip trailer and return the sink with the entry count.
    pub fn finish(self) -> io::Result<(W, usize)> {
        Ok((self.inner.finish()?, self.written))
    }
}

/// Reads a versioned, gzipped record stream.
#[derive(Debug)]
pub struct Reader<R: Read> {
    inner: GzDecoder<R>,
}

impl<R: Read> Reader<R> {
    pub fn new(source: R) -> Result<Self, Error> {
        let mut inner = GzDecoder::new(source);

        let mut header = [0u8; 4];
        fill(&mut inner, &mut header)?.ok_or(Error::MissingHeader)?;
        let version = u32::from_be_bytes(header);
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        Ok(Self { inner })
    }

    /// The next entry, or None at end-of-stream. A truncated final entry
    /// also ends the stream.
    pub fn next(&mut self) -> Result<Option<(Digest, Record)>, Error> {
        let mut entry = [0u8; ENTRY_SIZE];
        match fill(&mut self.inner, &mut entry)? {
            Some(()) => {
                let digest = Digest::try_from(&entry[..Digest::SIZE]).unwrap();
                let record = Record::decode(entry[Digest::SIZE..].try_into().unwrap());
                Ok(Some((digest, record)))
            }
            None => Ok(None),
        }
    }
}

// Fill `buf` completely, or report clean EOF as None. EOF part-way through
// the buffer is also None, per the partial-trailing-entry rule.
fn fill(r: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(()))
}
