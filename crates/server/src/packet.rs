//! The Pyzor v2.0 text packet: newline-separated `Name: value` lines, one
//! request or response per datagram.

use reputation::Digest;
use std::collections::BTreeMap;

/// Largest datagram accepted or produced.
pub const MAX_PACKET_SIZE: usize = 8192;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Packet {
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("packet is not valid UTF-8")]
    NotText,
    #[error("packet is missing a required header")]
    MissingHeader,
    #[error("packet carries a malformed digest")]
    BadDigest,
}

impl Packet {
    /// Lenient decode of whatever `Name: value` lines are present. Used to
    /// echo the Thread of requests that fail validation.
    pub fn decode(buffer: &[u8]) -> Packet {
        let mut packet = Packet::default();
        let Ok(text) = std::str::from_utf8(buffer) else {
            return packet;
        };

        for line in text.split(['\r', '\n']) {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            // The name is one token; the separator is a colon plus at
            // least one whitespace character.
            if name.is_empty() || name.contains(char::is_whitespace) {
                continue;
            }
            if !rest.starts_with(char::is_whitespace) {
                continue;
            }
            packet.set(name, rest.trim_start());
        }
        packet
    }

    /// Strict request parse: requires `PV`, `Op`, `Time` and `Thread`,
    /// and a well-formed 40-hex `Op-Digest` for the digest operations.
    pub fn parse(buffer: &[u8]) -> Result<Packet, ParseError> {
        if std::str::from_utf8(buffer).is_err() {
            return Err(ParseError::NotText);
        }
        let packet = Packet::decode(buffer);

        for required in ["PV", "Op", "Time", "Thread"] {
            if packet.get(required).is_none() {
                return Err(ParseError::MissingHeader);
            }
        }

        if matches!(packet.get("Op"), Some("check" | "report" | "whitelist")) {
            let digest = packet.get("Op-Digest").ok_or(ParseError::MissingHeader)?;
            digest.parse::<Digest>().map_err(|_| ParseError::BadDigest)?;
        }

        Ok(packet)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) {
        self.attributes.insert(name.into(), value.to_string());
    }

    /// Serialize as `Name: value` lines. Attributes render in name order,
    /// which keeps responses byte-stable.
    pub fn archive(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        for (name, value) in &self.attributes {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const GOOD: &[u8] = b"Op: check\nOp-Digest: 00112233445566778899aabbccddeeff00112233\nPV: 2.0\nThread: 1024\nTime: 1000000000\n";

    #[test]
    fn test_parse_and_archive_round_trip() {
        let packet = Packet::parse(GOOD).unwrap();
        assert_eq!(packet.get("Op"), Some("check"));
        assert_eq!(packet.get("Thread"), Some("1024"));
        assert_eq!(packet.archive(), GOOD);
    }

    #[test]
    fn test_crlf_and_padding_are_tolerated() {
        let packet = Packet::decode(b"PV:  2.0\r\nThread: 55\r\n\r\n");
        assert_eq!(packet.get("PV"), Some("2.0"));
        assert_eq!(packet.get("Thread"), Some("55"));
    }

    #[test]
    fn test_missing_required_header_fails() {
        let without_pv = b"Op: ping\nThread: 1\nTime: 2\n";
        assert_eq!(Packet::parse(without_pv), Err(ParseError::MissingHeader));

        // The thread still decodes leniently for the error reply.
        assert_eq!(Packet::decode(without_pv).get("Thread"), Some("1"));
    }

    #[test]
    fn test_digest_operations_validate_the_digest() {
        let short = b"Op: report\nOp-Digest: abcdef\nPV: 2.0\nThread: 1\nTime: 2\n";
        assert_eq!(Packet::parse(short), Err(ParseError::BadDigest));

        let missing = b"Op: report\nPV: 2.0\nThread: 1\nTime: 2\n";
        assert_eq!(Packet::parse(missing), Err(ParseError::MissingHeader));

        let ping = b"Op: ping\nPV: 2.0\nThread: 1\nTime: 2\n";
        assert!(Packet::parse(ping).is_ok());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let packet = Packet::decode(b"no colon here\nBad Name: x\nColonless:value\nGood: yes\n");
        assert_eq!(packet.get("Good"), Some("yes"));
        assert_eq!(packet.get("Colonless"), None);
        assert_eq!(packet.get("Bad Name"), None);
        assert_eq!(packet.archive(), b"Good: yes\n");
    }
}
