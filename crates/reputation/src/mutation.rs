use super::Digest;

/// Fixed wire size of one mutation: digest, kind, time.
pub const MUTATION_WIRE_SIZE: usize = Digest::SIZE + 4 + 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    Erase,
    Report,
    Whitelist,
}

impl Kind {
    pub fn code(&self) -> u32 {
        match self {
            Kind::Erase => 0,
            Kind::Report => 1,
            Kind::Whitelist => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Kind::Erase),
            1 => Some(Kind::Report),
            2 => Some(Kind::Whitelist),
            _ => None,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Kind::Erase => "erase",
            Kind::Report => "report",
            Kind::Whitelist => "whitelist",
        })
    }
}

/// One forwarded write: a digest, what happened to it, and when.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mutation {
    pub digest: Digest,
    pub kind: Kind,
    pub time: u32,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeMutationError {
    #[error("mutation requires {MUTATION_WIRE_SIZE} bytes, got {0}")]
    ShortRead(usize),
    #[error("unknown mutation kind {0}")]
    UnknownKind(u32),
}

impl Mutation {
    pub fn new(digest: Digest, kind: Kind, time: u32) -> Self {
        Self { digest, kind, time }
    }

    pub fn encode(&self) -> [u8; MUTATION_WIRE_SIZE] {
        let mut out = [0u8; MUTATION_WIRE_SIZE];
        out[..20].copy_from_slice(self.digest.as_bytes());
        out[20..24].copy_from_slice(&self.kind.code().to_be_bytes());
        out[24..28].copy_from_slice(&self.time.to_be_bytes());
        out
    }

    pub fn decode(wire: &[u8]) -> Result<Self, DecodeMutationError> {
        if wire.len() != MUTATION_WIRE_SIZE {
            return Err(DecodeMutationError::ShortRead(wire.len()));
        }
        let digest = Digest::try_from(&wire[..20]).expect("slice is 20 bytes");
        let code = u32::from_be_bytes(wire[20..24].try_into().unwrap());
        let kind = Kind::from_code(code).ok_or(DecodeMutationError::UnknownKind(code))?;
        let time = u32::from_be_bytes(wire[24..28].try_into().unwrap());
        Ok(Self { digest, kind, time })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> Mutation {
        Mutation::new(
            "00112233445566778899aabbccddeeff00112233".parse().unwrap(),
            Kind::Report,
            1234,
        )
    }

    #[test]
    fn test_wire_round_trip() {
        let m = fixture();
        let wire = m.encode();
        assert_eq!(wire.len(), 28);
        assert_eq!(Mutation::decode(&wire).unwrap(), m);

        // Kind and time are big-endian after the digest.
        assert_eq!(&wire[20..24], &1u32.to_be_bytes());
        assert_eq!(&wire[24..28], &1234u32.to_be_bytes());
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut wire = fixture().encode();
        wire[20..24].copy_from_slice(&9u32.to_be_bytes());
        assert_eq!(
            Mutation::decode(&wire),
            Err(DecodeMutationError::UnknownKind(9))
        );
    }

    #[test]
    fn test_rejects_short_read() {
        assert_eq!(
            Mutation::decode(&[0u8; 27]),
            Err(DecodeMutationError::ShortRead(27))
        );
    }
}
