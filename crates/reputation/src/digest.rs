use std::fmt;
use std::str::FromStr;

/// A 20-byte content digest, computed externally by Pyzor clients.
/// Equality and ordering are byte-wise. The textual form is 40 lowercase
/// hexadecimal characters.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Digest(pub [u8; 20]);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseDigestError {
    #[error("digest must be 40 hexadecimal characters, got {0}")]
    InvalidLength(usize),
    #[error("digest contains a non-hexadecimal character")]
    InvalidCharacter,
}

impl Digest {
    pub const SIZE: usize = 20;

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for Digest {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = ParseDigestError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| ParseDigestError::InvalidLength(bytes.len() * 2))?;
        Ok(Self(bytes))
    }
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(ParseDigestError::InvalidLength(s.len()));
        }
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out).map_err(|_| ParseDigestError::InvalidCharacter)?;
        Ok(Self(out))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// Debug output is the hex form, which is what operators grep for in logs.
impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
