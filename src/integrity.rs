//! Commit-time output digests.
//!
//! Committed assets carry a subresource-integrity style digest over their
//! final bytes so downstream emitters can stamp integrity attributes
//! without re-reading the blob cache.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use base64::display::Base64Display;
use base64::engine::general_purpose::URL_SAFE;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Digest algorithm recorded on committed assets.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum IntegrityType {
    None,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl FromStr for IntegrityType {
    type Err = IntegrityTypeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "" => Default::default(),
            "none" => Self::None,
            "sha256" => Self::Sha256,
            "sha384" => Self::Sha384,
            "sha512" => Self::Sha512,
            _ => return Err(IntegrityTypeParseError::InvalidValue),
        })
    }
}

impl Display for IntegrityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha384 => write!(f, "sha384"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrityTypeParseError {
    #[error("invalid value")]
    InvalidValue,
}

/// The digest of a committed asset's final bytes.
#[derive(Debug)]
pub struct OutputDigest {
    /// The digest algorithm.
    pub integrity: IntegrityType,
    /// The raw hash value.
    pub hash: Vec<u8>,
}

impl OutputDigest {
    /// Compute the digest over the given bytes.
    pub fn generate_from(integrity: IntegrityType, data: impl AsRef<[u8]>) -> Self {
        let hash = match integrity {
            IntegrityType::None => vec![],
            IntegrityType::Sha256 => Vec::from_iter(Sha256::digest(data)),
            IntegrityType::Sha384 => Vec::from_iter(Sha384::digest(data)),
            IntegrityType::Sha512 => Vec::from_iter(Sha512::digest(data)),
        };
        Self { integrity, hash }
    }

    /// Render as an `<alg>-<base64>` integrity value.
    pub fn to_integrity_value(&self) -> Option<String> {
        match self.integrity {
            IntegrityType::None => None,
            integrity => Some(format!(
                "{integrity}-{hash}",
                hash = Base64Display::new(&self.hash, &URL_SAFE)
            )),
        }
    }
}
