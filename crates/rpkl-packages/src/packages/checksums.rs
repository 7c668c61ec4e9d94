//! Checksum handling for package verification

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Package checksums for integrity verification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksums {
    /// SHA-256 checksum (hex-encoded)
    pub sha256: String,
}

impl Checksums {
    /// Create new checksums with a SHA-256 hash
    pub fn new(sha256: impl Into<String>) -> Self {
        Self {
            sha256: sha256.into(),
        }
    }

    /// Parse checksums from a string (format: "sha256:hexvalue")
    pub fn parse(s: &str) -> Result<Self> {
        match s.strip_prefix("sha256:") {
            Some(hash) if !hash.is_empty() => Ok(Self::new(hash)),
            _ => Err(Error::malformed(format!(
                "Invalid checksum format: `{}`. Expected 'sha256:...'",
                s
            ))),
        }
    }

    /// Compute SHA-256 checksum of bytes
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            sha256: hex::encode(hasher.finalize()),
        }
    }

    /// Whether both checksums carry the same SHA-256 value
    pub fn matches(&self, other: &Checksums) -> bool {
        self.sha256.eq_ignore_ascii_case(&other.sha256)
    }
}

impl fmt::Display for Checksums {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.sha256)
    }
}
