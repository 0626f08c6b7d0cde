//! Content keys: path-independent identity for an observed image file.
//!
//! A key is derived from `(file name, size, modification time)` only, so a
//! renamed directory or a moved file keeps its identity while an edited file
//! (new size or mtime) gets a new one.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of SHA-256 bytes kept in a key.
///
/// 16 bytes (32 hex characters) matches the keys already held by the remote
/// catalog. Truncation halves the collision resistance of the full digest;
/// 128 bits is still far beyond any realistic library size.
const KEY_BYTES: usize = 16;

/// Malformed input to key derivation.
#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    #[error("file name must not be empty")]
    EmptyFileName,

    #[error("file size must not be negative (got {0})")]
    NegativeSize(i64),

    #[error("modification time must be finite (got {0})")]
    NonFiniteTime(f64),

    #[error("file size {0} does not fit a signed 64-bit integer")]
    SizeOverflow(u64),
}

/// Hex-encoded, truncated SHA-256 identity of an image file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    /// Derive the key for a file. Pure and deterministic.
    ///
    /// `modified_ms` is the modification time in epoch milliseconds; it is
    /// rendered the way the catalog's other clients render it (integral values
    /// without a fractional part) before hashing.
    pub fn derive(file_name: &str, size: i64, modified_ms: f64) -> Result<Self, KeyError> {
        if file_name.is_empty() {
            return Err(KeyError::EmptyFileName);
        }
        if size < 0 {
            return Err(KeyError::NegativeSize(size));
        }
        if !modified_ms.is_finite() {
            return Err(KeyError::NonFiniteTime(modified_ms));
        }

        let input = format!("{}_{}_{}", file_name, size, modified_ms);
        let digest = Sha256::digest(input.as_bytes());
        let hex: String = digest[..KEY_BYTES]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(Self(hex))
    }

    /// Derive a key from unsigned filesystem metadata.
    pub fn for_file(file_name: &str, size: u64, modified_ms: i64) -> Result<Self, KeyError> {
        let size = i64::try_from(size).map_err(|_| KeyError::SizeOverflow(size))?;
        Self::derive(file_name, size, modified_ms as f64)
    }

    /// Wrap a key read back from durable storage.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this looks like a key from the legacy path-keyed scheme.
    pub fn looks_like_path(&self) -> bool {
        self.0.contains('/') || self.0.contains('\\')
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = ContentKey::derive("IMG_0001.jpg", 100, 1_700_000_000_000.0).unwrap();
        let b = ContentKey::derive("IMG_0001.jpg", 100, 1_700_000_000_000.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_is_32_lowercase_hex_chars() {
        let key = ContentKey::derive("a.jpg", 100, 1.0).unwrap();
        assert_eq!(key.as_str().len(), 32);
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_integral_mtime_hashes_without_fraction() {
        let key = ContentKey::derive("a.jpg", 100, 1_700_000_000_000.0).unwrap();
        let digest = Sha256::digest(b"a.jpg_100_1700000000000");
        let expected: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(key.as_str(), expected);
    }

    #[test]
    fn test_each_input_changes_the_key() {
        let base = ContentKey::derive("a.jpg", 100, 1000.0).unwrap();
        assert_ne!(base, ContentKey::derive("b.jpg", 100, 1000.0).unwrap());
        assert_ne!(base, ContentKey::derive("a.jpg", 101, 1000.0).unwrap());
        assert_ne!(base, ContentKey::derive("a.jpg", 100, 1001.0).unwrap());
    }

    #[test]
    fn test_for_file_matches_derive() {
        assert_eq!(
            ContentKey::for_file("a.jpg", 100, 1_700_000_000_000).unwrap(),
            ContentKey::derive("a.jpg", 100, 1_700_000_000_000.0).unwrap()
        );
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert_eq!(
            ContentKey::derive("", 1, 1.0),
            Err(KeyError::EmptyFileName)
        );
        assert_eq!(
            ContentKey::derive("a.jpg", -1, 1.0),
            Err(KeyError::NegativeSize(-1))
        );
        assert!(matches!(
            ContentKey::derive("a.jpg", 1, f64::NAN),
            Err(KeyError::NonFiniteTime(_))
        ));
        assert!(matches!(
            ContentKey::derive("a.jpg", 1, f64::INFINITY),
            Err(KeyError::NonFiniteTime(_))
        ));
        assert_eq!(
            ContentKey::for_file("a.jpg", u64::MAX, 0),
            Err(KeyError::SizeOverflow(u64::MAX))
        );
    }

    #[test]
    fn test_looks_like_path() {
        assert!(ContentKey::from_stored("/photos/a.jpg".into()).looks_like_path());
        assert!(ContentKey::from_stored("C:\\photos\\a.jpg".into()).looks_like_path());
        assert!(!ContentKey::derive("a.jpg", 1, 1.0).unwrap().looks_like_path());
    }
}
