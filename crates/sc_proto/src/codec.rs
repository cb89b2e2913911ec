//! Padding codec
//!
//! Plaintext is padded to fixed-size buckets BEFORE encryption so ciphertext
//! lengths only reveal the bucket, not the message size.
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384, 65536
//! Messages larger than the last bucket are length-prefixed but not padded.
//!
//! Format: [original_len: u32 LE] [plaintext] [random fill]

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

pub const LENGTH_PREFIX: usize = 4;
pub const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];
pub const MAX_BUCKET: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Length prefix only.
    None,
    /// Next bucket that fits.
    #[default]
    Buckets,
    /// Always the largest bucket.
    Maximum,
}

impl std::str::FromStr for PaddingMode {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(PaddingMode::None),
            "buckets" => Ok(PaddingMode::Buckets),
            "maximum" | "max" => Ok(PaddingMode::Maximum),
            other => Err(ProtoError::InvalidPadding(format!("unknown padding mode '{other}'"))),
        }
    }
}

/// Size the padded output will have for a `len`-byte plaintext.
pub fn padded_len(len: usize, mode: PaddingMode) -> usize {
    let needed = LENGTH_PREFIX + len;
    match mode {
        PaddingMode::None => needed,
        PaddingMode::Buckets => BUCKET_SIZES.iter().copied().find(|&b| b >= needed).unwrap_or(needed),
        PaddingMode::Maximum => needed.max(MAX_BUCKET),
    }
}

pub fn pad_to_bucket(plaintext: &[u8], mode: PaddingMode) -> Result<Vec<u8>, ProtoError> {
    let len = u32::try_from(plaintext.len())
        .map_err(|_| ProtoError::InvalidPadding(format!("{} bytes exceeds u32 length prefix", plaintext.len())))?;
    let target = padded_len(plaintext.len(), mode);

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(plaintext);
    let remaining = target - out.len();
    if remaining > 0 {
        // random rather than zero fill so padding does not compress away
        let mut fill = vec![0u8; remaining];
        OsRng.fill_bytes(&mut fill);
        out.extend_from_slice(&fill);
    }
    Ok(out)
}

pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let prefix: [u8; LENGTH_PREFIX] = padded
        .get(..LENGTH_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| ProtoError::InvalidPadding("too short for length prefix".into()))?;
    let len = u32::from_le_bytes(prefix) as usize;
    if LENGTH_PREFIX + len > padded.len() {
        return Err(ProtoError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(padded[LENGTH_PREFIX..LENGTH_PREFIX + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_message_lands_in_first_bucket() {
        let padded = pad_to_bucket(b"Hello, World!", PaddingMode::Buckets).unwrap();
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), b"Hello, World!");
    }

    #[test]
    fn bucket_boundary() {
        // 252 + 4 fits exactly; one more byte spills to 512
        assert_eq!(padded_len(252, PaddingMode::Buckets), 256);
        assert_eq!(padded_len(253, PaddingMode::Buckets), 512);
        assert_eq!(padded_len(5000, PaddingMode::Buckets), 16384);
        assert_eq!(padded_len(70000, PaddingMode::Buckets), 70004);
    }

    #[test]
    fn none_and_maximum() {
        let padded = pad_to_bucket(b"abc", PaddingMode::None).unwrap();
        assert_eq!(padded.len(), 7);
        let padded = pad_to_bucket(b"tiny", PaddingMode::Maximum).unwrap();
        assert_eq!(padded.len(), MAX_BUCKET);
        assert_eq!(unpad(&padded).unwrap(), b"tiny");
    }

    #[test]
    fn empty_plaintext() {
        let padded = pad_to_bucket(b"", PaddingMode::Buckets).unwrap();
        assert_eq!(padded.len(), 256);
        assert!(unpad(&padded).unwrap().is_empty());
    }

    #[test]
    fn corrupt_prefix_is_rejected() {
        assert!(matches!(unpad(&[1, 0]), Err(ProtoError::InvalidPadding(_))));
        let mut padded = pad_to_bucket(b"x", PaddingMode::Buckets).unwrap();
        padded[..4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(unpad(&padded), Err(ProtoError::InvalidPadding(_))));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("Buckets".parse::<PaddingMode>().unwrap(), PaddingMode::Buckets);
        assert_eq!("max".parse::<PaddingMode>().unwrap(), PaddingMode::Maximum);
        assert!("zstd".parse::<PaddingMode>().is_err());
    }
}
