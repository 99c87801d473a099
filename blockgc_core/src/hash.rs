//! Hashing and CID construction for new blocks.

use crate::error::{Error, Result};
use cid::Cid;

/// Multihash with room for digests up to 64 bytes.
pub type Multihash = multihash::Multihash<64>;

/// Multicodec code of a BLAKE3 digest.
pub const BLAKE3_256: u64 = 0x1e;

/// Multicodec code of a SHA2-256 digest (CIDv0 blocks).
pub const SHA2_256: u64 = 0x12;

/// Digest size in bytes (BLAKE3 produces 256-bit hashes).
pub const HASH_SIZE: usize = 32;

/// Supported hash algorithms for blocks written by this repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// BLAKE3 with 256-bit output.
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Blake3 => "blake3-256",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blake3-256" | "blake3" => Ok(Algorithm::Blake3),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }

    /// Returns the multihash code of the algorithm.
    pub fn code(&self) -> u64 {
        match self {
            Algorithm::Blake3 => BLAKE3_256,
        }
    }

    /// Hash raw bytes into a multihash.
    pub fn digest(&self, data: &[u8]) -> Result<Multihash> {
        match self {
            Algorithm::Blake3 => {
                let hash = blake3::hash(data);
                Ok(Multihash::wrap(self.code(), hash.as_bytes())?)
            }
        }
    }
}

/// Block codecs understood by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Opaque bytes without links.
    Raw,
    /// JSON node with a `links` array.
    DagJson,
}

impl Codec {
    /// Multicodec code of the `raw` codec.
    pub const RAW: u64 = 0x55;
    /// Multicodec code of the `dag-json` codec.
    pub const DAG_JSON: u64 = 0x0129;
    /// Multicodec code of `dag-pb`, the only codec a CIDv0 can carry.
    pub const DAG_PB: u64 = 0x70;

    /// Returns the multicodec code.
    pub fn code(&self) -> u64 {
        match self {
            Codec::Raw => Self::RAW,
            Codec::DagJson => Self::DAG_JSON,
        }
    }

    /// Look up a codec by multicodec code.
    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            Self::RAW => Ok(Codec::Raw),
            Self::DAG_JSON => Ok(Codec::DagJson),
            other => Err(Error::unsupported_codec(format!("0x{other:x}"))),
        }
    }

    /// Returns the codec name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Raw => "raw",
            Codec::DagJson => "dag-json",
        }
    }

    /// Parse a codec name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Codec::Raw),
            "dag-json" => Ok(Codec::DagJson),
            _ => Err(Error::unsupported_codec(s)),
        }
    }
}

/// Compute the CIDv1 of a block payload.
pub fn block_cid(algorithm: Algorithm, codec: Codec, data: &[u8]) -> Result<Cid> {
    let hash = algorithm.digest(data)?;
    Ok(Cid::new_v1(codec.code(), hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_cid_is_v1() {
        let cid = block_cid(Algorithm::Blake3, Codec::Raw, b"hello world").unwrap();
        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(cid.codec(), Codec::RAW);
        assert_eq!(cid.hash().code(), BLAKE3_256);
        assert_eq!(cid.hash().size() as usize, HASH_SIZE);
    }

    #[test]
    fn test_block_cid_digest_matches_blake3() {
        let cid = block_cid(Algorithm::Blake3, Codec::Raw, b"hello world").unwrap();
        assert_eq!(cid.hash().digest(), blake3::hash(b"hello world").as_bytes());
    }

    #[test]
    fn test_block_cid_deterministic_and_codec_sensitive() {
        let a = block_cid(Algorithm::Blake3, Codec::Raw, b"data").unwrap();
        let b = block_cid(Algorithm::Blake3, Codec::Raw, b"data").unwrap();
        let c = block_cid(Algorithm::Blake3, Codec::DagJson, b"data").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_algorithm_conversions() {
        assert_eq!(Algorithm::Blake3.as_str(), "blake3-256");
        assert_eq!(Algorithm::parse("blake3-256").unwrap(), Algorithm::Blake3);
        assert_eq!(Algorithm::parse("blake3").unwrap(), Algorithm::Blake3);
        assert!(Algorithm::parse("md5").is_err());
    }

    #[test]
    fn test_codec_conversions() {
        assert_eq!(Codec::from_code(0x55).unwrap(), Codec::Raw);
        assert_eq!(Codec::from_code(0x0129).unwrap(), Codec::DagJson);
        assert!(Codec::from_code(Codec::DAG_PB).is_err());
        assert_eq!(Codec::parse("dag-json").unwrap(), Codec::DagJson);
        assert!(Codec::parse("cbor").is_err());
    }
}
