//! Canonical block keys.
//!
//! The same content may be addressed by a CIDv0 (`Qm...`) or by any multibase
//! rendering of a CIDv1. Every membership test in the repository goes through
//! [`normalize`], which maps all of them to the CIDv1 base32 string.

use crate::error::{Error, Result};
use crate::hash::Codec;
use cid::{Cid, Version};
use std::collections::HashSet;

/// Canonical string form of a CID: CIDv1, base32 lower-case.
pub fn normalize(cid: &Cid) -> String {
    match cid.version() {
        Version::V0 => Cid::new_v1(Codec::DAG_PB, *cid.hash()).to_string(),
        Version::V1 => cid.to_string(),
    }
}

/// Decode a stored blockstore key (or user input) into a CID.
pub fn parse_key(key: &str) -> Result<Cid> {
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::invalid_cid("empty key"));
    }

    Cid::try_from(key).map_err(|e| Error::invalid_cid(format!("{key}: {e}")))
}

/// Decode a CID from its binary form.
pub fn cid_from_bytes(bytes: &[u8]) -> Result<Cid> {
    Ok(Cid::try_from(bytes)?)
}

/// The set of normalized keys that must survive a GC run.
///
/// Built once by the mark phase and never mutated afterwards.
#[derive(Debug, Default)]
pub struct MarkedSet {
    keys: HashSet<String>,
}

impl MarkedSet {
    pub(crate) fn new(keys: HashSet<String>) -> Self {
        Self { keys }
    }

    /// Returns true if the CID (in any encoding) is marked live.
    pub fn contains(&self, cid: &Cid) -> bool {
        self.keys.contains(&normalize(cid))
    }

    /// Returns true if the already-normalized key is marked live.
    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if nothing is marked.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
