//! Cache keys derived from request identifiers.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Digest used to derive keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    /// 128-bit MD5 digest, rendered as 32 lowercase hex characters
    #[default]
    Md5,
    /// Degraded mode: 64-bit SipHash rendered as 16 hex characters.
    ///
    /// Collision resistance drops to 64 bits and keys are only stable for a
    /// given toolchain, so a disk cache written in this mode may miss after
    /// an upgrade.
    Fast,
}

/// Fixed-width lowercase hex token identifying a cache entry in both tiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyHasher {
    mode: HashMode,
}

impl KeyHasher {
    pub fn new(mode: HashMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> HashMode {
        self.mode
    }

    /// Hash the UTF-8 bytes of `identifier`. Never fails.
    pub fn hash(&self, identifier: &str) -> CacheKey {
        match self.mode {
            HashMode::Md5 => CacheKey(format!("{:x}", md5::compute(identifier.as_bytes()))),
            HashMode::Fast => {
                let mut hasher = DefaultHasher::new();
                identifier.hash(&mut hasher);
                CacheKey(format!("{:016x}", hasher.finish()))
            }
        }
    }

    /// Length of every key this hasher produces
    pub fn key_len(&self) -> usize {
        match self.mode {
            HashMode::Md5 => 32,
            HashMode::Fast => 16,
        }
    }
}
