//! Nix32 hash validation and sharded blob paths.
//!
//! A [`Hash`] is the 32-character, lowercase Nix32 encoding of a store path's
//! hash part. It is the primary identity for a NARInfo; the NAR body has its
//! own, independent [`Hash`] (the `FileHash`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};

/// Nix32 alphabet: `0-9a-z` minus `e`, `o`, `u`, `t`.
const NIX32_ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

/// Nix32 hashes are always this many characters long in this system.
pub const HASH_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct Hash(String);

#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("hash must be {HASH_LEN} characters, got {0}")]
    WrongLength(usize),
    #[error("hash contains invalid Nix32 character {0:?}")]
    InvalidChar(char),
    #[error("hash must be lowercase, found {0:?}")]
    NotLowercase(char),
}

impl Hash {
    /// Validates and wraps a Nix32 hash string.
    pub fn parse(s: &str) -> Result<Self, HashParseError> {
        if s.chars().count() != HASH_LEN {
            return Err(HashParseError::WrongLength(s.chars().count()));
        }

        for c in s.chars() {
            if c.is_ascii_uppercase() {
                return Err(HashParseError::NotLowercase(c));
            }
            if !NIX32_ALPHABET.contains(c) {
                return Err(HashParseError::InvalidChar(c));
            }
        }

        Ok(Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the 2-level shard path `h/ha/hash<suffix>` used for blob keys.
    pub fn shard_path(&self, suffix: &str) -> PathBuf {
        let mut path = PathBuf::new();
        path.push(&self.0[0..1]);
        path.push(&self.0[0..2]);
        path.push(format!("{}{suffix}", self.0));
        path
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "00ji9synj1r6h6sjw27wwv8fw98myxsg";

    #[test]
    fn accepts_valid_hash() {
        assert!(Hash::parse(VALID).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            Hash::parse(&VALID[..31]),
            Err(HashParseError::WrongLength(31))
        ));
    }

    #[test]
    fn rejects_excluded_letters() {
        for bad in ['e', 'o', 'u', 't'] {
            let mut s = VALID.to_owned();
            s.replace_range(0..1, &bad.to_string());
            assert!(matches!(
                Hash::parse(&s),
                Err(HashParseError::InvalidChar(_))
            ));
        }
    }

    #[test]
    fn rejects_uppercase() {
        let mut s = VALID.to_owned();
        s.replace_range(0..1, "A");
        assert!(matches!(
            Hash::parse(&s),
            Err(HashParseError::NotLowercase('A'))
        ));
    }

    #[test]
    fn shard_path_is_two_level() {
        let hash = Hash::parse(VALID).unwrap();
        let path = hash.shard_path(".narinfo");
        assert_eq!(path.to_str().unwrap(), "0/00/00ji9synj1r6h6sjw27wwv8fw98myxsg.narinfo");
    }
}
