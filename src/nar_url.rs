//! NAR URL model: `<hash>.nar[.<codec>]?query`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::hash::{Hash, HashParseError};

/// Compression codecs recognized in a NAR URL suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Xz,
    Bzip2,
    Zstd,
    Lzip,
    Lz4,
    Br,
}

impl Compression {
    /// File extension written to the blob store, or `None` for the
    /// uncompressed/`none` alias (storage writes only `.nar`).
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Xz => Some("xz"),
            Self::Bzip2 => Some("bzip2"),
            Self::Zstd => Some("zstd"),
            Self::Lzip => Some("lzip"),
            Self::Lz4 => Some("lz4"),
            Self::Br => Some("br"),
        }
    }

    pub fn content_type_suffix(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => "+xz",
            Self::Bzip2 => "+bzip2",
            Self::Zstd => "+zstd",
            Self::Lzip => "+lzip",
            Self::Lz4 => "+lz4",
            Self::Br => "+br",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Zstd => "zstd",
            Self::Lzip => "lzip",
            Self::Lz4 => "lz4",
            Self::Br => "br",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionParseError {
    #[error("unsupported compression codec {0:?}")]
    Unsupported(String),
}

impl FromStr for Compression {
    type Err = CompressionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "" | "none" => Self::None,
            "xz" => Self::Xz,
            "bzip2" => Self::Bzip2,
            "zstd" => Self::Zstd,
            "lzip" => Self::Lzip,
            "lz4" => Self::Lz4,
            "br" => Self::Br,
            other => return Err(CompressionParseError::Unsupported(other.to_owned())),
        })
    }
}

/// A normalized reference to a NAR: `nar/<hash>[.<ext>][?query]`.
#[derive(Clone, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct NarUrl {
    pub hash: Hash,
    pub compression: Compression,
    pub query: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NarUrlParseError {
    #[error("nar url missing `nar/` prefix: {0:?}")]
    MissingPrefix(String),
    #[error("invalid hash in nar url: {0}")]
    Hash(#[from] HashParseError),
    #[error("invalid compression in nar url: {0}")]
    Compression(#[from] CompressionParseError),
}

impl NarUrl {
    /// Relative blob-store key: `nar/h/ha/hash.<ext>`, query stripped (the
    /// query string is never part of blob identity). Matches `Display`'s
    /// `.nar` fallback for uncompressed bodies rather than a bare hash.
    pub fn to_file_path(&self) -> std::path::PathBuf {
        let suffix = match self.compression.extension() {
            Some(ext) => format!(".{ext}"),
            None => ".nar".to_owned(),
        };
        self.hash.shard_path(&suffix)
    }
}

impl fmt::Display for NarUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nar/{}", self.hash)?;
        if let Some(ext) = self.compression.extension() {
            write!(f, ".{ext}")?;
        } else {
            write!(f, ".nar")?;
        }
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

impl FromStr for NarUrl {
    type Err = NarUrlParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("nar/")
            .ok_or_else(|| NarUrlParseError::MissingPrefix(s.to_owned()))?;

        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q.to_owned())),
            None => (rest, None),
        };

        // `<hash>.nar` or `<hash>.nar.<codec>` or bare `<hash>`.
        let (hash_str, compression) = match path.split_once(".nar") {
            Some((h, tail)) => {
                let compression = tail.strip_prefix('.').unwrap_or("");
                (h, compression.parse()?)
            }
            None => (path, Compression::None),
        };

        Ok(Self {
            hash: hash_str.parse()?,
            compression,
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: &str = "00ji9synj1r6h6sjw27wwv8fw98myxsg";

    #[test]
    fn round_trips_plain() {
        let s = format!("nar/{H}.nar");
        let parsed: NarUrl = s.parse().unwrap();
        assert_eq!(parsed.to_string(), s);
    }

    #[test]
    fn round_trips_compressed() {
        let s = format!("nar/{H}.nar.xz");
        let parsed: NarUrl = s.parse().unwrap();
        assert_eq!(parsed.compression, Compression::Xz);
        assert_eq!(parsed.to_string(), s);
    }

    #[test]
    fn none_and_empty_alias() {
        let a: NarUrl = format!("nar/{H}.nar.none").parse().unwrap();
        let b: NarUrl = format!("nar/{H}.nar").parse().unwrap();
        assert_eq!(a.compression, Compression::None);
        assert_eq!(a.to_file_path(), b.to_file_path());
    }

    #[test]
    fn query_is_preserved_but_not_part_of_file_path() {
        let a: NarUrl = format!("nar/{H}.nar.xz?foo=bar").parse().unwrap();
        let b: NarUrl = format!("nar/{H}.nar.xz").parse().unwrap();
        assert_eq!(a.to_file_path(), b.to_file_path());
        assert_eq!(a.query.as_deref(), Some("foo=bar"));
    }

    #[test]
    fn shard_path_two_level() {
        let url: NarUrl = format!("nar/{H}.nar.xz").parse().unwrap();
        assert_eq!(
            url.to_file_path().to_str().unwrap(),
            "0/00/00ji9synj1r6h6sjw27wwv8fw98myxsg.xz"
        );
    }
}
