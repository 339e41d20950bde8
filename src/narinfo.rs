//! NARInfo entity: parsed form of the upstream `.narinfo` text file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_builder::Builder;

use crate::hash::{Hash, HashParseError};
use crate::nar_url::{Compression, NarUrl, NarUrlParseError};

/// `/nix/store/<hash>-<name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePath {
    pub hash: Hash,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StorePathParseError {
    #[error("store path missing `-` separator between hash and name: {0:?}")]
    MissingSeparator(String),
    #[error("store path is missing a name after the hash: {0:?}")]
    EmptyName(String),
    #[error("invalid hash in store path: {0}")]
    Hash(#[from] HashParseError),
}

impl StorePath {
    /// The basename, e.g. `<hash>-<name>` (without `/nix/store/`).
    pub fn basename(&self) -> String {
        format!("{}-{}", self.hash, self.name)
    }

    pub fn full_path(&self) -> PathBuf {
        Path::new("/nix/store").join(self.basename())
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/nix/store/{}", self.basename())
    }
}

impl FromStr for StorePath {
    type Err = StorePathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let basename = s.rsplit('/').next().unwrap_or(s);

        let (hash_str, name) = basename
            .split_once('-')
            .ok_or_else(|| StorePathParseError::MissingSeparator(basename.to_owned()))?;

        if name.is_empty() {
            return Err(StorePathParseError::EmptyName(basename.to_owned()));
        }

        Ok(Self {
            hash: hash_str.parse()?,
            name: name.to_owned(),
        })
    }
}

/// One entry of the `References:` field: a store-path basename.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference(pub String);

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One `Sig:` line: `keyname-N:base64sig`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub String);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Builder)]
#[builder(setter(into, strip_option), build_fn(error = "NarInfoBuildError"))]
pub struct NarInfo {
    pub store_path: StorePath,
    pub url: NarUrl,
    pub compression: Compression,
    pub file_hash: Hash,
    pub file_size: u64,
    pub nar_hash: Hash,
    pub nar_size: u64,
    #[builder(default)]
    pub deriver: Option<String>,
    #[builder(default)]
    pub system: Option<String>,
    #[builder(default)]
    pub references: Vec<Reference>,
    #[builder(default)]
    pub sig: Vec<Signature>,
}

#[derive(Debug, thiserror::Error)]
#[error("narinfo is missing required fields")]
pub struct NarInfoBuildError(String);

impl From<derive_builder::UninitializedFieldError> for NarInfoBuildError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        Self(e.to_string())
    }
}

impl NarInfo {
    /// The hash identity of this NARInfo: the prefix of its StorePath basename.
    pub fn hash(&self) -> &Hash {
        &self.store_path.hash
    }

    /// Canonical signature fingerprint: `1;<storepath>;<narhash>;<narsize>;<refs sorted, comma-joined>`.
    pub fn fingerprint(&self) -> String {
        let mut refs: Vec<&str> = self.references.iter().map(|r| r.0.as_str()).collect();
        refs.sort_unstable();

        format!(
            "1;{};sha256:{};{};{}",
            self.store_path,
            self.nar_hash,
            self.nar_size,
            refs.join(","),
        )
    }

    /// Clears all existing signatures and appends a single fresh one.
    pub fn resign(&mut self, signature: Signature) {
        self.sig.clear();
        self.sig.push(signature);
    }
}

impl fmt::Display for NarInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StorePath: {}", self.store_path)?;
        writeln!(f, "URL: {}", self.url)?;
        writeln!(f, "Compression: {}", self.compression)?;
        writeln!(f, "FileHash: sha256:{}", self.file_hash)?;
        writeln!(f, "FileSize: {}", self.file_size)?;
        writeln!(f, "NarHash: sha256:{}", self.nar_hash)?;
        writeln!(f, "NarSize: {}", self.nar_size)?;

        if let Some(deriver) = &self.deriver {
            writeln!(f, "Deriver: {deriver}")?;
        }
        if let Some(system) = &self.system {
            writeln!(f, "System: {system}")?;
        }

        write!(f, "References:")?;
        for r in &self.references {
            write!(f, " {r}")?;
        }
        writeln!(f)?;

        for sig in &self.sig {
            writeln!(f, "Sig: {sig}")?;
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NarInfoParseError {
    #[error("invalid field value {0:?}: {1}")]
    InvalidFieldValue(String, String),
    #[error("missing required field(s): {0}")]
    MissingField(#[from] NarInfoBuildError),
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("malformed line (expected \"Key: value\"): {0:?}")]
    InvalidEntryFormat(String),
}

impl FromStr for NarInfo {
    type Err = NarInfoParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut builder = NarInfoBuilder::default();

        macro_rules! invalid {
            ($field:literal, $e:expr) => {
                NarInfoParseError::InvalidFieldValue($field.to_owned(), $e.to_string())
            };
        }

        for line in s.lines() {
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| NarInfoParseError::InvalidEntryFormat(line.to_owned()))?;

            match key {
                "StorePath" => {
                    builder.store_path(value.parse::<StorePath>().map_err(|e| invalid!("StorePath", e))?);
                }
                "URL" => {
                    builder.url(value.parse::<NarUrl>().map_err(|e| invalid!("URL", e))?);
                }
                "Compression" => {
                    builder.compression(value.parse::<Compression>().map_err(|e| invalid!("Compression", e))?);
                }
                "FileHash" => {
                    let hash = value.strip_prefix("sha256:").unwrap_or(value);
                    builder.file_hash(hash.parse::<Hash>().map_err(|e| invalid!("FileHash", e))?);
                }
                "FileSize" => {
                    builder.file_size(value.parse::<u64>().map_err(|e| invalid!("FileSize", e))?);
                }
                "NarHash" => {
                    let hash = value.strip_prefix("sha256:").unwrap_or(value);
                    builder.nar_hash(hash.parse::<Hash>().map_err(|e| invalid!("NarHash", e))?);
                }
                "NarSize" => {
                    builder.nar_size(value.parse::<u64>().map_err(|e| invalid!("NarSize", e))?);
                }
                "Deriver" => {
                    builder.deriver(Some(value.to_owned()));
                }
                "System" => {
                    builder.system(Some(value.to_owned()));
                }
                "References" => {
                    let refs = if value.is_empty() {
                        Vec::new()
                    } else {
                        value.split(' ').map(|s| Reference(s.to_owned())).collect()
                    };
                    builder.references(refs);
                }
                "Sig" => {
                    let mut sigs = builder.sig.clone().unwrap_or_default();
                    sigs.push(Signature(value.to_owned()));
                    builder.sig(sigs);
                }
                other => return Err(NarInfoParseError::UnknownField(other.to_owned())),
            };
        }

        Ok(builder.build()?)
    }
}

impl TryFrom<&str> for NarInfo {
    type Error = NarInfoParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> String {
        "\
StorePath: /nix/store/00ji9synj1r6h6sjw27wwv8fw98myxsg-hello-2.12.1
URL: nar/0123456789abcdfghijklmnpqrsvwxyz.nar.xz
Compression: xz
FileHash: sha256:0123456789abcdfghijklmnpqrsvwxyz
FileSize: 12345
NarHash: sha256:0123456789abcdfghijklmnpqrsvwxyz
NarSize: 54321
References: 00ji9synj1r6h6sjw27wwv8fw98myxsg-hello-2.12.1
Sig: cache.example-1:c2lnbmF0dXJlCg==
"
        .to_owned()
    }

    #[test]
    fn parses_and_roundtrips() {
        let info: NarInfo = sample().parse().unwrap();
        assert_eq!(info.hash().as_str(), "00ji9synj1r6h6sjw27wwv8fw98myxsg");
        assert_eq!(info.sig.len(), 1);
        assert_eq!(info.to_string(), sample());
    }

    #[test]
    fn fingerprint_sorts_references() {
        let mut info: NarInfo = sample().parse().unwrap();
        info.references.push(Reference("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-zzz".to_owned()));
        let fp = info.fingerprint();
        assert!(fp.starts_with("1;/nix/store/"));
        assert!(fp.contains("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-zzz,00ji9synj1r6h6sjw27wwv8fw98myxsg-hello-2.12.1"));
    }

    #[test]
    fn resign_replaces_all_signatures() {
        let mut info: NarInfo = sample().parse().unwrap();
        info.resign(Signature("cache.example-2:bmV3c2ln".to_owned()));
        assert_eq!(info.sig, vec![Signature("cache.example-2:bmV3c2ln".to_owned())]);
    }

    #[test]
    fn rejects_unknown_field() {
        let bad = format!("{}Unknown: wat\n", sample());
        assert!(matches!(
            bad.parse::<NarInfo>(),
            Err(NarInfoParseError::UnknownField(_))
        ));
    }

    #[test]
    fn rejects_hash_mismatch_with_url_independent_identity() {
        // The NARInfo's own hash (StorePath) and the NAR URL's hash are
        // independent identities; this is a parse-level sanity check only.
        let info: NarInfo = sample().parse().unwrap();
        assert_ne!(info.hash().as_str(), info.url.hash.as_str());
    }
}
