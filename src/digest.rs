//! Content digests and chain IDs.
//!
//! A [`Digest`] is the `algorithm:hex` identifier of a blob, computed from its
//! bytes.  A [`ChainId`] is a digest derived from an ordered list of layer
//! digests and names a materialized filesystem snapshot.

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

use crate::error::Error;

/// The hash algorithms accepted in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// The algorithm identifier as it appears in digest strings.
    pub const fn id(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    fn hash(self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Parsing a digest string failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDigestError {
    #[error("digest is missing the algorithm prefix")]
    MissingAlgorithm,
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid {algorithm} digest encoding: {encoded:?}")]
    InvalidEncoding {
        algorithm: Algorithm,
        encoded: String,
    },
}

/// A content digest in `algorithm:hex` form.
///
/// The hex part is always stored lower-case, so two digests of the same bytes
/// compare equal regardless of how they were spelled on input.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    encoded: Box<str>,
}

impl Digest {
    /// Compute the digest of `data` with the given algorithm.
    pub fn compute(algorithm: Algorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            encoded: algorithm.hash(data).into(),
        }
    }

    /// Compute the sha256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        Self::compute(Algorithm::Sha256, data)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lower-case hex encoding, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.encoded
    }

    /// Check that `data` hashes to this digest.
    pub fn verify(&self, data: &[u8]) -> Result<(), Error> {
        let found = Self::compute(self.algorithm, data);
        if found == *self {
            Ok(())
        } else {
            Err(Error::DigestMismatch {
                expected: self.clone(),
                found,
            })
        }
    }
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or(ParseDigestError::MissingAlgorithm)?;
        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            other => return Err(ParseDigestError::UnsupportedAlgorithm(other.to_string())),
        };
        if encoded.len() != algorithm.hex_len() || !encoded.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ParseDigestError::InvalidEncoding {
                algorithm,
                encoded: encoded.to_string(),
            });
        }
        Ok(Self {
            algorithm,
            encoded: encoded.to_ascii_lowercase().into(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = ParseDigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// The identity of a layered filesystem: a digest over the ordered sequence of
/// layer digests it was built from.
///
/// The first layer's chain ID is its own digest; every further layer `L`
/// extends the chain as `sha256(parent + " " + L)`.  Reordering layers or
/// changing any layer therefore changes every chain ID above it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(Digest);

impl ChainId {
    /// Compute the chain IDs of every prefix of `layers`.
    ///
    /// The result has one entry per layer; the last entry identifies the
    /// whole stack.
    pub fn for_prefixes(layers: &[Digest]) -> Vec<ChainId> {
        let mut chain: Vec<ChainId> = Vec::with_capacity(layers.len());
        for layer in layers {
            let next = match chain.last() {
                None => ChainId(layer.clone()),
                Some(parent) => ChainId(Digest::sha256(format!("{parent} {layer}").as_bytes())),
            };
            chain.push(next);
        }
        chain
    }

    /// Compute the chain ID of the full ordered layer list.
    pub fn of(layers: &[Digest]) -> Option<ChainId> {
        Self::for_prefixes(layers).pop()
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }

    pub fn hex(&self) -> &str {
        self.0.hex()
    }
}

impl FromStr for ChainId {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}
