//! Start-of-image marker sequences.
//!
//! Uses Aho-Corasick with leftmost-first semantics so that when two
//! signatures could match at the same position, the one registered first
//! wins.

use std::fmt;

use aho_corasick::{AhoCorasick, MatchKind};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// SOI followed by an APP0 (JFIF) marker.
pub const JFIF_SOI: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];
/// SOI followed by an APP1 (Exif / MP) marker.
pub const EXIF_SOI: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE1];

/// A byte sequence marking the first byte of an embedded JPEG.
///
/// Serialized as a hex string, e.g. `"FFD8FFE0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(hex: &str) -> Result<Self, ConfigError> {
        let digits: Vec<u8> = hex
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        if digits.len() % 2 != 0 {
            return Err(ConfigError::InvalidSignature(hex.to_string()));
        }

        digits
            .chunks_exact(2)
            .map(|pair| {
                let hi = (pair[0] as char).to_digit(16);
                let lo = (pair[1] as char).to_digit(16);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => Ok((hi * 16 + lo) as u8),
                    _ => Err(ConfigError::InvalidSignature(hex.to_string())),
                }
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Self)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Signature {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.to_string()
    }
}

/// The default JPEG start-of-image signatures, in priority order.
pub fn jpeg_signatures() -> Vec<Signature> {
    vec![Signature::new(JFIF_SOI), Signature::new(EXIF_SOI)]
}

/// A single signature hit within a search window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureHit {
    /// Start of the match within the window.
    pub start: usize,
    /// One past the last matched byte within the window.
    pub end: usize,
    /// Index of the matching signature in the set.
    pub signature: usize,
}

/// An ordered, closed set of signatures compiled into one automaton.
#[derive(Debug, Clone)]
pub struct SignatureSet {
    signatures: Vec<Signature>,
    matcher: AhoCorasick,
    max_len: usize,
}

impl SignatureSet {
    pub fn new(signatures: Vec<Signature>) -> Result<Self, ConfigError> {
        if signatures.is_empty() {
            return Err(ConfigError::NoSignatures);
        }
        if let Some(index) = signatures.iter().position(Signature::is_empty) {
            return Err(ConfigError::EmptySignature { index });
        }

        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostFirst)
            .build(signatures.iter().map(Signature::as_bytes))?;
        let max_len = signatures.iter().map(Signature::len).max().unwrap_or(0);

        Ok(Self {
            signatures,
            matcher,
            max_len,
        })
    }

    pub fn jpeg() -> Self {
        match Self::new(jpeg_signatures()) {
            Ok(set) => set,
            Err(e) => unreachable!("built-in signatures are valid: {e}"),
        }
    }

    #[inline]
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Length of the longest signature.
    #[inline]
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Bytes that must be carried from one chunk into the next so a
    /// signature straddling the boundary is still seen whole.
    #[inline]
    pub fn carry_len(&self) -> usize {
        self.max_len.saturating_sub(1)
    }

    /// All non-overlapping hits in `window`, in ascending order.
    pub fn find_iter<'a>(&'a self, window: &'a [u8]) -> impl Iterator<Item = SignatureHit> + 'a {
        self.matcher.find_iter(window).map(|m| SignatureHit {
            start: m.start(),
            end: m.end(),
            signature: m.pattern().as_usize(),
        })
    }
}

impl Default for SignatureSet {
    fn default() -> Self {
        Self::jpeg()
    }
}
