//! Core types shared by the ingestion and processing pipelines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between the host and the name inside a [`LogicalIdentity`].
pub const IDENTITY_SEPARATOR: char = ':';

/// Globally unique key of one ingested content stream: `host:name`.
///
/// The name part may carry a numeric disambiguation suffix (`photo_0.png`)
/// assigned by the dedup coordinator. Identities travel inside the pipe-delimited
/// wire header, so they never contain `|`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalIdentity(String);

impl LogicalIdentity {
    /// Build an identity from its parts.
    ///
    /// Returns `None` when the host is empty or contains `:`, or when either part
    /// contains the wire delimiter.
    pub fn new(host: &str, name: &str) -> Option<Self> {
        if host.is_empty() || name.is_empty() || host.contains(IDENTITY_SEPARATOR) {
            return None;
        }
        if host.contains('|') || name.contains('|') {
            return None;
        }
        Some(Self(format!("{}{}{}", host, IDENTITY_SEPARATOR, name)))
    }

    /// Parse an identity received from the wire.
    pub fn parse(raw: &str) -> Option<Self> {
        let (host, name) = raw.split_once(IDENTITY_SEPARATOR)?;
        Self::new(host, name)
    }

    pub fn host(&self) -> &str {
        self.0
            .split_once(IDENTITY_SEPARATOR)
            .map(|(host, _)| host)
            .unwrap_or(&self.0)
    }

    pub fn name(&self) -> &str {
        self.0
            .split_once(IDENTITY_SEPARATOR)
            .map(|(_, name)| name)
            .unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// BLAKE3 hash of an artifact's normalized byte stream.
///
/// Used purely as an equality test for "same bytes".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 8-bit RGB triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Uppercase `#RRGGBB` form.
    pub fn to_hex(&self) -> String {
        format!("#{}", hex::encode_upper([self.r, self.g, self.b]))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Rgb {
    type Err = String;

    /// Parse `#0E96B4` or `0E96B4` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if digits.len() != 6 {
            return Err(format!(
                "invalid color '{}': expected six hex digits such as #0E96B4",
                s
            ));
        }
        let mut rgb = [0u8; 3];
        hex::decode_to_slice(digits, &mut rgb)
            .map_err(|e| format!("invalid color '{}': {}", s, e))?;
        Ok(Self::new(rgb[0], rgb[1], rgb[2]))
    }
}
