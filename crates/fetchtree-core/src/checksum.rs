//! Entity tags for delivered parts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Available tag algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    #[default]
    Blake3,
    Xxh3,
    Md5, // S3-style part etags
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Blake3 => "blake3",
            ChecksumType::Xxh3 => "xxh3",
            ChecksumType::Md5 => "md5",
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumType {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(ChecksumType::Blake3),
            "xxh3" | "xxhash3" => Ok(ChecksumType::Xxh3),
            "md5" => Ok(ChecksumType::Md5),
            other => Err(eyre::eyre!(
                "unknown entity tag algorithm '{other}' (expected blake3, xxh3 or md5)"
            )),
        }
    }
}

/// Compute the raw digest of `data`.
pub fn strong_checksum(data: &[u8], checksum_type: ChecksumType) -> Vec<u8> {
    match checksum_type {
        ChecksumType::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        ChecksumType::Xxh3 => xxhash_rust::xxh3::xxh3_64(data).to_be_bytes().to_vec(),
        ChecksumType::Md5 => md5::compute(data).to_vec(),
    }
}

/// Entity tag of one part: lowercase hex of the digest.
pub fn entity_tag(data: &[u8], checksum_type: ChecksumType) -> String {
    hex::encode(strong_checksum(data, checksum_type))
}
