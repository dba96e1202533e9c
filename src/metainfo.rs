//! Torrent metadata (BEP-3, BEP-12).
//!
//! Only the fields the engine itself consumes are parsed: the info-hash,
//! piece layout, and tracker URL groups. Everything else in the metadata
//! (file lists, private flags, webseeds) belongs to the disk and peer layers.

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{encode, BencodeError, Value};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Parsed torrent metadata.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u64,
    pub piece_count: u32,
    pub total_length: u64,
    /// Tracker URLs partitioned into BEP-12 tiers; tier 0 is tried first.
    pub trackers: Vec<Vec<String>>,
}

impl Metainfo {
    /// Parses metadata from raw bencoded bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        Self::from_value(&crate::bencode::decode(data)?)
    }

    /// Parses metadata from a decoded bencode value.
    pub fn from_value(root: &Value) -> Result<Self, MetainfoError> {
        let info = root
            .get(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;
        if info.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("info"));
        }

        let mut hasher = Sha1::new();
        hasher.update(encode(info));
        let info_hash = hasher.finalize().into();

        let name = info
            .get(b"name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let piece_length = info
            .get(b"piece length")
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::InvalidField("piece length"))? as u64;

        let pieces = info
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let piece_count = (pieces.len() / 20) as u32;

        let total_length = match info.get(b"length").and_then(|v| v.as_integer()) {
            Some(n) if n >= 0 => n as u64,
            Some(_) => return Err(MetainfoError::InvalidField("length")),
            None => {
                let files = info
                    .get(b"files")
                    .and_then(|v| v.as_list())
                    .ok_or(MetainfoError::MissingField("length"))?;
                let mut total = 0u64;
                for file in files {
                    let len = file
                        .get(b"length")
                        .and_then(|v| v.as_integer())
                        .filter(|&n| n >= 0)
                        .ok_or(MetainfoError::InvalidField("files"))?;
                    total += len as u64;
                }
                total
            }
        };

        Ok(Metainfo {
            info_hash,
            name,
            piece_length,
            piece_count,
            total_length,
            trackers: parse_trackers(root),
        })
    }

    /// Returns the length of a given piece; the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        if index + 1 < self.piece_count {
            self.piece_length
        } else {
            let remainder = self.total_length % self.piece_length;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder
            }
        }
    }
}

// announce-list tiers, falling back to a single tier with announce.
fn parse_trackers(root: &Value) -> Vec<Vec<String>> {
    if let Some(tiers) = root.get(b"announce-list").and_then(|v| v.as_list()) {
        let parsed: Vec<Vec<String>> = tiers
            .iter()
            .filter_map(|tier| tier.as_list())
            .map(|urls| {
                urls.iter()
                    .filter_map(|u| u.as_str())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|tier: &Vec<String>| !tier.is_empty())
            .collect();

        if !parsed.is_empty() {
            return parsed;
        }
    }

    match root.get(b"announce").and_then(|v| v.as_str()) {
        Some(url) => vec![vec![url.to_string()]],
        None => Vec::new(),
    }
}
