use thiserror::Error;

use super::response::AnnounceResponse;
use crate::bencode::BencodeError;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    /// The tracker answered with a failure reason. Any interval, tracker id,
    /// or swarm statistics it sent along are still carried for adoption.
    #[error("tracker returned failure: {reason}")]
    Failure {
        reason: String,
        fields: Option<Box<AnnounceResponse>>,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("unable to connect to UDP tracker")]
    Unreachable,

    #[error("could not resolve hostname: {0}")]
    Resolve(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported tracker url scheme: {0}")]
    UnsupportedScheme(String),
}
