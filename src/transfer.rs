//! Piece acquisition state: blocks, transfers, and hash-failure policy.
//!
//! A [`TransferList`] tracks every piece currently being downloaded. Each
//! piece is a [`BlockList`] of 16 KiB blocks; each block remembers which
//! peers promised to deliver it. When the external hasher reports a piece as
//! corrupt, the list keeps a refcounted record of every distinct byte
//! sequence seen for each block. Once two variants exist for some block, the
//! most popular combination is re-submitted to the hasher without touching
//! the network; once a good copy finally verifies, the recorded variant
//! indices identify exactly which peers delivered bad data.
//!
//! The peer I/O layer holds [`TransferRef`] handles. A ref goes stale the
//! moment its block is reset for re-download; stale refs fail with
//! [`TransferError::InvalidState`] and never mutate block state.

mod block;
mod list;

pub use block::{Block, BlockList, BlockRange, BlockState, BlockTransfer, FailedVariant, Piece};
pub use list::{TransferList, TransferRef};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

#[cfg(test)]
mod tests;
