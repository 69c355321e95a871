use std::io;

use thiserror::Error;

/// Error kinds produced by the storage core.
#[derive(Debug, Error)]
pub enum DbErr {
    /// On-disk invariants violated: list node out of bounds, magic mismatch,
    /// wrong page type, impossible extent state, inconsistent header.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The allocator cannot extend the data file further.
    #[error("out of tablespace file space")]
    OutOfFileSpace,

    /// Block or heap allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Generic I/O or environmental error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DbErr {
    pub fn corruption(msg: impl Into<String>) -> DbErr {
        DbErr::Corruption(msg.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, DbErr::Corruption(_))
    }
}

pub type DbResult<T> = Result<T, DbErr>;
