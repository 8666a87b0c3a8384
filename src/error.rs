use std::io;

use thiserror::Error;

/// Errors surfaced by the image access layer and the checker.
///
/// Block-level I/O failures inside a check are reported to the diagnostic
/// sink and skipped over; only conditions that make the run meaningless
/// escape as `Err`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("block {0} out of image bounds")]
    BlockOutOfRange(u16),

    #[error("inode {0} outside the inode table")]
    InodeOutOfRange(u16),

    #[error("image opened read-only")]
    ReadOnly,

    #[error("bad filesystem size: total {fsize} blocks with {isize} inode blocks")]
    BadGeometry { fsize: u16, isize: u16 },

    #[error("root inode unallocated")]
    RootUnallocated,

    #[error("root inode is not a directory")]
    RootNotDirectory,
}

pub type Result<T> = std::result::Result<T, Error>;
