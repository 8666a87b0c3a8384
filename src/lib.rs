//! Unix V6 filesystem images: access and consistency checking.
//!
//! The [`fs`] module reads and writes the on-disk structures of a V6
//! image (512-byte blocks, 16-byte directory entries, 16 inodes per
//! table block) behind a [`U6fs`] handle generic over its backing device.
//! The [`check`] module is a six-phase offline fsck over that handle:
//! it verifies block references, directory structure, link counts and
//! the free list, and repairs what it can when the image is writable.
//!
//! ```no_run
//! use std::fs::OpenOptions;
//! use u6fs::U6fs;
//!
//! # fn main() -> u6fs::Result<()> {
//! let file = OpenOptions::new().read(true).write(true).open("v6.dsk")?;
//! let mut fs = U6fs::open(file, true)?;
//! let summary = u6fs::check(&mut fs, &mut std::io::stdout())?;
//! println!("{} blocks free", summary.free_blocks);
//! # Ok(())
//! # }
//! ```

pub mod check;
mod error;
pub mod fs;
pub mod param;

pub use check::{check, CheckSummary};
pub use error::{Error, Result};
pub use fs::{DirEnt, IMode, Inode, InodeType, Superblock, U6fs};
