//! Layout constants of the V6 on-disk format and the fixed table sizes
//! used by the consistency checker.

/// Block size in bytes.
pub const BSIZE: usize = 512;

/// Inodes per inode-table block.
pub const IPB: usize = BSIZE / DINODE_SIZE;

/// On-disk inode size in bytes.
pub const DINODE_SIZE: usize = 32;

/// Root i-number.
pub const ROOTINO: u16 = 1;

/// Block address slots per inode.
pub const NADDR: usize = 8;

/// Block numbers per indirect block.
pub const NINDIR: usize = BSIZE / 2;

/// Directory entry size in bytes.
pub const DIRENT_SIZE: usize = 16;

/// Filename bytes per directory entry.
pub const DIRSIZ: usize = 14;

/// Free-block slots cached in the superblock (and per chain block).
pub const NICFREE: usize = 100;

/// Free-inode slots cached in the superblock.
pub const NICINOD: usize = 100;

/// Limit on bad block references tolerated per inode.
pub const MAXBAD: u32 = 10;

/// Limit on duplicate block references tolerated per inode.
pub const MAXDUP: u32 = 10;

/// Capacity of the duplicate-block table.
pub const DUP_TABLE_SIZE: usize = 100;

/// Capacity of the zero-link-count inode table.
pub const BAD_LINK_SIZE: usize = 20;
