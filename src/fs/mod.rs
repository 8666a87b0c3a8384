//! V6 image access layer. Four layers, leaves first:
//!   + Blocks: bounds-checked 512-byte reads and writes on the backing
//!     device, plus the free-block chain push.
//!   + Superblock: geometry and the cached free-block/free-inode heads.
//!   + Inodes: materializing and persisting 32-byte on-disk inodes.
//!   + Directories: 16-byte entry codec.
//!
//! The consistency checker in [`crate::check`] drives everything through
//! this interface and owns the handle for the duration of a run.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::{Error, Result};
use crate::param::{BSIZE, DINODE_SIZE, DIRENT_SIZE, IPB, NICFREE, ROOTINO};

pub mod dir;
pub mod inode;
pub mod superblock;

pub use dir::DirEnt;
pub use inode::{IMode, Inode, InodeType};
pub use superblock::Superblock;

/// Handle on one filesystem image.
///
/// `D` is the backing device; a [`std::fs::File`] over an image file, or a
/// [`std::io::Cursor`] over bytes in tests. All mutation is gated on
/// `writable`; `modified` records whether any block actually hit the
/// device.
pub struct U6fs<D> {
    dev: D,
    pub sb: Superblock,
    pub writable: bool,
    pub modified: bool,
    dirty: bool,
}

impl<D: Read + Write + Seek> U6fs<D> {
    /// Open an existing image: decode the superblock from block 1.
    pub fn open(mut dev: D, writable: bool) -> Result<U6fs<D>> {
        dev.seek(SeekFrom::Start(BSIZE as u64))?;
        let mut buf = [0u8; BSIZE];
        dev.read_exact(&mut buf)?;
        let sb = Superblock::decode(&buf);
        debug!(
            "opened image: fsize {} isize {} writable {}",
            sb.fsize, sb.isize, writable
        );
        Ok(U6fs {
            dev,
            sb,
            writable,
            modified: false,
            dirty: false,
        })
    }

    /// Create a fresh image: boot block, superblock, zeroed inode table, a
    /// root directory holding `.` and `..` in the first data block, and a
    /// free-block chain threading every remaining data block.
    pub fn create(dev: D, fsize: u16, isize: u16) -> Result<U6fs<D>> {
        if isize as u32 + 2 >= fsize as u32 {
            return Err(Error::BadGeometry { fsize, isize });
        }
        let mut fs = U6fs {
            dev,
            sb: Superblock::new(isize, fsize),
            writable: true,
            modified: false,
            dirty: true,
        };
        let zero = [0u8; BSIZE];
        for bno in 0..fsize {
            fs.write_block(bno, &zero)?;
        }

        let first_data = isize + 2;
        let mut root = fs.inode_get(ROOTINO)?;
        root.mode = IMode::ALLOC | IMode::DIR | IMode::from_bits_truncate(0o777);
        root.nlink = 2;
        root.size = 2 * DIRENT_SIZE as u32;
        root.addr[0] = first_data;
        root.mtime = timestamp_now();
        fs.inode_save(&mut root, true)?;

        let mut block = [0u8; BSIZE];
        DirEnt::new(ROOTINO, b".").pack(&mut block[..DIRENT_SIZE]);
        DirEnt::new(ROOTINO, b"..").pack(&mut block[DIRENT_SIZE..2 * DIRENT_SIZE]);
        fs.write_block(first_data, &block)?;

        // Sentinel 0 terminates the chain; data blocks go on high to low.
        fs.block_free(0)?;
        for bno in (first_data + 1..fsize).rev() {
            fs.block_free(bno)?;
        }
        fs.sb.time = timestamp_now();
        fs.dirty = true;
        fs.sync(false)?;
        fs.modified = false;
        Ok(fs)
    }

    /// Give the backing device back, e.g. to reopen with different access.
    pub fn into_inner(self) -> D {
        self.dev
    }

    /// Number of inode slots in the table.
    pub fn ninodes(&self) -> u16 {
        ((self.sb.isize as u32) * IPB as u32).min(u16::MAX as u32) as u16
    }

    /// A block number is usable iff it addresses the data area.
    pub fn outrange(&self, bno: u16) -> bool {
        (bno as u32) < self.sb.isize as u32 + 2 || bno >= self.sb.fsize
    }

    pub fn read_block(&mut self, bno: u16, buf: &mut [u8; BSIZE]) -> Result<()> {
        if bno >= self.sb.fsize {
            return Err(Error::BlockOutOfRange(bno));
        }
        self.dev.seek(SeekFrom::Start(bno as u64 * BSIZE as u64))?;
        self.dev.read_exact(buf)?;
        Ok(())
    }

    pub fn write_block(&mut self, bno: u16, buf: &[u8; BSIZE]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        if bno >= self.sb.fsize {
            return Err(Error::BlockOutOfRange(bno));
        }
        debug!("write blk {}", bno);
        self.dev.seek(SeekFrom::Start(bno as u64 * BSIZE as u64))?;
        self.dev.write_all(buf)?;
        self.modified = true;
        Ok(())
    }

    /// Materialize inode `inum` (1-based) from the inode table.
    pub fn inode_get(&mut self, inum: u16) -> Result<Inode> {
        if inum < 1 || inum > self.ninodes() {
            return Err(Error::InodeOutOfRange(inum));
        }
        let mut buf = [0u8; BSIZE];
        self.read_block(iblock(inum), &mut buf)?;
        let off = ioffset(inum);
        Ok(Inode::decode(inum, &buf[off..off + DINODE_SIZE]))
    }

    /// Persist an inode. With `full` unset, only inodes carrying in-memory
    /// edits are written; either way this is a no-op on a read-only image.
    pub fn inode_save(&mut self, inode: &mut Inode, full: bool) -> Result<()> {
        if !full && !inode.is_dirty() {
            return Ok(());
        }
        if !self.writable {
            return Ok(());
        }
        let inum = inode.number;
        if inum < 1 || inum > self.ninodes() {
            return Err(Error::InodeOutOfRange(inum));
        }
        let bno = iblock(inum);
        let mut buf = [0u8; BSIZE];
        self.read_block(bno, &mut buf)?;
        let off = ioffset(inum);
        inode.encode(&mut buf[off..off + DINODE_SIZE]);
        self.write_block(bno, &buf)?;
        inode.mark_saved();
        Ok(())
    }

    /// Push `bno` onto the free-block chain. A full cache is first spilled
    /// into `bno` itself, which then becomes the new chain head.
    pub fn block_free(&mut self, bno: u16) -> Result<()> {
        if self.sb.nfree as usize >= NICFREE {
            let mut buf = [0u8; BSIZE];
            buf[..2].copy_from_slice(&self.sb.nfree.to_le_bytes());
            for (i, w) in self.sb.free.iter().enumerate() {
                buf[2 + 2 * i..4 + 2 * i].copy_from_slice(&w.to_le_bytes());
            }
            self.write_block(bno, &buf)?;
            self.sb.nfree = 0;
        }
        self.sb.free[self.sb.nfree as usize] = bno;
        self.sb.nfree += 1;
        self.dirty = true;
        Ok(())
    }

    /// Persist the superblock if it has pending changes (or when forced).
    pub fn sync(&mut self, force: bool) -> Result<()> {
        if (self.dirty || force) && self.writable {
            let mut buf = [0u8; BSIZE];
            self.sb.encode(&mut buf);
            self.write_block(1, &buf)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Note a superblock change that `sync` must persist.
    pub fn superblock_touched(&mut self) {
        self.dirty = true;
    }
}

/// Inode-table block holding inode `inum`.
fn iblock(inum: u16) -> u16 {
    2 + (inum - 1) / IPB as u16
}

/// Byte offset of inode `inum` within its block.
fn ioffset(inum: u16) -> usize {
    ((inum - 1) as usize % IPB) * DINODE_SIZE
}

/// Decode a 32-bit timestamp stored as two little-endian words, high word
/// first (PDP-11 convention).
pub(crate) fn decode_time(words: [u16; 2]) -> u32 {
    (u16::from_le(words[0]) as u32) << 16 | u16::from_le(words[1]) as u32
}

pub(crate) fn encode_time(time: u32) -> [u16; 2] {
    [((time >> 16) as u16).to_le(), (time as u16).to_le()]
}

pub(crate) fn timestamp_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn image(fsize: u16, isize: u16) -> U6fs<Cursor<Vec<u8>>> {
        let dev = Cursor::new(vec![0u8; fsize as usize * BSIZE]);
        U6fs::create(dev, fsize, isize).unwrap()
    }

    #[test]
    fn create_then_reopen() {
        let fs = image(10, 1);
        let dev = fs.into_inner();
        let mut fs = U6fs::open(dev, false).unwrap();
        assert_eq!(fs.sb.fsize, 10);
        assert_eq!(fs.sb.isize, 1);
        assert_eq!(fs.ninodes(), 16);

        let root = fs.inode_get(ROOTINO).unwrap();
        assert!(root.is_allocated());
        assert!(root.is_dir());
        assert_eq!(root.nlink, 2);
        assert_eq!(root.addr[0], 3);

        // Free chain holds the sentinel plus blocks 9..4.
        assert_eq!(fs.sb.nfree, 7);
        assert_eq!(fs.sb.free[0], 0);
        assert_eq!(fs.sb.free[1], 9);
        assert_eq!(fs.sb.free[6], 4);
    }

    #[test]
    fn root_directory_entries() {
        let mut fs = image(10, 1);
        let mut buf = [0u8; BSIZE];
        fs.read_block(3, &mut buf).unwrap();
        let dot = DirEnt::unpack(&buf[..DIRENT_SIZE]);
        let dotdot = DirEnt::unpack(&buf[DIRENT_SIZE..2 * DIRENT_SIZE]);
        assert_eq!((dot.ino, dot.name_bytes()), (ROOTINO, &b"."[..]));
        assert_eq!((dotdot.ino, dotdot.name_bytes()), (ROOTINO, &b".."[..]));
    }

    #[test]
    fn free_chain_spills_into_chain_blocks() {
        // Enough data blocks to force at least one spill of the 100-slot
        // cache while creating the free list.
        let fs = image(200, 1);
        let mut fs = U6fs::open(fs.into_inner(), false).unwrap();
        // 196 free blocks + sentinel = 197 pushes; one spill happened.
        assert!(fs.sb.nfree <= 100);
        let chain = fs.sb.free[0];
        assert_ne!(chain, 0);
        let mut buf = [0u8; BSIZE];
        fs.read_block(chain, &mut buf).unwrap();
        let count = u16::from_le_bytes([buf[0], buf[1]]);
        assert_eq!(count, 100);
        // The spilled chunk ends in the sentinel.
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0);
    }

    #[test]
    fn read_only_handles_refuse_writes() {
        let fs = image(10, 1);
        let mut fs = U6fs::open(fs.into_inner(), false).unwrap();
        let buf = [0u8; BSIZE];
        assert!(matches!(
            fs.write_block(4, &buf),
            Err(Error::ReadOnly)
        ));
        // Saving without `full` silently skips clean inodes.
        let mut root = fs.inode_get(ROOTINO).unwrap();
        fs.inode_save(&mut root, false).unwrap();
        assert!(!fs.modified);
    }
}
