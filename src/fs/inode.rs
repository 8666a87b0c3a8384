//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk structure packs
//! the mode word, the link count, owner ids, a 24-bit size, eight block
//! address slots, and two timestamps into 32 bytes, sixteen to a block.
//!
//! Small files keep direct block numbers in all eight address slots. When
//! the mode carries `LARG`, slots 0..7 are singly-indirect blocks and slot
//! 7 is doubly-indirect. Character and block device inodes keep their
//! device id in slot 0 and own no data blocks.

use core::mem;

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::{decode_time, encode_time};
use crate::param::{DINODE_SIZE, NADDR};

bitflags! {
    /// On-disk inode mode word (octal, PDP-11 heritage).
    pub struct IMode: u16 {
        /// Inode is allocated.
        const ALLOC = 0o100000;
        /// File-format subfield mask; see [`InodeType`].
        const FMT = 0o060000;
        /// Directory format bits.
        const DIR = 0o040000;
        /// Character-device format bits.
        const CHR = 0o020000;
        /// Addresses are indirect (large file).
        const LARG = 0o010000;
        const SUID = 0o004000;
        const SGID = 0o002000;
        const SVTX = 0o001000;
        /// rwx permission bits for owner, group, other.
        const PERM = 0o000777;
    }
}

/// Decoded file-format subfield of the mode word.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    Regular,
    Dir,
    Char,
    Block,
}

impl IMode {
    pub fn typ(self) -> InodeType {
        match self.bits() & IMode::FMT.bits() {
            0o040000 => InodeType::Dir,
            0o020000 => InodeType::Char,
            0o060000 => InodeType::Block,
            _ => InodeType::Regular,
        }
    }
}

/// In-memory copy of one inode, materialized by [`U6fs::inode_get`].
///
/// `dirty` tracks in-memory edits made through [`Inode::clear`], so a
/// non-full [`U6fs::inode_save`] can skip untouched inodes.
///
/// [`U6fs::inode_get`]: super::U6fs::inode_get
/// [`U6fs::inode_save`]: super::U6fs::inode_save
#[derive(Clone)]
pub struct Inode {
    /// I-number, 1-based.
    pub number: u16,
    pub mode: IMode,
    pub nlink: i16,
    pub uid: u8,
    pub gid: u8,
    /// Size in bytes; 24 bits on disk.
    pub size: u32,
    pub addr: [u16; NADDR],
    pub atime: u32,
    pub mtime: u32,
    dirty: bool,
}

/// On-disk inode structure.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct Dinode {
    mode: u16,
    nlink: u8,
    uid: u8,
    gid: u8,
    size0: u8,
    size1: u16,
    addr: [u16; NADDR],
    atime: [u16; 2],
    mtime: [u16; 2],
}

const_assert_eq!(mem::size_of::<Dinode>(), DINODE_SIZE);

impl Inode {
    pub fn is_allocated(&self) -> bool {
        self.mode.contains(IMode::ALLOC)
    }

    pub fn typ(&self) -> InodeType {
        self.mode.typ()
    }

    pub fn is_device(&self) -> bool {
        matches!(self.typ(), InodeType::Char | InodeType::Block)
    }

    pub fn is_dir(&self) -> bool {
        self.typ() == InodeType::Dir
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Zero the mode, link count, size and addresses in memory. The change
    /// reaches the disk at the next save.
    pub fn clear(&mut self) {
        self.mode = IMode::empty();
        self.nlink = 0;
        self.size = 0;
        self.addr = [0; NADDR];
        self.dirty = true;
    }

    pub(crate) fn decode(number: u16, bytes: &[u8]) -> Inode {
        let raw = Dinode::read_from(bytes).unwrap();
        let mut addr = raw.addr;
        for w in addr.iter_mut() {
            *w = u16::from_le(*w);
        }
        Inode {
            number,
            mode: IMode::from_bits_truncate(u16::from_le(raw.mode)),
            nlink: (raw.nlink as i8) as i16,
            uid: raw.uid,
            gid: raw.gid,
            size: (raw.size0 as u32) << 16 | u16::from_le(raw.size1) as u32,
            addr,
            atime: decode_time(raw.atime),
            mtime: decode_time(raw.mtime),
            dirty: false,
        }
    }

    pub(crate) fn encode(&self, bytes: &mut [u8]) {
        let mut addr = self.addr;
        for w in addr.iter_mut() {
            *w = w.to_le();
        }
        let raw = Dinode {
            mode: self.mode.bits().to_le(),
            nlink: self.nlink as u8,
            uid: self.uid,
            gid: self.gid,
            size0: (self.size >> 16) as u8,
            size1: (self.size as u16).to_le(),
            addr,
            atime: encode_time(self.atime),
            mtime: encode_time(self.mtime),
        };
        bytes[..DINODE_SIZE].copy_from_slice(raw.as_bytes());
    }

    pub(crate) fn mark_saved(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_subfield() {
        let m = IMode::from_bits_truncate(0o100755);
        assert!(m.contains(IMode::ALLOC));
        assert_eq!(m.typ(), InodeType::Regular);
        assert_eq!(IMode::from_bits_truncate(0o140777).typ(), InodeType::Dir);
        assert_eq!(IMode::from_bits_truncate(0o120000).typ(), InodeType::Char);
        assert_eq!(IMode::from_bits_truncate(0o160000).typ(), InodeType::Block);
    }

    #[test]
    fn codec_round_trip() {
        let mut ino = Inode::decode(7, &[0u8; DINODE_SIZE]);
        assert!(!ino.is_allocated());
        ino.mode = IMode::ALLOC | IMode::DIR | IMode::from_bits_truncate(0o755);
        ino.nlink = 2;
        ino.uid = 3;
        ino.size = 0x01_2345;
        ino.addr[0] = 42;
        ino.mtime = 0xdead_beef;

        let mut bytes = [0u8; DINODE_SIZE];
        ino.encode(&mut bytes);
        // 24-bit size splits into a high byte and a little-endian low word.
        assert_eq!(bytes[5], 0x01);
        assert_eq!(&bytes[6..8], &[0x45, 0x23]);

        let back = Inode::decode(7, &bytes);
        assert_eq!(back.mode, ino.mode);
        assert_eq!(back.nlink, 2);
        assert_eq!(back.size, 0x01_2345);
        assert_eq!(back.addr[0], 42);
        assert_eq!(back.mtime, 0xdead_beef);
    }

    #[test]
    fn negative_link_count_survives() {
        let mut ino = Inode::decode(1, &[0u8; DINODE_SIZE]);
        ino.nlink = -1;
        let mut bytes = [0u8; DINODE_SIZE];
        ino.encode(&mut bytes);
        assert_eq!(Inode::decode(1, &bytes).nlink, -1);
    }

    #[test]
    fn clear_marks_dirty() {
        let mut ino = Inode::decode(2, &[0u8; DINODE_SIZE]);
        ino.mode = IMode::ALLOC;
        assert!(!ino.is_dirty());
        ino.clear();
        assert!(ino.is_dirty());
        assert!(ino.mode.is_empty());
    }
}
