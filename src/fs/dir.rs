//! Directory entries.
//!
//! A directory is a file containing a sequence of 16-byte entries: a
//! 16-bit i-number followed by a 14-byte NUL-padded name. An entry with
//! i-number 0 is a free slot.

use core::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::param::{DIRENT_SIZE, DIRSIZ};

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct DirEnt {
    /// Referenced i-number; 0 marks a free slot.
    pub ino: u16,
    name: [u8; DIRSIZ],
}

const_assert_eq!(mem::size_of::<DirEnt>(), DIRENT_SIZE);

impl DirEnt {
    pub fn new(ino: u16, name: &[u8]) -> DirEnt {
        let mut entry = DirEnt {
            ino,
            name: [0; DIRSIZ],
        };
        entry.set_name(name);
        entry
    }

    /// Decode one entry from a 16-byte slot.
    pub fn unpack(bytes: &[u8]) -> DirEnt {
        let mut entry = DirEnt::read_from(&bytes[..DIRENT_SIZE]).unwrap();
        entry.ino = u16::from_le(entry.ino);
        entry
    }

    /// Encode this entry into a 16-byte slot.
    pub fn pack(&self, bytes: &mut [u8]) {
        let mut raw = *self;
        raw.ino = raw.ino.to_le();
        bytes[..DIRENT_SIZE].copy_from_slice(raw.as_bytes());
    }

    /// The name up to its first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }

    /// Fill in the name. Names shorter than [`DIRSIZ`] are NUL-padded;
    /// longer ones are truncated.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(DIRSIZ);
        self.name = [0; DIRSIZ];
        self.name[..len].copy_from_slice(&name[..len]);
    }
}
