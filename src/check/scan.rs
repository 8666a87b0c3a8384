//! Block and directory scanners.
//!
//! `scan_inode` walks every block reachable from one inode, handing each
//! to a visitor. Visitors answer with a [`ScanFlags`] mask: `STOP` aborts
//! the whole walk, `SKIP` avoids descending below the current block, and
//! `ALTERD` (from directory visitors) asks for the edited entry to be
//! written back through the block cursor.

use std::io::{Read, Seek, Write};

use bitflags::bitflags;

use super::CheckSession;
use crate::fs::{DirEnt, IMode, Inode};
use crate::param::{BSIZE, DIRENT_SIZE, NADDR};

bitflags! {
    /// Visitor verdict for one visited block or directory entry.
    pub(crate) struct ScanFlags: u8 {
        const STOP = 0o01;
        const SKIP = 0o02;
        const KEEPON = 0o04;
        const ALTERD = 0o10;
    }
}

/// Which blocks of an inode a walk hands to its visitor.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) enum ScanMode {
    /// Visit data blocks and the indirect blocks containing them.
    Addr,
    /// Visit data blocks only; indirect blocks are read transparently.
    Data,
}

impl<'a, D, W> CheckSession<'a, D, W>
where
    D: Read + Write + Seek,
    W: Write,
{
    /// Walk the block list of `inode`, calling `f` per block. Device
    /// inodes own no blocks and are skipped whole. Small inodes carry
    /// eight direct blocks; large ones seven singly-indirect blocks and
    /// one doubly-indirect in the last slot.
    pub(crate) fn scan_inode<F>(&mut self, inode: &Inode, mode: ScanMode, f: &mut F) -> ScanFlags
    where
        F: FnMut(&mut Self, &Inode, u16) -> ScanFlags,
    {
        if inode.is_device() {
            return ScanFlags::KEEPON;
        }
        self.scan_filesize = inode.size as i64;

        if !inode.mode.contains(IMode::LARG) {
            for &bno in inode.addr.iter() {
                if bno != 0 {
                    let ret = f(self, inode, bno);
                    if ret.contains(ScanFlags::STOP) {
                        return ret;
                    }
                }
            }
            return ScanFlags::KEEPON;
        }

        for &bno in inode.addr[..NADDR - 1].iter() {
            if bno != 0 {
                let ret = self.scan_indirect_block(inode, bno, false, mode, f);
                if ret.contains(ScanFlags::STOP) {
                    return ret;
                }
            }
        }
        if inode.addr[NADDR - 1] != 0 {
            let ret = self.scan_indirect_block(inode, inode.addr[NADDR - 1], true, mode, f);
            if ret.contains(ScanFlags::STOP) {
                return ret;
            }
        }
        ScanFlags::KEEPON
    }

    /// Walk one (possibly doubly-) indirect block. In `Addr` mode the
    /// container block itself is visited first; an out-of-range container
    /// is skipped without descent.
    fn scan_indirect_block<F>(
        &mut self,
        inode: &Inode,
        bno: u16,
        double_indirect: bool,
        mode: ScanMode,
        f: &mut F,
    ) -> ScanFlags
    where
        F: FnMut(&mut Self, &Inode, u16) -> ScanFlags,
    {
        if mode == ScanMode::Addr {
            let ret = f(self, inode, bno);
            if !ret.contains(ScanFlags::KEEPON) {
                return ret;
            }
        }
        if self.fs.outrange(bno) {
            return ScanFlags::SKIP;
        }
        let mut data = [0u8; BSIZE];
        if self.fs.read_block(bno, &mut data).is_err() {
            self.io_error("READ", bno);
            return ScanFlags::SKIP;
        }
        for slot in data.chunks_exact(2) {
            let nb = u16::from_le_bytes([slot[0], slot[1]]);
            if nb != 0 {
                let ret = if double_indirect {
                    self.scan_indirect_block(inode, nb, false, mode, f)
                } else {
                    f(self, inode, nb)
                };
                if ret.contains(ScanFlags::STOP) {
                    return ret;
                }
            }
        }
        ScanFlags::KEEPON
    }

    /// Walk the directory data blocks of `inode`, calling `g` per entry.
    pub(crate) fn scan_dir_inode<G>(&mut self, inode: &Inode, g: &mut G) -> ScanFlags
    where
        G: FnMut(&mut Self, &mut DirEnt) -> ScanFlags,
    {
        self.scan_inode(
            inode,
            ScanMode::Data,
            &mut |session: &mut Self, inode: &Inode, bno: u16| session.scan_directory(inode, bno, g),
        )
    }

    /// Walk the 32 entries of one directory block through the cursor,
    /// bounded by the directory's remaining logical size. An `ALTERD`
    /// verdict re-fetches the block and re-serializes the edited entry; if
    /// the re-fetch fails the edit is dropped and the original survives.
    fn scan_directory<G>(&mut self, inode: &Inode, bno: u16, g: &mut G) -> ScanFlags
    where
        G: FnMut(&mut Self, &mut DirEnt) -> ScanFlags,
    {
        if self.fs.outrange(bno) {
            self.scan_filesize -= BSIZE as i64;
            return ScanFlags::SKIP;
        }
        let mut off = 0;
        while off < BSIZE && self.scan_filesize > 0 {
            if !self.cursor.load(&mut *self.fs, &mut *self.out, bno) {
                self.scan_filesize -= (BSIZE - off) as i64;
                return ScanFlags::SKIP;
            }
            let mut entry = DirEnt::unpack(&self.cursor.data()[off..off + DIRENT_SIZE]);

            let mut ret = g(self, &mut entry);

            if ret.contains(ScanFlags::ALTERD) {
                if self.cursor.load(&mut *self.fs, &mut *self.out, bno) {
                    entry.pack(&mut self.cursor.data_mut()[off..off + DIRENT_SIZE]);
                    self.cursor.mark_dirty();
                } else {
                    ret.remove(ScanFlags::ALTERD);
                }
            }
            if ret.contains(ScanFlags::STOP) {
                return ret;
            }
            off += DIRENT_SIZE;
            self.scan_filesize -= DIRENT_SIZE as i64;
        }
        if self.scan_filesize > 0 {
            ScanFlags::KEEPON
        } else {
            ScanFlags::STOP
        }
    }
}
