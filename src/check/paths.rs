//! Phase 2: pathname walk from the root; phase 3: connectivity of
//! directories the walk never reached, with `lost+found` reconnection.

use std::io::{Read, Seek, Write};

use super::maps::InodeState;
use super::scan::ScanFlags;
use super::CheckSession;
use crate::error::{Error, Result};
use crate::fs::{DirEnt, IMode, Inode};
use crate::param::{BSIZE, ROOTINO};

const LOST_FOUND: &[u8] = b"lost+found";

impl<'a, D, W> CheckSession<'a, D, W>
where
    D: Read + Write + Seek,
    W: Write,
{
    /// Phase 2: recurse over the directory tree from the root, checking
    /// every entry and counting the references it contributes.
    pub(super) fn phase2(&mut self) -> Result<()> {
        let _ = writeln!(self.out, "** Phase 2 - Check Pathnames");
        self.path.clear();
        match self.state.get(ROOTINO) {
            InodeState::Unallocated => {
                let _ = writeln!(self.out, "ROOT INODE UNALLOCATED. TERMINATING.");
                return Err(Error::RootUnallocated);
            }
            InodeState::File => {
                let _ = writeln!(self.out, "ROOT INODE NOT DIRECTORY");
                if !self.fs.writable {
                    return Err(Error::RootNotDirectory);
                }
                let mut root = self.fs.inode_get(ROOTINO)?;
                root.mode.remove(IMode::FMT);
                root.mode.insert(IMode::DIR);
                self.fs.inode_save(&mut root, true)?;
                self.state.set(ROOTINO, InodeState::Dir);
                self.scan_pass2(ROOTINO);
            }
            InodeState::Dir => self.scan_pass2(ROOTINO),
            InodeState::Clear => {
                let _ = writeln!(self.out, "DUPS/BAD IN ROOT INODE");
                self.state.set(ROOTINO, InodeState::Dir);
                self.scan_pass2(ROOTINO);
            }
        }
        Ok(())
    }

    /// Traverse one directory, keeping the pathname accumulator current.
    /// Marking the inode `File` up front doubles as the visited flag.
    pub(super) fn scan_pass2(&mut self, inum: u16) {
        self.state.set(inum, InodeState::File);
        let inode = match self.fs.inode_get(inum) {
            Ok(inode) => inode,
            Err(_) => return,
        };
        let saved_len = self.path.len();
        self.path.push(b'/');
        let saved_size = self.scan_filesize;
        self.scan_dir_inode(&inode, &mut Self::pass2);
        self.scan_filesize = saved_size;
        self.path.truncate(saved_len);
    }

    /// Judge one directory entry: clear references to unallocated or
    /// dup/bad inodes, count the rest, recurse into directories.
    fn pass2(&mut self, entry: &mut DirEnt) -> ScanFlags {
        let inum = entry.ino;
        if inum == 0 {
            return ScanFlags::KEEPON;
        }
        let saved_len = self.path.len();
        self.path.extend_from_slice(entry.name_bytes());
        let mut ret = ScanFlags::KEEPON;

        if inum < ROOTINO || inum > self.fs.ninodes() {
            self.dir_error(inum, "I OUT OF RANGE");
        } else {
            // A demoted dup/bad inode is re-judged once under its new
            // state; a second arrival here means the mode itself is junk.
            let mut redispatched = false;
            loop {
                match self.state.get(inum) {
                    InodeState::Unallocated => {
                        self.dir_error(inum, "UNALLOCATED");
                        if self.fs.writable {
                            entry.ino = 0;
                            ret |= ScanFlags::ALTERD;
                        }
                    }
                    InodeState::Clear => {
                        self.dir_error(inum, "DUP/BAD");
                        if self.fs.writable {
                            entry.ino = 0;
                            ret |= ScanFlags::ALTERD;
                        } else if !redispatched {
                            if let Ok(target) = self.fs.inode_get(inum) {
                                self.state.set(
                                    inum,
                                    if target.is_dir() {
                                        InodeState::Dir
                                    } else {
                                        InodeState::File
                                    },
                                );
                                redispatched = true;
                                continue;
                            }
                        }
                    }
                    InodeState::File => {
                        self.link_count[inum as usize] -= 1;
                    }
                    InodeState::Dir => {
                        self.link_count[inum as usize] -= 1;
                        self.scan_pass2(inum);
                    }
                }
                break;
            }
        }
        self.path.truncate(saved_len);
        ret
    }

    /// `I OUT OF RANGE` / `UNALLOCATED` / `DUP/BAD` with inode detail and
    /// the path reached at the moment of the defect.
    fn dir_error(&mut self, inum: u16, what: &str) {
        let path = self.path_string();
        match self.fs.inode_get(inum) {
            Err(_) => {
                let _ = write!(self.out, "{}  I={}\nNAME={}\n", what, inum, path);
            }
            Ok(inode) => {
                let _ = write!(self.out, "{} ", what);
                self.print_inode(&inode);
                let _ = writeln!(self.out, "{}={}", Self::type_name(&inode), path);
            }
        }
    }

    /// Phase 3: every directory phase 2 never reached is climbed towards
    /// the root through `..`. A climb that dead-ends (no `..`, an
    /// unresolvable parent, or a cycle) reconnects the directory where it
    /// stalled into `lost+found`, then re-walks the recovered subtree.
    pub(super) fn phase3(&mut self) {
        let _ = writeln!(self.out, "** Phase 3 - Check Connectivity");
        for inum in ROOTINO..=self.last_allocated {
            if self.state.get(inum) != InodeState::Dir {
                continue;
            }
            let mut climbed = vec![inum];
            let mut ino = inum;
            loop {
                let inode = match self.fs.inode_get(ino) {
                    Ok(inode) => inode,
                    Err(_) => break,
                };
                let parent = self.find_entry(&inode, b"..");
                if parent == 0 || climbed.contains(&parent) {
                    // Parent link lost.
                    if self.move_to_lost_found(&inode) {
                        self.path.clear();
                        self.path.push(b'?');
                        self.scan_pass2(ino);
                    }
                    break;
                }
                ino = parent;
                if self.state.get(ino) != InodeState::Dir {
                    break;
                }
                climbed.push(ino);
            }
        }
    }

    /// Look `name` up in one directory; 0 when absent or out of range.
    pub(super) fn find_entry(&mut self, inode: &Inode, name: &[u8]) -> u16 {
        let ninodes = self.fs.ninodes();
        let mut found = 0;
        self.scan_dir_inode(inode, &mut |_session: &mut Self, entry: &mut DirEnt| {
            if entry.ino == 0 {
                return ScanFlags::KEEPON;
            }
            if entry.name_bytes() == name {
                if entry.ino >= ROOTINO && entry.ino <= ninodes {
                    found = entry.ino;
                }
                return ScanFlags::STOP;
            }
            ScanFlags::KEEPON
        });
        found
    }

    fn find_lost_found(&mut self) -> u16 {
        match self.fs.inode_get(ROOTINO) {
            Ok(root) => self.find_entry(&root, LOST_FOUND),
            Err(_) => 0,
        }
    }

    /// Reconnect an unreferenced inode under `lost+found` as `#NNNNN`.
    /// For a directory the `..` entry is rewritten to point there and the
    /// `lost+found` link count grows by one.
    pub(super) fn move_to_lost_found(&mut self, inode: &Inode) -> bool {
        let _ = write!(self.out, "UNREF {} ", Self::type_name(inode));
        self.print_inode(inode);
        if !self.fs.writable {
            return false;
        }

        if self.lost_found == 0 {
            self.lost_found = self.find_lost_found();
            if self.lost_found == 0 {
                let _ = write!(self.out, "SORRY. NO lost+found DIRECTORY\n\n");
                return false;
            }
        }
        let mut lf = match self.fs.inode_get(self.lost_found) {
            Ok(lf) => lf,
            Err(_) => {
                let _ = write!(self.out, "SORRY. NO lost+found DIRECTORY\n\n");
                return false;
            }
        };
        if !lf.is_dir() || self.state.get(self.lost_found) != InodeState::File {
            let _ = write!(self.out, "SORRY. NO lost+found DIRECTORY\n\n");
            return false;
        }
        if lf.size % BSIZE as u32 != 0 {
            // Pad to a block multiple so every slot of the last block is
            // inside the scanned size.
            lf.size = (lf.size + BSIZE as u32 - 1) / BSIZE as u32 * BSIZE as u32;
            if self.fs.inode_save(&mut lf, true).is_err() {
                let _ = write!(self.out, "SORRY. ERROR WRITING lost+found I-NODE\n\n");
                return false;
            }
        }

        // Plant the reconnection link in the first free slot.
        let lost = inode.number;
        let planted = self.scan_dir_inode(&lf, &mut |_session: &mut Self, entry: &mut DirEnt| {
            if entry.ino != 0 {
                return ScanFlags::KEEPON;
            }
            entry.ino = lost;
            entry.set_name(format!("#{:05}", lost).as_bytes());
            ScanFlags::ALTERD | ScanFlags::STOP
        });
        if !planted.contains(ScanFlags::ALTERD) {
            let _ = write!(self.out, "SORRY. NO SPACE IN lost+found DIRECTORY\n\n");
            return false;
        }
        self.link_count[lost as usize] -= 1;

        if inode.is_dir() {
            let lf_inum = self.lost_found;
            self.scan_dir_inode(inode, &mut |_session: &mut Self, entry: &mut DirEnt| {
                if entry.name_bytes() == b".." {
                    entry.ino = lf_inum;
                    return ScanFlags::ALTERD | ScanFlags::STOP;
                }
                ScanFlags::KEEPON
            });
            if let Ok(mut lf) = self.fs.inode_get(self.lost_found) {
                lf.nlink += 1;
                self.link_count[self.lost_found as usize] += 1;
                if self.fs.inode_save(&mut lf, true).is_err() {
                    let _ = write!(self.out, "SORRY. ERROR WRITING lost+found I-NODE\n\n");
                    return false;
                }
            }
            let _ = write!(self.out, "DIR I={} CONNECTED.\n\n", inode.number);
        }
        true
    }
}
