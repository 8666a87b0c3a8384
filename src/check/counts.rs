//! Phase 4: settle reference counts. Files whose stored link count does
//! not match the references phase 2 observed are fixed or relocated;
//! directories phase 2 never reached and inodes with bad/dup blocks are
//! cleared.

use std::io::{Read, Seek, Write};

use super::maps::InodeState;
use super::scan::{ScanFlags, ScanMode};
use super::CheckSession;
use crate::fs::Inode;
use crate::param::ROOTINO;

impl<'a, D, W> CheckSession<'a, D, W>
where
    D: Read + Write + Seek,
    W: Write,
{
    pub(super) fn phase4(&mut self) {
        let _ = writeln!(self.out, "** Phase 4 - Check Reference Counts");
        for inum in ROOTINO..=self.last_allocated {
            match self.state.get(inum) {
                InodeState::File => {
                    let leftover = self.link_count[inum as usize];
                    if leftover != 0 {
                        self.adjust_link_count(inum, leftover);
                    } else if self.bad_link.contains(&inum) {
                        self.clear_inode(inum, Some("UNREF"));
                    }
                }
                InodeState::Dir => self.clear_inode(inum, Some("UNREF")),
                InodeState::Clear => self.clear_inode(inum, Some("BAD/DUP")),
                InodeState::Unallocated => {}
            }
        }
        self.cursor.flush(&mut *self.fs, &mut *self.out);
    }

    /// The stored link count disagrees with the observed references by
    /// `leftover`. When nothing at all references the inode, move it to
    /// `lost+found` (clearing it if that fails); otherwise rewrite the
    /// count.
    fn adjust_link_count(&mut self, inum: u16, leftover: i16) {
        let mut inode = match self.fs.inode_get(inum) {
            Ok(inode) => inode,
            Err(_) => return,
        };
        if inode.nlink == leftover {
            if !self.move_to_lost_found(&inode) {
                self.clear_inode(inum, None);
            }
        } else {
            let tag = if inum == self.lost_found {
                "lost+found"
            } else {
                Self::type_name(&inode)
            };
            let _ = write!(self.out, "LINK COUNT {}", tag);
            self.print_inode(&inode);
            let fixed = (inode.nlink - leftover).max(0);
            let _ = writeln!(self.out, "COUNT {} SHOULD BE {}", inode.nlink, fixed);
            if self.fs.writable {
                inode.nlink = fixed;
                let _ = self.fs.inode_save(&mut inode, true);
            }
        }
    }

    /// Clear an inode on disk, releasing its blocks back into the primary
    /// map. Blocks still present in the dup table belong to another inode
    /// and are only unlisted, never freed.
    pub(super) fn clear_inode(&mut self, inum: u16, msg: Option<&str>) {
        let mut inode = match self.fs.inode_get(inum) {
            Ok(inode) => inode,
            Err(_) => return,
        };
        if let Some(msg) = msg {
            let _ = write!(self.out, "{} {}", msg, Self::type_name(&inode));
            self.print_inode(&inode);
        }
        if self.fs.writable {
            self.total_files -= 1;
            self.scan_inode(&inode, ScanMode::Addr, &mut Self::pass4);
            inode.clear();
            let _ = self.fs.inode_save(&mut inode, true);
        }
    }

    fn pass4(&mut self, _inode: &Inode, bno: u16) -> ScanFlags {
        if self.fs.outrange(bno) {
            return ScanFlags::SKIP;
        }
        if self.block_map.is_set(bno) && !self.dup.remove(bno) {
            self.block_map.clear(bno);
        }
        ScanFlags::KEEPON
    }
}
