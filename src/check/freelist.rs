//! Phase 5: verify the free-inode cache and walk the free-block chain
//! against a copy of the allocation map. Phase 6: rebuild the chain from
//! the allocation map when it is beyond repair.

use std::io::{Read, Seek, Write};
use std::mem;

use super::maps::{BlockMap, InodeState};
use super::scan::ScanFlags;
use super::CheckSession;
use crate::param::{BSIZE, DUP_TABLE_SIZE, MAXBAD, NICFREE, NICINOD};

/// Position of the free-list walk.
enum Walk {
    /// Validate the slot count of the current chunk.
    ReadCount,
    /// Hand slots `count-1 .. 1` to the block check.
    ProcessSlots,
    /// Slot 0 points at the next chunk; 0 ends the chain.
    FollowChain,
    Terminate,
}

impl<'a, D, W> CheckSession<'a, D, W>
where
    D: Read + Write + Seek,
    W: Write,
{
    /// Phase 5. Returns the number of blocks found on the free list. The
    /// link-count table and the inode-state map are released here; they
    /// have served their purpose.
    pub(super) fn phase5(&mut self) -> u16 {
        let _ = writeln!(self.out, "** Phase 5 - Check Free List");
        drop(mem::take(&mut self.link_count));
        self.check_free_inode_list();
        drop(mem::take(&mut self.state));

        self.bad_blocks = 0;
        self.dup_blocks = 0;
        let mut free_map = self.block_map.clone();
        let free_blocks = self.check_free_list(&mut free_map);
        drop(free_map);

        if self.bad_blocks > 0 {
            let _ = writeln!(self.out, "{} BAD BLKS IN FREE LIST", self.bad_blocks);
        }
        if self.dup_blocks > 0 {
            let _ = writeln!(self.out, "{} DUP BLKS IN FREE LIST", self.dup_blocks);
        }
        if !self.free_list_corrupted {
            let expected = self.fs.sb.fsize as i32 - self.fs.sb.isize as i32 - 2;
            let seen = self.used_blocks as i32 + free_blocks as i32;
            if seen != expected {
                let _ = writeln!(self.out, "{} BLK(S) MISSING", expected - seen);
                self.free_list_corrupted = true;
            }
        }
        if self.free_list_corrupted {
            let _ = writeln!(self.out, "BAD FREE LIST");
            if !self.fs.writable {
                // Nothing can be fixed; drop the flag so phase 6 is skipped.
                self.free_list_corrupted = false;
            }
        }
        free_blocks
    }

    /// The leading `ninode` slots of the free-inode cache must name
    /// unallocated inodes; on the first offender the cache is truncated
    /// to its valid prefix.
    fn check_free_inode_list(&mut self) {
        let cached = (self.fs.sb.ninode as usize).min(NICINOD);
        for i in 0..cached {
            let inum = self.fs.sb.inode[i];
            let stale = inum > self.fs.ninodes()
                || (inum > 0 && self.state.get(inum) != InodeState::Unallocated);
            if stale {
                let _ = writeln!(self.out, "ALLOCATED INODE(S) IN IFREE LIST");
                if self.fs.writable {
                    self.fs.sb.ninode = i as u16;
                    for slot in self.fs.sb.inode[i..].iter_mut() {
                        *slot = 0;
                    }
                    self.fs.superblock_touched();
                }
                return;
            }
        }
    }

    /// Walk the free-block chain, marking each block in `free_map` and
    /// counting it. Sets the corruption flag on any defect.
    fn check_free_list(&mut self, free_map: &mut BlockMap) -> u16 {
        let mut free_blocks = 0;
        if self.fs.sb.nfree == 0 {
            return 0;
        }
        let mut nfree = self.fs.sb.nfree as usize;
        let mut list = self.fs.sb.free;
        let mut walk = Walk::ReadCount;
        loop {
            walk = match walk {
                Walk::ReadCount => {
                    if nfree == 0 || nfree > NICFREE {
                        let _ = writeln!(self.out, "BAD FREEBLK COUNT");
                        self.free_list_corrupted = true;
                        Walk::Terminate
                    } else {
                        Walk::ProcessSlots
                    }
                }
                Walk::ProcessSlots => {
                    let mut next = Walk::FollowChain;
                    for i in (1..nfree).rev() {
                        if self
                            .pass5(list[i], free_map, &mut free_blocks)
                            .contains(ScanFlags::STOP)
                        {
                            next = Walk::Terminate;
                            break;
                        }
                    }
                    next
                }
                Walk::FollowChain => {
                    let chain = list[0];
                    if chain == 0 {
                        Walk::Terminate
                    } else if self.pass5(chain, free_map, &mut free_blocks) != ScanFlags::KEEPON {
                        Walk::Terminate
                    } else {
                        let mut data = [0u8; BSIZE];
                        match self.fs.read_block(chain, &mut data) {
                            Err(_) => {
                                self.io_error("READ", chain);
                                Walk::Terminate
                            }
                            Ok(()) => {
                                nfree = u16::from_le_bytes([data[0], data[1]]) as usize;
                                for (i, slot) in list.iter_mut().enumerate() {
                                    let at = 2 + 2 * i;
                                    *slot = u16::from_le_bytes([data[at], data[at + 1]]);
                                }
                                Walk::ReadCount
                            }
                        }
                    }
                }
                Walk::Terminate => return free_blocks,
            };
        }
    }

    /// Judge one free-list block: out of range, duplicated, or countable.
    fn pass5(&mut self, bno: u16, free_map: &mut BlockMap, free_blocks: &mut u16) -> ScanFlags {
        if self.fs.outrange(bno) {
            self.free_list_corrupted = true;
            self.bad_blocks += 1;
            if self.bad_blocks >= MAXBAD {
                let _ = writeln!(self.out, "EXCESSIVE BAD BLKS IN FREE LIST.");
                return ScanFlags::STOP;
            }
            return ScanFlags::SKIP;
        }
        if free_map.is_set(bno) {
            self.free_list_corrupted = true;
            self.dup_blocks += 1;
            if self.dup_blocks >= DUP_TABLE_SIZE as u32 {
                let _ = writeln!(self.out, "EXCESSIVE DUP BLKS IN FREE LIST.");
                return ScanFlags::STOP;
            }
        } else {
            *free_blocks += 1;
            free_map.set(bno);
        }
        ScanFlags::KEEPON
    }

    /// Phase 6: rebuild the free list from scratch out of the allocation
    /// map. Returns the rebuilt free-block count.
    pub(super) fn phase6(&mut self) -> u16 {
        let _ = writeln!(self.out, "** Phase 6 - Salvage Free List");
        self.make_free_list()
    }

    fn make_free_list(&mut self) -> u16 {
        self.fs.sb.nfree = 0;
        self.fs.sb.flock = 0;
        self.fs.sb.fmod = 0;
        self.fs.sb.ilock = 0;
        self.fs.sb.ronly = 0;
        self.fs.superblock_touched();

        let mut free_blocks = 0;
        if self.fs.block_free(0).is_err() {
            self.io_error("WRITE", 0);
            return 0;
        }
        let first_data = self.fs.sb.isize + 2;
        for bno in (first_data..self.fs.sb.fsize).rev() {
            if self.block_map.is_set(bno) {
                continue;
            }
            free_blocks += 1;
            if self.fs.block_free(bno).is_err() {
                self.io_error("WRITE", bno);
                return 0;
            }
        }
        free_blocks
    }
}
