//! Filesystem consistency check and repair.
//!
//! [`check`] runs six sequential phases over the image:
//!   1.  walk every allocated inode, marking referenced blocks and
//!       collecting duplicates and suspicious link counts;
//!   1b. rescan to pin down the original owners of duplicated blocks;
//!   2.  walk the directory tree from the root, validating every entry
//!       and counting real references;
//!   3.  reconnect directories that no path reaches into `lost+found`;
//!   4.  settle reference counts, clearing or relocating orphans;
//!   5.  verify the free-block chain and the free-inode cache;
//!   6.  rebuild the free list from the allocation map when it is bad.
//!
//! Diagnostics go to a caller-supplied sink; on a writable image defects
//! are repaired in place, otherwise they are only reported. All transient
//! state lives in a [`CheckSession`] that borrows the image handle for the
//! duration of the run.

mod counts;
mod cursor;
mod freelist;
mod maps;
mod paths;
mod scan;

use std::io::{Read, Seek, Write};

use arrayvec::ArrayVec;
use log::debug;

use self::cursor::BlockCursor;
use self::maps::{BlockMap, DupTable, InodeState, InodeStateMap};
use self::scan::{ScanFlags, ScanMode};
use crate::error::{Error, Result};
use crate::fs::{timestamp_now, Inode, InodeType, U6fs};
use crate::param::{BAD_LINK_SIZE, MAXBAD, MAXDUP};

/// Totals reported by a completed check.
#[derive(Debug, Clone, Copy)]
pub struct CheckSummary {
    /// Allocated inodes remaining on the image.
    pub files: u16,
    /// Blocks referenced by inodes.
    pub used_blocks: u16,
    /// Blocks threaded on the free list.
    pub free_blocks: u16,
    /// Whether any write reached the image.
    pub modified: bool,
}

/// Check the image, writing diagnostics to `out`.
///
/// On a writable handle defects are repaired in place. `Ok` means the
/// image was processed, corrupt or not; `Err` is reserved for fatal
/// conditions: unusable geometry or an unusable root inode.
pub fn check<D, W>(fs: &mut U6fs<D>, out: &mut W) -> Result<CheckSummary>
where
    D: Read + Write + Seek,
    W: Write,
{
    let isize = fs.sb.isize;
    let fsize = fs.sb.fsize;
    if isize as u32 + 2 >= fsize as u32 {
        return Err(Error::BadGeometry { fsize, isize });
    }
    let ninodes = fs.ninodes();
    let mut session = CheckSession {
        state: InodeStateMap::new(ninodes as usize + 1),
        block_map: BlockMap::new(fsize as usize),
        link_count: vec![0; ninodes as usize + 1],
        dup: DupTable::new(),
        bad_link: ArrayVec::new(),
        cursor: BlockCursor::new(),
        path: Vec::new(),
        scan_filesize: 0,
        total_files: 0,
        used_blocks: 0,
        bad_blocks: 0,
        dup_blocks: 0,
        free_list_corrupted: false,
        lost_found: 0,
        last_allocated: 0,
        fs,
        out,
    };
    session.run()
}

/// All transient state of one check run.
pub(crate) struct CheckSession<'a, D, W> {
    fs: &'a mut U6fs<D>,
    out: &'a mut W,
    /// Per-inode check state, 2 bits each.
    state: InodeStateMap,
    /// Primary allocation map: blocks referenced by inodes.
    block_map: BlockMap,
    /// Stored link count minus observed directory references, per inode.
    link_count: Vec<i16>,
    dup: DupTable,
    /// Inodes whose stored link count was not positive.
    bad_link: ArrayVec<u16, BAD_LINK_SIZE>,
    cursor: BlockCursor,
    /// Pathname accumulator for phase-2 diagnostics.
    path: Vec<u8>,
    /// Remaining logical bytes of the directory being scanned.
    scan_filesize: i64,
    total_files: u16,
    used_blocks: u16,
    /// Bad/dup sightings for the inode (or free list) under scan.
    bad_blocks: u32,
    dup_blocks: u32,
    free_list_corrupted: bool,
    /// Cached `lost+found` i-number, located on first use.
    lost_found: u16,
    /// High-water mark of allocated i-numbers.
    last_allocated: u16,
}

impl<'a, D, W> CheckSession<'a, D, W>
where
    D: Read + Write + Seek,
    W: Write,
{
    fn run(&mut self) -> Result<CheckSummary> {
        self.phase1();
        self.phase1b();
        self.phase2()?;
        self.phase3();
        self.phase4();
        let mut free_blocks = self.phase5();
        if self.free_list_corrupted {
            free_blocks = self.phase6();
        }

        let _ = writeln!(
            self.out,
            "{} files {} blocks {} free",
            self.total_files, self.used_blocks, free_blocks
        );
        if self.fs.modified {
            self.fs.sb.time = timestamp_now();
            self.fs.superblock_touched();
        }
        self.cursor.flush(&mut *self.fs, &mut *self.out);
        let _ = self.fs.sync(false);
        if self.fs.modified {
            let _ = write!(self.out, "\n***** FILE SYSTEM WAS MODIFIED *****\n");
        }
        Ok(CheckSummary {
            files: self.total_files,
            used_blocks: self.used_blocks,
            free_blocks,
            modified: self.fs.modified,
        })
    }

    /// Phase 1: walk every inode, mapping the blocks it references and
    /// recording its stored link count.
    fn phase1(&mut self) {
        let _ = writeln!(self.out, "** Phase 1 - Check Blocks and Sizes");
        for inum in 1..=self.fs.ninodes() {
            let mut inode = match self.fs.inode_get(inum) {
                Ok(inode) => inode,
                Err(err) => {
                    debug!("inode {} unreadable: {}", inum, err);
                    continue;
                }
            };
            if inode.is_allocated() {
                self.last_allocated = inum;
                self.total_files += 1;
                self.link_count[inum as usize] = inode.nlink;
                if inode.nlink <= 0 && self.bad_link.try_push(inum).is_err() {
                    let _ = writeln!(self.out, "LINK COUNT TABLE OVERFLOW");
                }
                self.state.set(
                    inum,
                    if inode.is_dir() {
                        InodeState::Dir
                    } else {
                        InodeState::File
                    },
                );
                self.bad_blocks = 0;
                self.dup_blocks = 0;
                self.scan_inode(&inode, ScanMode::Addr, &mut Self::pass1);
                let state = self.state.get(inum);
                if (state == InodeState::Dir || state == InodeState::File)
                    && inode.is_dir()
                    && inode.size % 16 != 0
                {
                    let _ = write!(self.out, "DIRECTORY MISALIGNED I={}\n\n", inum);
                }
            } else if !inode.mode.is_empty() {
                let _ = writeln!(self.out, "PARTIALLY ALLOCATED INODE I={}", inum);
                if self.fs.writable {
                    inode.clear();
                }
            }
            let _ = self.fs.inode_save(&mut inode, false);
        }
    }

    /// Mark blocks busy; collect out-of-range and duplicated references.
    fn pass1(&mut self, inode: &Inode, bno: u16) -> ScanFlags {
        if self.fs.outrange(bno) {
            self.block_error(bno, "BAD", inode.number);
            self.state.set(inode.number, InodeState::Clear);
            self.bad_blocks += 1;
            if self.bad_blocks >= MAXBAD {
                let _ = writeln!(self.out, "EXCESSIVE BAD BLKS I={}", inode.number);
                return ScanFlags::STOP;
            }
            return ScanFlags::SKIP;
        }
        if self.block_map.is_set(bno) {
            self.block_error(bno, "DUP", inode.number);
            self.state.set(inode.number, InodeState::Clear);
            self.dup_blocks += 1;
            if self.dup_blocks >= MAXDUP {
                let _ = writeln!(self.out, "EXCESSIVE DUP BLKS I={}", inode.number);
                return ScanFlags::STOP;
            }
            if self.dup.is_full() {
                let _ = writeln!(self.out, "DUP TABLE OVERFLOW.");
                return ScanFlags::STOP;
            }
            self.dup.record(bno);
        } else {
            self.used_blocks += 1;
            self.block_map.set(bno);
        }
        ScanFlags::KEEPON
    }

    /// Phase 1b: if phase 1 saw duplicates, rescan allocated inodes to
    /// find each duplicated block's original owner. The first inode to
    /// touch a table-prefix block is the one phase 1 let keep it; its
    /// entry moves to the suffix and the owner keeps the block.
    fn phase1b(&mut self) {
        if self.dup.is_empty() {
            return;
        }
        let _ = writeln!(self.out, "** Phase 1b - Rescan For More DUPS");
        for inum in 1..=self.last_allocated {
            if self.state.get(inum) == InodeState::Unallocated {
                continue;
            }
            let inode = match self.fs.inode_get(inum) {
                Ok(inode) => inode,
                Err(_) => continue,
            };
            if self
                .scan_inode(&inode, ScanMode::Addr, &mut Self::pass1b)
                .contains(ScanFlags::STOP)
            {
                break;
            }
        }
    }

    fn pass1b(&mut self, _inode: &Inode, bno: u16) -> ScanFlags {
        if self.fs.outrange(bno) {
            return ScanFlags::SKIP;
        }
        if self.dup.demote(bno) && self.dup.prefix_is_empty() {
            return ScanFlags::STOP;
        }
        ScanFlags::KEEPON
    }

    fn io_error(&mut self, op: &str, bno: u16) {
        report_io_error(&mut *self.out, op, bno);
    }

    /// `<blk> BAD I=<inum>` / `<blk> DUP I=<inum>` lines.
    fn block_error(&mut self, bno: u16, kind: &str, inum: u16) {
        let _ = writeln!(self.out, "{} {} I={}", bno, kind, inum);
    }

    fn print_inode(&mut self, inode: &Inode) {
        let _ = write!(self.out, " I={} ", inode.number);
        let _ = write!(self.out, " OWNER={} ", inode.uid);
        let _ = writeln!(self.out, "MODE={:o}", inode.mode.bits());
        let _ = write!(self.out, "SIZE={} ", inode.size);
        let _ = writeln!(self.out, "MTIME={}", inode.mtime);
    }

    fn type_name(inode: &Inode) -> &'static str {
        if inode.typ() == InodeType::Dir {
            "DIR"
        } else {
            "FILE"
        }
    }

    fn path_string(&self) -> String {
        String::from_utf8_lossy(&self.path).into_owned()
    }
}

pub(crate) fn report_io_error<W: Write>(out: &mut W, op: &str, bno: u16) {
    let _ = write!(out, "\nCAN NOT {}: BLK {}\n", op, bno);
}
