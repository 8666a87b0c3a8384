//! Single-slot write-back cache for directory blocks.
//!
//! Every directory read and rewrite performed by the pathname and
//! reference-count phases goes through this one buffer, so a dirty block
//! is always flushed before the cursor moves on. The driver flushes it
//! once more at the end of phase 4, before the free-list phases take over.

use std::io::{Read, Seek, Write};

use log::trace;

use super::report_io_error;
use crate::fs::U6fs;
use crate::param::BSIZE;

/// Cursor position meaning "holding nothing".
const NO_BLOCK: u16 = u16::MAX;

pub(crate) struct BlockCursor {
    bno: u16,
    data: [u8; BSIZE],
    dirty: bool,
}

impl BlockCursor {
    pub fn new() -> BlockCursor {
        BlockCursor {
            bno: NO_BLOCK,
            data: [0; BSIZE],
            dirty: false,
        }
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.data
    }

    /// Callers edit the buffer in place and mark it for write-back.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Bring block `bno` into the buffer, flushing any pending edit first.
    /// A read failure invalidates the cursor and reports the block.
    pub fn load<D, W>(&mut self, fs: &mut U6fs<D>, out: &mut W, bno: u16) -> bool
    where
        D: Read + Write + Seek,
        W: Write,
    {
        if self.bno == bno {
            return true;
        }
        self.flush(fs, out);
        trace!("cursor read blk {}", bno);
        if fs.read_block(bno, &mut self.data).is_err() {
            report_io_error(out, "READ", bno);
            self.bno = NO_BLOCK;
            return false;
        }
        self.bno = bno;
        true
    }

    /// Write the buffer back if it is dirty and the image is writable.
    pub fn flush<D, W>(&mut self, fs: &mut U6fs<D>, out: &mut W)
    where
        D: Read + Write + Seek,
        W: Write,
    {
        if self.dirty && fs.writable {
            trace!("cursor write blk {}", self.bno);
            if fs.write_block(self.bno, &self.data).is_err() {
                report_io_error(out, "WRITE", self.bno);
            }
        }
        self.dirty = false;
    }
}
