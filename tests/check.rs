//! End-to-end checks over in-memory images: the fixture scenarios and the
//! repair properties the checker must uphold.

use std::io::Cursor;

use u6fs::param::{BSIZE, DIRENT_SIZE, NADDR, ROOTINO};
use u6fs::{check, CheckSummary, DirEnt, IMode, U6fs};

type MemFs = U6fs<Cursor<Vec<u8>>>;

const DIR_MODE: u16 = 0o140755;
const FILE_MODE: u16 = 0o100644;

fn new_image(fsize: u16, isize: u16) -> MemFs {
    let dev = Cursor::new(vec![0u8; fsize as usize * BSIZE]);
    U6fs::create(dev, fsize, isize).unwrap()
}

fn reopen(fs: MemFs, writable: bool) -> MemFs {
    U6fs::open(fs.into_inner(), writable).unwrap()
}

fn snapshot(fs: MemFs) -> (Vec<u8>, MemFs) {
    let dev = fs.into_inner();
    let bytes = dev.get_ref().clone();
    (bytes, U6fs::open(dev, false).unwrap())
}

fn run(fs: &mut MemFs) -> (CheckSummary, String) {
    let mut out = Vec::new();
    let summary = check(fs, &mut out).unwrap();
    (summary, String::from_utf8(out).unwrap())
}

fn put_inode(fs: &mut MemFs, inum: u16, mode: u16, nlink: i16, size: u32, addrs: &[u16]) {
    let mut inode = fs.inode_get(inum).unwrap();
    inode.mode = IMode::from_bits_truncate(mode);
    inode.nlink = nlink;
    inode.size = size;
    inode.addr = [0; NADDR];
    inode.addr[..addrs.len()].copy_from_slice(addrs);
    fs.inode_save(&mut inode, true).unwrap();
}

fn put_dir_block(fs: &mut MemFs, bno: u16, entries: &[(u16, &[u8])]) {
    let mut buf = [0u8; BSIZE];
    for (i, &(ino, name)) in entries.iter().enumerate() {
        DirEnt::new(ino, name).pack(&mut buf[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE]);
    }
    fs.write_block(bno, &buf).unwrap();
}

fn read_dir_entry(fs: &mut MemFs, bno: u16, index: usize) -> DirEnt {
    let mut buf = [0u8; BSIZE];
    fs.read_block(bno, &mut buf).unwrap();
    DirEnt::unpack(&buf[index * DIRENT_SIZE..(index + 1) * DIRENT_SIZE])
}

/// Rebuild the free chain to cover every data block not listed in `used`.
fn rethread_free_list(fs: &mut MemFs, used: &[u16]) {
    fs.sb.nfree = 0;
    fs.block_free(0).unwrap();
    let first_data = fs.sb.isize + 2;
    for bno in (first_data..fs.sb.fsize).rev() {
        if !used.contains(&bno) {
            fs.block_free(bno).unwrap();
        }
    }
    fs.sync(true).unwrap();
}

// Scenario A: a fresh 10-block image checks clean, counts agree with the
// geometry, and a read-only run leaves every byte alone.
#[test]
fn clean_image_invariance() {
    let fs = new_image(10, 1);
    let (before, mut fs) = snapshot(fs);
    let (summary, out) = run(&mut fs);

    assert_eq!(summary.files, 1);
    assert_eq!(summary.used_blocks, 1);
    assert_eq!(summary.free_blocks, 6);
    assert!(!summary.modified);
    assert_eq!(
        summary.used_blocks + summary.free_blocks,
        fs.sb.fsize - fs.sb.isize - 2
    );
    assert_eq!(
        out,
        "** Phase 1 - Check Blocks and Sizes\n\
         ** Phase 2 - Check Pathnames\n\
         ** Phase 3 - Check Connectivity\n\
         ** Phase 4 - Check Reference Counts\n\
         ** Phase 5 - Check Free List\n\
         1 files 1 blocks 6 free\n"
    );

    let dev = fs.into_inner();
    assert_eq!(dev.get_ref(), &before);
}

// Scenario B: two regular files claim block 5. The second claimant is
// reported and cleared; the first keeps the block and the accounting
// still balances.
#[test]
fn duplicate_block_clears_second_claimant() {
    let mut fs = new_image(12, 1);
    put_dir_block(
        &mut fs,
        3,
        &[(1, b"."), (1, b".."), (2, b"a"), (3, b"b")],
    );
    put_inode(&mut fs, 1, DIR_MODE, 2, 64, &[3]);
    put_inode(&mut fs, 2, FILE_MODE, 1, 512, &[5]);
    put_inode(&mut fs, 3, FILE_MODE, 1, 512, &[5]);
    rethread_free_list(&mut fs, &[3, 5]);

    let mut fs = reopen(fs, true);
    let (summary, out) = run(&mut fs);
    assert!(out.contains("5 DUP I=3"));
    assert!(out.contains("DUP/BAD"));
    assert!(out.contains("FILE SYSTEM WAS MODIFIED"));
    assert!(summary.modified);
    assert_eq!(
        summary.used_blocks + summary.free_blocks,
        fs.sb.fsize - fs.sb.isize - 2
    );

    // Inode 3 is gone, inode 2 kept the block, the entry for "b" is free.
    assert!(!fs.inode_get(3).unwrap().is_allocated());
    let survivor = fs.inode_get(2).unwrap();
    assert!(survivor.is_allocated());
    assert_eq!(survivor.addr[0], 5);
    assert_eq!(read_dir_entry(&mut fs, 3, 3).ino, 0);

    let mut fs = reopen(fs, false);
    let (again, out) = run(&mut fs);
    assert_eq!(again.files, 2);
    assert_eq!(again.used_blocks, 2);
    assert!(!again.modified);
    assert!(!out.contains("DUP"));
}

// Property 4: with three claimants of one block, exactly the first keeps
// it and the other two are cleared.
#[test]
fn duplicate_detection_completeness() {
    let mut fs = new_image(12, 1);
    put_dir_block(
        &mut fs,
        3,
        &[(1, b"."), (1, b".."), (2, b"a"), (3, b"b"), (4, b"c")],
    );
    put_inode(&mut fs, 1, DIR_MODE, 2, 80, &[3]);
    for inum in 2..=4 {
        put_inode(&mut fs, inum, FILE_MODE, 1, 512, &[5]);
    }
    rethread_free_list(&mut fs, &[3, 5]);

    let mut fs = reopen(fs, true);
    let (_, out) = run(&mut fs);
    assert!(out.contains("5 DUP I=3"));
    assert!(out.contains("5 DUP I=4"));

    assert!(fs.inode_get(2).unwrap().is_allocated());
    assert!(!fs.inode_get(3).unwrap().is_allocated());
    assert!(!fs.inode_get(4).unwrap().is_allocated());

    let mut fs = reopen(fs, false);
    let (again, _) = run(&mut fs);
    assert_eq!(again.files, 2);
    assert_eq!(again.used_blocks, 2);
    assert_eq!(again.free_blocks, 7);
}

// Scenario C: an allocated file no directory names is reconnected into
// /lost+found as #00004, and the image then checks clean.
#[test]
fn unreferenced_file_moves_to_lost_found() {
    let mut fs = new_image(12, 1);
    put_dir_block(
        &mut fs,
        3,
        &[(1, b"."), (1, b".."), (2, b"lost+found")],
    );
    put_dir_block(&mut fs, 4, &[(2, b"."), (1, b"..")]);
    put_inode(&mut fs, 1, DIR_MODE, 3, 48, &[3]);
    put_inode(&mut fs, 2, DIR_MODE, 2, 32, &[4]);
    put_inode(&mut fs, 4, FILE_MODE, 1, 512, &[6]);
    rethread_free_list(&mut fs, &[3, 4, 6]);

    let mut fs = reopen(fs, true);
    let (summary, out) = run(&mut fs);
    assert!(out.contains("UNREF FILE"));
    assert!(out.contains("I=4"));
    assert!(summary.modified);

    // lost+found was padded to a block multiple and got the new link.
    assert_eq!(fs.inode_get(2).unwrap().size, 512);
    let planted = read_dir_entry(&mut fs, 4, 2);
    assert_eq!(planted.ino, 4);
    assert_eq!(planted.name_bytes(), b"#00004");

    let mut fs = reopen(fs, false);
    let (again, out) = run(&mut fs);
    assert!(!out.contains("UNREF"));
    assert!(!again.modified);
    assert_eq!(again.files, 3);
}

// Scenario D: a directory whose `..` points at itself is unreachable;
// phase 3 reconnects it, rewrites `..`, and bumps lost+found's links.
#[test]
fn detached_directory_is_reconnected() {
    let mut fs = new_image(12, 1);
    put_dir_block(
        &mut fs,
        3,
        &[(1, b"."), (1, b".."), (2, b"lost+found")],
    );
    put_dir_block(&mut fs, 4, &[(2, b"."), (1, b"..")]);
    put_dir_block(&mut fs, 6, &[(5, b"."), (5, b"..")]);
    put_inode(&mut fs, 1, DIR_MODE, 3, 48, &[3]);
    put_inode(&mut fs, 2, DIR_MODE, 2, 512, &[4]);
    put_inode(&mut fs, 5, DIR_MODE, 2, 32, &[6]);
    rethread_free_list(&mut fs, &[3, 4, 6]);

    let mut fs = reopen(fs, true);
    let (summary, out) = run(&mut fs);
    assert!(out.contains("UNREF DIR"));
    assert!(out.contains("DIR I=5 CONNECTED."));
    assert!(summary.modified);

    let planted = read_dir_entry(&mut fs, 4, 2);
    assert_eq!(planted.ino, 5);
    assert_eq!(planted.name_bytes(), b"#00005");
    // `..` of the reconnected directory now points at lost+found.
    assert_eq!(read_dir_entry(&mut fs, 6, 1).ino, 2);
    assert_eq!(fs.inode_get(2).unwrap().nlink, 3);

    let mut fs = reopen(fs, false);
    let (again, out) = run(&mut fs);
    assert!(!out.contains("UNREF"));
    assert!(!again.modified);
    assert_eq!(again.files, 3);
    assert_eq!(again.used_blocks, 3);
}

// Scenario E: the free list omits block 7. Read-only only reports;
// writable salvages the list and the block reappears.
#[test]
fn missing_free_block_is_salvaged() {
    let mut fs = new_image(10, 1);
    rethread_free_list(&mut fs, &[3, 7]);

    let (before, mut fs) = snapshot(fs);
    let (summary, out) = run(&mut fs);
    assert!(out.contains("1 BLK(S) MISSING"));
    assert!(out.contains("BAD FREE LIST"));
    assert!(!out.contains("Phase 6"));
    assert!(!summary.modified);
    assert_eq!(summary.free_blocks, 5);
    let dev = fs.into_inner();
    assert_eq!(dev.get_ref(), &before);

    let mut fs = U6fs::open(dev, true).unwrap();
    let (summary, out) = run(&mut fs);
    assert!(out.contains("** Phase 6 - Salvage Free List"));
    assert!(summary.modified);
    assert_eq!(summary.free_blocks, 6);

    let mut fs = reopen(fs, false);
    let (again, out) = run(&mut fs);
    assert!(!out.contains("MISSING"));
    assert!(!again.modified);
    assert_eq!(again.free_blocks, 6);
}

// Scenario F: a directory size that is not a multiple of 16 is reported
// and left alone in read-only mode.
#[test]
fn misaligned_directory_is_reported() {
    let mut fs = new_image(10, 1);
    put_inode(&mut fs, 1, DIR_MODE, 2, 33, &[3]);

    let (before, mut fs) = snapshot(fs);
    let (summary, out) = run(&mut fs);
    assert!(out.contains("DIRECTORY MISALIGNED I=1"));
    assert!(!summary.modified);
    let dev = fs.into_inner();
    assert_eq!(dev.get_ref(), &before);
}

// Property 3: a second writable run after a repair changes nothing.
#[test]
fn repair_is_idempotent() {
    let mut fs = new_image(12, 1);
    put_dir_block(
        &mut fs,
        3,
        &[(1, b"."), (1, b".."), (2, b"a"), (3, b"b")],
    );
    put_inode(&mut fs, 1, DIR_MODE, 2, 64, &[3]);
    put_inode(&mut fs, 2, FILE_MODE, 1, 512, &[5]);
    put_inode(&mut fs, 3, FILE_MODE, 1, 512, &[5]);
    rethread_free_list(&mut fs, &[3, 5]);

    let mut fs = reopen(fs, true);
    run(&mut fs);
    let dev = fs.into_inner();
    let after_first = dev.get_ref().clone();

    let mut fs = U6fs::open(dev, true).unwrap();
    let (summary, _) = run(&mut fs);
    assert!(!summary.modified);
    let dev = fs.into_inner();
    assert_eq!(dev.get_ref(), &after_first);
}

// Property 5: a stored link count that disagrees with the directory tree
// is rewritten to the observed reference count.
#[test]
fn stored_link_count_is_corrected() {
    let mut fs = new_image(12, 1);
    put_dir_block(&mut fs, 3, &[(1, b"."), (1, b".."), (2, b"a")]);
    put_inode(&mut fs, 1, DIR_MODE, 2, 48, &[3]);
    put_inode(&mut fs, 2, FILE_MODE, 5, 512, &[4]);
    rethread_free_list(&mut fs, &[3, 4]);

    let mut fs = reopen(fs, true);
    let (summary, out) = run(&mut fs);
    assert!(out.contains("LINK COUNT FILE"));
    assert!(out.contains("COUNT 5 SHOULD BE 1"));
    assert!(summary.modified);
    assert_eq!(fs.inode_get(2).unwrap().nlink, 1);

    let mut fs = reopen(fs, false);
    let (again, out) = run(&mut fs);
    assert!(!out.contains("LINK COUNT"));
    assert!(!again.modified);
}

// An address outside the data area marks the inode bad; the directory
// entry is cleared and the inode goes in phase 4.
#[test]
fn out_of_range_address_clears_inode() {
    let mut fs = new_image(12, 1);
    put_dir_block(&mut fs, 3, &[(1, b"."), (1, b".."), (2, b"a")]);
    put_inode(&mut fs, 1, DIR_MODE, 2, 48, &[3]);
    put_inode(&mut fs, 2, FILE_MODE, 1, 512, &[99]);
    rethread_free_list(&mut fs, &[3]);

    let mut fs = reopen(fs, true);
    let (_, out) = run(&mut fs);
    assert!(out.contains("99 BAD I=2"));
    assert!(out.contains("BAD/DUP"));
    assert!(!fs.inode_get(2).unwrap().is_allocated());

    let mut fs = reopen(fs, false);
    let (again, _) = run(&mut fs);
    assert_eq!(again.files, 1);
    assert_eq!(again.used_blocks + again.free_blocks, 9);
}

// A non-zero mode without the allocated bit is a partially allocated
// inode: reported, and zeroed when writable.
#[test]
fn partially_allocated_inode_is_zeroed() {
    let mut fs = new_image(10, 1);
    put_inode(&mut fs, 6, 0o644, 0, 0, &[]);

    let mut fs = reopen(fs, true);
    let (_, out) = run(&mut fs);
    assert!(out.contains("PARTIALLY ALLOCATED INODE I=6"));
    assert!(fs.inode_get(6).unwrap().mode.is_empty());

    let mut fs = reopen(fs, false);
    let (_, out) = run(&mut fs);
    assert!(!out.contains("PARTIALLY ALLOCATED"));
}

// Large-file address slots are walked through the indirect blocks, and a
// clean large file stays clean.
#[test]
fn large_file_blocks_are_accounted() {
    let mut fs = new_image(40, 1);
    put_dir_block(&mut fs, 3, &[(1, b"."), (1, b".."), (2, b"big")]);
    put_inode(&mut fs, 1, DIR_MODE, 2, 48, &[3]);

    // Indirect block 10 fans out to data blocks 11..=13.
    let mut indirect = [0u8; BSIZE];
    for (i, bno) in (11u16..=13).enumerate() {
        indirect[2 * i..2 * i + 2].copy_from_slice(&bno.to_le_bytes());
    }
    fs.write_block(10, &indirect).unwrap();
    put_inode(
        &mut fs,
        2,
        FILE_MODE | 0o010000,
        1,
        3 * BSIZE as u32,
        &[10],
    );
    rethread_free_list(&mut fs, &[3, 10, 11, 12, 13]);

    let mut fs = reopen(fs, false);
    let (summary, out) = run(&mut fs);
    // Root block, the indirect block, and three data blocks.
    assert_eq!(summary.used_blocks, 5);
    assert_eq!(summary.used_blocks + summary.free_blocks, 37);
    assert!(!out.contains("BAD"));
    assert!(!out.contains("MISSING"));
}

// The superblock's free-inode cache must only name unallocated inodes;
// a stale entry truncates the cache to its valid prefix.
#[test]
fn stale_free_inode_cache_is_truncated() {
    let mut fs = new_image(10, 1);
    fs.sb.ninode = 2;
    fs.sb.inode[0] = 5;
    fs.sb.inode[1] = ROOTINO; // allocated: stale
    fs.sync(true).unwrap();

    let mut fs = reopen(fs, true);
    let (_, out) = run(&mut fs);
    assert!(out.contains("ALLOCATED INODE(S) IN IFREE LIST"));
    assert_eq!(fs.sb.ninode, 1);
    assert_eq!(fs.sb.inode[1], 0);

    let mut fs = reopen(fs, false);
    let (_, out) = run(&mut fs);
    assert!(!out.contains("IFREE"));
}
