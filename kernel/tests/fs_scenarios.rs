//! End-to-end filesystem scenarios over a RAM disk: file growth through
//! the indirect block, deep directory trees, link/unlink round trips,
//! and the open-file layer above it all.

use ferrite_kernel::fs::file::{FileTable, OpenFlags};
use ferrite_kernel::fs::testing::fresh_fs;
use ferrite_kernel::fs::{InodeType, Stat, BSIZE, DIRENT_SIZE, NDIRECT};

fn rdwr_create() -> OpenFlags {
    OpenFlags::RDWR | OpenFlags::CREATE
}

#[test]
fn bigfile_grows_through_the_indirect_block() {
    let t = fresh_fs();
    let ftable = FileTable::new();

    // Write 20 blocks of 'A' sequentially through the file layer.
    let f = ftable
        .open(&t.fs, b"/bigfile", rdwr_create(), None)
        .expect("create bigfile");
    let block = [b'A'; BSIZE];
    for _ in 0..20 {
        let n = ftable
            .write(f, &t.fs, false, block.as_ptr() as usize, BSIZE)
            .expect("write block");
        assert_eq!(n, BSIZE);
    }
    ftable.close(f, &t.fs);

    // Reopen: size is 20480 and the first block reads back as 'A's.
    let f = ftable
        .open(&t.fs, b"/bigfile", OpenFlags::empty(), None)
        .expect("reopen bigfile");

    let mut st = Stat::default();
    ftable
        .stat(f, &t.fs, false, &mut st as *mut Stat as usize)
        .expect("fstat");
    assert_eq!(st.size, 20 * BSIZE as u64);
    assert_eq!(st.typ, InodeType::File as i16);

    let mut back = [0u8; BSIZE];
    let n = ftable
        .read(f, &t.fs, false, back.as_mut_ptr() as usize, BSIZE)
        .expect("read");
    assert_eq!(n, BSIZE);
    assert!(back.iter().all(|&b| b == b'A'));

    // 20 blocks > NDIRECT, so the indirect block must be in play.
    let iref = ftable.inode_of(f).expect("inode behind the file");
    let guard = t.fs.ilock(iref).expect("ilock");
    assert!(
        guard.addrs[NDIRECT] != 0,
        "file of {} blocks must use the indirect block",
        20
    );
    drop(guard);
    ftable.close(f, &t.fs);
}

#[test]
fn size_crossing_ndirect_allocates_indirect_block_exactly_then() {
    let t = fresh_fs();
    let ftable = FileTable::new();
    let f = ftable
        .open(&t.fs, b"/edge", rdwr_create(), None)
        .expect("create");
    let block = [7u8; BSIZE];

    for _ in 0..NDIRECT {
        ftable
            .write(f, &t.fs, false, block.as_ptr() as usize, BSIZE)
            .expect("direct write");
    }
    let iref = ftable.inode_of(f).expect("inode");
    {
        let guard = t.fs.ilock(iref).expect("ilock");
        assert_eq!(guard.addrs[NDIRECT], 0, "still within direct blocks");
    }

    ftable
        .write(f, &t.fs, false, block.as_ptr() as usize, BSIZE)
        .expect("first indirect write");
    {
        let guard = t.fs.ilock(iref).expect("ilock");
        assert_ne!(
            guard.addrs[NDIRECT],
            0,
            "block NDIRECT triggers the indirect block"
        );
    }
    ftable.close(f, &t.fs);
}

#[test]
fn deep_directory_tree_resolves_from_the_root() {
    let t = fresh_fs();
    let ftable = FileTable::new();

    for path in [&b"/a"[..], b"/a/b", b"/a/b/c"] {
        t.fs.log.begin_op(&t.fs);
        let ip = t
            .fs
            .create(path, InodeType::Dir, 0, 0, None)
            .expect("mkdir");
        t.fs.iput(ip);
        t.fs.log.end_op(&t.fs).expect("commit");
    }

    let f = ftable
        .open(&t.fs, b"/a/b/c/deep_file", rdwr_create(), None)
        .expect("create deep file");
    ftable
        .write(f, &t.fs, false, b"deep".as_ptr() as usize, 4)
        .expect("write");
    ftable.close(f, &t.fs);

    let f = ftable
        .open(&t.fs, b"/a/b/c/deep_file", OpenFlags::empty(), None)
        .expect("open across three directory levels");
    let mut back = [0u8; 8];
    let n = ftable
        .read(f, &t.fs, false, back.as_mut_ptr() as usize, 8)
        .expect("read");
    assert_eq!(&back[..n], b"deep");
    ftable.close(f, &t.fs);

    // A missing component still fails cleanly.
    assert!(ftable
        .open(&t.fs, b"/a/x/c/deep_file", OpenFlags::empty(), None)
        .is_err());
}

#[test]
fn write_read_round_trip_at_odd_offsets() {
    let t = fresh_fs();
    let ftable = FileTable::new();
    let f = ftable
        .open(&t.fs, b"/oddball", rdwr_create(), None)
        .expect("create");

    // Three writes that straddle block boundaries.
    let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    let n = ftable
        .write(f, &t.fs, false, payload.as_ptr() as usize, payload.len())
        .expect("write");
    assert_eq!(n, payload.len());
    ftable.close(f, &t.fs);

    let f = ftable
        .open(&t.fs, b"/oddball", OpenFlags::empty(), None)
        .expect("reopen");
    let mut back = vec![0u8; payload.len()];
    let mut got = 0;
    while got < back.len() {
        let n = ftable
            .read(
                f,
                &t.fs,
                false,
                back[got..].as_mut_ptr() as usize,
                back.len() - got,
            )
            .expect("read");
        if n == 0 {
            break;
        }
        got += n;
    }
    assert_eq!(got, payload.len());
    assert_eq!(back, payload);
    ftable.close(f, &t.fs);
}

#[test]
fn link_then_unlink_round_trip() {
    let t = fresh_fs();
    let ftable = FileTable::new();

    let f = ftable
        .open(&t.fs, b"/orig", rdwr_create(), None)
        .expect("create");
    ftable
        .write(f, &t.fs, false, b"shared".as_ptr() as usize, 6)
        .expect("write");
    ftable.close(f, &t.fs);

    t.fs.log.begin_op(&t.fs);
    t.fs.link(b"/orig", b"/alias", None).expect("link");
    t.fs.log.end_op(&t.fs).expect("commit");

    // Both names reach the same inode.
    let a = t.fs.namei(b"/orig", None).expect("orig resolves");
    let b = t.fs.namei(b"/alias", None).expect("alias resolves");
    assert_eq!(a.inum, b.inum);
    {
        let guard = t.fs.ilock(a).expect("ilock");
        assert_eq!(guard.nlink, 2);
    }
    t.fs.iput(a);
    t.fs.iput(b);

    t.fs.log.begin_op(&t.fs);
    t.fs.unlink(b"/orig", None).expect("unlink original");
    t.fs.log.end_op(&t.fs).expect("commit");

    assert!(t.fs.namei(b"/orig", None).is_err(), "old name is gone");
    let b = t.fs.namei(b"/alias", None).expect("alias survives");
    {
        let guard = t.fs.ilock(b).expect("ilock");
        assert_eq!(guard.nlink, 1);
        let mut back = [0u8; 6];
        guard_read(&t.fs, b, &mut back);
        assert_eq!(&back, b"shared");
    }
    t.fs.iput(b);

    // Unlinking the last name frees the inode for reuse.
    t.fs.log.begin_op(&t.fs);
    t.fs.unlink(b"/alias", None).expect("unlink alias");
    t.fs.log.end_op(&t.fs).expect("commit");
    assert!(t.fs.namei(b"/alias", None).is_err());
}

fn guard_read(
    fs: &ferrite_kernel::fs::FileSystem,
    iref: ferrite_kernel::fs::inode::InodeRef,
    buf: &mut [u8],
) {
    let mut guard = fs.ilock(iref).expect("ilock");
    let n = guard
        .read(false, buf.as_mut_ptr() as usize, 0, buf.len())
        .expect("read");
    assert_eq!(n, buf.len());
}

#[test]
fn directory_overflowing_one_block_allocates_another() {
    let t = fresh_fs();
    let entries_per_block = BSIZE / DIRENT_SIZE;

    t.fs.log.begin_op(&t.fs);
    let dir = t
        .fs
        .create(b"/crowded", InodeType::Dir, 0, 0, None)
        .expect("mkdir");
    t.fs.log.end_op(&t.fs).expect("commit");

    // `.` and `..` occupy two slots; fill the rest of the first block
    // and one more.
    let to_create = entries_per_block - 2 + 1;
    for i in 0..to_create {
        let mut name = *b"/crowded/f00\0\0";
        name[10] = b'0' + (i / 10 % 10) as u8;
        name[11] = b'0' + (i % 10) as u8;
        name[12] = b'a' + (i / 100) as u8;
        let path = &name[..13];
        t.fs.log.begin_op(&t.fs);
        let ip = t
            .fs
            .create(path, InodeType::File, 0, 0, None)
            .expect("create entry");
        t.fs.iput(ip);
        t.fs.log.end_op(&t.fs).expect("commit");
    }

    let mut guard = t.fs.ilock(dir).expect("ilock");
    assert!(
        guard.size as usize > BSIZE,
        "directory spilled into a second block (size {})",
        guard.size
    );
    // The spilled entry is still findable.
    let mut last = *b"/crowded/f00\0\0";
    let i = to_create - 1;
    last[10] = b'0' + (i / 10 % 10) as u8;
    last[11] = b'0' + (i % 10) as u8;
    last[12] = b'a' + (i / 100) as u8;
    let found = t
        .fs
        .dirlookup(&mut guard, &last[9..13])
        .expect("lookup")
        .expect("entry past the first block resolves");
    drop(guard);
    t.fs.iput(found.0);
    t.fs.iput(dir);
}

#[test]
fn unlink_refuses_dot_and_nonempty_directories() {
    let t = fresh_fs();

    t.fs.log.begin_op(&t.fs);
    let d = t
        .fs
        .create(b"/holds", InodeType::Dir, 0, 0, None)
        .expect("mkdir");
    t.fs.iput(d);
    let f = t
        .fs
        .create(b"/holds/x", InodeType::File, 0, 0, None)
        .expect("create");
    t.fs.iput(f);
    t.fs.log.end_op(&t.fs).expect("commit");

    t.fs.log.begin_op(&t.fs);
    assert!(
        t.fs.unlink(b"/holds", None).is_err(),
        "non-empty directory must not unlink"
    );
    assert!(t.fs.unlink(b"/holds/.", None).is_err(), "refuse '.'");
    t.fs.unlink(b"/holds/x", None).expect("empty it");
    t.fs.unlink(b"/holds", None).expect("now it unlinks");
    t.fs.log.end_op(&t.fs).expect("commit");

    assert!(t.fs.namei(b"/holds", None).is_err());
}

#[test]
fn open_file_sharing_via_dup_keeps_one_offset() {
    let t = fresh_fs();
    let ftable = FileTable::new();

    let f = ftable
        .open(&t.fs, b"/shared", rdwr_create(), None)
        .expect("create");
    ftable
        .write(f, &t.fs, false, b"abcdef".as_ptr() as usize, 6)
        .expect("write");
    ftable.close(f, &t.fs);

    let f = ftable
        .open(&t.fs, b"/shared", OpenFlags::empty(), None)
        .expect("open");
    let g = ftable.dup(f);

    let mut buf = [0u8; 3];
    ftable
        .read(f, &t.fs, false, buf.as_mut_ptr() as usize, 3)
        .expect("read via f");
    assert_eq!(&buf, b"abc");
    ftable
        .read(g, &t.fs, false, buf.as_mut_ptr() as usize, 3)
        .expect("read via dup");
    assert_eq!(&buf, b"def", "dup shares the offset");

    ftable.close(f, &t.fs);
    ftable.close(g, &t.fs);
}

#[test]
fn holes_read_back_as_zeroes() {
    let t = fresh_fs();

    t.fs.log.begin_op(&t.fs);
    let ip = t
        .fs
        .create(b"/sparse", InodeType::File, 0, 0, None)
        .expect("create");
    let mut guard = t.fs.ilock(ip).expect("ilock");
    // Bump the size without allocating blocks, then check reads.
    guard.size = 2 * BSIZE as u32;
    guard.update().expect("update");
    let mut buf = [0xFFu8; 64];
    let n = guard
        .read(false, buf.as_mut_ptr() as usize, BSIZE as u32, 64)
        .expect("read hole");
    assert_eq!(n, 64);
    assert!(buf.iter().all(|&b| b == 0), "holes are zero-filled");
    drop(guard);
    t.fs.iput(ip);
    t.fs.log.end_op(&t.fs).expect("commit");
}
