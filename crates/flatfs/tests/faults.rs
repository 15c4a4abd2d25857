mod common;

use common::{assert_blocks_accounted, flaky_mounted, leaked_blocks, pattern};
use flatfs::{DeviceError, FileSystem, FsError, OpenMode, BLOCK_SIZE};

fn read_all(fs: &FileSystem, name: &str) -> Vec<u8> {
    let fd = fs.open(name, OpenMode::Read).unwrap();
    let mut data = vec![0u8; fs.fsize(&fd).unwrap() as usize];
    assert_eq!(fs.read(&fd, &mut data).unwrap(), data.len());
    fs.close(&fd).unwrap();
    data
}

fn create(fs: &FileSystem, name: &str, data: &[u8]) {
    let fd = fs.open(name, OpenMode::Write).unwrap();
    fs.write(&fd, data).unwrap();
    fs.close(&fd).unwrap();
}

#[test]
fn read_failure_mid_write_keeps_prefix() {
    let (disk, fs) = flaky_mounted(200);
    let fd = fs.open("flaky", OpenMode::Write).unwrap();

    // each new block costs a free-list read and a data block read
    disk.fail_reads_after(4);
    assert!(matches!(
        fs.write(&fd, &pattern(4000)),
        Err(FsError::Device(DeviceError::Io(_)))
    ));
    disk.heal_reads();

    assert_eq!(fs.fsize(&fd).unwrap(), 1024);
    fs.close(&fd).unwrap();
    assert_eq!(read_all(&fs, "flaky"), pattern(1024));
    assert_blocks_accounted(&fs);
}

#[test]
fn write_error_wins_over_failed_inode_save() {
    let (disk, fs) = flaky_mounted(200);
    let fd = fs.open("both", OpenMode::Write).unwrap();

    disk.fail_reads_after(4);
    // two blocks, each zeroed on allocation and then written; the inode
    // save is the next write
    disk.fail_write_after(4);
    let err = fs.write(&fd, &pattern(4000)).unwrap_err();
    assert!(err.to_string().contains("injected read failure"), "{}", err);
    disk.heal_reads();

    fs.close(&fd).unwrap();
    // the unsaved inode does not own its two blocks
    assert_eq!(leaked_blocks(&fs).len(), 2);
}

#[test]
fn failed_truncate_save_leaves_file_intact() {
    let (disk, fs) = flaky_mounted(300);
    let data = pattern(6000);
    create(&fs, "t", &data);
    let free = fs.stats().unwrap().free_blocks;

    // the open's reference-count update goes through, the cleared inode does not
    disk.fail_write_after(1);
    assert!(matches!(
        fs.open("t", OpenMode::Write),
        Err(FsError::Device(_))
    ));

    assert_eq!(fs.stats().unwrap().free_blocks, free);
    assert_blocks_accounted(&fs);
    assert_eq!(read_all(&fs, "t"), data);
}

#[test]
fn failed_block_release_never_double_books() {
    let (disk, fs) = flaky_mounted(300);
    create(&fs, "t", &pattern(6000));

    // count update, cleared inode, two released blocks, then a failed push
    disk.fail_write_after(4);
    assert!(matches!(
        fs.open("t", OpenMode::Write),
        Err(FsError::Device(_))
    ));
    let leaked = leaked_blocks(&fs);
    assert_eq!(leaked.len(), 1);

    let fd = fs.open("t", OpenMode::Write).unwrap();
    assert_eq!(fs.fsize(&fd).unwrap(), 0);
    fs.write(&fd, b"again").unwrap();
    fs.close(&fd).unwrap();
    assert_eq!(read_all(&fs, "t"), b"again");
    assert_eq!(leaked_blocks(&fs), leaked);

    fs.delete("t").unwrap();
    assert_eq!(leaked_blocks(&fs), leaked);
}

#[test]
fn failed_index_install_returns_both_blocks() {
    // 1: zeroing the popped index block fails; 2: initializing it fails
    for writes in [1, 2] {
        let (disk, fs) = flaky_mounted(300);
        let fd = fs.open("i", OpenMode::Write).unwrap();
        let direct = pattern(11 * BLOCK_SIZE);
        fs.write(&fd, &direct).unwrap();
        let free = fs.stats().unwrap().free_blocks;

        disk.fail_write_after(writes);
        assert!(matches!(
            fs.write(&fd, &pattern(100)),
            Err(FsError::Device(DeviceError::Io(_)))
        ));
        assert_eq!(fs.fsize(&fd).unwrap(), 11 * BLOCK_SIZE as u32);
        fs.close(&fd).unwrap();
        assert_eq!(fs.stats().unwrap().free_blocks, free);
        assert_blocks_accounted(&fs);

        let fd = fs.open("i", OpenMode::Append).unwrap();
        fs.write(&fd, b"tail").unwrap();
        fs.close(&fd).unwrap();
        assert_eq!(read_all(&fs, "i").len(), 11 * BLOCK_SIZE + 4);
        assert_blocks_accounted(&fs);
    }
}
