mod common;

use common::{assert_blocks_accounted, mounted, pattern};
use flatfs::{FsError, OpenMode, Whence};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Write { file: usize, len: usize },
    Append { file: usize, len: usize },
    Delete { file: usize },
    Sync,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..3usize, 0..9000usize).prop_map(|(file, len)| Op::Write { file, len }),
        2 => (0..3usize, 0..1500usize).prop_map(|(file, len)| Op::Append { file, len }),
        2 => (0..3usize).prop_map(|file| Op::Delete { file }),
        1 => Just(Op::Sync),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_block_is_free_or_owned(ops in prop::collection::vec(op(), 1..20)) {
        let (_disk, fs) = mounted(400);
        fs.format(8).unwrap();
        let mut sizes = [None::<usize>; 3];

        for op in ops {
            match op {
                Op::Write { file, len } => {
                    let fd = fs.open(&format!("f{}", file), OpenMode::Write).unwrap();
                    prop_assert_eq!(fs.write(&fd, &pattern(len)).unwrap(), len);
                    fs.close(&fd).unwrap();
                    sizes[file] = Some(len);
                }
                Op::Append { file, len } => {
                    let fd = fs.open(&format!("f{}", file), OpenMode::Append).unwrap();
                    fs.write(&fd, &pattern(len)).unwrap();
                    prop_assert_eq!(
                        fs.seek(&fd, 0, Whence::End).unwrap() as usize,
                        sizes[file].unwrap_or(0) + len
                    );
                    fs.close(&fd).unwrap();
                    sizes[file] = Some(sizes[file].unwrap_or(0) + len);
                }
                Op::Delete { file } => {
                    let result = fs.delete(&format!("f{}", file));
                    if sizes[file].take().is_some() {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(FsError::NotFound(_))));
                    }
                }
                Op::Sync => fs.sync().unwrap(),
            }
            assert_blocks_accounted(&fs);
        }

        for (file, size) in sizes.iter().enumerate() {
            if let Some(size) = size {
                let fd = fs.open(&format!("f{}", file), OpenMode::Read).unwrap();
                prop_assert_eq!(fs.fsize(&fd).unwrap() as usize, *size);
                fs.close(&fd).unwrap();
            }
        }
    }
}
