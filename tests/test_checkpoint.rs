//! Crash-safe checkpoint round-trip through a real file (spec §4.6).

use sapling::btree::PutFlags;
use sapling::checkpoint::{checkpoint, restore};
use sapling::checksum::ChecksumMode;
use sapling::db::DbBuilder;
use sapling::error::Error;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use tempfile::TempDir;

#[test]
fn checkpoint_to_disk_and_restore_preserves_every_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("snapshot.ckpt");

    let db = DbBuilder::new().build().unwrap();
    let mut txn = db.begin_write().unwrap();
    let dbi = txn.create_dbi(0, false).unwrap();
    for i in 0..300u32 {
        let k = format!("k-{i:05}");
        let v = format!("v-{i}");
        txn.put(dbi, k.as_bytes(), v.as_bytes(), PutFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    {
        let mut file = File::create(&path).unwrap();
        checkpoint(&db, &mut file).unwrap();
    }

    let mut file = File::open(&path).unwrap();
    let restored = restore(&mut file, db.page_size(), ChecksumMode::None).unwrap();

    let mut read = restored.begin_read().unwrap();
    for i in 0..300u32 {
        let k = format!("k-{i:05}");
        let v = format!("v-{i}");
        assert_eq!(read.get(dbi, k.as_bytes()).unwrap(), Some(v.into_bytes()));
    }
}

#[test]
fn restore_rejects_a_truncated_stream() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("truncated.ckpt");

    let db = DbBuilder::new().build().unwrap();
    let mut txn = db.begin_write().unwrap();
    let dbi = txn.create_dbi(0, false).unwrap();
    txn.put(dbi, b"key", b"value", PutFlags::empty()).unwrap();
    txn.commit().unwrap();

    {
        let mut file = File::create(&path).unwrap();
        checkpoint(&db, &mut file).unwrap();
    }

    let full_len = std::fs::metadata(&path).unwrap().len();
    let truncated = std::cmp::max(full_len / 2, 20);
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(truncated).unwrap();

    let mut file = File::open(&path).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let err = restore(&mut file, db.page_size(), ChecksumMode::None).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. } | Error::Other(_)));
}
