//! Basic open/put/commit/read lifecycle against the in-memory page store.

use sapling::btree::PutFlags;
use sapling::db::{DbBuilder, Dbi};

#[test]
fn put_commit_then_read_back() {
    let db = DbBuilder::new().build().unwrap();

    let mut wtxn = db.begin_write().unwrap();
    wtxn.create_dbi(1, false).unwrap();
    wtxn.put(Dbi(1), b"hello", b"world", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let mut rtxn = db.begin_read().unwrap();
    let value = rtxn.get(Dbi(1), b"hello").unwrap();
    assert_eq!(value, Some(b"world".to_vec()));
}

#[test]
fn read_snapshot_does_not_see_a_later_write() {
    let db = DbBuilder::new().build().unwrap();

    let mut wtxn = db.begin_write().unwrap();
    wtxn.create_dbi(1, false).unwrap();
    wtxn.put(Dbi(1), b"k1", b"v1", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let mut rtxn = db.begin_read().unwrap();

    let mut wtxn2 = db.begin_write().unwrap();
    wtxn2.put(Dbi(1), b"k2", b"v2", PutFlags::empty()).unwrap();
    wtxn2.commit().unwrap();

    assert_eq!(rtxn.get(Dbi(1), b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(rtxn.get(Dbi(1), b"k2").unwrap(), None);

    let mut rtxn2 = db.begin_read().unwrap();
    assert_eq!(rtxn2.get(Dbi(1), b"k2").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn delete_removes_a_key() {
    let db = DbBuilder::new().build().unwrap();

    let mut wtxn = db.begin_write().unwrap();
    wtxn.create_dbi(1, false).unwrap();
    wtxn.put(Dbi(1), b"gone", b"soon", PutFlags::empty()).unwrap();
    wtxn.commit().unwrap();

    let mut wtxn = db.begin_write().unwrap();
    wtxn.del(Dbi(1), b"gone").unwrap();
    wtxn.commit().unwrap();

    let mut rtxn = db.begin_read().unwrap();
    assert_eq!(rtxn.get(Dbi(1), b"gone").unwrap(), None);
}

#[test]
fn many_keys_survive_a_larger_write_batch() {
    let db = DbBuilder::new().build().unwrap();

    let mut wtxn = db.begin_write().unwrap();
    wtxn.create_dbi(1, false).unwrap();
    for i in 0..500u32 {
        let key = format!("key-{i:05}");
        let value = format!("value-{i}");
        wtxn.put(Dbi(1), key.as_bytes(), value.as_bytes(), PutFlags::empty()).unwrap();
    }
    wtxn.commit().unwrap();

    let mut rtxn = db.begin_read().unwrap();
    for i in 0..500u32 {
        let key = format!("key-{i:05}");
        let expected = format!("value-{i}");
        assert_eq!(rtxn.get(Dbi(1), key.as_bytes()).unwrap(), Some(expected.into_bytes()));
    }
}
