//! B+tree invariant properties against a `BTreeMap` reference model (spec
//! §8 "for all sequences of puts and dels, `get` agrees with the reference
//! model").

use proptest::prelude::*;
use sapling::btree::PutFlags;
use sapling::db::{DbBuilder, Dbi};
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Clone)]
enum Op {
    Put(u16, u16),
    Del(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u16>(), any::<u16>()).prop_map(|(k, v)| Op::Put(k, v)),
        any::<u16>().prop_map(Op::Del),
    ]
}

fn key_bytes(k: u16) -> Vec<u8> {
    k.to_be_bytes().to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn get_agrees_with_a_btreemap_after_any_sequence_of_puts_and_dels(ops in prop::collection::vec(op_strategy(), 0..150)) {
        let db = DbBuilder::new().build().unwrap();
        let mut setup = db.begin_write().unwrap();
        setup.create_dbi(0, false).unwrap();
        setup.commit().unwrap();

        let mut model: BTreeMap<u16, u16> = BTreeMap::new();
        let mut touched: std::collections::BTreeSet<u16> = std::collections::BTreeSet::new();

        for op in &ops {
            let mut txn = db.begin_write().unwrap();
            match *op {
                Op::Put(k, v) => {
                    txn.put(Dbi(0), &key_bytes(k), &v.to_be_bytes(), PutFlags::empty()).unwrap();
                    model.insert(k, v);
                }
                Op::Del(k) => {
                    match txn.del(Dbi(0), &key_bytes(k)) {
                        Ok(_) | Err(sapling::error::Error::NotFound) => {}
                        Err(e) => panic!("unexpected delete error: {e}"),
                    }
                    model.remove(&k);
                }
            }
            touched.insert(match *op {
                Op::Put(k, _) => k,
                Op::Del(k) => k,
            });
            txn.commit().unwrap();
        }

        let mut rtxn = db.begin_read().unwrap();
        for k in touched {
            let expected = model.get(&k).map(|v| v.to_be_bytes().to_vec());
            let actual = rtxn.get(Dbi(0), &key_bytes(k)).unwrap();
            prop_assert_eq!(actual, expected, "mismatch at key {}", k);
        }

        let total = rtxn.count_range(Dbi(0), Bound::Unbounded, Bound::Unbounded).unwrap();
        prop_assert_eq!(total as usize, model.len());
    }

    #[test]
    fn count_range_matches_the_reference_model_over_a_bounded_window(
        ops in prop::collection::vec(op_strategy(), 0..150),
        lo in any::<u16>(),
        hi in any::<u16>(),
    ) {
        prop_assume!(lo <= hi);

        let db = DbBuilder::new().build().unwrap();
        let mut setup = db.begin_write().unwrap();
        setup.create_dbi(0, false).unwrap();
        setup.commit().unwrap();

        let mut model: BTreeMap<u16, u16> = BTreeMap::new();
        for op in &ops {
            let mut txn = db.begin_write().unwrap();
            match *op {
                Op::Put(k, v) => {
                    txn.put(Dbi(0), &key_bytes(k), &v.to_be_bytes(), PutFlags::empty()).unwrap();
                    model.insert(k, v);
                }
                Op::Del(k) => {
                    match txn.del(Dbi(0), &key_bytes(k)) {
                        Ok(_) | Err(sapling::error::Error::NotFound) => {}
                        Err(e) => panic!("unexpected delete error: {e}"),
                    }
                    model.remove(&k);
                }
            }
            txn.commit().unwrap();
        }

        let expected = model.range(lo..=hi).count();
        let mut rtxn = db.begin_read().unwrap();
        let lo_bytes = key_bytes(lo);
        let hi_bytes = key_bytes(hi);
        let actual = rtxn.count_range(Dbi(0), Bound::Included(&lo_bytes[..]), Bound::Included(&hi_bytes[..])).unwrap();
        prop_assert_eq!(actual as usize, expected);
    }
}
