mod common;

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tempfile::tempdir;

use common::{collect, open_db};

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, usize),
    Erase(u16),
    Commit,
    Abort,
    Snapshot,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u16..600, 0usize..300).prop_map(|(k, len)| Op::Insert(k, len)),
        3 => (0u16..600).prop_map(Op::Erase),
        1 => Just(Op::Commit),
        1 => Just(Op::Abort),
        1 => Just(Op::Snapshot),
    ]
}

fn model_key(k: u16) -> Vec<u8> {
    format!("key-{k:05}").into_bytes()
}

fn model_value(k: u16, len: usize) -> Vec<u8> {
    (0..len).map(|i| (k as usize + i) as u8).collect()
}

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

fn records(model: &Model) -> Vec<(Vec<u8>, Vec<u8>)> {
    model.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_matches_ordered_map(ops in prop::collection::vec(op_strategy(), 1..400)) {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path(), 2048).unwrap();

        let mut committed = Model::new();
        let mut working = Model::new();
        let mut snapshots = Vec::new();
        let mut txn = db.start_transaction().unwrap();

        for op in ops {
            match op {
                Op::Insert(k, len) => {
                    let value = model_value(k, len);
                    txn.insert(&model_key(k), &value).unwrap();
                    working.insert(model_key(k), value);
                }
                Op::Erase(k) => {
                    let existed = txn.erase(&model_key(k)).unwrap();
                    prop_assert_eq!(existed, working.remove(&model_key(k)).is_some());
                }
                Op::Commit => {
                    txn.commit().unwrap();
                    committed = working.clone();
                    txn = db.start_transaction().unwrap();
                }
                Op::Abort => {
                    txn.abort().unwrap();
                    working = committed.clone();
                    txn = db.start_transaction().unwrap();
                }
                Op::Snapshot => {
                    snapshots.push((db.latest(), records(&committed)));
                }
            }
        }

        assert_eq!(collect(txn.cursor().unwrap()).unwrap(), records(&working));
        for (snapshot, expected) in &snapshots {
            assert_eq!(&collect(snapshot.cursor().unwrap()).unwrap(), expected);
        }
        txn.commit().unwrap();
        assert_eq!(collect(db.latest().cursor().unwrap()).unwrap(), records(&working));
    }
}
