use std::collections::BTreeMap;

use quickcheck::{Arbitrary, Gen};

use rtable::{
    Entity, Error, Expected, Properties, Property, ReplicationMetadata, RowKey,
    Version,
};

const N_KEYS: u8 = 10;
const TAILS: [&str; 2] = ["t1", "t2"];

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq)]
pub struct Key(pub u8);

impl Key {
    fn row_key(self) -> RowKey {
        RowKey::new("p", format!("k{}", self.0))
    }
}

impl Arbitrary for Key {
    fn arbitrary(g: &mut Gen) -> Self {
        Key(u8::arbitrary(g) % N_KEYS)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        Box::new(self.0.shrink().map(Key))
    }
}

#[derive(Debug, Clone)]
pub enum Op {
    Insert(Key, u8),
    Replace(Key, u8),
    Merge(Key, u8),
    Delete(Key),
    InsertOrReplace(Key, u8),
    InsertOrMerge(Key, u8),
    Retrieve(Key),
    TailDown(usize),
    TailUp(usize),
    Reconcile,
}

use self::Op::*;

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        let tail = usize::arbitrary(g) % TAILS.len();
        match u8::arbitrary(g) % 12 {
            0 | 1 => Insert(Key::arbitrary(g), u8::arbitrary(g)),
            2 => Replace(Key::arbitrary(g), u8::arbitrary(g)),
            3 => Merge(Key::arbitrary(g), u8::arbitrary(g)),
            4 => Delete(Key::arbitrary(g)),
            5 => InsertOrReplace(Key::arbitrary(g), u8::arbitrary(g)),
            6 => InsertOrMerge(Key::arbitrary(g), u8::arbitrary(g)),
            7 | 8 => Retrieve(Key::arbitrary(g)),
            9 => TailDown(tail),
            10 => TailUp(tail),
            11 => Reconcile,
            _ => panic!("impossible choice"),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        match *self {
            Insert(k, v) => Box::new(k.shrink().map(move |k| Insert(k, v))),
            Replace(k, v) => Box::new(k.shrink().map(move |k| Replace(k, v))),
            Merge(k, v) => Box::new(k.shrink().map(move |k| Merge(k, v))),
            Delete(k) => Box::new(k.shrink().map(Delete)),
            InsertOrReplace(k, v) => {
                Box::new(k.shrink().map(move |k| InsertOrReplace(k, v)))
            }
            InsertOrMerge(k, v) => {
                Box::new(k.shrink().map(move |k| InsertOrMerge(k, v)))
            }
            Retrieve(k) => Box::new(k.shrink().map(Retrieve)),
            TailDown(_) | TailUp(_) | Reconcile => Box::new(vec![].into_iter()),
        }
    }
}

// What a row should look like: the version of its last write, and its
// user columns unless that write was a delete.
#[derive(Debug, Clone, PartialEq)]
struct Expectation {
    version: Version,
    live: Option<Properties>,
}

fn columns(name: &str, v: u8) -> Properties {
    let mut properties = Properties::new();
    properties.insert(name.to_owned(), Property::from(i64::from(v)));
    properties
}

fn merge_column(v: u8) -> String {
    format!("m{}", v % 3)
}

fn user_columns(properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(name, _)| !name.starts_with("_rtable_"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub fn prop_table_matches_model(ops: Vec<Op>) -> bool {
    if let Err(e) = prop_table_matches_model_inner(ops) {
        eprintln!("hit error while running quickcheck on rtable: {:?}", e);
        false
    } else {
        true
    }
}

fn prop_table_matches_model_inner(ops: Vec<Op>) -> rtable::Result<()> {
    super::common::setup_logger();

    let cluster = super::common::Cluster::new(&["h", "t1", "t2"]);
    let table = cluster.create(super::common::test_config(), &["h", "t1", "t2"]);

    let mut reference: BTreeMap<Key, Expectation> = BTreeMap::new();

    for op in ops {
        match op {
            Insert(k, v) => {
                let res = table.insert(entity(k, "v", v));
                match reference.get(&k) {
                    Some(Expectation { live: Some(_), .. }) => assert_eq!(
                        res,
                        Err(Error::PreconditionFailed { key: k.row_key() })
                    ),
                    _ => {
                        let committed = res?;
                        record(&mut reference, k, committed.version, Some(columns("v", v)));
                    }
                }
            }
            Replace(k, v) | Merge(k, v) => {
                let merging = matches!(op, Merge(..));
                let res = if merging {
                    table.merge(entity(k, &merge_column(v), v), Expected::Any)
                } else {
                    table.replace(entity(k, "v", v), Expected::Any)
                };
                match reference.get(&k).and_then(|e| e.live.clone()) {
                    None => assert_eq!(
                        res,
                        Err(Error::NotFound { key: k.row_key() })
                    ),
                    Some(mut live) => {
                        let committed = res?;
                        if merging {
                            live.extend(columns(&merge_column(v), v));
                        } else {
                            live = columns("v", v);
                        }
                        record(&mut reference, k, committed.version, Some(live));
                    }
                }
            }
            Delete(k) => {
                let res = table.delete(&k.row_key(), Expected::Any);
                match reference.get(&k) {
                    Some(Expectation { live: Some(_), .. }) => {
                        let committed = res?;
                        record(&mut reference, k, committed.version, None);
                    }
                    _ => assert_eq!(
                        res,
                        Err(Error::NotFound { key: k.row_key() })
                    ),
                }
            }
            InsertOrReplace(k, v) => {
                let committed = table.insert_or_replace(entity(k, "v", v))?;
                record(&mut reference, k, committed.version, Some(columns("v", v)));
            }
            InsertOrMerge(k, v) => {
                let name = merge_column(v);
                let committed =
                    table.insert_or_merge(entity(k, &name, v))?;
                let mut live = reference
                    .get(&k)
                    .and_then(|e| e.live.clone())
                    .unwrap_or_default();
                live.extend(columns(&name, v));
                record(&mut reference, k, committed.version, Some(live));
            }
            Retrieve(k) => {
                let RowKey { partition_key, row_key } = k.row_key();
                let res = table.retrieve(&partition_key, &row_key);
                match reference.get(&k) {
                    Some(Expectation { version, live: Some(live) }) => {
                        let found = res?;
                        assert_eq!(found.version, Some(*version));
                        assert_eq!(&found.properties, live);
                    }
                    _ => assert_eq!(
                        res,
                        Err(Error::NotFound { key: k.row_key() })
                    ),
                }
            }
            TailDown(i) => cluster.replica(TAILS[i]).set_reachable(false),
            TailUp(i) => cluster.replica(TAILS[i]).set_reachable(true),
            Reconcile => {
                table.reconcile_all()?;
            }
        }
    }

    for tail in TAILS {
        cluster.replica(tail).set_reachable(true);
    }

    let summary = table.reconcile_all()?;
    assert_eq!(summary.incomplete, 0);
    assert_eq!(table.check_replica_invariants()?, vec![]);

    for name in ["h", "t1", "t2"] {
        let rows = cluster.replica(name).snapshot();
        assert_eq!(rows.len(), reference.len(), "row count on {}", name);

        for (row, (k, expected)) in rows.iter().zip(reference.iter()) {
            assert_eq!(row.key, k.row_key());
            let meta = ReplicationMetadata::read(&row.key, &row.properties)?
                .ok_or_else(|| Error::Corruption {
                    key: row.key.clone(),
                    reason: "missing replication metadata".into(),
                })?;
            assert_eq!(meta.version, expected.version, "{} on {}", row.key, name);
            assert_eq!(meta.tombstone, expected.live.is_none());
            if let Some(live) = &expected.live {
                assert_eq!(&user_columns(&row.properties), live);
            }
        }
    }

    Ok(())
}

fn entity(k: Key, name: &str, v: u8) -> Entity {
    let RowKey { partition_key, row_key } = k.row_key();
    Entity::new(partition_key, row_key).with(name, i64::from(v))
}

fn record(
    reference: &mut BTreeMap<Key, Expectation>,
    k: Key,
    version: Version,
    live: Option<Properties>,
) {
    let previous = reference.get(&k).map_or(Version(0), |e| e.version);
    assert_eq!(version, previous.next(), "version of {:?}", k);
    reference.insert(k, Expectation { version, live });
}
