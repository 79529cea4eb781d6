// Runs a random sequence of reads and writes twice: once as-is and once with
// maintenance (promotion, compaction, reopening) scheduled in between. The
// maintenance must never change what the reads return. On a mismatch the
// schedule is shrunk before failing.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use rand::Rng;

use crate::{config::Options, encoding::StringSerializer, KeyValue};

use super::Database;

#[derive(Debug, Clone)]
enum Op {
    Set(String, String),
    Delete(String),
    Get(String),
    Between(String, String),
    Promote,
    Compact,
    Reload,
}

#[derive(Debug, Clone, Default)]
struct Schedule {
    ops: Vec<Op>,
    // Each runs just before `ops[idx]`, or at the end if `idx == ops.len()`.
    maintenance: Vec<(usize, Op)>,
}

impl Schedule {
    fn interleaved(&self) -> Vec<Op> {
        let mut maintenance = self.maintenance.clone();
        maintenance.sort_by_key(|(idx, _)| *idx);
        let mut maintenance = maintenance.into_iter().peekable();

        let mut out = Vec::new();
        for (i, op) in self.ops.iter().enumerate() {
            while let Some((_, m)) = maintenance.next_if(|(idx, _)| *idx <= i) {
                out.push(m);
            }
            out.push(op.clone());
        }
        out.extend(maintenance.map(|(_, m)| m));
        out
    }

    fn without_op(&self, idx: usize) -> Schedule {
        let mut s = self.clone();
        s.ops.remove(idx);
        for m in s.maintenance.iter_mut() {
            if m.0 > idx {
                m.0 -= 1;
            }
        }
        s
    }

    fn without_maintenance(&self, idx: usize) -> Schedule {
        let mut s = self.clone();
        s.maintenance.remove(idx);
        s
    }

    fn plain(&self) -> Schedule {
        Schedule {
            ops: self.ops.clone(),
            maintenance: Vec::new(),
        }
    }

    fn diverges(&self) -> bool {
        run(&self.plain().interleaved()) != run(&self.interleaved())
    }

    /// Drops ops and maintenance steps for as long as the outputs still differ.
    fn shrink(mut self) -> Schedule {
        'outer: loop {
            for idx in 0..self.ops.len() {
                let smaller = self.without_op(idx);
                if smaller.diverges() {
                    self = smaller;
                    continue 'outer;
                }
            }
            for idx in 0..self.maintenance.len() {
                let smaller = self.without_maintenance(idx);
                if smaller.diverges() {
                    self = smaller;
                    continue 'outer;
                }
            }
            return self;
        }
    }
}

fn open(dir: &Path) -> Database<String> {
    let options = Options {
        max_log_size: 200,
        max_levels: 3,
        cache_capacity: 4,
        index_interval: 3,
        ..Options::default()
    };
    Database::open(dir, options, Arc::new(StringSerializer)).unwrap()
}

fn run(ops: &[Op]) -> Vec<String> {
    let dir = tempfile::tempdir().unwrap();
    let mut db = open(dir.path());
    let mut out = Vec::new();

    for op in ops {
        match op {
            Op::Set(k, v) => db.set(k.as_str(), v.clone()).unwrap(),
            Op::Delete(k) => db.delete(k.as_str()).unwrap(),
            Op::Get(k) => out.push(format!("{:?}", db.get(k).unwrap())),
            Op::Between(from, to) => {
                out.push(format!("{:?}", db.between(from, to, None).unwrap()))
            }
            Op::Promote => {
                // It's fine if there was nothing to promote.
                db.promote(true).unwrap();
            }
            Op::Compact => {
                db.compact().unwrap();
            }
            Op::Reload => {
                db.close().unwrap();
                db = open(dir.path());
            }
        }
    }

    out
}

fn key(rng: &mut impl Rng) -> String {
    format!("key{}", rng.gen_range(0..10))
}

fn random_ops(rng: &mut impl Rng, n: usize) -> Vec<Op> {
    (0..n)
        .map(|_| match rng.gen_range(0..4) {
            0 => Op::Set(key(rng), format!("value{}", rng.gen_range(0..10))),
            1 => Op::Delete(key(rng)),
            2 => Op::Get(key(rng)),
            3 => {
                let (a, b) = (key(rng), key(rng));
                if a <= b {
                    Op::Between(a, b)
                } else {
                    Op::Between(b, a)
                }
            }
            _ => unreachable!(),
        })
        .collect()
}

#[test]
fn metamorphic_test() {
    let mut rng = rand::thread_rng();
    let mut schedule = Schedule {
        ops: random_ops(&mut rng, 50),
        maintenance: Vec::new(),
    };

    for _ in 0..30 {
        let idx = rng.gen_range(0..=schedule.ops.len());
        let op = match rng.gen_range(0..3) {
            0 => Op::Promote,
            1 => Op::Compact,
            2 => Op::Reload,
            _ => unreachable!(),
        };
        schedule.maintenance.push((idx, op));
    }

    if schedule.diverges() {
        println!("reduced case: {:#?}", schedule.shrink());
        panic!("they differed!")
    }
}

#[test]
fn random_against_model() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let mut model = BTreeMap::new();
    let mut rng = rand::thread_rng();

    for i in 0..1000 {
        let k = format!("key{}", rng.gen_range(0..100));
        if rng.gen_range(0..4) == 0 {
            db.delete(k.as_str()).unwrap();
            model.remove(&k);
        } else {
            let v = format!("value{}", i);
            db.set(k.as_str(), v.clone()).unwrap();
            model.insert(k, v);
        }
    }

    let expected: Vec<_> = model
        .into_iter()
        .map(|(key, value)| KeyValue { key, value })
        .collect();
    assert_eq!(expected, db.between("key", "kez", None).unwrap());
}
