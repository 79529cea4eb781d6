use std::{path::Path, sync::Arc};

use crate::{config::Options, encoding::StringSerializer};

use super::Database;

fn open_with(dir: &Path, args: &std::collections::HashMap<String, Vec<String>>) -> Database<String> {
    let mut options = Options::default();
    for (k, v) in args {
        let v = &v[0];
        match k.as_str() {
            "max_log_size" => options.max_log_size = v.parse().unwrap(),
            "max_levels" => options.max_levels = v.parse().unwrap(),
            "cache_capacity" => options.cache_capacity = v.parse().unwrap(),
            "index_interval" => options.index_interval = v.parse().unwrap(),
            _ => panic!("unknown option {}", k),
        }
    }
    Database::open(dir, options, Arc::new(StringSerializer)).unwrap()
}

#[test]
fn test_db_trace() {
    datadriven::walk("src/db/testdata/", |f| {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_with(dir.path(), &Default::default());
        f.run(|test_case| match test_case.directive.as_str() {
            "set" => {
                let pairs = test_case.input.lines().map(|line| {
                    let (k, v) = line.split_once('=').unwrap();
                    (k.to_owned(), v.to_owned())
                });
                if test_case.args.contains_key("batch") {
                    db.set_batch(pairs).unwrap();
                } else {
                    for (k, v) in pairs {
                        db.set(k, v).unwrap();
                    }
                }
                "ok\n".into()
            }
            "delete" => {
                for key in test_case.input.lines() {
                    db.delete(key.trim()).unwrap();
                }
                "ok\n".into()
            }
            "get" => test_case
                .input
                .lines()
                .map(|key| format!("{:?}\n", db.get(key.trim()).unwrap()))
                .collect(),
            "between" => {
                let arg = |name: &str| test_case.args.get(name).map(|v| v[0].clone());
                let from = arg("from").unwrap();
                let to = arg("to").unwrap();
                let limit = arg("limit").map(|l| l.parse().unwrap());
                let found = db.between(&from, &to, limit).unwrap();
                if found.is_empty() {
                    "<empty>\n".into()
                } else {
                    found
                        .into_iter()
                        .map(|kv| format!("{}={}\n", kv.key, kv.value))
                        .collect()
                }
            }
            "promote" => {
                format!("{}\n", db.promote(test_case.args.contains_key("force")).unwrap())
            }
            "compact" => format!("{}\n", db.compact().unwrap()),
            "stats" => {
                let stats = db.stats();
                format!(
                    "levels: {:?}\nlog entries: {}\n",
                    stats.level_records, stats.log_entries
                )
            }
            "files" => {
                let mut names: Vec<_> = std::fs::read_dir(dir.path())
                    .unwrap()
                    .map(|e| e.unwrap().file_name().into_string().unwrap())
                    .filter(|n| n.ends_with(".level"))
                    .collect();
                names.sort();
                if names.is_empty() {
                    "<none>\n".into()
                } else {
                    names.into_iter().map(|n| n + "\n").collect()
                }
            }
            "reload" => {
                db = open_with(dir.path(), &test_case.args);
                "ok\n".into()
            }
            _ => {
                panic!("unhandled");
            }
        })
    })
}
