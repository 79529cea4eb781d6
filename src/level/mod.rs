// A level is an immutable, key-sorted file of records, written once either by
// draining the log or by merging other levels. Each key appears at most once.
//
// On open we make a single pass over the file, recording the offset of every
// `index_interval`-th record in the sparse index. Point lookups seek to the
// closest indexed key at or before the one they want and read forward; since
// keys are sorted, reading a larger key proves the one we want isn't there.
// Range scans seek the same way and stop at the first key past the range.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    encoding::{record::RecordReader, Serializer},
    error::Error,
    log::Log,
    Lookup, LogEntry, Operation, Value,
};

use self::{
    cache::{CacheStats, LookupCache},
    index::SparseIndex,
};

pub mod cache;
pub mod index;
mod writer;

/// What every level of a store is opened with.
pub struct LevelContext<T> {
    pub serializer: Arc<dyn Serializer<T>>,
    pub cache_capacity: usize,
    pub index_interval: usize,
}

impl<T> Clone for LevelContext<T> {
    fn clone(&self) -> Self {
        LevelContext {
            serializer: self.serializer.clone(),
            cache_capacity: self.cache_capacity,
            index_interval: self.index_interval,
        }
    }
}

pub struct Level<T: Value> {
    seq: u32,
    path: PathBuf,
    reader: Mutex<RecordReader<File>>,
    index: SparseIndex,
    cache: LookupCache<T>,
    serializer: Arc<dyn Serializer<T>>,
    // Smallest and largest key, if the level has any records.
    bounds: Option<(String, String)>,
    records: usize,
    size: u64,
}

impl<T: Value> std::fmt::Debug for Level<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("seq", &self.seq)
            .field("path", &self.path)
            .field("records", &self.records)
            .field("size", &self.size)
            .finish()
    }
}

impl<T: Value> Level<T> {
    /// Writes everything in the log, deletes included, into a new level.
    pub fn build<P>(log: &Log<T>, path: P, seq: u32, ctx: &LevelContext<T>) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        writer::write_segment(path.as_ref(), log.snapshot(), &*ctx.serializer)?;
        Self::open(path, seq, ctx)
    }

    /// Merges `levels` (oldest first) into a new level. Deletes cancel out
    /// whatever they shadow and are then dropped, since there's nothing older
    /// left for them to hide.
    pub fn compact<P>(
        levels: &[Arc<Level<T>>],
        path: P,
        seq: u32,
        ctx: &LevelContext<T>,
    ) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let mut merged: BTreeMap<String, Option<T>> = BTreeMap::new();
        for level in levels {
            for entry in level.entries()? {
                if entry.is_delete() {
                    merged.insert(entry.key, None);
                } else {
                    merged.insert(entry.key, Some(entry.value.unwrap_or_default()));
                }
            }
        }

        let live = merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| LogEntry::write(k, v)));
        writer::write_segment(path.as_ref(), live, &*ctx.serializer)?;
        Self::open(path, seq, ctx)
    }

    pub fn open<P>(path: P, seq: u32, ctx: &LevelContext<T>) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let mut reader = RecordReader::open(&path)?;
        let interval = ctx.index_interval.max(1);

        let mut index = SparseIndex::new();
        let mut bounds: Option<(String, String)> = None;
        let mut records = 0;
        while !reader.at_end() {
            let offset = reader.position();
            let header = reader.read_header()?;
            let key = reader.read_key(&header)?;
            reader.skip_value(&header)?;

            if records % interval == 0 {
                index.insert(key.clone(), offset);
            }
            bounds = match bounds {
                None => Some((key.clone(), key)),
                Some((first, last)) => {
                    if last >= key {
                        return Err(Error::corruption(
                            path,
                            offset,
                            format!("key {:?} is out of order after {:?}", key, last),
                        )
                        .into());
                    }
                    Some((first, key))
                }
            };
            records += 1;
        }
        let size = reader.len();

        ::log::debug!(
            "opened level {} ({} records, {} indexed, {} bytes)",
            path.display(),
            records,
            index.len(),
            size
        );

        Ok(Level {
            seq,
            path,
            reader: Mutex::new(reader),
            index,
            cache: LookupCache::new(ctx.cache_capacity),
            serializer: ctx.serializer.clone(),
            bounds,
            records,
            size,
        })
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records, deletes included.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn in_bounds(&self, key: &str) -> bool {
        match &self.bounds {
            Some((first, last)) => first.as_str() <= key && key <= last.as_str(),
            None => false,
        }
    }

    pub fn lookup(&self, key: &str) -> anyhow::Result<Lookup<T>> {
        if !self.in_bounds(key) {
            return Ok(Lookup::NotFound);
        }
        if let Some(hit) = self.cache.try_get(key) {
            return Ok(hit);
        }

        let start = self
            .index
            .search(key)
            .or_else(|| self.index.search_floor(key))
            .map_or(0, |e| e.offset);

        let result = {
            let mut reader = self.reader.lock();
            reader.seek(start)?;
            let mut result = Lookup::NotFound;
            while !reader.at_end() {
                let header = reader.read_header()?;
                let found = reader.read_key(&header)?;
                match found.as_str().cmp(key) {
                    Ordering::Less => reader.skip_value(&header)?,
                    Ordering::Equal => {
                        result = match header.operation {
                            Operation::Delete => Lookup::Tombstoned,
                            Operation::Write => Lookup::Found(
                                reader
                                    .read_value(&header, &*self.serializer)?
                                    .unwrap_or_default(),
                            ),
                        };
                        break;
                    }
                    Ordering::Greater => break,
                }
            }
            result
        };

        self.cache.add(key.to_owned(), result.clone());
        Ok(result)
    }

    /// Records with `from <= key < to` in key order, deletes included.
    pub fn scan(&self, from: &str, to: &str) -> anyhow::Result<Vec<LogEntry<T>>> {
        let mut out = Vec::new();
        if from >= to {
            return Ok(out);
        }
        if let Some((first, last)) = &self.bounds {
            if to <= first.as_str() || from > last.as_str() {
                return Ok(out);
            }
        } else {
            return Ok(out);
        }

        let start = self
            .index
            .search_floor(from)
            .or_else(|| self.index.search_nearest(from))
            .map_or(0, |e| e.offset);

        let mut reader = self.reader.lock();
        reader.seek(start)?;
        while !reader.at_end() {
            let header = reader.read_header()?;
            let key = reader.read_key(&header)?;
            if key.as_str() < from {
                reader.skip_value(&header)?;
                continue;
            }
            if key.as_str() >= to {
                break;
            }
            let value = reader.read_value(&header, &*self.serializer)?;
            out.push(LogEntry {
                key,
                operation: header.operation,
                value,
            });
        }
        Ok(out)
    }

    /// Every record in the level, in key order.
    pub fn entries(&self) -> anyhow::Result<Vec<LogEntry<T>>> {
        let mut reader = self.reader.lock();
        reader.seek(0)?;
        let mut out = Vec::with_capacity(self.records);
        while let Some(entry) = reader.next_entry(&*self.serializer)? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Closes the level and deletes its file.
    pub fn remove(self) -> anyhow::Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{Level, LevelContext};
    use crate::{
        encoding::{FieldReader, FieldSerializer, FieldWriter, Fields, StringSerializer},
        log::Log,
        Error, LogEntry, Lookup,
    };

    fn ctx() -> LevelContext<String> {
        LevelContext {
            serializer: Arc::new(StringSerializer),
            cache_capacity: 16,
            index_interval: 1,
        }
    }

    fn log_with(dir: &std::path::Path, entries: &[(&str, Option<&str>)]) -> Log<String> {
        let log = Log::open(dir.join("database.log"), Arc::new(StringSerializer), false).unwrap();
        for (k, v) in entries {
            match v {
                Some(v) => log.set(*k, v.to_string()).unwrap(),
                None => log.delete(*k).unwrap(),
            }
        }
        log
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct TestEntry {
        value: String,
    }

    impl Fields for TestEntry {
        const FIELDS: &'static [&'static str] = &["value"];

        fn write_fields(&self, w: &mut FieldWriter) -> anyhow::Result<()> {
            w.field("value", &self.value)
        }

        fn read_fields(r: &mut FieldReader) -> anyhow::Result<Self> {
            Ok(TestEntry {
                value: r.field("value")?,
            })
        }
    }

    #[test]
    fn test_level() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Arc::new(FieldSerializer::<TestEntry>::new());
        let log: Log<TestEntry> =
            Log::open(dir.path().join("database.log"), serializer.clone(), false).unwrap();
        for i in 0..1000 {
            log.set(
                format!("key{}", i),
                TestEntry {
                    value: format!("value{}", i),
                },
            )
            .unwrap();
        }
        log.delete("key88").unwrap();

        let ctx: LevelContext<TestEntry> = LevelContext {
            serializer,
            cache_capacity: 100,
            index_interval: 1,
        };
        let level = Level::build(&log, dir.path().join("0000.level"), 0, &ctx).unwrap();
        assert_eq!(1000, level.len());

        let found = |k: &str| match level.lookup(k).unwrap() {
            Lookup::Found(e) => e.value,
            other => panic!("{}: {:?}", k, other),
        };
        assert_eq!("value100", found("key100"));
        assert_eq!("value999", found("key999"));
        assert_eq!(Lookup::NotFound, level.lookup("random key name").unwrap());
        assert_eq!(Lookup::Tombstoned, level.lookup("key88").unwrap());
    }

    #[test]
    fn test_lookup_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(dir.path(), &[("a", Some("1")), ("c", Some("3"))]);
        let level = Level::build(&log, dir.path().join("0000.level"), 0, &ctx()).unwrap();

        assert_eq!(Lookup::Found("1".to_owned()), level.lookup("a").unwrap());
        assert_eq!(Lookup::Found("1".to_owned()), level.lookup("a").unwrap());
        // Between the bounds but absent: resolved on disk, then cached.
        assert_eq!(Lookup::NotFound, level.lookup("b").unwrap());
        assert_eq!(Lookup::NotFound, level.lookup("b").unwrap());

        let stats = level.cache_stats();
        assert_eq!(2, stats.hits);
        assert_eq!(2, stats.misses);

        // Scans leave the cache alone.
        level.scan("a", "z").unwrap();
        assert_eq!(2, level.cache_stats().len);
    }

    #[test]
    fn test_scan() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(
            dir.path(),
            &[
                ("b", Some("2")),
                ("d", Some("4")),
                ("c", None),
                ("f", Some("6")),
                ("h", Some("8")),
            ],
        );

        for interval in [1, 2, 3, 100] {
            let ctx = LevelContext {
                index_interval: interval,
                ..ctx()
            };
            let path = dir.path().join(format!("{:04}.level", interval));
            let level = Level::build(&log, &path, interval as u32, &ctx).unwrap();

            assert_eq!(
                vec![
                    LogEntry::delete("c"),
                    LogEntry::write("d", "4".to_owned()),
                    LogEntry::write("f", "6".to_owned()),
                ],
                level.scan("c", "h").unwrap(),
                "interval {}",
                interval
            );
            assert_eq!(
                vec![LogEntry::write("b", "2".to_owned())],
                level.scan("a", "c").unwrap()
            );
            assert_eq!(
                vec![LogEntry::write("h", "8".to_owned())],
                level.scan("g", "z").unwrap()
            );
            assert!(level.scan("x", "z").unwrap().is_empty());
            assert!(level.scan("f", "a").unwrap().is_empty());

            for (k, want) in [
                ("b", Lookup::Found("2".to_owned())),
                ("c", Lookup::Tombstoned),
                ("e", Lookup::NotFound),
                ("h", Lookup::Found("8".to_owned())),
            ] {
                assert_eq!(want, level.lookup(k).unwrap(), "interval {} key {}", interval, k);
            }
        }
    }

    #[test]
    fn test_compact() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx();

        let log = log_with(dir.path(), &[("a", Some("1")), ("b", Some("1")), ("c", Some("1"))]);
        let first = Level::build(&log, dir.path().join("0000.level"), 0, &ctx).unwrap();
        log.clear().unwrap();

        log.set("a", "2".to_owned()).unwrap();
        log.delete("b").unwrap();
        log.delete("z").unwrap();
        let second = Level::build(&log, dir.path().join("0001.level"), 1, &ctx).unwrap();
        log.clear().unwrap();

        log.set("b", "3".to_owned()).unwrap();
        log.delete("c").unwrap();
        let third = Level::build(&log, dir.path().join("0002.level"), 2, &ctx).unwrap();

        let levels = vec![Arc::new(first), Arc::new(second), Arc::new(third)];
        let merged = Level::compact(&levels, dir.path().join("0003.level"), 3, &ctx).unwrap();

        assert_eq!(
            vec![
                LogEntry::write("a", "2".to_owned()),
                LogEntry::write("b", "3".to_owned()),
            ],
            merged.entries().unwrap()
        );
        assert_eq!(Lookup::NotFound, merged.lookup("c").unwrap());
        assert_eq!(Lookup::NotFound, merged.lookup("z").unwrap());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_with(dir.path(), &[("a", Some("1"))]);
        let path = dir.path().join("0000.level");
        let level = Level::build(&log, &path, 0, &ctx()).unwrap();
        assert!(path.exists());
        level.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_out_of_order_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000.level");
        let mut buf = Vec::new();
        for k in ["b", "a"] {
            crate::encoding::record::encode(
                &LogEntry::write(k, "v".to_owned()),
                &StringSerializer,
                &mut buf,
            )
            .unwrap();
        }
        std::fs::write(&path, buf).unwrap();

        let err = Level::open(&path, 0, &ctx()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Corruption { .. })
        ));
    }
}
