use std::{
    collections::{BTreeMap, HashSet},
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        mpsc, Arc,
    },
};

use anyhow::Context;
use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    config::Options,
    encoding::Serializer,
    error::{check_key, Error},
    level::{Level, LevelContext},
    log::{Log, LogLock},
    KeyValue, LogEntry, Lookup, Value,
};

#[cfg(test)]
mod metamorphic_test;
#[cfg(test)]
mod trace_test;

const LOG_FILE: &str = "database.log";
const LEVEL_EXT: &str = "level";

/// A point-in-time view of the store's shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub levels: usize,
    /// Records per level, oldest first.
    pub level_records: Vec<usize>,
    pub log_size: u64,
    pub log_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// The store: one write log in front of a list of immutable levels.
///
/// Every operation takes `&self`. Writes, promotion and compaction are
/// serialized on the log's write lock; reads never take it.
pub struct Database<T: Value> {
    dir: PathBuf,
    options: Options,
    ctx: LevelContext<T>,
    log: Log<T>,
    // Oldest first.
    levels: RwLock<Vec<Arc<Level<T>>>>,
    // Only advanced while holding the log's write lock.
    next_level: AtomicU32,
}

impl<T: Value> std::fmt::Debug for Database<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.dir)
            .field("log", &self.log)
            .field("levels", &*self.levels.read())
            .finish()
    }
}

fn level_seq(path: &Path) -> anyhow::Result<u32> {
    path.file_stem()
        .and_then(OsStr::to_str)
        .and_then(|stem| stem.parse().ok())
        .ok_or_else(|| Error::corruption(path, 0, "level file name is not a sequence number").into())
}

/// Closes a level that is no longer in the list and deletes its file. A
/// reader may still hold it, in which case the file is unlinked from under
/// the open handle and goes away once the reader is done.
fn remove_level<T: Value>(level: Arc<Level<T>>) -> anyhow::Result<()> {
    match Arc::try_unwrap(level) {
        Ok(level) => level.remove(),
        Err(shared) => {
            fs::remove_file(shared.path())?;
            Ok(())
        }
    }
}

impl<T: Value> Database<T> {
    pub fn open<P>(dir: P, options: Options, serializer: Arc<dyn Serializer<T>>) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let ctx = LevelContext {
            serializer: serializer.clone(),
            cache_capacity: options.cache_capacity,
            index_interval: options.index_interval,
        };

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if path.extension() != Some(OsStr::new(LEVEL_EXT)) || !path.is_file() {
                continue;
            }
            found.push((level_seq(&path)?, path));
        }
        found.sort_by_key(|(seq, _)| *seq);

        let levels = found
            .into_iter()
            .map(|(seq, path)| Level::open(&path, seq, &ctx).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let next_level = levels.last().map_or(0, |l| l.seq() + 1);

        let log = Log::open(dir.join(LOG_FILE), serializer, options.sync_writes)?;

        ::log::info!(
            "opened database {} ({} levels, log {} bytes)",
            dir.display(),
            levels.len(),
            log.size()
        );

        Ok(Database {
            dir,
            options,
            ctx,
            log,
            levels: RwLock::new(levels),
            next_level: AtomicU32::new(next_level),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn level_path(&self, seq: u32) -> PathBuf {
        self.dir.join(format!("{:04}.{}", seq, LEVEL_EXT))
    }

    fn levels(&self) -> Vec<Arc<Level<T>>> {
        self.levels.read().clone()
    }

    /// The current value of `key`, or `None` if it was never written or was
    /// deleted.
    pub fn get(&self, key: &str) -> anyhow::Result<Option<T>> {
        check_key(key)?;

        // The log has to be consulted before the levels are listed: a
        // promotion publishes its level before clearing the log, so this order
        // can't miss a key that is moving between the two.
        let found = self.log.get(key);
        if !found.is_not_found() {
            return Ok(found.into_value());
        }
        for level in self.levels().iter().rev() {
            let found = level.lookup(key)?;
            if !found.is_not_found() {
                return Ok(found.into_value());
            }
        }
        Ok(None)
    }

    pub fn set<K: Into<String>>(&self, key: K, value: T) -> anyhow::Result<()> {
        self.log.set(key, value)?;
        self.promote(false)?;
        Ok(())
    }

    pub fn set_batch<I, K>(&self, pairs: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
    {
        self.log.set_batch(pairs)?;
        self.promote(false)?;
        Ok(())
    }

    pub fn delete<K: Into<String>>(&self, key: K) -> anyhow::Result<()> {
        self.log.delete(key)?;
        self.promote(false)?;
        Ok(())
    }

    pub fn delete_batch<I, K>(&self, keys: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.log.delete_batch(keys)?;
        self.promote(false)?;
        Ok(())
    }

    /// Live pairs with `from <= key < to`, sorted by key, at most `limit` of
    /// them.
    pub fn between(
        &self,
        from: &str,
        to: &str,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<KeyValue<T>>> {
        let mut seen = HashSet::new();
        let mut live = BTreeMap::new();
        let mut take = |entry: LogEntry<T>| {
            if seen.insert(entry.key.clone()) {
                let key = entry.key.clone();
                if let Lookup::Found(value) = entry.into_lookup() {
                    live.insert(key, value);
                }
            }
        };

        for entry in self.log.scan(from, to) {
            take(entry);
        }
        for level in self.levels().iter().rev() {
            for entry in level.scan(from, to)? {
                take(entry);
            }
        }

        Ok(live
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, value)| KeyValue { key, value })
            .collect())
    }

    /// Moves the log into a new level if it has outgrown `max_log_size`, or
    /// unconditionally when `force` is set. Compacts afterwards if that leaves
    /// too many levels. Returns whether a level was written.
    pub fn promote(&self, force: bool) -> anyhow::Result<bool> {
        let mut lock = self.log.lock();
        if !force && lock.size() <= self.options.max_log_size {
            return Ok(false);
        }
        if lock.is_empty() {
            return Ok(false);
        }

        let seq = self.next_level.load(Ordering::SeqCst);
        let path = self.level_path(seq);
        let level = Level::build(&self.log, &path, seq, &self.ctx)?;
        self.next_level.store(seq + 1, Ordering::SeqCst);
        ::log::info!(
            "promoted {} bytes of log into {} ({} records)",
            lock.size(),
            path.display(),
            level.len()
        );

        let count = {
            let mut levels = self.levels.write();
            levels.push(Arc::new(level));
            levels.len()
        };
        lock.clear()?;

        if count > self.options.max_levels {
            self.compact_locked(&lock)?;
        }
        Ok(true)
    }

    /// Merges every level into one, dropping deleted keys for good. Returns
    /// false if there was nothing to merge.
    pub fn compact(&self) -> anyhow::Result<bool> {
        let lock = self.log.lock();
        self.compact_locked(&lock)
    }

    fn compact_locked(&self, _lock: &LogLock<'_, T>) -> anyhow::Result<bool> {
        let old = self.levels();
        if old.is_empty() {
            return Ok(false);
        }

        let seq = self.next_level.load(Ordering::SeqCst);
        let path = self.level_path(seq);
        let merged = Level::compact(&old, &path, seq, &self.ctx)?;
        self.next_level.store(seq + 1, Ordering::SeqCst);
        ::log::info!(
            "compacted {} levels into {} ({} records)",
            old.len(),
            path.display(),
            merged.len()
        );

        *self.levels.write() = vec![Arc::new(merged)];

        let mut first_err = None;
        for level in old {
            let path = level.path().to_path_buf();
            if let Err(e) = remove_level(level) {
                ::log::warn!("failed to remove superseded level {}: {}", path.display(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Receives every entry written from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<LogEntry<T>> {
        self.log.subscribe()
    }

    pub fn stats(&self) -> Stats {
        let levels = self.levels();
        let mut stats = Stats {
            levels: levels.len(),
            level_records: levels.iter().map(|l| l.len()).collect(),
            log_size: self.log.size(),
            log_entries: self.log.len(),
            ..Stats::default()
        };
        for level in &levels {
            let cache = level.cache_stats();
            stats.cache_hits += cache.hits;
            stats.cache_misses += cache.misses;
        }
        stats
    }

    /// Flushes the log to disk and closes every file.
    pub fn close(self) -> anyhow::Result<()> {
        self.log.sync()?;
        let Database { levels, log, .. } = self;
        drop(levels);
        drop(log);
        Ok(())
    }
}
