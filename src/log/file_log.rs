use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc,
    },
};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    encoding::{
        record::{self, RecordReader},
        Serializer,
    },
    error::check_key,
    Lookup, LogEntry, Operation, Value,
};

use super::LogObserver;

// Current value per key; `None` marks a key whose latest record is a delete.
type Mirror<T> = HashMap<String, Option<T>>;

fn apply<T: Default>(mirror: &mut Mirror<T>, entry: LogEntry<T>) {
    match entry.operation {
        Operation::Write => {
            mirror.insert(entry.key, Some(entry.value.unwrap_or_default()));
        }
        Operation::Delete => {
            mirror.insert(entry.key, None);
        }
    }
}

/// The append-only write log plus an in-memory mirror of everything in it.
///
/// Appends and truncation are serialized on the file mutex. Readers only ever
/// take the mirror's read lock, so they never wait on disk I/O.
pub struct Log<T: Value> {
    path: PathBuf,
    file: Mutex<File>,
    size: AtomicU64,
    mirror: RwLock<Mirror<T>>,
    serializer: Arc<dyn Serializer<T>>,
    sync_writes: bool,
    observers: RwLock<Vec<Box<dyn LogObserver<T>>>>,
}

impl<T: Value> std::fmt::Debug for Log<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("path", &self.path)
            .field("size", &self.size())
            .field("entries", &self.len())
            .finish()
    }
}

impl<T: Value> Log<T> {
    /// Opens the log at `path`, creating it if needed and otherwise replaying
    /// every record in it. A corrupt log fails the open.
    pub fn open<P>(
        path: P,
        serializer: Arc<dyn Serializer<T>>,
        sync_writes: bool,
    ) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut mirror = HashMap::new();
        let mut reader = RecordReader::open(&path)?;
        let mut replayed = 0;
        while let Some(entry) = reader.next_entry(&*serializer)? {
            apply(&mut mirror, entry);
            replayed += 1;
        }
        let size = reader.len();

        ::log::debug!(
            "opened log {} ({} bytes, {} records, {} keys)",
            path.display(),
            size,
            replayed,
            mirror.len()
        );

        Ok(Log {
            path,
            file: Mutex::new(file),
            size: AtomicU64::new(size),
            mirror: RwLock::new(mirror),
            serializer,
            sync_writes,
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the log file in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Number of keys in the mirror, deleted ones included.
    pub fn len(&self) -> usize {
        self.mirror.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.read().is_empty()
    }

    pub fn get(&self, key: &str) -> Lookup<T> {
        match self.mirror.read().get(key) {
            None => Lookup::NotFound,
            Some(None) => Lookup::Tombstoned,
            Some(Some(v)) => Lookup::Found(v.clone()),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.mirror
            .read()
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.mirror
            .read()
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn set<K: Into<String>>(&self, key: K, value: T) -> anyhow::Result<()> {
        self.append(vec![LogEntry::write(key, value)])
    }

    /// Writes every pair in one append; readers see all of them or none.
    pub fn set_batch<I, K>(&self, pairs: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
    {
        self.append(
            pairs
                .into_iter()
                .map(|(k, v)| LogEntry::write(k, v))
                .collect(),
        )
    }

    pub fn delete<K: Into<String>>(&self, key: K) -> anyhow::Result<()> {
        self.append(vec![LogEntry::delete(key)])
    }

    pub fn delete_batch<I, K>(&self, keys: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.append(keys.into_iter().map(LogEntry::delete).collect())
    }

    fn append(&self, mut entries: Vec<LogEntry<T>>) -> anyhow::Result<()> {
        for entry in &entries {
            check_key(&entry.key)?;
        }
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in entries.iter_mut() {
            let start = buf.len();
            record::encode(entry, &*self.serializer, &mut buf)?;
            // A value that encoded to nothing replays as no value, so the
            // mirror and observers have to see it the same way.
            if (buf.len() - start) as u64 == record::HEADER_LEN + entry.key.len() as u64 {
                entry.value = None;
            }
        }

        {
            let mut file = self.file.lock();
            let prev_size = self.size();
            if let Err(e) = Self::write_all(&mut file, &buf, self.sync_writes) {
                // Don't leave half a batch behind for the next replay.
                if let Err(rollback) = file.set_len(prev_size) {
                    ::log::warn!("failed to roll back {}: {}", self.path.display(), rollback);
                }
                return Err(e);
            }
            self.size.fetch_add(buf.len() as u64, Ordering::SeqCst);

            let mut mirror = self.mirror.write();
            for entry in &entries {
                apply(&mut mirror, entry.clone());
            }
        }

        self.notify(&entries);
        Ok(())
    }

    fn write_all(file: &mut File, buf: &[u8], sync: bool) -> anyhow::Result<()> {
        file.write_all(buf)?;
        file.flush()?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn notify(&self, entries: &[LogEntry<T>]) {
        let observers = self.observers.read();
        for observer in observers.iter() {
            for entry in entries {
                observer.on_entry(entry);
            }
        }
    }

    pub fn add_observer(&self, observer: Box<dyn LogObserver<T>>) {
        self.observers.write().push(observer);
    }

    /// Returns a channel that receives every entry appended from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<LogEntry<T>> {
        let (tx, rx) = mpsc::channel();
        self.add_observer(Box::new(tx));
        rx
    }

    /// Entries with `from <= key < to`, deletes included, in no particular
    /// order.
    pub fn scan(&self, from: &str, to: &str) -> Vec<LogEntry<T>> {
        self.mirror
            .read()
            .iter()
            .filter(|(k, _)| k.as_str() >= from && k.as_str() < to)
            .map(|(k, v)| to_entry(k, v))
            .collect()
    }

    /// Every entry in the mirror, sorted by key.
    pub fn snapshot(&self) -> Vec<LogEntry<T>> {
        let mut entries: Vec<_> = self
            .mirror
            .read()
            .iter()
            .map(|(k, v)| to_entry(k, v))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Takes the write lock. Appends block until the returned guard is
    /// dropped; reads carry on against the mirror.
    pub fn lock(&self) -> LogLock<'_, T> {
        LogLock {
            log: self,
            file: self.file.lock(),
        }
    }

    pub fn sync(&self) -> anyhow::Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        self.lock().clear()
    }
}

fn to_entry<T: Clone>(key: &str, value: &Option<T>) -> LogEntry<T> {
    match value {
        Some(v) => LogEntry::write(key, v.clone()),
        None => LogEntry::delete(key),
    }
}

/// Exclusive access to the log for the duration of a promotion.
pub struct LogLock<'a, T: Value> {
    log: &'a Log<T>,
    file: MutexGuard<'a, File>,
}

impl<'a, T: Value> LogLock<'a, T> {
    pub fn size(&self) -> u64 {
        self.log.size()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Truncates the file in place and empties the mirror. Only safe once the
    /// log's contents live somewhere else.
    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.flush()?;
        if self.log.sync_writes {
            self.file.sync_all()?;
        }
        self.log.size.store(0, Ordering::SeqCst);
        self.log.mirror.write().clear();
        Ok(())
    }
}
