use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::bail;

use crate::{
    encoding::{record, Serializer},
    LogEntry,
};

/// Writes one level file front to back. Keys must arrive strictly increasing;
/// that's what lets readers stop early and seek through the index.
struct SegmentWriter<'a, T> {
    w: BufWriter<File>,
    serializer: &'a dyn Serializer<T>,
    buf: Vec<u8>,
    prev_key: Option<String>,
    written: u64,
}

impl<'a, T> SegmentWriter<'a, T> {
    fn create(path: &Path, serializer: &'a dyn Serializer<T>) -> anyhow::Result<Self> {
        // Never clobber an existing level.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(SegmentWriter {
            w: BufWriter::new(file),
            serializer,
            buf: Vec::with_capacity(1024),
            prev_key: None,
            written: 0,
        })
    }

    fn write(&mut self, entry: &LogEntry<T>) -> anyhow::Result<()> {
        if let Some(prev) = &self.prev_key {
            if prev.as_str() >= entry.key.as_str() {
                bail!(
                    "level keys must be strictly increasing, got {:?} after {:?}",
                    entry.key,
                    prev
                );
            }
        }

        self.buf.clear();
        record::encode(entry, self.serializer, &mut self.buf)?;
        self.w.write_all(&self.buf)?;
        self.written += self.buf.len() as u64;

        match &mut self.prev_key {
            Some(prev) => prev.clone_from(&entry.key),
            None => self.prev_key = Some(entry.key.clone()),
        }
        Ok(())
    }

    fn finish(self) -> anyhow::Result<u64> {
        let file = self.w.into_inner().map_err(|e| e.into_error())?;
        // The level is about to replace data held elsewhere, so it has to be on
        // disk first.
        file.sync_all()?;
        Ok(self.written)
    }
}

/// Writes `entries` (sorted by key) to a new file at `path` and fsyncs it.
/// A partially written file is removed on failure.
pub(crate) fn write_segment<T, I>(
    path: &Path,
    entries: I,
    serializer: &dyn Serializer<T>,
) -> anyhow::Result<u64>
where
    I: IntoIterator<Item = LogEntry<T>>,
{
    let mut writer = SegmentWriter::create(path, serializer)?;
    let result = entries
        .into_iter()
        .try_for_each(|entry| writer.write(&entry))
        .and_then(|_| writer.finish());

    if result.is_err() {
        if let Err(e) = fs::remove_file(path) {
            ::log::warn!("failed to remove partial level {}: {}", path.display(), e);
        }
    }
    result
}
