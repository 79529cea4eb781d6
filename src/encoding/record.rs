// Records are laid out as
//
//   [key len: u32][value len: u32][operation: u8][key bytes][value bytes]
//
// with little-endian integers. A value length of zero means "no value" and is
// never handed to the serializer. There's no checksum, so the reader's job is
// to make sure lengths and tags are consistent with the bytes actually there
// and to fail instead of reading garbage.

use std::{
    fs::File,
    io::{BufReader, Cursor, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use crate::{
    encoding::Serializer,
    error::{check_key, Error},
    LogEntry, Operation,
};

pub const HEADER_LEN: u64 = 4 + 4 + 1;

/// Appends the encoding of `entry` to `buf`. On error `buf` is left as it was.
pub fn encode<T>(
    entry: &LogEntry<T>,
    serializer: &dyn Serializer<T>,
    buf: &mut Vec<u8>,
) -> anyhow::Result<()> {
    check_key(&entry.key)?;

    let start = buf.len();
    buf.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
    // Value length is patched in once the value has been serialized.
    buf.extend_from_slice(&[0; 4]);
    buf.push(entry.operation as u8);
    buf.extend_from_slice(entry.key.as_bytes());

    let value_start = buf.len();
    if let (Operation::Write, Some(value)) = (entry.operation, &entry.value) {
        if let Err(e) = serializer.serialize(value, buf) {
            buf.truncate(start);
            return Err(e);
        }
    }

    let value_len = match u32::try_from(buf.len() - value_start) {
        Ok(n) => n,
        Err(_) => {
            let len = buf.len() - value_start;
            buf.truncate(start);
            return Err(
                Error::InvalidArgument(format!("value of {} bytes is too long", len)).into(),
            );
        }
    };
    buf[start + 4..start + 8].copy_from_slice(&value_len.to_le_bytes());

    Ok(())
}

/// Decodes exactly one record from `bytes`.
pub fn decode<T>(bytes: &[u8], serializer: &dyn Serializer<T>) -> anyhow::Result<LogEntry<T>> {
    let mut reader = RecordReader::new(Cursor::new(bytes), bytes.len() as u64, "<memory>");
    let entry = match reader.next_entry(serializer)? {
        Some(entry) => entry,
        None => return Err(Error::corruption("<memory>", 0, "no record").into()),
    };
    if !reader.at_end() {
        return Err(Error::corruption("<memory>", reader.position(), "trailing bytes").into());
    }
    Ok(entry)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub key_len: u32,
    pub value_len: u32,
    pub operation: Operation,
}

/// Sequential reader over a run of records occupying the first `len` bytes of
/// `r`.
pub struct RecordReader<R> {
    r: BufReader<R>,
    path: PathBuf,
    pos: u64,
    len: u64,
    buf: Vec<u8>,
}

impl RecordReader<File> {
    pub fn open<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(RecordReader::new(file, len, path.as_ref()))
    }
}

impl<R> RecordReader<R>
where
    R: Read + Seek,
{
    pub fn new<P: Into<PathBuf>>(r: R, len: u64, path: P) -> Self {
        RecordReader {
            r: BufReader::new(r),
            path: path.into(),
            pos: 0,
            len,
            buf: Vec::with_capacity(1024),
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.len
    }

    pub fn seek(&mut self, pos: u64) -> anyhow::Result<()> {
        self.r.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    fn corruption(&self, offset: u64, reason: impl Into<String>) -> anyhow::Error {
        Error::corruption(self.path.clone(), offset, reason).into()
    }

    pub fn read_header(&mut self) -> anyhow::Result<RecordHeader> {
        let start = self.pos;
        let remaining = self.len.saturating_sub(start);
        if remaining < HEADER_LEN {
            return Err(self.corruption(start, "truncated record header"));
        }

        let mut header = [0_u8; HEADER_LEN as usize];
        self.r.read_exact(&mut header)?;
        self.pos += HEADER_LEN;

        let key_len = u32::from_le_bytes(header[0..4].try_into()?);
        let value_len = u32::from_le_bytes(header[4..8].try_into()?);
        let operation = match Operation::from_u8(header[8]) {
            Some(op) => op,
            None => {
                return Err(self.corruption(start, format!("unknown operation tag {}", header[8])))
            }
        };

        if key_len == 0 {
            return Err(self.corruption(start, "empty key"));
        }
        if operation == Operation::Delete && value_len != 0 {
            return Err(self.corruption(start, "delete record carries a value"));
        }
        if key_len as u64 + value_len as u64 > remaining - HEADER_LEN {
            return Err(self.corruption(
                start,
                format!(
                    "record of {} bytes overruns the {} remaining",
                    HEADER_LEN + key_len as u64 + value_len as u64,
                    remaining
                ),
            ));
        }

        Ok(RecordHeader {
            key_len,
            value_len,
            operation,
        })
    }

    fn fill(&mut self, n: u32) -> anyhow::Result<()> {
        self.buf.clear();
        self.buf.resize(n as usize, 0);
        self.r.read_exact(&mut self.buf)?;
        self.pos += n as u64;
        Ok(())
    }

    pub fn read_key(&mut self, header: &RecordHeader) -> anyhow::Result<String> {
        let start = self.pos;
        self.fill(header.key_len)?;
        match std::str::from_utf8(&self.buf) {
            Ok(key) => Ok(key.to_owned()),
            Err(_) => Err(self.corruption(start, "key is not valid utf-8")),
        }
    }

    pub fn read_value<T>(
        &mut self,
        header: &RecordHeader,
        serializer: &dyn Serializer<T>,
    ) -> anyhow::Result<Option<T>> {
        if header.value_len == 0 {
            return Ok(None);
        }
        let start = self.pos;
        self.fill(header.value_len)?;
        match serializer.deserialize(&self.buf) {
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(self.corruption(start, format!("undecodable value: {}", e))),
        }
    }

    pub fn skip_value(&mut self, header: &RecordHeader) -> anyhow::Result<()> {
        self.r.seek_relative(header.value_len as i64)?;
        self.pos += header.value_len as u64;
        Ok(())
    }

    pub fn next_entry<T>(
        &mut self,
        serializer: &dyn Serializer<T>,
    ) -> anyhow::Result<Option<LogEntry<T>>> {
        if self.at_end() {
            return Ok(None);
        }
        let header = self.read_header()?;
        let key = self.read_key(&header)?;
        let value = self.read_value(&header, serializer)?;
        Ok(Some(LogEntry {
            key,
            operation: header.operation,
            value,
        }))
    }
}
