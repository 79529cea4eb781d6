use std::marker::PhantomData;

use anyhow::bail;

pub mod record;

/// Converts stored values to and from the bytes that go in a record's value
/// slot. Chosen once when a store is opened; whatever it writes is part of the
/// on-disk format.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T, buf: &mut Vec<u8>) -> anyhow::Result<()>;
    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, value: &String, buf: &mut Vec<u8>) -> anyhow::Result<()> {
        buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<String> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>, buf: &mut Vec<u8>) -> anyhow::Result<()> {
        buf.extend_from_slice(value);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

const SEPARATOR: [u8; 2] = [0x00, 0x01];
const ESCAPED_00: [u8; 2] = [0x00, 0xff];

fn copy_escaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.iter().position(|x| *x == 0x00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                to.push(0xff);
                from = &from[(idx + 1)..];
            }
            None => {
                to.extend(from);
                return;
            }
        }
    }
}

fn copy_unescaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.windows(2).position(|w| w == ESCAPED_00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                from = &from[(idx + 2)..];
            }
            None => {
                to.extend(from);
                from = &from[from.len()..];
            }
        }
    }
}

/// A record type stored through `FieldSerializer`. `FIELDS` is the durable
/// field order: `write_fields` and `read_fields` must visit exactly these
/// names, in this order.
pub trait Fields: Sized {
    const FIELDS: &'static [&'static str];

    fn write_fields(&self, w: &mut FieldWriter) -> anyhow::Result<()>;
    fn read_fields(r: &mut FieldReader) -> anyhow::Result<Self>;
}

/// Writes fields as escaped segments joined by `SEPARATOR`.
#[derive(Debug)]
pub struct FieldWriter<'a> {
    buf: &'a mut Vec<u8>,
    fields: &'static [&'static str],
    next_field: usize,
    segments: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(buf: &'a mut Vec<u8>, fields: &'static [&'static str]) -> Self {
        FieldWriter {
            buf,
            fields,
            next_field: 0,
            segments: 0,
        }
    }

    pub fn field<V: FieldValue>(&mut self, name: &str, value: &V) -> anyhow::Result<()> {
        match self.fields.get(self.next_field) {
            Some(expected) if *expected == name => {}
            Some(expected) => bail!("wrote field {:?} where {:?} was declared", name, expected),
            None => bail!("wrote undeclared field {:?}", name),
        }
        self.next_field += 1;
        value.write(self);
        Ok(())
    }

    pub fn segment(&mut self, data: &[u8]) {
        if self.segments > 0 {
            self.buf.extend(SEPARATOR);
        }
        copy_escaped(data, self.buf);
        self.segments += 1;
    }

    fn finish(&self) -> anyhow::Result<()> {
        if self.next_field != self.fields.len() {
            bail!(
                "wrote {} of {} declared fields",
                self.next_field,
                self.fields.len()
            );
        }
        Ok(())
    }
}

pub struct FieldReader<'a> {
    buf: &'a [u8],
    from: usize,
    done: bool,
    fields: &'static [&'static str],
    next_field: usize,
    scratch: Vec<u8>,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8], fields: &'static [&'static str]) -> Self {
        FieldReader {
            buf,
            from: 0,
            done: false,
            fields,
            next_field: 0,
            scratch: Vec::new(),
        }
    }

    pub fn field<V: FieldValue>(&mut self, name: &str) -> anyhow::Result<V> {
        match self.fields.get(self.next_field) {
            Some(expected) if *expected == name => {}
            Some(expected) => bail!("read field {:?} where {:?} was declared", name, expected),
            None => bail!("read undeclared field {:?}", name),
        }
        self.next_field += 1;
        V::read(self)
    }

    pub fn segment(&mut self) -> anyhow::Result<&[u8]> {
        if self.done {
            bail!("ran out of field data");
        }
        let rest = &self.buf[self.from..];
        let end = match rest.windows(2).position(|x| x == SEPARATOR) {
            Some(idx) => idx,
            None => {
                self.done = true;
                rest.len()
            }
        };

        self.scratch.clear();
        copy_unescaped(&rest[..end], &mut self.scratch);
        self.from += end + SEPARATOR.len();

        Ok(&self.scratch)
    }

    fn finish(&self) -> anyhow::Result<()> {
        if self.next_field != self.fields.len() {
            bail!(
                "read {} of {} declared fields",
                self.next_field,
                self.fields.len()
            );
        }
        if !self.done {
            bail!("trailing field data");
        }
        Ok(())
    }
}

/// A single field's value, written as one or more segments.
pub trait FieldValue: Sized {
    fn write(&self, w: &mut FieldWriter);
    fn read(r: &mut FieldReader) -> anyhow::Result<Self>;
}

impl FieldValue for String {
    fn write(&self, w: &mut FieldWriter) {
        w.segment(self.as_bytes())
    }

    fn read(r: &mut FieldReader) -> anyhow::Result<Self> {
        Ok(String::from_utf8(r.segment()?.to_vec())?)
    }
}

impl FieldValue for Vec<u8> {
    fn write(&self, w: &mut FieldWriter) {
        w.segment(self)
    }

    fn read(r: &mut FieldReader) -> anyhow::Result<Self> {
        Ok(r.segment()?.to_vec())
    }
}

macro_rules! int_field {
    ($($t:ty),*) => {
        $(
            impl FieldValue for $t {
                fn write(&self, w: &mut FieldWriter) {
                    w.segment(&self.to_le_bytes())
                }

                fn read(r: &mut FieldReader) -> anyhow::Result<Self> {
                    Ok(Self::from_le_bytes(r.segment()?.try_into()?))
                }
            }
        )*
    };
}

int_field!(u8, u32, u64, i64);

impl FieldValue for bool {
    fn write(&self, w: &mut FieldWriter) {
        w.segment(&[*self as u8])
    }

    fn read(r: &mut FieldReader) -> anyhow::Result<Self> {
        match r.segment()? {
            [0] => Ok(false),
            [1] => Ok(true),
            other => bail!("invalid bool field {:?}", other),
        }
    }
}

impl<A> FieldValue for Option<A>
where
    A: FieldValue,
{
    fn write(&self, w: &mut FieldWriter) {
        match self {
            None => w.segment(&[0]),
            Some(v) => {
                w.segment(&[1]);
                v.write(w);
            }
        }
    }

    fn read(r: &mut FieldReader) -> anyhow::Result<Self> {
        let tag = r.segment()?.to_vec();
        match tag.as_slice() {
            [0] => Ok(None),
            [1] => Ok(Some(A::read(r)?)),
            other => bail!("invalid option tag {:?}", other),
        }
    }
}

/// The default structured serializer: fields in the order `T::FIELDS`
/// declares them.
pub struct FieldSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> FieldSerializer<T> {
    pub fn new() -> Self {
        FieldSerializer {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FieldSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for FieldSerializer<T>
where
    T: Fields,
{
    fn serialize(&self, value: &T, buf: &mut Vec<u8>) -> anyhow::Result<()> {
        let mut w = FieldWriter::new(buf, T::FIELDS);
        value.write_fields(&mut w)?;
        w.finish()
    }

    fn deserialize(&self, bytes: &[u8]) -> anyhow::Result<T> {
        let mut r = FieldReader::new(bytes, T::FIELDS);
        let value = T::read_fields(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}
