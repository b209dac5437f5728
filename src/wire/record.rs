//! Declarative record layouts and the codec that is driven by them.
//!
//! A [RecordDef] is an ordered list of [Field]s. The same definition is used for encoding a
//!  [Record] (a list of named values) and for decoding one from a buffer, so encode and decode
//!  cannot drift apart for a given message.

use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::buf_ext::BufExt;


/// Records are padded to four byte boundaries
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// A field with this name is filled with the record's total encoded length, regardless of the
///  value passed in
pub const AUTO_LENGTH_FIELD: &str = "length";


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// padding, written as zeros and skipped when reading
    Zeros(usize),
    /// u32 length (including a NUL terminator) followed by UTF-8 bytes, padded to 4 bytes
    StringUtf8,
    /// u32 length followed by raw console bytes, padded to 4 bytes
    TtyStreamData,
    Variant,
}

impl FieldKind {
    fn fixed_len(&self) -> Option<usize> {
        match self {
            FieldKind::U8 | FieldKind::I8 => Some(1),
            FieldKind::U16 | FieldKind::I16 => Some(2),
            FieldKind::U32 | FieldKind::I32 => Some(4),
            FieldKind::U64 | FieldKind::I64 => Some(8),
            FieldKind::Zeros(n) => Some(*n),
            FieldKind::StringUtf8 | FieldKind::TtyStreamData | FieldKind::Variant => None,
        }
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    /// used for numeric fields that the record being encoded does not contain
    pub default: i64,
}

impl Field {
    pub const fn new(name: &'static str, kind: FieldKind) -> Field {
        Field { name, kind, default: 0 }
    }

    pub const fn with_default(self, default: i64) -> Field {
        Field { default, ..self }
    }

    pub const fn u8(name: &'static str) -> Field { Self::new(name, FieldKind::U8) }
    pub const fn u16(name: &'static str) -> Field { Self::new(name, FieldKind::U16) }
    pub const fn u32(name: &'static str) -> Field { Self::new(name, FieldKind::U32) }
    pub const fn u64(name: &'static str) -> Field { Self::new(name, FieldKind::U64) }
    pub const fn i32(name: &'static str) -> Field { Self::new(name, FieldKind::I32) }
    pub const fn i64(name: &'static str) -> Field { Self::new(name, FieldKind::I64) }
    pub const fn zeros(len: usize) -> Field { Self::new("", FieldKind::Zeros(len)) }
    pub const fn string(name: &'static str) -> Field { Self::new(name, FieldKind::StringUtf8) }
    pub const fn tty_stream(name: &'static str) -> Field { Self::new(name, FieldKind::TtyStreamData) }
    pub const fn variant(name: &'static str) -> Field { Self::new(name, FieldKind::Variant) }
}

pub type RecordDef = &'static [Field];


/// A self-describing value: `[u32 size incl. this header][u32 tag][payload]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    /// 128 bit numbers (tags 4 and 5) and tags this codec does not know. The payload is kept
    ///  as is.
    Opaque { tag: u32, raw: Bytes },
    Utf8(String),
    Bytes(Bytes),
}

impl Variant {
    pub const HEADER_LEN: usize = 8;

    pub const TAG_I32: u32 = 0;
    pub const TAG_U32: u32 = 1;
    pub const TAG_I64: u32 = 2;
    pub const TAG_U64: u32 = 3;
    pub const TAG_UTF8: u32 = 7;
    pub const TAG_BYTES: u32 = 8;

    pub fn tag(&self) -> u32 {
        match self {
            Variant::I32(_) => Self::TAG_I32,
            Variant::U32(_) => Self::TAG_U32,
            Variant::I64(_) => Self::TAG_I64,
            Variant::U64(_) => Self::TAG_U64,
            Variant::Opaque { tag, .. } => *tag,
            Variant::Utf8(_) => Self::TAG_UTF8,
            Variant::Bytes(_) => Self::TAG_BYTES,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Variant::I32(_) | Variant::U32(_) => 4,
            Variant::I64(_) | Variant::U64(_) => 8,
            Variant::Opaque { raw, .. } => raw.len(),
            Variant::Utf8(s) => 4 + pad4(s.len() + 1),
            Variant::Bytes(b) => 4 + pad4(b.len()),
        }
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.payload_len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.encoded_len() as u32);
        buf.put_u32_le(self.tag());
        match self {
            Variant::I32(v) => buf.put_i32_le(*v),
            Variant::U32(v) => buf.put_u32_le(*v),
            Variant::I64(v) => buf.put_i64_le(*v),
            Variant::U64(v) => buf.put_u64_le(*v),
            Variant::Opaque { raw, .. } => buf.put_slice(raw),
            Variant::Utf8(s) => {
                buf.put_u32_le((s.len() + 1) as u32);
                buf.put_slice(s.as_bytes());
                buf.put_bytes(0, pad4(s.len() + 1) - s.len());
            }
            Variant::Bytes(b) => {
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
                buf.put_bytes(0, pad4(b.len()) - b.len());
            }
        }
    }

    /// Reads a variant, always consuming exactly the number of bytes given by its size field
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Variant> {
        let size = buf.checked_get_u32_le()? as usize;
        if size < Self::HEADER_LEN {
            bail!("variant size {} is smaller than its header", size);
        }
        let tag = buf.checked_get_u32_le()?;
        let mut payload = buf.checked_copy_to_bytes(size - Self::HEADER_LEN)?;

        let result = match tag {
            Self::TAG_I32 => Variant::I32(payload.checked_get_i32_le()?),
            Self::TAG_U32 => Variant::U32(payload.checked_get_u32_le()?),
            Self::TAG_I64 => Variant::I64(payload.checked_get_i64_le()?),
            Self::TAG_U64 => Variant::U64(payload.checked_get_u64_le()?),
            Self::TAG_UTF8 => {
                let len = payload.checked_get_u32_le()? as usize;
                let raw = payload.checked_copy_to_bytes(len)?;
                Variant::Utf8(utf8_without_nul(&raw)?)
            }
            Self::TAG_BYTES => {
                let len = payload.checked_get_u32_le()? as usize;
                Variant::Bytes(payload.checked_copy_to_bytes(len)?)
            }
            tag => Variant::Opaque { tag, raw: payload },
        };
        Ok(result)
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::I32(v) => write!(f, "{}", v),
            Variant::U32(v) => write!(f, "{}", v),
            Variant::I64(v) => write!(f, "{}", v),
            Variant::U64(v) => write!(f, "{}", v),
            Variant::Opaque { tag, raw } => write!(f, "<tag {}: {} bytes>", tag, raw.len()),
            Variant::Utf8(s) => write!(f, "{}", s),
            Variant::Bytes(b) => write!(f, "{:?}", b),
        }
    }
}

fn utf8_without_nul(raw: &[u8]) -> anyhow::Result<String> {
    let raw = match raw.last() {
        Some(&0) => &raw[..raw.len() - 1],
        _ => raw,
    };
    Ok(std::str::from_utf8(raw)?.to_string())
}


#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Str(String),
    Variant(Variant),
}

impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int(v as i64) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<u8> for Value { fn from(v: u8) -> Self { Value::UInt(v as u64) } }
impl From<u16> for Value { fn from(v: u16) -> Self { Value::UInt(v as u64) } }
impl From<u32> for Value { fn from(v: u32) -> Self { Value::UInt(v as u64) } }
impl From<u64> for Value { fn from(v: u64) -> Self { Value::UInt(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::Str(v.to_string()) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::Str(v) } }
impl From<Variant> for Value { fn from(v: Variant) -> Self { Value::Variant(v) } }


/// Named values in field order, as produced by [decode] and consumed by [encode]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    values: Vec<(&'static str, Value)>,
}

macro_rules! typed_getter {
    ($name: ident, $ty: ty) => {
        pub fn $name(&self, name: &str) -> anyhow::Result<$ty> {
            let n = self.number(name)?;
            <$ty>::try_from(n).map_err(|_| anyhow!("value {} of field {} does not fit {}", n, name, stringify!($ty)))
        }
    }
}

impl Record {
    pub fn new() -> Record {
        Record::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Record {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<Value>) {
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, Value)> {
        self.values.iter()
    }

    fn number(&self, name: &str) -> anyhow::Result<i128> {
        match self.get(name) {
            Some(Value::Int(v)) => Ok(*v as i128),
            Some(Value::UInt(v)) => Ok(*v as i128),
            Some(other) => bail!("field {} is not a number: {:?}", name, other),
            None => bail!("no field {}", name),
        }
    }

    typed_getter!(u8, u8);
    typed_getter!(u16, u16);
    typed_getter!(u32, u32);
    typed_getter!(u64, u64);
    typed_getter!(i32, i32);
    typed_getter!(i64, i64);

    pub fn str(&self, name: &str) -> anyhow::Result<&str> {
        match self.get(name) {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => bail!("field {} is not a string: {:?}", name, other),
            None => bail!("no field {}", name),
        }
    }

    pub fn variant(&self, name: &str) -> anyhow::Result<&Variant> {
        match self.get(name) {
            Some(Value::Variant(v)) => Ok(v),
            Some(other) => bail!("field {} is not a variant: {:?}", name, other),
            None => bail!("no field {}", name),
        }
    }
}


fn field_len(field: &Field, record: &Record) -> anyhow::Result<usize> {
    if let Some(len) = field.kind.fixed_len() {
        return Ok(len);
    }
    match (field.kind, record.get(field.name)) {
        (FieldKind::StringUtf8, Some(Value::Str(s))) => Ok(4 + pad4(s.len() + 1)),
        (FieldKind::TtyStreamData, Some(Value::Str(s))) => Ok(4 + pad4(s.len())),
        (FieldKind::Variant, Some(Value::Variant(v))) => Ok(v.encoded_len()),
        (kind, value) => bail!("field {} ({:?}) cannot be encoded from {:?}", field.name, kind, value),
    }
}

pub fn encoded_len(def: RecordDef, record: &Record) -> anyhow::Result<usize> {
    let mut total = 0;
    for field in def {
        total += field_len(field, record)?;
    }
    Ok(total)
}

macro_rules! put_number {
    ($buf: expr, $put: ident, $ty: ty, $field: expr, $n: expr) => {{
        let n = $n;
        $buf.$put(<$ty>::try_from(n).map_err(|_| anyhow!("value {} out of range for field {}", n, $field.name))?)
    }}
}

pub fn encode_into(def: RecordDef, record: &Record, buf: &mut BytesMut) -> anyhow::Result<()> {
    let total_len = encoded_len(def, record)?;
    buf.reserve(total_len);

    for field in def {
        let number = || -> anyhow::Result<i128> {
            if field.name == AUTO_LENGTH_FIELD {
                return Ok(total_len as i128);
            }
            match record.get(field.name) {
                None => Ok(field.default as i128),
                Some(Value::Int(v)) => Ok(*v as i128),
                Some(Value::UInt(v)) => Ok(*v as i128),
                Some(other) => bail!("field {} expects a number, got {:?}", field.name, other),
            }
        };

        match field.kind {
            FieldKind::U8 => put_number!(buf, put_u8, u8, field, number()?),
            FieldKind::U16 => put_number!(buf, put_u16_le, u16, field, number()?),
            FieldKind::U32 => put_number!(buf, put_u32_le, u32, field, number()?),
            FieldKind::U64 => put_number!(buf, put_u64_le, u64, field, number()?),
            FieldKind::I8 => put_number!(buf, put_i8, i8, field, number()?),
            FieldKind::I16 => put_number!(buf, put_i16_le, i16, field, number()?),
            FieldKind::I32 => put_number!(buf, put_i32_le, i32, field, number()?),
            FieldKind::I64 => put_number!(buf, put_i64_le, i64, field, number()?),
            FieldKind::Zeros(n) => buf.put_bytes(0, n),
            FieldKind::StringUtf8 => {
                let s = record.str(field.name)?;
                buf.put_u32_le((s.len() + 1) as u32);
                buf.put_slice(s.as_bytes());
                buf.put_bytes(0, pad4(s.len() + 1) - s.len());
            }
            FieldKind::TtyStreamData => {
                let s = record.str(field.name)?;
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
                buf.put_bytes(0, pad4(s.len()) - s.len());
            }
            FieldKind::Variant => record.variant(field.name)?.ser(buf),
        }
    }
    Ok(())
}

pub fn encode(def: RecordDef, record: &Record) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_into(def, record, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes one record, leaving `buf` positioned right after it
pub fn decode(def: RecordDef, buf: &mut impl Buf) -> anyhow::Result<Record> {
    let mut record = Record::new();
    for field in def {
        let value: Value = match field.kind {
            FieldKind::U8 => buf.checked_get_u8()?.into(),
            FieldKind::U16 => buf.checked_get_u16_le()?.into(),
            FieldKind::U32 => buf.checked_get_u32_le()?.into(),
            FieldKind::U64 => buf.checked_get_u64_le()?.into(),
            FieldKind::I8 => (buf.checked_get_i8()? as i32).into(),
            FieldKind::I16 => (buf.checked_get_i16_le()? as i32).into(),
            FieldKind::I32 => buf.checked_get_i32_le()?.into(),
            FieldKind::I64 => buf.checked_get_i64_le()?.into(),
            FieldKind::Zeros(n) => {
                buf.checked_advance(n)?;
                continue;
            }
            FieldKind::StringUtf8 => {
                let len = buf.checked_get_u32_le()? as usize;
                let raw = buf.checked_copy_to_bytes(pad4(len))?;
                utf8_without_nul(&raw[..len])?.into()
            }
            FieldKind::TtyStreamData => {
                let len = buf.checked_get_u32_le()? as usize;
                let raw = buf.checked_copy_to_bytes(pad4(len))?;
                String::from_utf8_lossy(&raw[..len]).into_owned().into()
            }
            FieldKind::Variant => Variant::try_deser(buf)?.into(),
        };
        record.set(field.name, value);
    }
    Ok(record)
}

/// Decodes records for as long as the next four bytes are a positive number. Lists on the wire
///  have no count; each entry starts with its (positive) size, and a zero or negative value or
///  the end of the buffer terminates the list.
pub fn decode_list(def: RecordDef, buf: &mut impl Buf) -> anyhow::Result<Vec<Record>> {
    let mut result = Vec::new();
    while let Some(next) = buf.peek_i32_le() {
        if next <= 0 {
            break;
        }
        result.push(decode(def, buf)?);
    }
    Ok(result)
}
