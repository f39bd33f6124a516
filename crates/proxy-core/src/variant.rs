//! Codec for the typed argument list carried by `CALL_FUNCTION` tank
//! packets.
//!
//! Wire layout: a leading u8 entry count, then per entry a u8 argument
//! index, a u8 type tag, and a tag-dependent payload. Any out-of-range
//! read or unknown tag fails the whole buffer; a frame whose extra data
//! does not decode is forwarded untouched by the relay.
//!
//! Decoded entries keep their original encoded slice, so re-emitting a
//! list where only some entries were modified reproduces the untouched
//! entries byte for byte.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

pub const TYPE_FLOAT: u8 = 1;
pub const TYPE_STRING: u8 = 2;
pub const TYPE_VEC2: u8 = 3;
pub const TYPE_VEC3: u8 = 4;
pub const TYPE_UNSIGNED: u8 = 5;
pub const TYPE_SIGNED: u8 = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariantError {
    #[error("variant buffer truncated in entry {0}")]
    Truncated(usize),
    #[error("unknown variant type tag {tag} in entry {entry}")]
    UnknownTag { entry: usize, tag: u8 },
    #[error("variant string in entry {0} is not valid utf-8")]
    BadString(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Float(f32),
    Str(String),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Unsigned(u32),
    Signed(i32),
}

impl Variant {
    pub fn type_tag(&self) -> u8 {
        match self {
            Variant::Float(_) => TYPE_FLOAT,
            Variant::Str(_) => TYPE_STRING,
            Variant::Vec2(_) => TYPE_VEC2,
            Variant::Vec3(_) => TYPE_VEC3,
            Variant::Unsigned(_) => TYPE_UNSIGNED,
            Variant::Signed(_) => TYPE_SIGNED,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of `Unsigned`/`Signed` values.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variant::Unsigned(v) => Some(i64::from(*v)),
            Variant::Signed(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            Variant::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Variant::Str(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Variant::Vec2(v) => {
                for f in v {
                    out.extend_from_slice(&f.to_le_bytes());
                }
            }
            Variant::Vec3(v) => {
                for f in v {
                    out.extend_from_slice(&f.to_le_bytes());
                }
            }
            Variant::Unsigned(v) => out.extend_from_slice(&v.to_le_bytes()),
            Variant::Signed(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// One decoded entry. `raw` holds the original encoded slice (index and
/// tag included) and is dropped when the value is replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantEntry {
    index: u8,
    value: Variant,
    raw: Option<Vec<u8>>,
}

impl VariantEntry {
    pub fn new(index: u8, value: Variant) -> Self {
        Self {
            index,
            value,
            raw: None,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn value(&self) -> &Variant {
        &self.value
    }

    pub fn set_value(&mut self, value: Variant) {
        self.value = value;
        self.raw = None;
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        if let Some(raw) = &self.raw {
            out.extend_from_slice(raw);
            return;
        }
        out.push(self.index);
        out.push(self.value.type_tag());
        self.value.write_payload(out);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantList {
    entries: Vec<VariantEntry>,
}

impl VariantList {
    pub fn from_entries(entries: Vec<VariantEntry>) -> Self {
        Self { entries }
    }

    /// Builds the argument list of a function-call packet: the function
    /// name at argument index 0, each argument after it.
    pub fn for_call(function: &str, args: impl IntoIterator<Item = VariantArg>) -> Self {
        let mut entries = vec![VariantEntry::new(0, Variant::Str(function.to_string()))];
        for (i, arg) in args.into_iter().enumerate() {
            entries.push(VariantEntry::new((i + 1) as u8, arg.coerce()));
        }
        Self { entries }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, VariantError> {
        let mut cursor = Cursor::new(buf);
        let count = cursor
            .read_u8()
            .map_err(|_| VariantError::Truncated(0))?;

        let mut entries = Vec::with_capacity(count as usize);
        for entry in 0..count as usize {
            let start = cursor.position() as usize;
            let index = cursor.read_u8().map_err(|_| VariantError::Truncated(entry))?;
            let tag = cursor.read_u8().map_err(|_| VariantError::Truncated(entry))?;
            let value = match tag {
                TYPE_FLOAT => Variant::Float(
                    cursor
                        .read_f32::<LittleEndian>()
                        .map_err(|_| VariantError::Truncated(entry))?,
                ),
                TYPE_STRING => {
                    let len = cursor
                        .read_u32::<LittleEndian>()
                        .map_err(|_| VariantError::Truncated(entry))?
                        as usize;
                    let at = cursor.position() as usize;
                    let bytes = buf
                        .get(at..at + len)
                        .ok_or(VariantError::Truncated(entry))?;
                    cursor.set_position((at + len) as u64);
                    Variant::Str(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|_| VariantError::BadString(entry))?,
                    )
                }
                TYPE_VEC2 => {
                    let mut v = [0f32; 2];
                    for f in &mut v {
                        *f = cursor
                            .read_f32::<LittleEndian>()
                            .map_err(|_| VariantError::Truncated(entry))?;
                    }
                    Variant::Vec2(v)
                }
                TYPE_VEC3 => {
                    let mut v = [0f32; 3];
                    for f in &mut v {
                        *f = cursor
                            .read_f32::<LittleEndian>()
                            .map_err(|_| VariantError::Truncated(entry))?;
                    }
                    Variant::Vec3(v)
                }
                TYPE_UNSIGNED => Variant::Unsigned(
                    cursor
                        .read_u32::<LittleEndian>()
                        .map_err(|_| VariantError::Truncated(entry))?,
                ),
                TYPE_SIGNED => Variant::Signed(
                    cursor
                        .read_i32::<LittleEndian>()
                        .map_err(|_| VariantError::Truncated(entry))?,
                ),
                other => return Err(VariantError::UnknownTag { entry, tag: other }),
            };
            let end = cursor.position() as usize;
            entries.push(VariantEntry {
                index,
                value,
                raw: Some(buf[start..end].to_vec()),
            });
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.entries.len() as u8];
        for entry in &self.entries {
            entry.encode_into(&mut out);
        }
        out
    }

    /// First string argument, by convention the called function's name.
    pub fn function_name(&self) -> Option<&str> {
        self.entries.iter().find_map(|e| e.value.as_str())
    }

    /// First entry carrying the given argument index.
    pub fn arg(&self, index: u8) -> Option<&VariantEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    pub fn arg_mut(&mut self, index: u8) -> Option<&mut VariantEntry> {
        self.entries.iter_mut().find(|e| e.index == index)
    }

    pub fn entries(&self) -> &[VariantEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Loosely-typed argument accepted by the injection surface. Coercion
/// picks the smallest faithful wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum VariantArg {
    Num(f64),
    Text(String),
    List(Vec<f64>),
}

impl VariantArg {
    pub fn coerce(self) -> Variant {
        match self {
            VariantArg::Text(s) => Variant::Str(s),
            VariantArg::Num(n) => coerce_number(n),
            VariantArg::List(v) => match v.len() {
                2 => Variant::Vec2([v[0] as f32, v[1] as f32]),
                3 => Variant::Vec3([v[0] as f32, v[1] as f32, v[2] as f32]),
                _ => Variant::Str(String::new()),
            },
        }
    }
}

fn coerce_number(n: f64) -> Variant {
    if !n.is_finite() {
        return Variant::Str(format!("{n}"));
    }
    if n.fract() == 0.0 {
        if (0.0..=u32::MAX as f64).contains(&n) {
            return Variant::Unsigned(n as u32);
        }
        if (i32::MIN as f64..=i32::MAX as f64).contains(&n) {
            return Variant::Signed(n as i32);
        }
        return Variant::Str(format!("{n}"));
    }
    Variant::Float(n as f32)
}

impl From<&str> for VariantArg {
    fn from(value: &str) -> Self {
        VariantArg::Text(value.to_string())
    }
}

impl From<String> for VariantArg {
    fn from(value: String) -> Self {
        VariantArg::Text(value)
    }
}

impl From<f64> for VariantArg {
    fn from(value: f64) -> Self {
        VariantArg::Num(value)
    }
}

impl From<i32> for VariantArg {
    fn from(value: i32) -> Self {
        VariantArg::Num(f64::from(value))
    }
}

impl From<u32> for VariantArg {
    fn from(value: u32) -> Self {
        VariantArg::Num(f64::from(value))
    }
}

impl From<[f32; 2]> for VariantArg {
    fn from(value: [f32; 2]) -> Self {
        VariantArg::List(value.iter().map(|f| f64::from(*f)).collect())
    }
}

impl From<[f32; 3]> for VariantArg {
    fn from(value: [f32; 3]) -> Self {
        VariantArg::List(value.iter().map(|f| f64::from(*f)).collect())
    }
}
