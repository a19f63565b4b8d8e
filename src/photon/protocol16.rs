//! Tagged binary value codec for the game's payload dictionaries.
//!
//! Every logical message carries a parameter table: an `i16` count followed
//! by `(u8 key, tagged value)` pairs. Values are self-describing via one-byte
//! type tags; all integers are big-endian and strings are length-prefixed
//! UTF-8. The tag assignments are empirical and versioned with the dialect.
//!
//! The decoder is recursive descent. An unknown tag is a recoverable
//! condition: the caller gets everything parsed so far plus the offending
//! tag, and the raw body goes to the unknown-payload sink for offline
//! analysis. Truncation or garbage inside a known tag is malformed and drops
//! the whole message.

use std::collections::BTreeMap;

use thiserror::Error;

pub const TAG_NIL: u8 = 0;
pub const TAG_DICT: u8 = 68;
pub const TAG_STRING_ARRAY: u8 = 97;
pub const TAG_I8: u8 = 98;
pub const TAG_CUSTOM: u8 = 99;
pub const TAG_F64: u8 = 100;
pub const TAG_DICTIONARY: u8 = 101;
pub const TAG_INT_ARRAY: u8 = 104;
pub const TAG_I64: u8 = 105;
pub const TAG_I16: u8 = 107;
pub const TAG_I32: u8 = 108;
pub const TAG_F32: u8 = 109;
pub const TAG_BOOL: u8 = 111;
pub const TAG_STRING: u8 = 115;
pub const TAG_BYTE_ARRAY: u8 = 120;
pub const TAG_ARRAY: u8 = 121;
pub const TAG_OBJECT_ARRAY: u8 = 122;

pub type ParamMap = BTreeMap<u8, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    IntArray(Vec<i32>),
    StrArray(Vec<String>),
    Array(Vec<Value>),
    ObjectArray(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Custom { code: i8, data: Vec<u8> },
}

impl Value {
    /// Integer view across all integer widths; floats do not coerce.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view: integers and floats both coerce.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            other => other.as_i64().map(|v| v != 0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer elements of any array-ish value.
    pub fn as_int_slice(&self) -> Option<Vec<i64>> {
        match self {
            Value::IntArray(values) => Some(values.iter().map(|v| i64::from(*v)).collect()),
            Value::Array(values) | Value::ObjectArray(values) => {
                values.iter().map(Value::as_i64).collect()
            }
            Value::Bytes(values) => Some(values.iter().map(|v| i64::from(*v)).collect()),
            _ => None,
        }
    }

    /// String elements of any array-ish value.
    pub fn as_str_slice(&self) -> Option<Vec<String>> {
        match self {
            Value::StrArray(values) => Some(values.clone()),
            Value::Array(values) | Value::ObjectArray(values) => values
                .iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect(),
            Value::Str(s) => Some(vec![s.clone()]),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Protocol16Error {
    #[error("truncated value: needed {needed} bytes, {remaining} remain")]
    Truncated { needed: usize, remaining: usize },
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("invalid utf-8 in string value")]
    BadUtf8,
    #[error("unknown type tag {0}")]
    UnknownTag(u8),
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

/// Containers nest in practice two or three levels; anything deeper is a
/// parser trap, not traffic.
const MAX_DEPTH: usize = 32;

/// Cursor over an immutable payload slice.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Protocol16Error> {
        if self.remaining() < n {
            return Err(Protocol16Error::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, Protocol16Error> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, Protocol16Error> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn i16(&mut self) -> Result<i16, Protocol16Error> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u16(&mut self) -> Result<u16, Protocol16Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn i32(&mut self) -> Result<i32, Protocol16Error> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i64(&mut self) -> Result<i64, Protocol16Error> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn f32(&mut self) -> Result<f32, Protocol16Error> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f64(&mut self) -> Result<f64, Protocol16Error> {
        let b = self.take(8)?;
        Ok(f64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn len_i16(&mut self) -> Result<usize, Protocol16Error> {
        let len = self.i16()?;
        if len < 0 {
            return Err(Protocol16Error::NegativeLength(i32::from(len)));
        }
        Ok(len as usize)
    }

    fn len_i32(&mut self) -> Result<usize, Protocol16Error> {
        let len = self.i32()?;
        if len < 0 {
            return Err(Protocol16Error::NegativeLength(len));
        }
        Ok(len as usize)
    }

    fn string(&mut self) -> Result<String, Protocol16Error> {
        let len = self.len_i16()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Protocol16Error::BadUtf8)
    }
}

/// Result of decoding a parameter table.
///
/// `unknown_tag` is set when decoding stopped early on an unrecognized tag;
/// `params` then holds everything parsed before that point.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedParams {
    pub params: ParamMap,
    pub unknown_tag: Option<u8>,
}

pub fn decode_params(r: &mut Reader<'_>) -> Result<DecodedParams, Protocol16Error> {
    let count = r.len_i16()?;
    let mut params = ParamMap::new();
    for _ in 0..count {
        let key = r.u8()?;
        match decode_value(r) {
            Ok(value) => {
                params.insert(key, value);
            }
            Err(Protocol16Error::UnknownTag(tag)) => {
                return Ok(DecodedParams {
                    params,
                    unknown_tag: Some(tag),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(DecodedParams {
        params,
        unknown_tag: None,
    })
}

pub fn decode_value(r: &mut Reader<'_>) -> Result<Value, Protocol16Error> {
    decode_value_at(r, 0)
}

fn decode_value_at(r: &mut Reader<'_>, depth: usize) -> Result<Value, Protocol16Error> {
    let tag = r.u8()?;
    decode_body(r, tag, depth)
}

fn decode_body(r: &mut Reader<'_>, tag: u8, depth: usize) -> Result<Value, Protocol16Error> {
    if depth > MAX_DEPTH {
        return Err(Protocol16Error::TooDeep(MAX_DEPTH));
    }
    match tag {
        TAG_NIL => Ok(Value::Nil),
        TAG_BOOL => Ok(Value::Bool(r.u8()? != 0)),
        TAG_I8 => Ok(Value::I8(r.i8()?)),
        TAG_I16 => Ok(Value::I16(r.i16()?)),
        TAG_I32 => Ok(Value::I32(r.i32()?)),
        TAG_I64 => Ok(Value::I64(r.i64()?)),
        TAG_F32 => Ok(Value::F32(r.f32()?)),
        TAG_F64 => Ok(Value::F64(r.f64()?)),
        TAG_STRING => Ok(Value::Str(r.string()?)),
        TAG_BYTE_ARRAY => {
            let len = r.len_i32()?;
            Ok(Value::Bytes(r.take(len)?.to_vec()))
        }
        TAG_INT_ARRAY => {
            let count = r.len_i32()?;
            let mut values = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                values.push(r.i32()?);
            }
            Ok(Value::IntArray(values))
        }
        TAG_STRING_ARRAY => {
            let count = r.len_i16()?;
            let mut values = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                values.push(r.string()?);
            }
            Ok(Value::StrArray(values))
        }
        TAG_ARRAY => {
            let count = r.len_i16()?;
            let element_tag = r.u8()?;
            let mut values = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                values.push(decode_body(r, element_tag, depth + 1)?);
            }
            Ok(Value::Array(values))
        }
        TAG_OBJECT_ARRAY => {
            let count = r.len_i16()?;
            let mut values = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                values.push(decode_value_at(r, depth + 1)?);
            }
            Ok(Value::ObjectArray(values))
        }
        TAG_DICT => {
            let key_tag = r.u8()?;
            let val_tag = r.u8()?;
            let count = r.len_i16()?;
            let mut entries = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let key = decode_body(r, key_tag, depth + 1)?;
                let value = decode_body(r, val_tag, depth + 1)?;
                entries.push((key, value));
            }
            Ok(Value::Dict(entries))
        }
        TAG_DICTIONARY => {
            let count = r.len_i16()?;
            let mut entries = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let key = decode_value_at(r, depth + 1)?;
                let value = decode_value_at(r, depth + 1)?;
                entries.push((key, value));
            }
            Ok(Value::Dict(entries))
        }
        TAG_CUSTOM => {
            let code = r.i8()?;
            let len = r.len_i16()?;
            Ok(Value::Custom {
                code,
                data: r.take(len)?.to_vec(),
            })
        }
        other => Err(Protocol16Error::UnknownTag(other)),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("value too large for its length prefix")]
    TooLarge,
    #[error("array elements must share one type")]
    HeterogeneousArray,
}

/// Encode a parameter table: `i16` count, then `(key, tagged value)` pairs.
///
/// The meter never transmits; the encoder exists because every wire-level
/// test fixture and the decode round-trip property are built from it.
pub fn encode_params(params: &ParamMap, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let count = i16::try_from(params.len()).map_err(|_| EncodeError::TooLarge)?;
    out.extend_from_slice(&count.to_be_bytes());
    for (key, value) in params {
        out.push(*key);
        encode_value(value, out)?;
    }
    Ok(())
}

pub fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    out.push(tag_of(value));
    encode_body(value, out)
}

fn tag_of(value: &Value) -> u8 {
    match value {
        Value::Nil => TAG_NIL,
        Value::Bool(_) => TAG_BOOL,
        Value::I8(_) => TAG_I8,
        Value::I16(_) => TAG_I16,
        Value::I32(_) => TAG_I32,
        Value::I64(_) => TAG_I64,
        Value::F32(_) => TAG_F32,
        Value::F64(_) => TAG_F64,
        Value::Str(_) => TAG_STRING,
        Value::Bytes(_) => TAG_BYTE_ARRAY,
        Value::IntArray(_) => TAG_INT_ARRAY,
        Value::StrArray(_) => TAG_STRING_ARRAY,
        Value::Array(_) => TAG_ARRAY,
        Value::ObjectArray(_) => TAG_OBJECT_ARRAY,
        // Per-entry tags round-trip any dict; the declared-type form (68)
        // is decode-only.
        Value::Dict(_) => TAG_DICTIONARY,
        Value::Custom { .. } => TAG_CUSTOM,
    }
}

fn encode_body(value: &Value, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    match value {
        Value::Nil => {}
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::I8(v) => out.push(*v as u8),
        Value::I16(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::F32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::F64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Str(s) => encode_string(s, out)?,
        Value::Bytes(data) => {
            let len = i32::try_from(data.len()).map_err(|_| EncodeError::TooLarge)?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(data);
        }
        Value::IntArray(values) => {
            let count = i32::try_from(values.len()).map_err(|_| EncodeError::TooLarge)?;
            out.extend_from_slice(&count.to_be_bytes());
            for v in values {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        Value::StrArray(values) => {
            let count = i16::try_from(values.len()).map_err(|_| EncodeError::TooLarge)?;
            out.extend_from_slice(&count.to_be_bytes());
            for s in values {
                encode_string(s, out)?;
            }
        }
        Value::Array(values) => {
            let count = i16::try_from(values.len()).map_err(|_| EncodeError::TooLarge)?;
            out.extend_from_slice(&count.to_be_bytes());
            let element_tag = values.first().map(tag_of).unwrap_or(TAG_NIL);
            out.push(element_tag);
            for v in values {
                if tag_of(v) != element_tag {
                    return Err(EncodeError::HeterogeneousArray);
                }
                encode_body(v, out)?;
            }
        }
        Value::ObjectArray(values) => {
            let count = i16::try_from(values.len()).map_err(|_| EncodeError::TooLarge)?;
            out.extend_from_slice(&count.to_be_bytes());
            for v in values {
                encode_value(v, out)?;
            }
        }
        Value::Dict(entries) => {
            let count = i16::try_from(entries.len()).map_err(|_| EncodeError::TooLarge)?;
            out.extend_from_slice(&count.to_be_bytes());
            for (k, v) in entries {
                encode_value(k, out)?;
                encode_value(v, out)?;
            }
        }
        Value::Custom { code, data } => {
            out.push(*code as u8);
            let len = i16::try_from(data.len()).map_err(|_| EncodeError::TooLarge)?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(data);
        }
    }
    Ok(())
}

fn encode_string(s: &str, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let len = i16::try_from(s.len()).map_err(|_| EncodeError::TooLarge)?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) -> Value {
        let mut out = Vec::new();
        encode_value(&value, &mut out).expect("encode");
        let mut r = Reader::new(&out);
        let decoded = decode_value(&mut r).expect("decode");
        assert_eq!(r.remaining(), 0, "trailing bytes after decode");
        decoded
    }

    #[test]
    fn scalars_roundtrip() {
        for value in [
            Value::Nil,
            Value::Bool(true),
            Value::I8(-5),
            Value::I16(-300),
            Value::I32(70_000),
            Value::I64(-9_000_000_000),
            Value::F32(1.5),
            Value::F64(-2.25),
            Value::Str("Ragnar".to_string()),
            Value::Bytes(vec![1, 2, 3]),
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn containers_roundtrip() {
        let value = Value::Dict(vec![
            (Value::I8(1), Value::StrArray(vec!["a".into(), "b".into()])),
            (
                Value::I8(2),
                Value::ObjectArray(vec![Value::I32(9), Value::Str("x".into())]),
            ),
            (Value::I8(3), Value::IntArray(vec![-1, 0, 1])),
        ]);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn homogeneous_array_roundtrips() {
        let value = Value::Array(vec![Value::I16(1), Value::I16(2), Value::I16(3)]);
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn heterogeneous_array_is_an_encode_error() {
        let value = Value::Array(vec![Value::I16(1), Value::I32(2)]);
        let mut out = Vec::new();
        assert_eq!(
            encode_value(&value, &mut out),
            Err(EncodeError::HeterogeneousArray)
        );
    }

    #[test]
    fn declared_type_dict_decodes() {
        // key type i8, value type string, two entries
        let mut body = vec![TAG_DICT, TAG_I8, TAG_STRING];
        body.extend_from_slice(&2i16.to_be_bytes());
        body.push(7);
        body.extend_from_slice(&1i16.to_be_bytes());
        body.push(b'x');
        body.push(9);
        body.extend_from_slice(&1i16.to_be_bytes());
        body.push(b'y');

        let mut r = Reader::new(&body);
        let decoded = decode_value(&mut r).expect("decode");
        assert_eq!(
            decoded,
            Value::Dict(vec![
                (Value::I8(7), Value::Str("x".into())),
                (Value::I8(9), Value::Str("y".into())),
            ])
        );
    }

    #[test]
    fn params_roundtrip() {
        let mut params = ParamMap::new();
        params.insert(0, Value::I32(1234));
        params.insert(2, Value::F64(-150.5));
        params.insert(6, Value::I32(77));
        params.insert(40, Value::IntArray(vec![801, 0, 0]));

        let mut out = Vec::new();
        encode_params(&params, &mut out).expect("encode");
        let mut r = Reader::new(&out);
        let decoded = decode_params(&mut r).expect("decode");
        assert_eq!(decoded.params, params);
        assert!(decoded.unknown_tag.is_none());
    }

    #[test]
    fn unknown_tag_yields_partial_params() {
        let mut out = Vec::new();
        out.extend_from_slice(&2i16.to_be_bytes());
        out.push(0);
        out.push(TAG_I32);
        out.extend_from_slice(&42i32.to_be_bytes());
        out.push(1);
        out.push(23); // tag nobody knows
        out.extend_from_slice(&[0xde, 0xad]);

        let mut r = Reader::new(&out);
        let decoded = decode_params(&mut r).expect("decode");
        assert_eq!(decoded.params.len(), 1);
        assert_eq!(decoded.params.get(&0), Some(&Value::I32(42)));
        assert_eq!(decoded.unknown_tag, Some(23));
    }

    #[test]
    fn truncated_value_is_an_error() {
        let out = vec![TAG_I32, 0, 0];
        let mut r = Reader::new(&out);
        assert!(matches!(
            decode_value(&mut r),
            Err(Protocol16Error::Truncated { .. })
        ));
    }

    #[test]
    fn pathological_nesting_is_rejected() {
        // 40 nested single-element object arrays.
        let mut out = Vec::new();
        for _ in 0..40 {
            out.push(TAG_OBJECT_ARRAY);
            out.extend_from_slice(&1i16.to_be_bytes());
        }
        out.push(TAG_NIL);
        let mut r = Reader::new(&out);
        assert!(matches!(
            decode_value(&mut r),
            Err(Protocol16Error::TooDeep(_))
        ));
    }

    #[test]
    fn negative_length_is_an_error() {
        let mut out = vec![TAG_STRING];
        out.extend_from_slice(&(-4i16).to_be_bytes());
        let mut r = Reader::new(&out);
        assert!(matches!(
            decode_value(&mut r),
            Err(Protocol16Error::NegativeLength(_))
        ));
    }
}
