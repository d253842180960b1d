//! Value encoder.
//!
//! Every fixed-width primitive is emitted in its preferred (widest)
//! encoding; variable-width and compound values pick the 8-bit form when
//! the body is under 256 octets and the 32-bit form otherwise. The
//! compact zero-width forms are accepted on decode but only null and the
//! booleans are emitted compactly.

use std::mem::discriminant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::described::Described;
use crate::error::Error;
use crate::format_code::{FormatCode, DESCRIBED};
use crate::value::Value;

/// Encodes one value into a fresh buffer
pub fn encode(value: &Value) -> Result<Bytes, Error> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encodes one value, appending to `buf`
pub fn encode_into(value: &Value, buf: &mut BytesMut) -> Result<(), Error> {
    match value {
        Value::Described(described) => {
            let Described { descriptor, value } = described.as_ref();
            buf.put_u8(DESCRIBED);
            encode_into(&descriptor.clone().into(), buf)?;
            encode_into(value, buf)
        }
        Value::Null => {
            buf.put_u8(FormatCode::Null as u8);
            Ok(())
        }
        Value::Bool(true) => {
            buf.put_u8(FormatCode::BooleanTrue as u8);
            Ok(())
        }
        Value::Bool(false) => {
            buf.put_u8(FormatCode::BooleanFalse as u8);
            Ok(())
        }
        Value::UByte(n) => {
            buf.put_u8(FormatCode::UByte as u8);
            buf.put_u8(*n);
            Ok(())
        }
        Value::UShort(n) => {
            buf.put_u8(FormatCode::UShort as u8);
            buf.put_u16(*n);
            Ok(())
        }
        Value::UInt(n) => {
            buf.put_u8(FormatCode::UInt as u8);
            buf.put_u32(*n);
            Ok(())
        }
        Value::ULong(n) => {
            buf.put_u8(FormatCode::ULong as u8);
            buf.put_u64(*n);
            Ok(())
        }
        Value::Byte(n) => {
            buf.put_u8(FormatCode::Byte as u8);
            buf.put_i8(*n);
            Ok(())
        }
        Value::Short(n) => {
            buf.put_u8(FormatCode::Short as u8);
            buf.put_i16(*n);
            Ok(())
        }
        Value::Int(n) => {
            buf.put_u8(FormatCode::Int as u8);
            buf.put_i32(*n);
            Ok(())
        }
        Value::Long(n) => {
            buf.put_u8(FormatCode::Long as u8);
            buf.put_i64(*n);
            Ok(())
        }
        Value::Float(n) => {
            buf.put_u8(FormatCode::Float as u8);
            buf.put_f32(n.into_inner());
            Ok(())
        }
        Value::Double(n) => {
            buf.put_u8(FormatCode::Double as u8);
            buf.put_f64(n.into_inner());
            Ok(())
        }
        Value::Decimal32(d) => {
            buf.put_u8(FormatCode::Decimal32 as u8);
            buf.put_slice(&d.0);
            Ok(())
        }
        Value::Decimal64(d) => {
            buf.put_u8(FormatCode::Decimal64 as u8);
            buf.put_slice(&d.0);
            Ok(())
        }
        Value::Decimal128(d) => {
            buf.put_u8(FormatCode::Decimal128 as u8);
            buf.put_slice(&d.0);
            Ok(())
        }
        Value::Char(c) => {
            buf.put_u8(FormatCode::Char as u8);
            buf.put_u32(*c as u32);
            Ok(())
        }
        Value::Timestamp(t) => {
            buf.put_u8(FormatCode::Timestamp as u8);
            buf.put_i64(t.0);
            Ok(())
        }
        Value::Uuid(u) => {
            buf.put_u8(FormatCode::Uuid as u8);
            buf.put_slice(&u.0);
            Ok(())
        }
        Value::Binary(b) => {
            encode_variable(FormatCode::VBin8, FormatCode::VBin32, &b.0, buf);
            Ok(())
        }
        Value::String(s) => {
            encode_variable(FormatCode::Str8, FormatCode::Str32, s.as_bytes(), buf);
            Ok(())
        }
        Value::Symbol(s) => {
            encode_variable(FormatCode::Sym8, FormatCode::Sym32, s.0.as_bytes(), buf);
            Ok(())
        }
        Value::List(items) => {
            let mut body = BytesMut::new();
            for item in items {
                encode_into(item, &mut body)?;
            }
            encode_compound(
                FormatCode::List8,
                FormatCode::List32,
                items.len(),
                &body,
                buf,
            );
            Ok(())
        }
        Value::Map(map) => {
            let mut body = BytesMut::new();
            for (key, val) in map.iter() {
                encode_into(key, &mut body)?;
                encode_into(val, &mut body)?;
            }
            encode_compound(
                FormatCode::Map8,
                FormatCode::Map32,
                map.len() * 2,
                &body,
                buf,
            );
            Ok(())
        }
        Value::Array(items) => encode_array(items, buf),
    }
}

fn encode_variable(narrow: FormatCode, wide: FormatCode, bytes: &[u8], buf: &mut BytesMut) {
    if bytes.len() < 256 {
        buf.put_u8(narrow as u8);
        buf.put_u8(bytes.len() as u8);
    } else {
        buf.put_u8(wide as u8);
        buf.put_u32(bytes.len() as u32);
    }
    buf.put_slice(bytes);
}

fn encode_compound(
    narrow: FormatCode,
    wide: FormatCode,
    count: usize,
    body: &BytesMut,
    buf: &mut BytesMut,
) {
    // size counts everything after the size field, count width included
    if body.len() + 1 < 256 && count < 256 {
        buf.put_u8(narrow as u8);
        buf.put_u8((body.len() + 1) as u8);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(wide as u8);
        buf.put_u32((body.len() + 4) as u32);
        buf.put_u32(count as u32);
    }
    buf.put_slice(body);
}

fn encode_array(items: &[Value], buf: &mut BytesMut) -> Result<(), Error> {
    let mut constructor = BytesMut::new();
    let mut body = BytesMut::new();

    match items.first() {
        None => constructor.put_u8(FormatCode::Null as u8),
        Some(Value::Described(first)) => {
            // elements share one descriptor and one inner constructor
            constructor.put_u8(DESCRIBED);
            encode_into(&first.descriptor.clone().into(), &mut constructor)?;
            constructor.put_u8(array_element_code(&first.value) as u8);
            for item in items {
                let described = match item {
                    Value::Described(d) if d.descriptor == first.descriptor => d,
                    _ => return Err(Error::HeterogeneousArray),
                };
                if discriminant(&described.value) != discriminant(&first.value) {
                    return Err(Error::HeterogeneousArray);
                }
                encode_array_payload(&described.value, &mut body)?;
            }
        }
        Some(first) => {
            constructor.put_u8(array_element_code(first) as u8);
            for item in items {
                if discriminant(item) != discriminant(first) {
                    return Err(Error::HeterogeneousArray);
                }
                encode_array_payload(item, &mut body)?;
            }
        }
    }

    let inner = constructor.len() + body.len();
    if inner + 1 < 256 && items.len() < 256 {
        buf.put_u8(FormatCode::Array8 as u8);
        buf.put_u8((inner + 1) as u8);
        buf.put_u8(items.len() as u8);
    } else {
        buf.put_u8(FormatCode::Array32 as u8);
        buf.put_u32((inner + 4) as u32);
        buf.put_u32(items.len() as u32);
    }
    buf.put_slice(&constructor);
    buf.put_slice(&body);
    Ok(())
}

/// The widest-form code shared by every element of an array
fn array_element_code(value: &Value) -> FormatCode {
    match value {
        // a described element's constructor is handled by the caller
        Value::Described(_) => FormatCode::Null,
        Value::Null => FormatCode::Null,
        Value::Bool(_) => FormatCode::Boolean,
        Value::UByte(_) => FormatCode::UByte,
        Value::UShort(_) => FormatCode::UShort,
        Value::UInt(_) => FormatCode::UInt,
        Value::ULong(_) => FormatCode::ULong,
        Value::Byte(_) => FormatCode::Byte,
        Value::Short(_) => FormatCode::Short,
        Value::Int(_) => FormatCode::Int,
        Value::Long(_) => FormatCode::Long,
        Value::Float(_) => FormatCode::Float,
        Value::Double(_) => FormatCode::Double,
        Value::Decimal32(_) => FormatCode::Decimal32,
        Value::Decimal64(_) => FormatCode::Decimal64,
        Value::Decimal128(_) => FormatCode::Decimal128,
        Value::Char(_) => FormatCode::Char,
        Value::Timestamp(_) => FormatCode::Timestamp,
        Value::Uuid(_) => FormatCode::Uuid,
        Value::Binary(_) => FormatCode::VBin32,
        Value::String(_) => FormatCode::Str32,
        Value::Symbol(_) => FormatCode::Sym32,
        Value::List(_) => FormatCode::List32,
        Value::Map(_) => FormatCode::Map32,
        Value::Array(_) => FormatCode::Array32,
    }
}

/// Writes one array element body, widest form, without its constructor
fn encode_array_payload(value: &Value, buf: &mut BytesMut) -> Result<(), Error> {
    match value {
        Value::Described(_) => Err(Error::HeterogeneousArray),
        Value::Null => Ok(()),
        Value::Bool(b) => {
            buf.put_u8(*b as u8);
            Ok(())
        }
        Value::UByte(n) => {
            buf.put_u8(*n);
            Ok(())
        }
        Value::UShort(n) => {
            buf.put_u16(*n);
            Ok(())
        }
        Value::UInt(n) => {
            buf.put_u32(*n);
            Ok(())
        }
        Value::ULong(n) => {
            buf.put_u64(*n);
            Ok(())
        }
        Value::Byte(n) => {
            buf.put_i8(*n);
            Ok(())
        }
        Value::Short(n) => {
            buf.put_i16(*n);
            Ok(())
        }
        Value::Int(n) => {
            buf.put_i32(*n);
            Ok(())
        }
        Value::Long(n) => {
            buf.put_i64(*n);
            Ok(())
        }
        Value::Float(n) => {
            buf.put_f32(n.into_inner());
            Ok(())
        }
        Value::Double(n) => {
            buf.put_f64(n.into_inner());
            Ok(())
        }
        Value::Decimal32(d) => {
            buf.put_slice(&d.0);
            Ok(())
        }
        Value::Decimal64(d) => {
            buf.put_slice(&d.0);
            Ok(())
        }
        Value::Decimal128(d) => {
            buf.put_slice(&d.0);
            Ok(())
        }
        Value::Char(c) => {
            buf.put_u32(*c as u32);
            Ok(())
        }
        Value::Timestamp(t) => {
            buf.put_i64(t.0);
            Ok(())
        }
        Value::Uuid(u) => {
            buf.put_slice(&u.0);
            Ok(())
        }
        Value::Binary(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
            Ok(())
        }
        Value::String(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
            Ok(())
        }
        Value::Symbol(s) => {
            buf.put_u32(s.0.len() as u32);
            buf.put_slice(s.0.as_bytes());
            Ok(())
        }
        Value::List(items) => {
            let mut body = BytesMut::new();
            for item in items {
                encode_into(item, &mut body)?;
            }
            buf.put_u32((body.len() + 4) as u32);
            buf.put_u32(items.len() as u32);
            buf.put_slice(&body);
            Ok(())
        }
        Value::Map(map) => {
            let mut body = BytesMut::new();
            for (key, val) in map.iter() {
                encode_into(key, &mut body)?;
                encode_into(val, &mut body)?;
            }
            buf.put_u32((body.len() + 4) as u32);
            buf.put_u32((map.len() * 2) as u32);
            buf.put_slice(&body);
            Ok(())
        }
        Value::Array(items) => encode_array_wide(items, buf),
    }
}

/// Nested-array payload: always the 32-bit form, without the leading code
fn encode_array_wide(items: &[Value], buf: &mut BytesMut) -> Result<(), Error> {
    let mut encoded = BytesMut::new();
    encode_array(items, &mut encoded)?;
    let code = encoded[0];
    if code == FormatCode::Array8 as u8 {
        // widen: size and count grow from one byte to four
        let size = encoded[1] as u32;
        let count = encoded[2] as u32;
        buf.put_u32(size + 3);
        buf.put_u32(count);
        buf.put_slice(&encoded[3..]);
    } else {
        buf.put_slice(&encoded[1..]);
    }
    Ok(())
}
