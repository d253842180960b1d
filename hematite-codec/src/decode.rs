//! Value decoder.
//!
//! Consumes exactly one complete value from a byte slice. Truncated
//! input yields [`Error::Incomplete`] so the caller can retry once more
//! bytes arrive; malformed input yields a terminal error.

use crate::described::Described;
use crate::descriptor::Descriptor;
use crate::error::Error;
use crate::format_code::{FormatCode, DESCRIBED};
use crate::primitives::{Binary, Dec128, Dec32, Dec64, OrderedMap, Symbol, Timestamp, Uuid};
use crate::value::Value;

/// Decodes one value, returning it and the number of bytes consumed
pub fn decode(bytes: &[u8]) -> Result<(Value, usize), Error> {
    let mut reader = Reader::new(bytes);
    let value = read_value(&mut reader)?;
    Ok((value, reader.pos))
}

/// Decodes one value that must span the whole input
pub fn decode_exact(bytes: &[u8]) -> Result<Value, Error> {
    let (value, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(Error::TrailingBytes);
    }
    Ok(value)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn read_value(r: &mut Reader<'_>) -> Result<Value, Error> {
    let byte = r.u8()?;
    if byte == DESCRIBED {
        let descriptor = match Descriptor::try_from(read_value(r)?) {
            Ok(d) => d,
            Err(_) => return Err(Error::InvalidFormatCode(DESCRIBED)),
        };
        let value = read_value(r)?;
        return Ok(Value::Described(Box::new(Described::new(
            descriptor, value,
        ))));
    }
    let code = FormatCode::try_from(byte)?;
    read_payload(code, r)
}

fn read_payload(code: FormatCode, r: &mut Reader<'_>) -> Result<Value, Error> {
    let value = match code {
        FormatCode::Null => Value::Null,

        FormatCode::Boolean => Value::Bool(r.u8()? != 0),
        FormatCode::BooleanTrue => Value::Bool(true),
        FormatCode::BooleanFalse => Value::Bool(false),

        FormatCode::UByte => Value::UByte(r.u8()?),
        FormatCode::UShort => Value::UShort(r.u16()?),

        FormatCode::UInt => Value::UInt(r.u32()?),
        FormatCode::SmallUInt => Value::UInt(r.u8()? as u32),
        FormatCode::UInt0 => Value::UInt(0),

        FormatCode::ULong => Value::ULong(r.u64()?),
        FormatCode::SmallULong => Value::ULong(r.u8()? as u64),
        FormatCode::ULong0 => Value::ULong(0),

        FormatCode::Byte => Value::Byte(r.u8()? as i8),
        FormatCode::Short => Value::Short(r.u16()? as i16),

        FormatCode::Int => Value::Int(r.u32()? as i32),
        FormatCode::SmallInt => Value::Int((r.u8()? as i8) as i32),

        FormatCode::Long => Value::Long(r.u64()? as i64),
        FormatCode::SmallLong => Value::Long((r.u8()? as i8) as i64),

        FormatCode::Float => Value::Float(f32::from_bits(r.u32()?).into()),
        FormatCode::Double => Value::Double(f64::from_bits(r.u64()?).into()),

        FormatCode::Decimal32 => Value::Decimal32(Dec32(r.take(4)?.try_into().unwrap())),
        FormatCode::Decimal64 => Value::Decimal64(Dec64(r.take(8)?.try_into().unwrap())),
        FormatCode::Decimal128 => Value::Decimal128(Dec128(r.take(16)?.try_into().unwrap())),

        FormatCode::Char => {
            Value::Char(char::from_u32(r.u32()?).ok_or(Error::InvalidChar)?)
        }
        FormatCode::Timestamp => Value::Timestamp(Timestamp(r.u64()? as i64)),
        FormatCode::Uuid => Value::Uuid(Uuid(r.take(16)?.try_into().unwrap())),

        FormatCode::VBin8 => {
            let len = r.u8()? as usize;
            Value::Binary(Binary(r.take(len)?.to_vec()))
        }
        FormatCode::VBin32 => {
            let len = r.u32()? as usize;
            Value::Binary(Binary(r.take(len)?.to_vec()))
        }

        FormatCode::Str8 => {
            let len = r.u8()? as usize;
            Value::String(read_utf8(r.take(len)?)?)
        }
        FormatCode::Str32 => {
            let len = r.u32()? as usize;
            Value::String(read_utf8(r.take(len)?)?)
        }

        FormatCode::Sym8 => {
            let len = r.u8()? as usize;
            Value::Symbol(Symbol(read_utf8(r.take(len)?)?))
        }
        FormatCode::Sym32 => {
            let len = r.u32()? as usize;
            Value::Symbol(Symbol(read_utf8(r.take(len)?)?))
        }

        FormatCode::List0 => Value::List(Vec::new()),
        FormatCode::List8 => {
            let size = r.u8()? as usize;
            read_list(r.take(size)?, false)?
        }
        FormatCode::List32 => {
            let size = r.u32()? as usize;
            read_list(r.take(size)?, true)?
        }

        FormatCode::Map8 => {
            let size = r.u8()? as usize;
            read_map(r.take(size)?, false)?
        }
        FormatCode::Map32 => {
            let size = r.u32()? as usize;
            read_map(r.take(size)?, true)?
        }

        FormatCode::Array8 => {
            let size = r.u8()? as usize;
            read_array(r.take(size)?, false)?
        }
        FormatCode::Array32 => {
            let size = r.u32()? as usize;
            read_array(r.take(size)?, true)?
        }
    };
    Ok(value)
}

fn read_utf8(bytes: &[u8]) -> Result<String, Error> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
}

/// Incomplete inside a size-delimited body means the size lied
fn sized(err: Error) -> Error {
    match err {
        Error::Incomplete => Error::InvalidSize,
        other => other,
    }
}

fn read_count(r: &mut Reader<'_>, wide: bool) -> Result<usize, Error> {
    if wide {
        Ok(r.u32().map_err(sized)? as usize)
    } else {
        Ok(r.u8().map_err(sized)? as usize)
    }
}

fn read_list(body: &[u8], wide: bool) -> Result<Value, Error> {
    let mut r = Reader::new(body);
    let count = read_count(&mut r, wide)?;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(read_value(&mut r).map_err(sized)?);
    }
    if r.remaining() != 0 {
        return Err(Error::InvalidSize);
    }
    Ok(Value::List(items))
}

fn read_map(body: &[u8], wide: bool) -> Result<Value, Error> {
    let mut r = Reader::new(body);
    let count = read_count(&mut r, wide)?;
    if count % 2 != 0 {
        return Err(Error::OddMapCount);
    }
    let mut map = OrderedMap::new();
    for _ in 0..count / 2 {
        let key = read_value(&mut r).map_err(sized)?;
        let val = read_value(&mut r).map_err(sized)?;
        map.insert(key, val);
    }
    if r.remaining() != 0 {
        return Err(Error::InvalidSize);
    }
    Ok(Value::Map(map))
}

fn read_array(body: &[u8], wide: bool) -> Result<Value, Error> {
    let mut r = Reader::new(body);
    let count = read_count(&mut r, wide)?;

    // one constructor shared by every element
    let mut byte = r.u8().map_err(sized)?;
    let descriptor = if byte == DESCRIBED {
        let d = Descriptor::try_from(read_value(&mut r).map_err(sized)?)
            .map_err(|_| Error::InvalidFormatCode(DESCRIBED))?;
        byte = r.u8().map_err(sized)?;
        Some(d)
    } else {
        None
    };
    let code = FormatCode::try_from(byte)?;

    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let element = read_payload(code, &mut r).map_err(sized)?;
        let element = match &descriptor {
            Some(d) => Value::Described(Box::new(Described::new(d.clone(), element))),
            None => element,
        };
        items.push(element);
    }
    if r.remaining() != 0 {
        return Err(Error::InvalidSize);
    }
    Ok(Value::Array(items))
}
