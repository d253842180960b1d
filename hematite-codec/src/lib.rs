//! Self-describing typed-value codec for the AMQP 1.0 type system.
//!
//! A [`Value`] is the in-memory form of one encoded value: the primitive
//! set (null through array) plus described values. [`encode`] and
//! [`decode`] are symmetric at the value level; compact alternate
//! encodings on the wire decode into the same variants as their
//! preferred-width forms.
//!
//! Composite protocol bodies are bound to structs one crate up; this
//! crate knows nothing about any particular descriptor.

#![deny(missing_docs, missing_debug_implementations)]

mod decode;
mod described;
mod descriptor;
mod encode;
mod error;
mod format_code;
#[allow(missing_docs)]
mod primitives;
#[allow(missing_docs)]
mod value;

pub use decode::{decode, decode_exact};
pub use described::Described;
pub use descriptor::Descriptor;
pub use encode::{encode, encode_into};
pub use error::Error;
pub use format_code::{FormatCode, DESCRIBED};
pub use primitives::{Binary, Dec128, Dec32, Dec64, OrderedMap, Symbol, Timestamp, Uuid};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let bytes = encode(&value).unwrap();
        let decoded = decode_exact(&bytes).unwrap();
        assert_eq!(decoded, value, "bytes were {:02x?}", &bytes[..]);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::UByte(0x7f));
        round_trip(Value::UShort(515));
        round_trip(Value::UInt(0));
        round_trip(Value::UInt(u32::MAX));
        round_trip(Value::ULong(1 << 40));
        round_trip(Value::Byte(-3));
        round_trip(Value::Short(-515));
        round_trip(Value::Int(i32::MIN));
        round_trip(Value::Long(i64::MAX));
        round_trip(Value::Float(1.5f32.into()));
        round_trip(Value::Double(f64::MIN_POSITIVE.into()));
        round_trip(Value::Char('\u{1F980}'));
        round_trip(Value::Timestamp(Timestamp(1_234_567_890_123)));
        round_trip(Value::Uuid(Uuid([7; 16])));
        round_trip(Value::Decimal32(Dec32([1, 2, 3, 4])));
        round_trip(Value::Decimal64(Dec64([8; 8])));
        round_trip(Value::Decimal128(Dec128([9; 16])));
    }

    #[test]
    fn variable_width_forms() {
        round_trip(Value::Binary(Binary(vec![])));
        round_trip(Value::Binary(Binary(vec![0xab; 100])));
        round_trip(Value::Binary(Binary(vec![0xcd; 1000])));
        round_trip(Value::String("".into()));
        round_trip(Value::String("hello".into()));
        round_trip(Value::String("x".repeat(300)));
        round_trip(Value::Symbol(Symbol::new("amqp:link:redirect")));

        // narrow vs wide form selection
        let narrow = encode(&Value::String("hi".into())).unwrap();
        assert_eq!(narrow[0], FormatCode::Str8 as u8);
        let wide = encode(&Value::String("y".repeat(256))).unwrap();
        assert_eq!(wide[0], FormatCode::Str32 as u8);
    }

    #[test]
    fn fixed_widths_use_preferred_encoding() {
        let bytes = encode(&Value::UInt(1)).unwrap();
        assert_eq!(&bytes[..], &[0x70, 0, 0, 0, 1]);
        let bytes = encode(&Value::ULong(1)).unwrap();
        assert_eq!(&bytes[..], &[0x80, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn compact_forms_decode() {
        // smalluint, uint0, smallulong, ulong0, smallint, smalllong, list0
        assert_eq!(decode_exact(&[0x52, 9]).unwrap(), Value::UInt(9));
        assert_eq!(decode_exact(&[0x43]).unwrap(), Value::UInt(0));
        assert_eq!(decode_exact(&[0x53, 9]).unwrap(), Value::ULong(9));
        assert_eq!(decode_exact(&[0x44]).unwrap(), Value::ULong(0));
        assert_eq!(decode_exact(&[0x54, 0xff]).unwrap(), Value::Int(-1));
        assert_eq!(decode_exact(&[0x55, 0x80]).unwrap(), Value::Long(-128));
        assert_eq!(decode_exact(&[0x45]).unwrap(), Value::List(vec![]));
    }

    #[test]
    fn lists_and_maps_round_trip() {
        round_trip(Value::List(vec![]));
        round_trip(Value::List(vec![
            Value::UInt(1),
            Value::String("two".into()),
            Value::Null,
            Value::List(vec![Value::Bool(false)]),
        ]));

        let mut map = OrderedMap::new();
        map.insert(Value::Symbol(Symbol::new("k1")), Value::UInt(1));
        map.insert(Value::String("k2".into()), Value::List(vec![Value::Null]));
        round_trip(Value::Map(map));

        // force the 32-bit form
        let big: Vec<Value> = (0..300u32).map(Value::UInt).collect();
        round_trip(Value::List(big));
    }

    #[test]
    fn arrays_round_trip() {
        round_trip(Value::Array(vec![]));
        round_trip(Value::Array(vec![
            Value::UInt(1),
            Value::UInt(2),
            Value::UInt(3),
        ]));
        round_trip(Value::Array(vec![
            Value::Symbol(Symbol::new("PLAIN")),
            Value::Symbol(Symbol::new("ANONYMOUS")),
        ]));
        let big: Vec<Value> = (0..300u32).map(Value::UInt).collect();
        round_trip(Value::Array(big));
    }

    #[test]
    fn array_of_described_values_round_trips() {
        let element = |n: u64| {
            Value::Described(Box::new(Described::new(
                Descriptor::code(0x24),
                Value::List(vec![Value::ULong(n)]),
            )))
        };
        round_trip(Value::Array(vec![element(1), element(2)]));
    }

    #[test]
    fn heterogeneous_array_is_an_encode_error() {
        let err = encode(&Value::Array(vec![Value::UInt(1), Value::Bool(true)])).unwrap_err();
        assert_eq!(err, Error::HeterogeneousArray);
    }

    #[test]
    fn described_values_round_trip() {
        round_trip(Value::Described(Box::new(Described::new(
            Descriptor::name(Symbol::new("amqp:open:list")),
            Value::List(vec![Value::String("container".into()), Value::Null]),
        ))));
        round_trip(Value::Described(Box::new(Described::new(
            Descriptor::code(0x0000_0000_0000_0010),
            Value::List(vec![]),
        ))));
    }

    #[test]
    fn truncated_input_reports_incomplete() {
        let bytes = encode(&Value::String("hello world".into())).unwrap();
        for n in 0..bytes.len() {
            let err = decode(&bytes[..n]).unwrap_err();
            assert!(err.is_incomplete(), "prefix of {} bytes: {:?}", n, err);
        }
    }

    #[test]
    fn unknown_format_code_is_terminal() {
        let err = decode(&[0x3e, 0x00]).unwrap_err();
        assert_eq!(err, Error::InvalidFormatCode(0x3e));
        assert!(!err.is_incomplete());
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let mut bytes = encode(&Value::UInt(1)).unwrap().to_vec();
        bytes.push(0x00);
        assert_eq!(decode_exact(&bytes).unwrap_err(), Error::TrailingBytes);
    }

    #[test]
    fn decode_returns_consumed_length() {
        let mut bytes = encode(&Value::UInt(7)).unwrap().to_vec();
        let tail = encode(&Value::Bool(true)).unwrap();
        bytes.extend_from_slice(&tail);
        let (value, consumed) = decode(&bytes).unwrap();
        assert_eq!(value, Value::UInt(7));
        assert_eq!(consumed, 5);
        let (value, _) = decode(&bytes[consumed..]).unwrap();
        assert_eq!(value, Value::Bool(true));
    }
}
