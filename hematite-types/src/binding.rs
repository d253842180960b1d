//! Binding kernel between composite wire types and Rust structs.
//!
//! Each composite is declared in the protocol schema as a descriptor plus
//! an ordered field list with mandatory/multiple/default markers. The
//! structs in this crate are the generated form of that schema: encoding
//! walks the fields in ordinal order and trims trailing nulls, decoding
//! reads ordinally, applies defaults for absent fields, and rejects null
//! mandatory fields by name. Mandatory fields are non-optional struct
//! fields, so the encode-side mandatory check holds by construction.

use bytes::{Bytes, BytesMut};
use hematite_codec::{Described, Descriptor, Value};
use thiserror::Error;

/// Errors raised while binding values to composite types
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// A field the schema marks mandatory decoded as null or absent
    #[error("{type_name}: mandatory field '{field}' is null")]
    MandatoryFieldNull {
        /// Composite type being decoded
        type_name: &'static str,
        /// Offending field
        field: &'static str,
    },

    /// A field decoded to a value of the wrong type
    #[error("{type_name}: field '{field}' has an unexpected type")]
    UnexpectedType {
        /// Composite type being decoded
        type_name: &'static str,
        /// Offending field
        field: &'static str,
    },

    /// The descriptor does not name the expected composite
    #[error("descriptor {descriptor} does not name {expected}")]
    UnexpectedDescriptor {
        /// The descriptor found on the wire
        descriptor: String,
        /// The composite the caller expected
        expected: &'static str,
    },

    /// The body is not a described list
    #[error("body is not a described {expected}")]
    NotComposite {
        /// The composite the caller expected
        expected: &'static str,
    },

    /// The descriptor is not known to this binding table
    #[error("unknown descriptor {0}")]
    UnknownDescriptor(String),

    /// Raw codec failure underneath the binding
    #[error(transparent)]
    Codec(#[from] hematite_codec::Error),
}

/// A composite type: a named record serialized as descriptor + list
pub trait Composite: Sized {
    /// Symbolic descriptor, e.g. `amqp:open:list`
    const NAME: &'static str;

    /// Numeric descriptor code
    const CODE: u64;

    /// Fields in ordinal order, untrimmed
    fn to_list(&self) -> Vec<Value>;

    /// Rebuilds the record from an ordinal field list
    fn from_list(fields: Vec<Value>) -> Result<Self, Error>;

    /// True when `descriptor` names this composite by symbol or code
    fn descriptor_matches(descriptor: &Descriptor) -> bool {
        match descriptor {
            Descriptor::Name(name) => name.as_str() == Self::NAME,
            Descriptor::Code(code) => *code == Self::CODE,
        }
    }

    /// Wraps the record as a described list value, trailing nulls trimmed
    fn to_value(&self) -> Value {
        let mut fields = self.to_list();
        while fields.last().map(Value::is_null).unwrap_or(false) {
            fields.pop();
        }
        Value::Described(Box::new(Described::new(
            Descriptor::Code(Self::CODE),
            Value::List(fields),
        )))
    }

    /// Unwraps a described list value into the record
    fn from_value(value: Value) -> Result<Self, Error> {
        let described = match value {
            Value::Described(d) => *d,
            _ => {
                return Err(Error::NotComposite {
                    expected: Self::NAME,
                })
            }
        };
        if !Self::descriptor_matches(&described.descriptor) {
            return Err(Error::UnexpectedDescriptor {
                descriptor: described.descriptor.to_string(),
                expected: Self::NAME,
            });
        }
        match described.value {
            Value::List(fields) => Self::from_list(fields),
            _ => Err(Error::NotComposite {
                expected: Self::NAME,
            }),
        }
    }

    /// Encodes the record to bytes
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        // composite bodies only contain encodable shapes
        hematite_codec::encode_into(&self.to_value(), &mut buf)
            .expect("composite bodies are homogeneous");
        buf.freeze()
    }

    /// Decodes one record spanning the whole input
    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_value(hematite_codec::decode_exact(bytes)?)
    }
}

/// Conversion between one field and its wire value
pub trait FieldValue: Sized {
    /// The wire form of this field
    fn into_value(self) -> Value;

    /// Rebuilds the field, handing the value back on mismatch
    fn from_value(value: Value) -> Result<Self, Value>;
}

impl FieldValue for Value {
    fn into_value(self) -> Value {
        self
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        Ok(value)
    }
}

impl FieldValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(other),
        }
    }
}

impl FieldValue for u8 {
    fn into_value(self) -> Value {
        Value::UByte(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::UByte(n) => Ok(n),
            other => Err(other),
        }
    }
}

impl FieldValue for u16 {
    fn into_value(self) -> Value {
        Value::UShort(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::UShort(n) => Ok(n),
            other => Err(other),
        }
    }
}

impl FieldValue for u32 {
    fn into_value(self) -> Value {
        Value::UInt(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::UInt(n) => Ok(n),
            other => Err(other),
        }
    }
}

impl FieldValue for u64 {
    fn into_value(self) -> Value {
        Value::ULong(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::ULong(n) => Ok(n),
            other => Err(other),
        }
    }
}

impl FieldValue for String {
    fn into_value(self) -> Value {
        Value::String(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(other),
        }
    }
}

impl FieldValue for hematite_codec::Symbol {
    fn into_value(self) -> Value {
        Value::Symbol(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Symbol(s) => Ok(s),
            other => Err(other),
        }
    }
}

impl FieldValue for hematite_codec::Binary {
    fn into_value(self) -> Value {
        Value::Binary(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Binary(b) => Ok(b),
            other => Err(other),
        }
    }
}

impl FieldValue for hematite_codec::Timestamp {
    fn into_value(self) -> Value {
        Value::Timestamp(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Timestamp(t) => Ok(t),
            other => Err(other),
        }
    }
}

impl FieldValue for hematite_codec::OrderedMap {
    fn into_value(self) -> Value {
        Value::Map(self)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Map(m) => Ok(m),
            other => Err(other),
        }
    }
}

/// A `multiple="true"` field: one value or an array of values.
///
/// Encoded as an array; a bare single value is accepted on decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Multiple<T>(pub Vec<T>);

impl<T> Multiple<T> {
    /// A multiple holding exactly one value
    pub fn one(value: T) -> Self {
        Multiple(vec![value])
    }

    /// Iterates the values
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

impl<T> From<Vec<T>> for Multiple<T> {
    fn from(values: Vec<T>) -> Self {
        Multiple(values)
    }
}

impl<T: FieldValue> FieldValue for Multiple<T> {
    fn into_value(self) -> Value {
        Value::Array(self.0.into_iter().map(FieldValue::into_value).collect())
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Array(items) | Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(T::from_value(item)?);
                }
                Ok(Multiple(out))
            }
            single => Ok(Multiple(vec![T::from_value(single)?])),
        }
    }
}

/// Ordinal field reader over a decoded composite list
#[derive(Debug)]
pub struct ListDecoder {
    type_name: &'static str,
    fields: std::vec::IntoIter<Value>,
}

impl ListDecoder {
    /// Creates a reader over `fields` for error reporting as `type_name`
    pub fn new(type_name: &'static str, fields: Vec<Value>) -> Self {
        Self {
            type_name,
            fields: fields.into_iter(),
        }
    }

    /// Reads the next field; absent and null are both `None`
    pub fn optional<T: FieldValue>(&mut self, field: &'static str) -> Result<Option<T>, Error> {
        match self.fields.next() {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::from_value(value).map(Some).map_err(|_| Error::UnexpectedType {
                type_name: self.type_name,
                field,
            }),
        }
    }

    /// Reads a mandatory field, failing by name on null
    pub fn mandatory<T: FieldValue>(&mut self, field: &'static str) -> Result<T, Error> {
        self.optional(field)?.ok_or(Error::MandatoryFieldNull {
            type_name: self.type_name,
            field,
        })
    }

    /// Reads a defaulted field
    pub fn or_default<T: FieldValue>(
        &mut self,
        field: &'static str,
        default: T,
    ) -> Result<T, Error> {
        Ok(self.optional(field)?.unwrap_or(default))
    }
}

/// Pushes fields in ordinal order; `Composite::to_value` trims the tail
pub fn field<T: FieldValue>(value: T) -> Value {
    value.into_value()
}

/// An optional field: absent encodes as null
pub fn optional<T: FieldValue>(value: Option<T>) -> Value {
    value.map(FieldValue::into_value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_codec::Symbol;

    #[derive(Debug, Clone, PartialEq)]
    struct Probe {
        first: String,
        second: Option<u32>,
        third: bool,
    }

    impl Composite for Probe {
        const NAME: &'static str = "test:probe:list";
        const CODE: u64 = 0x99;

        fn to_list(&self) -> Vec<Value> {
            vec![
                field(self.first.clone()),
                optional(self.second),
                field(self.third),
            ]
        }

        fn from_list(fields: Vec<Value>) -> Result<Self, Error> {
            let mut decoder = ListDecoder::new(Self::NAME, fields);
            Ok(Self {
                first: decoder.mandatory("first")?,
                second: decoder.optional("second")?,
                third: decoder.or_default("third", false)?,
            })
        }
    }

    #[test]
    fn composite_round_trip() {
        let probe = Probe {
            first: "hello".into(),
            second: Some(7),
            third: true,
        };
        let bytes = probe.encode();
        assert_eq!(Probe::decode(&bytes).unwrap(), probe);
    }

    #[test]
    fn trailing_nulls_are_trimmed_and_defaulted() {
        let probe = Probe {
            first: "hello".into(),
            second: None,
            third: false,
        };
        let value = probe.to_value();
        let inner = value.as_described().unwrap();
        match &inner.value {
            Value::List(fields) => assert_eq!(fields.len(), 1),
            other => panic!("expected list, got {:?}", other),
        }
        assert_eq!(Probe::from_value(value).unwrap(), probe);
    }

    #[test]
    fn mandatory_null_is_named() {
        let err = Probe::from_list(vec![Value::Null]).unwrap_err();
        assert_eq!(
            err,
            Error::MandatoryFieldNull {
                type_name: "test:probe:list",
                field: "first"
            }
        );
    }

    #[test]
    fn multiple_accepts_single_or_array() {
        let single = Value::Symbol(Symbol::new("PLAIN"));
        let got: Multiple<Symbol> = FieldValue::from_value(single).unwrap();
        assert_eq!(got.0.len(), 1);

        let array = Value::Array(vec![
            Value::Symbol(Symbol::new("PLAIN")),
            Value::Symbol(Symbol::new("ANONYMOUS")),
        ]);
        let got: Multiple<Symbol> = FieldValue::from_value(array).unwrap();
        assert_eq!(got.0.len(), 2);
    }

    #[test]
    fn descriptor_mismatch_is_reported() {
        let value = Value::Described(Box::new(hematite_codec::Described::new(
            hematite_codec::Descriptor::Code(0x10),
            Value::List(vec![]),
        )));
        assert!(matches!(
            Probe::from_value(value),
            Err(Error::UnexpectedDescriptor { .. })
        ));
    }
}
