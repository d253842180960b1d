//! Descriptors of described types

use std::fmt;

use crate::primitives::Symbol;
use crate::value::Value;

/// A descriptor names the described type that follows it: either the
/// symbolic name or the numeric (domain-id, descriptor-id) code packed
/// into a ulong.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// Symbolic descriptor, e.g. `amqp:open:list`
    Name(Symbol),

    /// Numeric descriptor code
    Code(u64),
}

impl Descriptor {
    /// Creates a symbolic descriptor
    pub fn name(name: impl Into<Symbol>) -> Self {
        Descriptor::Name(name.into())
    }

    /// Creates a numeric descriptor
    pub fn code(code: u64) -> Self {
        Descriptor::Code(code)
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Name(name) => write!(f, "{}", name),
            Descriptor::Code(code) => write!(f, "0x{:08x}:0x{:08x}", code >> 32, code & 0xffff_ffff),
        }
    }
}

impl From<Descriptor> for Value {
    fn from(descriptor: Descriptor) -> Self {
        match descriptor {
            Descriptor::Name(name) => Value::Symbol(name),
            Descriptor::Code(code) => Value::ULong(code),
        }
    }
}

impl TryFrom<Value> for Descriptor {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Symbol(name) => Ok(Descriptor::Name(name)),
            Value::ULong(code) => Ok(Descriptor::Code(code)),
            other => Err(other),
        }
    }
}
