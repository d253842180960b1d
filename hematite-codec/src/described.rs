//! Described values: a descriptor paired with an inner value

use crate::descriptor::Descriptor;
use crate::value::Value;

/// A described value `(descriptor, value)`.
///
/// On the wire this is the `0x00` marker, the encoded descriptor, then
/// the inner encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Described {
    /// Names the described type
    pub descriptor: Descriptor,

    /// The inner value
    pub value: Value,
}

impl Described {
    /// Creates a described value
    pub fn new(descriptor: Descriptor, value: Value) -> Self {
        Self { descriptor, value }
    }
}

impl From<Described> for Value {
    fn from(described: Described) -> Self {
        Value::Described(Box::new(described))
    }
}
