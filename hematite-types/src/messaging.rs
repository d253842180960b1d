//! Messaging types from Part 3: termini, delivery states, outcomes, and
//! the body sections the broker needs to read control messages.

use bytes::{Bytes, BytesMut};
use hematite_codec::{Binary, Symbol, Value};
use indexmap::IndexMap;

use crate::binding::{field, optional, Composite, Error as BindError, FieldValue, ListDecoder, Multiple};
use crate::definitions::{DeliveryTag, Error, Fields, Seconds};
use crate::transaction::{Coordinator, Declared, TransactionalState};

/// 3.5.5 Terminus durability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminusDurability {
    /// No state is retained
    #[default]
    None = 0,
    /// Only configuration is retained
    Configuration = 1,
    /// Configuration and delivery state are retained
    UnsettledState = 2,
}

impl FieldValue for TerminusDurability {
    fn into_value(self) -> Value {
        Value::UInt(self as u32)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match u32::from_value(value)? {
            0 => Ok(TerminusDurability::None),
            1 => Ok(TerminusDurability::Configuration),
            2 => Ok(TerminusDurability::UnsettledState),
            other => Err(Value::UInt(other)),
        }
    }
}

/// 3.5.6 Terminus expiry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Expires when the link detaches
    LinkDetach,
    /// Expires when the session ends
    SessionEnd,
    /// Expires when the connection closes
    ConnectionClose,
    /// Never expires
    Never,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        ExpiryPolicy::SessionEnd
    }
}

impl FieldValue for ExpiryPolicy {
    fn into_value(self) -> Value {
        let s = match self {
            ExpiryPolicy::LinkDetach => "link-detach",
            ExpiryPolicy::SessionEnd => "session-end",
            ExpiryPolicy::ConnectionClose => "connection-close",
            ExpiryPolicy::Never => "never",
        };
        Value::Symbol(Symbol::new(s))
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        let symbol = Symbol::from_value(value)?;
        match symbol.as_str() {
            "link-detach" => Ok(ExpiryPolicy::LinkDetach),
            "session-end" => Ok(ExpiryPolicy::SessionEnd),
            "connection-close" => Ok(ExpiryPolicy::ConnectionClose),
            "never" => Ok(ExpiryPolicy::Never),
            _ => Err(Value::Symbol(symbol)),
        }
    }
}

/// 3.5.3 Source
///
/// <descriptor name="amqp:source:list" code="0x00000000:0x00000028"/>
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Source {
    /// Address of the node the terminus is attached to
    pub address: Option<String>,

    /// What state survives the node
    pub durable: TerminusDurability,

    /// When the terminus expires
    pub expiry_policy: ExpiryPolicy,

    /// Grace period for expiry
    pub timeout: Seconds,

    /// The node is created on attach and named in the reply
    pub dynamic: bool,

    /// Node properties requested for a dynamic node
    pub dynamic_node_properties: Option<Fields>,

    /// move or copy
    pub distribution_mode: Option<Symbol>,

    /// Predicate narrowing the messages of interest
    pub filter: Option<Fields>,

    /// Outcome applied when settlement gives no other state
    pub default_outcome: Option<Outcome>,

    /// Outcomes the source supports
    pub outcomes: Option<Multiple<Symbol>>,

    /// Extension capabilities
    pub capabilities: Option<Multiple<Symbol>>,
}

impl Source {
    /// A source reading from `address`
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    /// A source requesting a dynamic node
    pub fn dynamic() -> Self {
        Self {
            dynamic: true,
            ..Default::default()
        }
    }
}

impl Composite for Source {
    const NAME: &'static str = "amqp:source:list";
    const CODE: u64 = 0x0000_0000_0000_0028;

    fn to_list(&self) -> Vec<Value> {
        vec![
            optional(self.address.clone()),
            field(self.durable),
            field(self.expiry_policy.clone()),
            field(self.timeout),
            field(self.dynamic),
            optional(self.dynamic_node_properties.clone()),
            optional(self.distribution_mode.clone()),
            optional(self.filter.clone()),
            optional(self.default_outcome.clone()),
            optional(self.outcomes.clone()),
            optional(self.capabilities.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            address: decoder.optional("address")?,
            durable: decoder.or_default("durable", TerminusDurability::None)?,
            expiry_policy: decoder.or_default("expiry-policy", ExpiryPolicy::SessionEnd)?,
            timeout: decoder.or_default("timeout", 0)?,
            dynamic: decoder.or_default("dynamic", false)?,
            dynamic_node_properties: decoder.optional("dynamic-node-properties")?,
            distribution_mode: decoder.optional("distribution-mode")?,
            filter: decoder.optional("filter")?,
            default_outcome: decoder.optional("default-outcome")?,
            outcomes: decoder.optional("outcomes")?,
            capabilities: decoder.optional("capabilities")?,
        })
    }
}

impl FieldValue for Source {
    fn into_value(self) -> Value {
        self.to_value()
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        <Source as Composite>::from_value(value.clone()).map_err(|_| value)
    }
}

/// 3.5.4 Target
///
/// <descriptor name="amqp:target:list" code="0x00000000:0x00000029"/>
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    /// Address of the node the terminus is attached to
    pub address: Option<String>,

    /// What state survives the node
    pub durable: TerminusDurability,

    /// When the terminus expires
    pub expiry_policy: ExpiryPolicy,

    /// Grace period for expiry
    pub timeout: Seconds,

    /// The node is created on attach and named in the reply
    pub dynamic: bool,

    /// Node properties requested for a dynamic node
    pub dynamic_node_properties: Option<Fields>,

    /// Extension capabilities
    pub capabilities: Option<Multiple<Symbol>>,
}

impl Target {
    /// A target writing to `address`
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    /// A target requesting a dynamic node
    pub fn dynamic() -> Self {
        Self {
            dynamic: true,
            ..Default::default()
        }
    }
}

impl Composite for Target {
    const NAME: &'static str = "amqp:target:list";
    const CODE: u64 = 0x0000_0000_0000_0029;

    fn to_list(&self) -> Vec<Value> {
        vec![
            optional(self.address.clone()),
            field(self.durable),
            field(self.expiry_policy.clone()),
            field(self.timeout),
            field(self.dynamic),
            optional(self.dynamic_node_properties.clone()),
            optional(self.capabilities.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            address: decoder.optional("address")?,
            durable: decoder.or_default("durable", TerminusDurability::None)?,
            expiry_policy: decoder.or_default("expiry-policy", ExpiryPolicy::SessionEnd)?,
            timeout: decoder.or_default("timeout", 0)?,
            dynamic: decoder.or_default("dynamic", false)?,
            dynamic_node_properties: decoder.optional("dynamic-node-properties")?,
            capabilities: decoder.optional("capabilities")?,
        })
    }
}

impl FieldValue for Target {
    fn into_value(self) -> Value {
        self.to_value()
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        <Target as Composite>::from_value(value.clone()).map_err(|_| value)
    }
}

/// Anything an Attach may carry in its target field
#[derive(Debug, Clone, PartialEq)]
pub enum TargetArchetype {
    /// A node-addressed target
    Target(Target),
    /// The transaction coordinator target
    Coordinator(Coordinator),
}

impl TargetArchetype {
    /// The address, when the archetype has one
    pub fn address(&self) -> Option<&str> {
        match self {
            TargetArchetype::Target(t) => t.address.as_deref(),
            TargetArchetype::Coordinator(_) => None,
        }
    }
}

impl From<Target> for TargetArchetype {
    fn from(target: Target) -> Self {
        TargetArchetype::Target(target)
    }
}

impl From<Coordinator> for TargetArchetype {
    fn from(coordinator: Coordinator) -> Self {
        TargetArchetype::Coordinator(coordinator)
    }
}

impl FieldValue for TargetArchetype {
    fn into_value(self) -> Value {
        match self {
            TargetArchetype::Target(t) => t.to_value(),
            TargetArchetype::Coordinator(c) => c.to_value(),
        }
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        let descriptor = match value.as_described() {
            Some(described) => &described.descriptor,
            None => return Err(value),
        };
        if Target::descriptor_matches(descriptor) {
            <Target as Composite>::from_value(value.clone())
                .map(TargetArchetype::Target)
                .map_err(|_| value)
        } else if Coordinator::descriptor_matches(descriptor) {
            <Coordinator as Composite>::from_value(value.clone())
                .map(TargetArchetype::Coordinator)
                .map_err(|_| value)
        } else {
            Err(value)
        }
    }
}

/// 3.4.1 Received: partial delivery progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    /// Section the receiver reached
    pub section_number: u32,

    /// Offset within that section
    pub section_offset: u64,
}

impl Composite for Received {
    const NAME: &'static str = "amqp:received:list";
    const CODE: u64 = 0x0000_0000_0000_0023;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.section_number), field(self.section_offset)]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            section_number: decoder.mandatory("section-number")?,
            section_offset: decoder.mandatory("section-offset")?,
        })
    }
}

/// 3.4.2 Accepted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accepted;

impl Composite for Accepted {
    const NAME: &'static str = "amqp:accepted:list";
    const CODE: u64 = 0x0000_0000_0000_0024;

    fn to_list(&self) -> Vec<Value> {
        Vec::new()
    }

    fn from_list(_fields: Vec<Value>) -> Result<Self, BindError> {
        Ok(Accepted)
    }
}

/// 3.4.3 Rejected
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rejected {
    /// Why the message was rejected
    pub error: Option<Error>,
}

impl Composite for Rejected {
    const NAME: &'static str = "amqp:rejected:list";
    const CODE: u64 = 0x0000_0000_0000_0025;

    fn to_list(&self) -> Vec<Value> {
        vec![optional(self.error.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            error: decoder.optional("error")?,
        })
    }
}

/// 3.4.4 Released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Released;

impl Composite for Released {
    const NAME: &'static str = "amqp:released:list";
    const CODE: u64 = 0x0000_0000_0000_0026;

    fn to_list(&self) -> Vec<Value> {
        Vec::new()
    }

    fn from_list(_fields: Vec<Value>) -> Result<Self, BindError> {
        Ok(Released)
    }
}

/// 3.4.5 Modified
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modified {
    /// Count the delivery as a failed attempt
    pub delivery_failed: Option<bool>,

    /// Do not redeliver to this receiver
    pub undeliverable_here: Option<bool>,

    /// Annotations to merge into the message
    pub message_annotations: Option<Fields>,
}

impl Composite for Modified {
    const NAME: &'static str = "amqp:modified:list";
    const CODE: u64 = 0x0000_0000_0000_0027;

    fn to_list(&self) -> Vec<Value> {
        vec![
            optional(self.delivery_failed),
            optional(self.undeliverable_here),
            optional(self.message_annotations.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            delivery_failed: decoder.optional("delivery-failed")?,
            undeliverable_here: decoder.optional("undeliverable-here")?,
            message_annotations: decoder.optional("message-annotations")?,
        })
    }
}

/// A terminal outcome of a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 3.4.2
    Accepted(Accepted),
    /// 3.4.3
    Rejected(Rejected),
    /// 3.4.4
    Released(Released),
    /// 3.4.5
    Modified(Modified),
    /// 4.5.5
    Declared(Declared),
}

impl FieldValue for Outcome {
    fn into_value(self) -> Value {
        match self {
            Outcome::Accepted(v) => v.to_value(),
            Outcome::Rejected(v) => v.to_value(),
            Outcome::Released(v) => v.to_value(),
            Outcome::Modified(v) => v.to_value(),
            Outcome::Declared(v) => v.to_value(),
        }
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match DeliveryState::from_value(value)? {
            DeliveryState::Accepted(v) => Ok(Outcome::Accepted(v)),
            DeliveryState::Rejected(v) => Ok(Outcome::Rejected(v)),
            DeliveryState::Released(v) => Ok(Outcome::Released(v)),
            DeliveryState::Modified(v) => Ok(Outcome::Modified(v)),
            DeliveryState::Declared(v) => Ok(Outcome::Declared(v)),
            other => Err(other.into_value()),
        }
    }
}

impl From<Outcome> for DeliveryState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Accepted(v) => DeliveryState::Accepted(v),
            Outcome::Rejected(v) => DeliveryState::Rejected(v),
            Outcome::Released(v) => DeliveryState::Released(v),
            Outcome::Modified(v) => DeliveryState::Modified(v),
            Outcome::Declared(v) => DeliveryState::Declared(v),
        }
    }
}

/// 3.4 Delivery State
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    /// 3.4.1
    Received(Received),
    /// 3.4.2
    Accepted(Accepted),
    /// 3.4.3
    Rejected(Rejected),
    /// 3.4.4
    Released(Released),
    /// 3.4.5
    Modified(Modified),
    /// 4.5.5
    Declared(Declared),
    /// 4.5.6
    TransactionalState(TransactionalState),
}

impl DeliveryState {
    /// Shorthand for the accepted outcome
    pub fn accepted() -> Self {
        DeliveryState::Accepted(Accepted)
    }

    /// True when no further state change is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            DeliveryState::Received(_) | DeliveryState::TransactionalState(_)
        )
    }
}

impl FieldValue for DeliveryState {
    fn into_value(self) -> Value {
        match self {
            DeliveryState::Received(v) => v.to_value(),
            DeliveryState::Accepted(v) => v.to_value(),
            DeliveryState::Rejected(v) => v.to_value(),
            DeliveryState::Released(v) => v.to_value(),
            DeliveryState::Modified(v) => v.to_value(),
            DeliveryState::Declared(v) => v.to_value(),
            DeliveryState::TransactionalState(v) => v.to_value(),
        }
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        let descriptor = match value.as_described() {
            Some(described) => described.descriptor.clone(),
            None => return Err(value),
        };
        let state = if Received::descriptor_matches(&descriptor) {
            <Received as Composite>::from_value(value.clone()).map(DeliveryState::Received)
        } else if Accepted::descriptor_matches(&descriptor) {
            <Accepted as Composite>::from_value(value.clone()).map(DeliveryState::Accepted)
        } else if Rejected::descriptor_matches(&descriptor) {
            <Rejected as Composite>::from_value(value.clone()).map(DeliveryState::Rejected)
        } else if Released::descriptor_matches(&descriptor) {
            <Released as Composite>::from_value(value.clone()).map(DeliveryState::Released)
        } else if Modified::descriptor_matches(&descriptor) {
            <Modified as Composite>::from_value(value.clone()).map(DeliveryState::Modified)
        } else if Declared::descriptor_matches(&descriptor) {
            <Declared as Composite>::from_value(value.clone()).map(DeliveryState::Declared)
        } else if TransactionalState::descriptor_matches(&descriptor) {
            <TransactionalState as Composite>::from_value(value.clone())
                .map(DeliveryState::TransactionalState)
        } else {
            return Err(value);
        };
        state.map_err(|_| value)
    }
}

/// The unsettled map carried by Attach: delivery-tag to last known state
pub type UnsettledMap = IndexMap<DeliveryTag, Option<DeliveryState>>;

impl FieldValue for UnsettledMap {
    fn into_value(self) -> Value {
        self.into_iter()
            .map(|(tag, state)| {
                (
                    Value::Binary(tag),
                    state.map(FieldValue::into_value).unwrap_or(Value::Null),
                )
            })
            .collect::<hematite_codec::OrderedMap>()
            .into_value()
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        let map = hematite_codec::OrderedMap::from_value(value)?;
        let mut out = UnsettledMap::new();
        for (key, val) in map.into_iter() {
            let tag = Binary::from_value(key)?;
            let state = match val {
                Value::Null => None,
                other => Some(DeliveryState::from_value(other)?),
            };
            out.insert(tag, state);
        }
        Ok(out)
    }
}

/// 3.2.6 Data section
pub const DATA_CODE: u64 = 0x0000_0000_0000_0075;

/// 3.2.7 AmqpSequence section
pub const AMQP_SEQUENCE_CODE: u64 = 0x0000_0000_0000_0076;

/// 3.2.8 AmqpValue section
pub const AMQP_VALUE_CODE: u64 = 0x0000_0000_0000_0077;

/// One section of a message body
#[derive(Debug, Clone, PartialEq)]
pub enum BodySection {
    /// Opaque binary
    Data(Binary),
    /// A sequence of values
    Sequence(Vec<Value>),
    /// A single value
    Value(Value),
}

/// A bare message: the body sections the engine itself reads.
///
/// The broker treats payloads as opaque except for coordinator control
/// messages, so headers and annotations pass through undecoded inside
/// `Data` payloads from the engine's point of view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Body sections in order
    pub sections: Vec<BodySection>,
}

impl Message {
    /// A message whose body is one value section
    pub fn value(value: impl Into<Value>) -> Self {
        Message {
            sections: vec![BodySection::Value(value.into())],
        }
    }

    /// A message whose body is one data section
    pub fn data(bytes: impl Into<Binary>) -> Self {
        Message {
            sections: vec![BodySection::Data(bytes.into())],
        }
    }

    /// The value of the first amqp-value section, if any
    pub fn body_value(&self) -> Option<&Value> {
        self.sections.iter().find_map(|s| match s {
            BodySection::Value(v) => Some(v),
            _ => None,
        })
    }

    /// Serializes the sections to a transfer payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for section in &self.sections {
            let (code, value) = match section {
                BodySection::Data(b) => (DATA_CODE, Value::Binary(b.clone())),
                BodySection::Sequence(items) => (AMQP_SEQUENCE_CODE, Value::List(items.clone())),
                BodySection::Value(v) => (AMQP_VALUE_CODE, v.clone()),
            };
            let described = Value::Described(Box::new(hematite_codec::Described::new(
                hematite_codec::Descriptor::Code(code),
                value,
            )));
            hematite_codec::encode_into(&described, &mut buf)
                .expect("message sections are homogeneous");
        }
        buf.freeze()
    }

    /// Decodes a transfer payload into sections, skipping sections the
    /// engine does not model
    pub fn decode(mut payload: &[u8]) -> Result<Self, BindError> {
        let mut sections = Vec::new();
        while !payload.is_empty() {
            let (value, consumed) = hematite_codec::decode(payload)?;
            payload = &payload[consumed..];
            let described = match value {
                Value::Described(d) => *d,
                // bare value outside any section wrapper
                other => {
                    sections.push(BodySection::Value(other));
                    continue;
                }
            };
            match described.descriptor {
                hematite_codec::Descriptor::Code(DATA_CODE) => {
                    if let Value::Binary(b) = described.value {
                        sections.push(BodySection::Data(b));
                    }
                }
                hematite_codec::Descriptor::Code(AMQP_SEQUENCE_CODE) => {
                    if let Value::List(items) = described.value {
                        sections.push(BodySection::Sequence(items));
                    }
                }
                hematite_codec::Descriptor::Code(AMQP_VALUE_CODE) => {
                    sections.push(BodySection::Value(described.value));
                }
                // headers, annotations, properties: not modeled, but a
                // described control body is surfaced as a value section
                _ => sections.push(BodySection::Value(Value::Described(Box::new(described)))),
            }
        }
        Ok(Message { sections })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trip() {
        let source = Source::with_address("q");
        let value = source.clone().to_value();
        assert_eq!(<Source as Composite>::from_value(value).unwrap(), source);
    }

    #[test]
    fn target_archetype_dispatches_on_descriptor() {
        let target: TargetArchetype = Target::with_address("q").into();
        let value = target.clone().into_value();
        assert_eq!(TargetArchetype::from_value(value).unwrap(), target);

        let coordinator: TargetArchetype = Coordinator::default().into();
        let value = coordinator.clone().into_value();
        assert_eq!(TargetArchetype::from_value(value).unwrap(), coordinator);
    }

    #[test]
    fn delivery_states_round_trip() {
        let states = [
            DeliveryState::accepted(),
            DeliveryState::Released(Released),
            DeliveryState::Rejected(Rejected { error: None }),
            DeliveryState::Modified(Modified::default()),
            DeliveryState::Received(Received {
                section_number: 1,
                section_offset: 20,
            }),
        ];
        for state in states {
            let value = state.clone().into_value();
            assert_eq!(DeliveryState::from_value(value).unwrap(), state);
        }
    }

    #[test]
    fn message_round_trip() {
        let message = Message::value("m1");
        let payload = message.encode();
        assert_eq!(Message::decode(&payload).unwrap(), message);
        assert_eq!(message.body_value(), Some(&Value::String("m1".into())));

        let message = Message::data("raw bytes");
        let payload = message.encode();
        assert_eq!(Message::decode(&payload).unwrap(), message);
    }

    #[test]
    fn unsettled_map_round_trip() {
        let mut unsettled = UnsettledMap::new();
        unsettled.insert(Binary::from("0"), Some(DeliveryState::accepted()));
        unsettled.insert(Binary::from("1"), None);
        let value = unsettled.clone().into_value();
        assert_eq!(UnsettledMap::from_value(value).unwrap(), unsettled);
    }
}
