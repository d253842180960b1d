//! Definitions from Part 2.8 of the AMQP 1.0 specification

use hematite_codec::{Binary, OrderedMap, Symbol, Value};

use crate::binding::{field, optional, Composite, Error as BindError, FieldValue, ListDecoder};

/// Protocol major version
pub const MAJOR: u8 = 1;

/// Protocol minor version
pub const MINOR: u8 = 0;

/// Protocol revision
pub const REVISION: u8 = 0;

/// 2.8.10 Sequence No: RFC-1982 serial number arithmetic on u32
pub type SequenceNo = u32;

/// 2.8.9 Transfer Number
pub type TransferNumber = SequenceNo;

/// 2.8.8 Delivery Number
pub type DeliveryNumber = SequenceNo;

/// 2.8.11 Message Format
pub type MessageFormat = u32;

/// 2.8.5 Seconds
pub type Seconds = u32;

/// 2.8.6 Milliseconds
pub type Milliseconds = u32;

/// 2.8.7 Delivery Tag: up to 32 octets of binary data
pub type DeliveryTag = Binary;

/// 2.8.13 Fields: a symbol-keyed map
pub type Fields = OrderedMap;

/// 2.8.4 Handle: the endpoint-scoped alias for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl Default for Handle {
    fn default() -> Self {
        Handle(u32::MAX)
    }
}

impl From<u32> for Handle {
    fn from(val: u32) -> Self {
        Handle(val)
    }
}

impl From<Handle> for u32 {
    fn from(val: Handle) -> Self {
        val.0
    }
}

impl FieldValue for Handle {
    fn into_value(self) -> Value {
        Value::UInt(self.0)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        u32::from_value(value).map(Handle)
    }
}

/// 2.8.1 Role: the two ends of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Encoded as `false`
    Sender,
    /// Encoded as `true`
    Receiver,
}

impl Role {
    /// The opposite role
    pub fn flip(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl FieldValue for Role {
    fn into_value(self) -> Value {
        Value::Bool(matches!(self, Role::Receiver))
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        bool::from_value(value).map(|receiver| {
            if receiver {
                Role::Receiver
            } else {
                Role::Sender
            }
        })
    }
}

/// 2.8.2 Sender Settle Mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SenderSettleMode {
    /// The sender will send all deliveries initially unsettled
    Unsettled = 0,
    /// The sender will send all deliveries settled
    Settled = 1,
    /// The sender may send a mixture
    #[default]
    Mixed = 2,
}

impl FieldValue for SenderSettleMode {
    fn into_value(self) -> Value {
        Value::UByte(self as u8)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match u8::from_value(value)? {
            0 => Ok(SenderSettleMode::Unsettled),
            1 => Ok(SenderSettleMode::Settled),
            2 => Ok(SenderSettleMode::Mixed),
            other => Err(Value::UByte(other)),
        }
    }
}

/// 2.8.3 Receiver Settle Mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// The receiver settles first
    #[default]
    First = 0,
    /// The receiver waits for the sender to settle
    Second = 1,
}

impl FieldValue for ReceiverSettleMode {
    fn into_value(self) -> Value {
        Value::UByte(self as u8)
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        match u8::from_value(value)? {
            0 => Ok(ReceiverSettleMode::First),
            1 => Ok(ReceiverSettleMode::Second),
            other => Err(Value::UByte(other)),
        }
    }
}

macro_rules! condition_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $symbol:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),*
        }

        impl $name {
            /// The condition symbol on the wire
            pub fn as_symbol(&self) -> &'static str {
                match self {
                    $( $name::$variant => $symbol ),*
                }
            }

            /// Maps a symbol back to the condition
            pub fn from_symbol(symbol: &str) -> Option<Self> {
                match symbol {
                    $( $symbol => Some($name::$variant), )*
                    _ => None,
                }
            }
        }
    };
}

condition_enum! {
    /// 2.8.15 AMQP errors shared by every scope
    pub enum AmqpError {
        InternalError => "amqp:internal-error",
        NotFound => "amqp:not-found",
        UnauthorizedAccess => "amqp:unauthorized-access",
        DecodeError => "amqp:decode-error",
        ResourceLimitExceeded => "amqp:resource-limit-exceeded",
        NotAllowed => "amqp:not-allowed",
        InvalidField => "amqp:invalid-field",
        NotImplemented => "amqp:not-implemented",
        ResourceLocked => "amqp:resource-locked",
        PreconditionFailed => "amqp:precondition-failed",
        ResourceDeleted => "amqp:resource-deleted",
        IllegalState => "amqp:illegal-state",
        FrameSizeTooSmall => "amqp:frame-size-too-small",
    }
}

condition_enum! {
    /// 2.8.16 Connection error conditions
    pub enum ConnectionError {
        ConnectionForced => "amqp:connection:forced",
        FramingError => "amqp:connection:framing-error",
        Redirect => "amqp:connection:redirect",
    }
}

condition_enum! {
    /// 2.8.17 Session error conditions
    pub enum SessionError {
        WindowViolation => "amqp:session:window-violation",
        ErrantLink => "amqp:session:errant-link",
        HandleInUse => "amqp:session:handle-in-use",
        UnattachedHandle => "amqp:session:unattached-handle",
    }
}

condition_enum! {
    /// 2.8.18 Link error conditions
    pub enum LinkError {
        DetachForced => "amqp:link:detach-forced",
        TransferLimitExceeded => "amqp:link:transfer-limit-exceeded",
        MessageSizeExceeded => "amqp:link:message-size-exceeded",
        Redirect => "amqp:link:redirect",
        Stolen => "amqp:link:stolen",
    }
}

condition_enum! {
    /// 4.5.8 Transaction error conditions
    pub enum TransactionError {
        UnknownId => "amqp:transaction:unknown-id",
        Rollback => "amqp:transaction:rollback",
        Timeout => "amqp:transaction:timeout",
    }
}

/// Any condition symbol an [`Error`] may carry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    /// Shared `amqp:` conditions
    Amqp(AmqpError),
    /// `amqp:connection:` conditions
    Connection(ConnectionError),
    /// `amqp:session:` conditions
    Session(SessionError),
    /// `amqp:link:` conditions
    Link(LinkError),
    /// `amqp:transaction:` conditions
    Transaction(TransactionError),
    /// Conditions outside the registered set
    Custom(Symbol),
}

impl ErrorCondition {
    /// The condition symbol on the wire
    pub fn symbol(&self) -> Symbol {
        match self {
            ErrorCondition::Amqp(c) => Symbol::new(c.as_symbol()),
            ErrorCondition::Connection(c) => Symbol::new(c.as_symbol()),
            ErrorCondition::Session(c) => Symbol::new(c.as_symbol()),
            ErrorCondition::Link(c) => Symbol::new(c.as_symbol()),
            ErrorCondition::Transaction(c) => Symbol::new(c.as_symbol()),
            ErrorCondition::Custom(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl From<AmqpError> for ErrorCondition {
    fn from(c: AmqpError) -> Self {
        ErrorCondition::Amqp(c)
    }
}

impl From<ConnectionError> for ErrorCondition {
    fn from(c: ConnectionError) -> Self {
        ErrorCondition::Connection(c)
    }
}

impl From<SessionError> for ErrorCondition {
    fn from(c: SessionError) -> Self {
        ErrorCondition::Session(c)
    }
}

impl From<LinkError> for ErrorCondition {
    fn from(c: LinkError) -> Self {
        ErrorCondition::Link(c)
    }
}

impl From<TransactionError> for ErrorCondition {
    fn from(c: TransactionError) -> Self {
        ErrorCondition::Transaction(c)
    }
}

impl FieldValue for ErrorCondition {
    fn into_value(self) -> Value {
        Value::Symbol(self.symbol())
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        let symbol = Symbol::from_value(value)?;
        let s = symbol.as_str();
        let condition = AmqpError::from_symbol(s)
            .map(ErrorCondition::Amqp)
            .or_else(|| ConnectionError::from_symbol(s).map(ErrorCondition::Connection))
            .or_else(|| SessionError::from_symbol(s).map(ErrorCondition::Session))
            .or_else(|| LinkError::from_symbol(s).map(ErrorCondition::Link))
            .or_else(|| TransactionError::from_symbol(s).map(ErrorCondition::Transaction))
            .unwrap_or(ErrorCondition::Custom(symbol));
        Ok(condition)
    }
}

/// 2.8.14 Error
///
/// <type name="error" class="composite" source="list">
///     <descriptor name="amqp:error:list" code="0x00000000:0x0000001d"/>
///     <field name="condition" type="symbol" requires="error-condition" mandatory="true"/>
///     <field name="description" type="string"/>
///     <field name="info" type="fields"/>
/// </type>
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// Names the error class
    pub condition: ErrorCondition,

    /// Human-readable supplement
    pub description: Option<String>,

    /// Peer-specific details
    pub info: Option<Fields>,
}

impl Error {
    /// Creates an error with a condition and description
    pub fn new(condition: impl Into<ErrorCondition>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
            info: None,
        }
    }

    /// Creates an error carrying only a condition
    pub fn condition(condition: impl Into<ErrorCondition>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
            info: None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{}: {}", self.condition, d),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl Composite for Error {
    const NAME: &'static str = "amqp:error:list";
    const CODE: u64 = 0x0000_0000_0000_001d;

    fn to_list(&self) -> Vec<Value> {
        vec![
            field(self.condition.clone()),
            optional(self.description.clone()),
            optional(self.info.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            condition: decoder.mandatory("condition")?,
            description: decoder.optional("description")?,
            info: decoder.optional("info")?,
        })
    }
}

impl FieldValue for Error {
    fn into_value(self) -> Value {
        self.to_value()
    }

    fn from_value(value: Value) -> Result<Self, Value> {
        <Error as Composite>::from_value(value.clone()).map_err(|_| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_round_trip() {
        let error = Error::new(AmqpError::NotAllowed, "double open");
        let bytes = error.encode();
        assert_eq!(Error::decode(&bytes).unwrap(), error);
    }

    #[test]
    fn condition_symbols_round_trip() {
        let condition = ErrorCondition::from(SessionError::UnattachedHandle);
        let value = condition.clone().into_value();
        let back = <ErrorCondition as FieldValue>::from_value(value).unwrap();
        assert_eq!(back, condition);
    }

    #[test]
    fn unknown_condition_is_custom() {
        let value = Value::Symbol(Symbol::new("vendor:strange"));
        let back = <ErrorCondition as FieldValue>::from_value(value).unwrap();
        assert!(matches!(back, ErrorCondition::Custom(_)));
    }
}
