//! The nine AMQP performatives of Part 2.7.
//!
//! Dispatch is a tagged [`Performative`] enum; every layer matches
//! exhaustively on it rather than looking handlers up by name.

use hematite_codec::{Symbol, Value};

use crate::binding::{field, optional, Composite, Error as BindError, FieldValue, ListDecoder, Multiple};
use crate::definitions::{
    DeliveryNumber, DeliveryTag, Error, Fields, Handle, MessageFormat, Milliseconds,
    ReceiverSettleMode, Role, SenderSettleMode, SequenceNo, TransferNumber,
};
use crate::messaging::{DeliveryState, Source, TargetArchetype, UnsettledMap};

/// 2.7.1 Open: negotiate connection parameters
///
/// <descriptor name="amqp:open:list" code="0x00000000:0x00000010"/>
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    /// The container id of the sending peer
    pub container_id: String,

    /// The name of the host the peer is connecting to
    pub hostname: Option<String>,

    /// Proposed maximum frame size
    pub max_frame_size: u32,

    /// Highest channel number that may be used
    pub channel_max: u16,

    /// Idle timeout in milliseconds
    pub idle_time_out: Option<Milliseconds>,

    /// Locales the peer emits
    pub outgoing_locales: Option<Multiple<Symbol>>,

    /// Locales the peer understands
    pub incoming_locales: Option<Multiple<Symbol>>,

    /// Extension capabilities the peer supports
    pub offered_capabilities: Option<Multiple<Symbol>>,

    /// Extension capabilities the peer desires
    pub desired_capabilities: Option<Multiple<Symbol>>,

    /// Connection properties
    pub properties: Option<Fields>,
}

impl Open {
    /// An Open for `container_id` with default negotiables
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: 65535,
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }
    }
}

impl Composite for Open {
    const NAME: &'static str = "amqp:open:list";
    const CODE: u64 = 0x0000_0000_0000_0010;

    fn to_list(&self) -> Vec<Value> {
        vec![
            field(self.container_id.clone()),
            optional(self.hostname.clone()),
            field(self.max_frame_size),
            field(self.channel_max),
            optional(self.idle_time_out),
            optional(self.outgoing_locales.clone()),
            optional(self.incoming_locales.clone()),
            optional(self.offered_capabilities.clone()),
            optional(self.desired_capabilities.clone()),
            optional(self.properties.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            container_id: decoder.mandatory("container-id")?,
            hostname: decoder.optional("hostname")?,
            max_frame_size: decoder.or_default("max-frame-size", u32::MAX)?,
            channel_max: decoder.or_default("channel-max", 65535)?,
            idle_time_out: decoder.optional("idle-time-out")?,
            outgoing_locales: decoder.optional("outgoing-locales")?,
            incoming_locales: decoder.optional("incoming-locales")?,
            offered_capabilities: decoder.optional("offered-capabilities")?,
            desired_capabilities: decoder.optional("desired-capabilities")?,
            properties: decoder.optional("properties")?,
        })
    }
}

/// 2.7.2 Begin: start a session on a channel
///
/// <descriptor name="amqp:begin:list" code="0x00000000:0x00000011"/>
#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    /// Channel of the session this Begin answers, absent when initiating
    pub remote_channel: Option<u16>,

    /// The first transfer-id the peer will assign
    pub next_outgoing_id: TransferNumber,

    /// How many incoming transfer frames the peer will buffer
    pub incoming_window: u32,

    /// How many outgoing transfer frames the peer may have in flight
    pub outgoing_window: u32,

    /// Highest handle number that may be used
    pub handle_max: Handle,

    /// Extension capabilities the peer supports
    pub offered_capabilities: Option<Multiple<Symbol>>,

    /// Extension capabilities the peer desires
    pub desired_capabilities: Option<Multiple<Symbol>>,

    /// Session properties
    pub properties: Option<Fields>,
}

impl Composite for Begin {
    const NAME: &'static str = "amqp:begin:list";
    const CODE: u64 = 0x0000_0000_0000_0011;

    fn to_list(&self) -> Vec<Value> {
        vec![
            optional(self.remote_channel),
            field(self.next_outgoing_id),
            field(self.incoming_window),
            field(self.outgoing_window),
            field(self.handle_max),
            optional(self.offered_capabilities.clone()),
            optional(self.desired_capabilities.clone()),
            optional(self.properties.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            remote_channel: decoder.optional("remote-channel")?,
            next_outgoing_id: decoder.mandatory("next-outgoing-id")?,
            incoming_window: decoder.mandatory("incoming-window")?,
            outgoing_window: decoder.mandatory("outgoing-window")?,
            handle_max: decoder.or_default("handle-max", Handle::default())?,
            offered_capabilities: decoder.optional("offered-capabilities")?,
            desired_capabilities: decoder.optional("desired-capabilities")?,
            properties: decoder.optional("properties")?,
        })
    }
}

/// 2.7.3 Attach: attach a link to a session
///
/// <descriptor name="amqp:attach:list" code="0x00000000:0x00000012"/>
#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    /// Link name, unique per (container, role) pair
    pub name: String,

    /// Handle aliasing the link on this session
    pub handle: Handle,

    /// Which end of the link the peer is
    pub role: Role,

    /// Settlement policy of the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Settlement policy of the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    /// Where deliveries originate
    pub source: Option<Box<Source>>,

    /// Where deliveries land
    pub target: Option<Box<TargetArchetype>>,

    /// Deliveries that survived a previous attach, by tag
    pub unsettled: Option<UnsettledMap>,

    /// True when the unsettled map could not be sent complete
    pub incomplete_unsettled: bool,

    /// The sender's delivery-count at attach; senders only
    pub initial_delivery_count: Option<SequenceNo>,

    /// Largest message this link accepts
    pub max_message_size: Option<u64>,

    /// Extension capabilities the peer supports
    pub offered_capabilities: Option<Multiple<Symbol>>,

    /// Extension capabilities the peer desires
    pub desired_capabilities: Option<Multiple<Symbol>>,

    /// Link properties
    pub properties: Option<Fields>,
}

impl Composite for Attach {
    const NAME: &'static str = "amqp:attach:list";
    const CODE: u64 = 0x0000_0000_0000_0012;

    fn to_list(&self) -> Vec<Value> {
        vec![
            field(self.name.clone()),
            field(self.handle),
            field(self.role),
            field(self.snd_settle_mode),
            field(self.rcv_settle_mode),
            optional(self.source.clone().map(|b| *b)),
            optional(self.target.clone().map(|b| *b)),
            optional(self.unsettled.clone()),
            field(self.incomplete_unsettled),
            optional(self.initial_delivery_count),
            optional(self.max_message_size),
            optional(self.offered_capabilities.clone()),
            optional(self.desired_capabilities.clone()),
            optional(self.properties.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            name: decoder.mandatory("name")?,
            handle: decoder.mandatory("handle")?,
            role: decoder.mandatory("role")?,
            snd_settle_mode: decoder.or_default("snd-settle-mode", SenderSettleMode::Mixed)?,
            rcv_settle_mode: decoder.or_default("rcv-settle-mode", ReceiverSettleMode::First)?,
            source: decoder.optional("source")?.map(Box::new),
            target: decoder.optional("target")?.map(Box::new),
            unsettled: decoder.optional("unsettled")?,
            incomplete_unsettled: decoder.or_default("incomplete-unsettled", false)?,
            initial_delivery_count: decoder.optional("initial-delivery-count")?,
            max_message_size: decoder.optional("max-message-size")?,
            offered_capabilities: decoder.optional("offered-capabilities")?,
            desired_capabilities: decoder.optional("desired-capabilities")?,
            properties: decoder.optional("properties")?,
        })
    }
}

/// 2.7.4 Flow: update link and session flow state
///
/// <descriptor name="amqp:flow:list" code="0x00000000:0x00000013"/>
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flow {
    /// The transfer-id the peer expects next
    pub next_incoming_id: Option<TransferNumber>,

    /// Peer's incoming window in transfer frames
    pub incoming_window: u32,

    /// The transfer-id the peer will assign next
    pub next_outgoing_id: TransferNumber,

    /// Peer's outgoing window in transfer frames
    pub outgoing_window: u32,

    /// Link the remaining fields apply to; absent for session-only flow
    pub handle: Option<Handle>,

    /// Deliveries the link endpoint has seen
    pub delivery_count: Option<SequenceNo>,

    /// Credit the receiver grants
    pub link_credit: Option<u32>,

    /// Deliveries the sender has ready
    pub available: Option<u32>,

    /// The sender must exhaust credit before pausing
    pub drain: bool,

    /// The peer should echo its flow state back
    pub echo: bool,

    /// Extension properties
    pub properties: Option<Fields>,
}

impl Composite for Flow {
    const NAME: &'static str = "amqp:flow:list";
    const CODE: u64 = 0x0000_0000_0000_0013;

    fn to_list(&self) -> Vec<Value> {
        vec![
            optional(self.next_incoming_id),
            field(self.incoming_window),
            field(self.next_outgoing_id),
            field(self.outgoing_window),
            optional(self.handle),
            optional(self.delivery_count),
            optional(self.link_credit),
            optional(self.available),
            field(self.drain),
            field(self.echo),
            optional(self.properties.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            next_incoming_id: decoder.optional("next-incoming-id")?,
            incoming_window: decoder.mandatory("incoming-window")?,
            next_outgoing_id: decoder.mandatory("next-outgoing-id")?,
            outgoing_window: decoder.mandatory("outgoing-window")?,
            handle: decoder.optional("handle")?,
            delivery_count: decoder.optional("delivery-count")?,
            link_credit: decoder.optional("link-credit")?,
            available: decoder.optional("available")?,
            drain: decoder.or_default("drain", false)?,
            echo: decoder.or_default("echo", false)?,
            properties: decoder.optional("properties")?,
        })
    }
}

/// 2.7.5 Transfer: carry (part of) a delivery
///
/// <descriptor name="amqp:transfer:list" code="0x00000000:0x00000014"/>
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transfer {
    /// Link the delivery flows on
    pub handle: Handle,

    /// Session-scoped delivery id; required on the first fragment
    pub delivery_id: Option<DeliveryNumber>,

    /// Tag shared by every fragment of the delivery
    pub delivery_tag: Option<DeliveryTag>,

    /// Format of the payload
    pub message_format: Option<MessageFormat>,

    /// Already settled by the sender
    pub settled: Option<bool>,

    /// More fragments follow
    pub more: bool,

    /// Receiver settle mode override for this delivery
    pub rcv_settle_mode: Option<ReceiverSettleMode>,

    /// Delivery state at the sender
    pub state: Option<DeliveryState>,

    /// The delivery resumes an unsettled delivery from a prior attach
    pub resume: bool,

    /// The delivery is aborted and must be discarded
    pub aborted: bool,

    /// The peer may batch the acknowledgement
    pub batchable: bool,
}

impl Composite for Transfer {
    const NAME: &'static str = "amqp:transfer:list";
    const CODE: u64 = 0x0000_0000_0000_0014;

    fn to_list(&self) -> Vec<Value> {
        vec![
            field(self.handle),
            optional(self.delivery_id),
            optional(self.delivery_tag.clone()),
            optional(self.message_format),
            optional(self.settled),
            field(self.more),
            optional(self.rcv_settle_mode),
            optional(self.state.clone()),
            field(self.resume),
            field(self.aborted),
            field(self.batchable),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            handle: decoder.mandatory("handle")?,
            delivery_id: decoder.optional("delivery-id")?,
            delivery_tag: decoder.optional("delivery-tag")?,
            message_format: decoder.optional("message-format")?,
            settled: decoder.optional("settled")?,
            more: decoder.or_default("more", false)?,
            rcv_settle_mode: decoder.optional("rcv-settle-mode")?,
            state: decoder.optional("state")?,
            resume: decoder.or_default("resume", false)?,
            aborted: decoder.or_default("aborted", false)?,
            batchable: decoder.or_default("batchable", false)?,
        })
    }
}

/// 2.7.6 Disposition: update the state of a delivery range
///
/// <descriptor name="amqp:disposition:list" code="0x00000000:0x00000015"/>
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    /// Which role's deliveries the range names
    pub role: Role,

    /// First delivery id in the range
    pub first: DeliveryNumber,

    /// Last delivery id; absent means `first` alone
    pub last: Option<DeliveryNumber>,

    /// The deliveries are settled at the informing peer
    pub settled: bool,

    /// The new delivery state
    pub state: Option<DeliveryState>,

    /// The peer may batch the acknowledgement
    pub batchable: bool,
}

impl Composite for Disposition {
    const NAME: &'static str = "amqp:disposition:list";
    const CODE: u64 = 0x0000_0000_0000_0015;

    fn to_list(&self) -> Vec<Value> {
        vec![
            field(self.role),
            field(self.first),
            optional(self.last),
            field(self.settled),
            optional(self.state.clone()),
            field(self.batchable),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            role: decoder.mandatory("role")?,
            first: decoder.mandatory("first")?,
            last: decoder.optional("last")?,
            settled: decoder.or_default("settled", false)?,
            state: decoder.optional("state")?,
            batchable: decoder.or_default("batchable", false)?,
        })
    }
}

/// 2.7.7 Detach: detach a link from a session
///
/// <descriptor name="amqp:detach:list" code="0x00000000:0x00000016"/>
#[derive(Debug, Clone, PartialEq)]
pub struct Detach {
    /// The link being detached
    pub handle: Handle,

    /// The link is being destroyed, not suspended
    pub closed: bool,

    /// Why the link detached
    pub error: Option<Error>,
}

impl Composite for Detach {
    const NAME: &'static str = "amqp:detach:list";
    const CODE: u64 = 0x0000_0000_0000_0016;

    fn to_list(&self) -> Vec<Value> {
        vec![
            field(self.handle),
            field(self.closed),
            optional(self.error.clone()),
        ]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            handle: decoder.mandatory("handle")?,
            closed: decoder.or_default("closed", false)?,
            error: decoder.optional("error")?,
        })
    }
}

/// 2.7.8 End: end a session
///
/// <descriptor name="amqp:end:list" code="0x00000000:0x00000017"/>
#[derive(Debug, Clone, Default, PartialEq)]
pub struct End {
    /// Why the session ended
    pub error: Option<Error>,
}

impl Composite for End {
    const NAME: &'static str = "amqp:end:list";
    const CODE: u64 = 0x0000_0000_0000_0017;

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

/// 2.7.9 Close: close the connection
///
/// <descriptor name="amqp:close:list" code="0x00000000:0x00000018"/>
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Close {
    /// Why the connection closed
    pub error: Option<Error>,
}

impl Composite for Close {
    const NAME: &'static str = "amqp:close:list";
    const CODE: u64 = 0x0000_0000_0000_0018;

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

/// One performative, dispatched exhaustively by every layer
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    /// Connection open handshake
    Open(Open),
    /// Session begin handshake
    Begin(Begin),
    /// Link attach handshake
    Attach(Attach),
    /// Flow control update
    Flow(Flow),
    /// Delivery fragment
    Transfer(Transfer),
    /// Delivery state update
    Disposition(Disposition),
    /// Link detach handshake
    Detach(Detach),
    /// Session end handshake
    End(End),
    /// Connection close handshake
    Close(Close),
}

impl Performative {
    /// The descriptor symbol of the wrapped body
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => Open::NAME,
            Performative::Begin(_) => Begin::NAME,
            Performative::Attach(_) => Attach::NAME,
            Performative::Flow(_) => Flow::NAME,
            Performative::Transfer(_) => Transfer::NAME,
            Performative::Disposition(_) => Disposition::NAME,
            Performative::Detach(_) => Detach::NAME,
            Performative::End(_) => End::NAME,
            Performative::Close(_) => Close::NAME,
        }
    }

    /// Serializes the body to its described-list value
    pub fn to_value(&self) -> Value {
        match self {
            Performative::Open(b) => b.to_value(),
            Performative::Begin(b) => b.to_value(),
            Performative::Attach(b) => b.to_value(),
            Performative::Flow(b) => b.to_value(),
            Performative::Transfer(b) => b.to_value(),
            Performative::Disposition(b) => b.to_value(),
            Performative::Detach(b) => b.to_value(),
            Performative::End(b) => b.to_value(),
            Performative::Close(b) => b.to_value(),
        }
    }

    /// Dispatches a decoded value on its descriptor
    pub fn from_value(value: Value) -> Result<Self, BindError> {
        let descriptor = match value.as_described() {
            Some(described) => described.descriptor.clone(),
            None => {
                return Err(BindError::NotComposite {
                    expected: "performative",
                })
            }
        };
        if Open::descriptor_matches(&descriptor) {
            <Open as Composite>::from_value(value).map(Performative::Open)
        } else if Begin::descriptor_matches(&descriptor) {
            <Begin as Composite>::from_value(value).map(Performative::Begin)
        } else if Attach::descriptor_matches(&descriptor) {
            <Attach as Composite>::from_value(value).map(Performative::Attach)
        } else if Flow::descriptor_matches(&descriptor) {
            <Flow as Composite>::from_value(value).map(Performative::Flow)
        } else if Transfer::descriptor_matches(&descriptor) {
            <Transfer as Composite>::from_value(value).map(Performative::Transfer)
        } else if Disposition::descriptor_matches(&descriptor) {
            <Disposition as Composite>::from_value(value).map(Performative::Disposition)
        } else if Detach::descriptor_matches(&descriptor) {
            <Detach as Composite>::from_value(value).map(Performative::Detach)
        } else if End::descriptor_matches(&descriptor) {
            <End as Composite>::from_value(value).map(Performative::End)
        } else if Close::descriptor_matches(&descriptor) {
            <Close as Composite>::from_value(value).map(Performative::Close)
        } else {
            Err(BindError::UnknownDescriptor(descriptor.to_string()))
        }
    }
}

macro_rules! impl_from_performative {
    ($($body:ident),*) => {
        $(
            impl From<$body> for Performative {
                fn from(body: $body) -> Self {
                    Performative::$body(body)
                }
            }
        )*
    };
}

impl_from_performative!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Target;
    use hematite_codec::Binary;

    fn round_trip(performative: Performative) {
        let value = performative.to_value();
        let bytes = hematite_codec::encode(&value).unwrap();
        let decoded = hematite_codec::decode_exact(&bytes).unwrap();
        assert_eq!(Performative::from_value(decoded).unwrap(), performative);
    }

    #[test]
    fn open_round_trip() {
        let mut open = Open::new("container-a");
        open.hostname = Some("localhost".into());
        open.max_frame_size = 512;
        open.idle_time_out = Some(30_000);
        round_trip(Performative::Open(open));
    }

    #[test]
    fn begin_round_trip() {
        round_trip(Performative::Begin(Begin {
            remote_channel: Some(0),
            next_outgoing_id: 0,
            incoming_window: 65536,
            outgoing_window: 65536,
            handle_max: Handle::default(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }));
    }

    #[test]
    fn attach_round_trip_with_unsettled() {
        let mut unsettled = UnsettledMap::new();
        unsettled.insert(Binary::from("0"), Some(DeliveryState::accepted()));
        round_trip(Performative::Attach(Attach {
            name: "sender-1".into(),
            handle: Handle(0),
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Box::new(Source::with_address("q"))),
            target: Some(Box::new(Target::with_address("q").into())),
            unsettled: Some(unsettled),
            incomplete_unsettled: false,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }));
    }

    #[test]
    fn transfer_round_trip() {
        round_trip(Performative::Transfer(Transfer {
            handle: Handle(0),
            delivery_id: Some(0),
            delivery_tag: Some(Binary::from("0")),
            message_format: Some(0),
            settled: Some(false),
            more: true,
            ..Default::default()
        }));
    }

    #[test]
    fn disposition_round_trip() {
        round_trip(Performative::Disposition(Disposition {
            role: Role::Receiver,
            first: 0,
            last: Some(4),
            settled: true,
            state: Some(DeliveryState::accepted()),
            batchable: false,
        }));
    }

    #[test]
    fn handshake_bodies_round_trip() {
        round_trip(Performative::Flow(Flow {
            incoming_window: 1024,
            next_outgoing_id: 3,
            outgoing_window: 1024,
            handle: Some(Handle(0)),
            link_credit: Some(5),
            drain: true,
            ..Default::default()
        }));
        round_trip(Performative::Detach(Detach {
            handle: Handle(1),
            closed: true,
            error: None,
        }));
        round_trip(Performative::End(End { error: None }));
        round_trip(Performative::Close(Close {
            error: Some(Error::new(
                crate::definitions::AmqpError::NotAllowed,
                "double open",
            )),
        }));
    }

    #[test]
    fn defaults_apply_when_fields_are_trimmed() {
        let flow = Flow {
            incoming_window: 10,
            next_outgoing_id: 0,
            outgoing_window: 10,
            ..Default::default()
        };
        let value = flow.to_value();
        let decoded = <Flow as Composite>::from_value(value).unwrap();
        assert!(!decoded.drain);
        assert!(!decoded.echo);
        assert_eq!(decoded.handle, None);
    }
}
