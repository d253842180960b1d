//! Link endpoints: attach/detach handshake, credit, transfer
//! fragmentation and reassembly, the unsettled map, and disposition
//! plumbing.
//!
//! A link never reaches for its session; it produces [`LinkOutput`]
//! items into its own queue and the session merges them on tick,
//! stamping the fields only the session knows (handles on flows,
//! delivery ids on transfers).

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use hematite_types::definitions::{
    DeliveryNumber, DeliveryTag, Error as AmqpLinkError, Handle, LinkError as LinkCondition,
    MessageFormat, ReceiverSettleMode, Role, SenderSettleMode, SequenceNo,
};
use hematite_types::messaging::{DeliveryState, Source, TargetArchetype, UnsettledMap};
use hematite_types::performatives::{Attach, Detach, Transfer};
use hematite_types::states::LinkState;
use indexmap::IndexMap;
use thiserror::Error;

/// Link-scoped failures; fatal to the link, not the session
#[derive(Debug, Error)]
pub enum LinkError {
    /// Attach while already attached
    #[error("already attached")]
    AlreadyAttached,

    /// Detach without an attach
    #[error("not attached")]
    NotAttached,

    /// Send without credit
    #[error("would block: no link credit")]
    WouldBlock,

    /// Transfer arrived with no credit outstanding
    #[error("transfer exceeds link credit")]
    TransferLimitExceeded,

    /// Continuation fragment changed delivery-tag mid-delivery
    #[error("fragment changed delivery-tag mid-delivery")]
    FragmentTagMismatch,

    /// Transfer on a receiver missing its delivery-tag
    #[error("first fragment carries no delivery-tag")]
    MissingDeliveryTag,
}

impl LinkError {
    /// The wire error body for a Detach carrying this failure
    pub fn to_wire(&self) -> AmqpLinkError {
        match self {
            LinkError::TransferLimitExceeded => {
                AmqpLinkError::new(LinkCondition::TransferLimitExceeded, self.to_string())
            }
            other => AmqpLinkError::new(LinkCondition::DetachForced, other.to_string()),
        }
    }
}

/// One side's view of a delivery: the state, whether that side settled,
/// and the bookkeeping flags
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideState {
    /// Last known delivery state
    pub state: Option<DeliveryState>,

    /// That side considers the delivery settled
    pub settled: bool,

    /// Changed since the last reconciliation pass
    pub modified: bool,

    /// Survived a detach/attach cycle
    pub resumed: bool,
}

/// The two views of one unsettled delivery
#[derive(Debug, Clone, Default)]
pub struct UnsettledEntry {
    /// Our view
    pub local: SideState,

    /// The peer's view
    pub remote: SideState,
}

/// A complete delivery handed out of a receiver
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag shared by every fragment
    pub tag: DeliveryTag,

    /// Session-scoped id
    pub id: DeliveryNumber,

    /// Reassembled payload
    pub payload: Bytes,

    /// The sender pre-settled it
    pub settled: bool,

    /// State the sender attached
    pub state: Option<DeliveryState>,

    /// Resumes an earlier unsettled delivery
    pub resume: bool,

    /// Payload format
    pub message_format: Option<MessageFormat>,
}

/// What a link wants sent, minus the session-level fields.
/// Flows travel separately via [`LinkEndpoint::take_flow`] so the
/// session can stamp its windows with up-to-date counts.
#[derive(Debug)]
pub enum LinkOutput {
    /// An attach for this link
    Attach(Attach),

    /// A detach for this link
    Detach(Detach),
}

/// The link-scoped fields of a Flow
#[derive(Debug, Clone, Default)]
pub struct LinkFlow {
    /// Sender's deliveries-seen count
    pub delivery_count: Option<SequenceNo>,

    /// Credit on offer
    pub link_credit: Option<u32>,

    /// Deliveries ready at the sender
    pub available: Option<u32>,

    /// Credit must be exhausted before pausing
    pub drain: bool,

    /// Ask the peer to echo
    pub echo: bool,
}

/// A delivery queued at a sender, not yet on the wire
#[derive(Debug)]
struct PendingDelivery {
    tag: DeliveryTag,
    payload: Bytes,
    settled: bool,
    state: Option<DeliveryState>,
    resume: bool,
    message_format: Option<MessageFormat>,
}

/// A delivery part-way through fragmentation
#[derive(Debug)]
struct InFlight {
    delivery: PendingDelivery,
    id: DeliveryNumber,
    remaining: Bytes,
    first_sent: bool,
}

/// A delivery part-way through reassembly
#[derive(Debug)]
struct Reassembly {
    tag: DeliveryTag,
    id: DeliveryNumber,
    payload: BytesMut,
    settled: bool,
    state: Option<DeliveryState>,
    resume: bool,
    message_format: Option<MessageFormat>,
}

/// Options when attaching a link
#[derive(Debug, Default, Clone)]
pub struct LinkOptions {
    /// Where deliveries originate
    pub source: Option<Source>,

    /// Where deliveries land
    pub target: Option<TargetArchetype>,

    /// Settlement policy of the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Settlement policy of the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    /// Unsettled deliveries carried over from a previous attach
    pub unsettled: UnsettledMap,
}

/// One end of a link
#[derive(Debug)]
pub struct LinkEndpoint {
    /// Link name, unique per container pair
    pub name: String,

    /// Our role
    pub role: Role,

    /// Our handle: the slot the session allocated
    pub handle: Handle,

    /// The handle the peer advertised
    pub remote_handle: Option<Handle>,

    /// Local terminus views
    pub source: Option<Source>,
    /// Local terminus views
    pub target: Option<TargetArchetype>,

    /// Peer terminus views
    pub remote_source: Option<Source>,
    /// Peer terminus views
    pub remote_target: Option<TargetArchetype>,

    /// Settlement policy of the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Settlement policy of the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    // handshake flags
    attach_sent: bool,
    attach_rcvd: bool,
    detach_sent: bool,
    detach_rcvd: bool,

    /// The peer detached with closed=true
    pub remote_closed: bool,

    /// We detached with closed=true
    pub local_closed: bool,

    // flow state; credit lives on the sender
    delivery_count: SequenceNo,
    link_credit: u32,
    available: u32,
    drain: bool,
    flow_modified: bool,

    /// `delivery-tag -> (local, remote)` state pairs
    pub unsettled: IndexMap<DeliveryTag, UnsettledEntry>,

    // sender side
    pending: VecDeque<PendingDelivery>,
    in_flight: Option<InFlight>,
    next_tag: u64,

    // receiver side
    reassembly: Option<Reassembly>,
    inbox: VecDeque<Delivery>,

    /// Deliveries the peer settled, awaiting terminus reconciliation
    peer_settled: Vec<(DeliveryTag, Option<DeliveryState>)>,

    output: VecDeque<LinkOutput>,
}

impl LinkEndpoint {
    pub(crate) fn new(name: String, role: Role, handle: Handle, options: LinkOptions) -> Self {
        let mut unsettled = IndexMap::new();
        for (tag, state) in options.unsettled {
            unsettled.insert(
                tag,
                UnsettledEntry {
                    local: SideState {
                        state,
                        settled: false,
                        modified: false,
                        resumed: true,
                    },
                    remote: SideState::default(),
                },
            );
        }
        Self {
            name,
            role,
            handle,
            remote_handle: None,
            source: options.source,
            target: options.target,
            remote_source: None,
            remote_target: None,
            snd_settle_mode: options.snd_settle_mode,
            rcv_settle_mode: options.rcv_settle_mode,
            attach_sent: false,
            attach_rcvd: false,
            detach_sent: false,
            detach_rcvd: false,
            remote_closed: false,
            local_closed: false,
            delivery_count: 0,
            link_credit: 0,
            available: 0,
            drain: false,
            flow_modified: false,
            unsettled,
            pending: VecDeque::new(),
            in_flight: None,
            next_tag: 0,
            reassembly: None,
            inbox: VecDeque::new(),
            peer_settled: Vec::new(),
            output: VecDeque::new(),
        }
    }

    // -- state queries, in the broker's vocabulary --

    /// The peer attached and we have not answered
    pub fn attaching(&self) -> bool {
        self.attach_rcvd && !self.attach_sent
    }

    /// The peer detached and we have not answered
    pub fn detaching(&self) -> bool {
        self.detach_rcvd && !self.detach_sent
    }

    /// Both attaches seen, no detach yet
    pub fn attached(&self) -> bool {
        self.attach_sent && self.attach_rcvd && !(self.detach_sent || self.detach_rcvd)
    }

    /// Both detaches seen
    pub fn detached(&self) -> bool {
        self.detach_sent && self.detach_rcvd
    }

    /// The handshake state as an enum, for diagnostics
    pub fn state(&self) -> LinkState {
        match (
            self.attach_sent,
            self.attach_rcvd,
            self.detach_sent,
            self.detach_rcvd,
        ) {
            (false, false, _, _) => LinkState::Detached,
            (true, false, _, _) => LinkState::AttachSent,
            (false, true, _, _) => LinkState::AttachReceived,
            (true, true, false, false) => LinkState::Attached,
            (true, true, true, false) => LinkState::DetachSent,
            (true, true, false, true) => LinkState::DetachReceived,
            (true, true, true, true) => LinkState::Detached,
        }
    }

    /// Credit not yet spoken for by queued deliveries
    pub fn capacity(&self) -> u32 {
        let committed = self.pending.len() + usize::from(self.in_flight.is_some());
        self.link_credit.saturating_sub(committed as u32)
    }

    /// Current credit
    pub fn credit(&self) -> u32 {
        self.link_credit
    }

    /// Sender's deliveries-seen count
    pub fn delivery_count(&self) -> SequenceNo {
        self.delivery_count
    }

    /// Deliveries reassembled and waiting in the receiver inbox
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    // -- handshake --

    /// Sends our attach; queues the initial flow intent for a receiver
    pub fn attach(&mut self) -> Result<(), LinkError> {
        if self.attach_sent && !self.detach_sent {
            return Err(LinkError::AlreadyAttached);
        }
        // re-attach after detach starts a fresh handshake
        if self.detach_sent && self.detach_rcvd {
            self.attach_sent = false;
            self.attach_rcvd = false;
            self.detach_sent = false;
            self.detach_rcvd = false;
            self.remote_closed = false;
        }

        let unsettled = self.unsettled_snapshot();
        let attach = Attach {
            name: self.name.clone(),
            handle: self.handle,
            role: self.role,
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            source: self.source.clone().map(Box::new),
            target: self.target.clone().map(Box::new),
            unsettled: if unsettled.is_empty() {
                None
            } else {
                Some(unsettled)
            },
            incomplete_unsettled: false,
            initial_delivery_count: match self.role {
                Role::Sender => Some(self.delivery_count),
                Role::Receiver => None,
            },
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.output.push_back(LinkOutput::Attach(attach));
        self.attach_sent = true;
        if self.role == Role::Receiver && self.link_credit > 0 {
            self.flow_modified = true;
        }
        Ok(())
    }

    /// The unsettled map we advertise on attach
    pub fn unsettled_snapshot(&self) -> UnsettledMap {
        self.unsettled
            .iter()
            .map(|(tag, entry)| (tag.clone(), entry.local.state.clone()))
            .collect()
    }

    pub(crate) fn handle_attach(&mut self, attach: Attach) {
        self.attach_rcvd = true;
        self.remote_handle = Some(attach.handle);
        self.remote_source = attach.source.map(|b| *b);
        self.remote_target = attach.target.map(|b| *b);
        if self.role == Role::Receiver {
            // the receiver adopts the sender's policy, its desired
            // receiver mode, and its count
            self.snd_settle_mode = attach.snd_settle_mode;
            self.rcv_settle_mode = attach.rcv_settle_mode;
            if let Some(count) = attach.initial_delivery_count {
                self.delivery_count = count;
            }
        } else {
            self.rcv_settle_mode = attach.rcv_settle_mode;
        }

        // fold the peer's surviving deliveries into our map
        if let Some(peer_unsettled) = attach.unsettled {
            for (tag, state) in peer_unsettled {
                let entry = self.unsettled.entry(tag).or_default();
                entry.remote.state = state;
                entry.remote.resumed = true;
                entry.local.resumed = true;
            }
        }
    }

    /// Sends our detach. Settled entries were pruned eagerly; unsettled
    /// entries stay behind for resumption.
    pub fn detach(&mut self, closed: bool, error: Option<AmqpLinkError>) -> Result<(), LinkError> {
        if !self.attach_sent || self.detach_sent {
            return Err(LinkError::NotAttached);
        }
        self.output.push_back(LinkOutput::Detach(Detach {
            handle: self.handle,
            closed,
            error,
        }));
        self.detach_sent = true;
        self.local_closed = closed;
        Ok(())
    }

    pub(crate) fn handle_detach(&mut self, detach: Detach) {
        self.detach_rcvd = true;
        self.remote_closed = detach.closed;
        self.remote_handle = None;
    }

    // -- flow, credit on the sender --

    pub(crate) fn handle_flow(
        &mut self,
        delivery_count: Option<SequenceNo>,
        link_credit: Option<u32>,
        available: Option<u32>,
        drain: bool,
        echo: bool,
    ) {
        match self.role {
            Role::Sender => {
                let receiver_count = delivery_count.unwrap_or(0);
                let credit = link_credit.unwrap_or(0);
                // credit = receiver.delivery-count + receiver.link-credit
                //          - sender.delivery-count
                self.link_credit = receiver_count
                    .wrapping_add(credit)
                    .wrapping_sub(self.delivery_count);
                self.drain = drain;
            }
            Role::Receiver => {
                // transfers on the wire were already counted on arrival;
                // only a count we have not seen (a drained sender)
                // consumes credit here
                if let Some(count) = delivery_count {
                    if crate::session::window::serial_lt(self.delivery_count, count) {
                        let seen = count.wrapping_sub(self.delivery_count);
                        self.link_credit = self.link_credit.saturating_sub(seen);
                        self.delivery_count = count;
                    }
                }
                self.available = available.unwrap_or(0);
            }
        }
        if echo {
            self.flow_modified = true;
        }
    }

    /// Receiver issues `n` more credits; `drain` asks the sender to
    /// exhaust them
    pub fn flow(&mut self, n: u32, drain: bool) {
        debug_assert_eq!(self.role, Role::Receiver);
        self.link_credit += n;
        self.drain = drain;
        self.flow_modified = true;
    }

    /// After the pending queue empties under drain, the sender burns the
    /// rest of its credit and echoes the drained count
    fn drained(&mut self) {
        if self.drain && self.capacity() > 0 {
            self.delivery_count = self.delivery_count.wrapping_add(self.capacity());
            self.link_credit = (self.pending.len() + usize::from(self.in_flight.is_some())) as u32;
            self.flow_modified = true;
        }
    }

    /// The pending flow frame for this link, if any
    pub(crate) fn take_flow(&mut self) -> Option<LinkFlow> {
        if !self.flow_modified || !self.attach_sent {
            return None;
        }
        self.flow_modified = false;
        Some(LinkFlow {
            delivery_count: Some(self.delivery_count),
            link_credit: Some(self.link_credit),
            available: match self.role {
                Role::Sender => Some((self.pending.len()
                    + usize::from(self.in_flight.is_some()))
                    as u32),
                Role::Receiver => None,
            },
            drain: self.drain,
            echo: false,
        })
    }

    // -- sending --

    /// Queues a delivery; the session fragments it under credit and
    /// window on tick. A missing tag is assigned from a counter.
    pub fn send(
        &mut self,
        payload: impl Into<Bytes>,
        tag: Option<DeliveryTag>,
        state: Option<DeliveryState>,
    ) -> Result<DeliveryTag, LinkError> {
        debug_assert_eq!(self.role, Role::Sender);
        if self.capacity() == 0 {
            return Err(LinkError::WouldBlock);
        }
        let tag = tag
            .unwrap_or_else(|| hematite_codec::Binary::from(format!("{}", self.next_tag).as_str()));
        self.next_tag += 1;
        let settled = self.snd_settle_mode == SenderSettleMode::Settled;
        let resume = self
            .unsettled
            .get(&tag)
            .map(|entry| entry.local.resumed)
            .unwrap_or(false);
        self.pending.push_back(PendingDelivery {
            tag: tag.clone(),
            payload: payload.into(),
            settled,
            state,
            resume,
            message_format: Some(0),
        });
        Ok(tag)
    }

    /// Deliveries the peer reports ready beyond its credit
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Produces the next transfer frame, at most `max_payload` bytes of
    /// payload, assigning a delivery id from `assign` for each new
    /// delivery. Returns `None` when out of work or credit.
    pub(crate) fn next_transfer(
        &mut self,
        max_payload: usize,
        mut assign: impl FnMut(&DeliveryTag) -> DeliveryNumber,
    ) -> Option<(Transfer, Bytes)> {
        if self.in_flight.is_none() {
            if self.link_credit == 0 {
                self.drained();
                return None;
            }
            let delivery = match self.pending.pop_front() {
                Some(d) => d,
                None => {
                    self.drained();
                    return None;
                }
            };
            // a delivery starts: count it and spend one credit
            self.delivery_count = self.delivery_count.wrapping_add(1);
            self.link_credit -= 1;
            let id = assign(&delivery.tag);
            let remaining = delivery.payload.clone();
            self.in_flight = Some(InFlight {
                delivery,
                id,
                remaining,
                first_sent: false,
            });
        }

        let flight = self.in_flight.as_mut().expect("in-flight delivery");
        let take = flight.remaining.len().min(max_payload.max(1));
        let chunk = flight.remaining.split_to(take);
        let more = !flight.remaining.is_empty();
        let first = !flight.first_sent;
        flight.first_sent = true;

        let transfer = Transfer {
            handle: self.handle,
            delivery_id: Some(flight.id),
            delivery_tag: Some(flight.delivery.tag.clone()),
            message_format: flight.delivery.message_format,
            settled: Some(flight.delivery.settled),
            more,
            rcv_settle_mode: None,
            state: if first {
                flight.delivery.state.clone()
            } else {
                None
            },
            resume: flight.delivery.resume,
            aborted: false,
            batchable: false,
        };

        if !more {
            let flight = self.in_flight.take().expect("in-flight delivery");
            if !flight.delivery.settled {
                let entry = self.unsettled.entry(flight.delivery.tag).or_default();
                entry.remote.state = flight.delivery.state;
            }
        }
        Some((transfer, chunk))
    }

    // -- receiving --

    /// True when a multi-fragment delivery is mid-reassembly
    pub(crate) fn mid_delivery(&self) -> bool {
        self.reassembly.is_some()
    }

    /// Accepts one transfer fragment. A completed delivery lands in the
    /// inbox; the tag and its pre-settled flag are reported back.
    pub(crate) fn handle_transfer(
        &mut self,
        transfer: Transfer,
        id: DeliveryNumber,
        payload: Bytes,
    ) -> Result<Option<(DeliveryTag, bool)>, LinkError> {
        debug_assert_eq!(self.role, Role::Receiver);

        if self.reassembly.is_none() {
            // a new delivery starts
            if self.link_credit == 0 {
                return Err(LinkError::TransferLimitExceeded);
            }
            self.delivery_count = self.delivery_count.wrapping_add(1);
            self.link_credit -= 1;
            let tag = transfer
                .delivery_tag
                .clone()
                .ok_or(LinkError::MissingDeliveryTag)?;
            self.reassembly = Some(Reassembly {
                tag,
                id,
                payload: BytesMut::new(),
                settled: transfer.settled.unwrap_or(false),
                state: transfer.state.clone(),
                resume: transfer.resume,
                message_format: transfer.message_format,
            });
        } else if let Some(tag) = &transfer.delivery_tag {
            let flight = self.reassembly.as_ref().expect("reassembly in progress");
            if tag != &flight.tag {
                return Err(LinkError::FragmentTagMismatch);
            }
        }

        let flight = self.reassembly.as_mut().expect("reassembly in progress");
        flight.payload.extend_from_slice(&payload);
        if transfer.settled == Some(true) {
            flight.settled = true;
        }

        if transfer.more {
            return Ok(None);
        }

        // more=false completes exactly one delivery
        let flight = self.reassembly.take().expect("reassembly in progress");
        let delivery = Delivery {
            tag: flight.tag.clone(),
            id: flight.id,
            payload: flight.payload.freeze(),
            settled: flight.settled,
            state: flight.state.clone(),
            resume: flight.resume,
            message_format: flight.message_format,
        };
        if !flight.settled {
            let entry = self.unsettled.entry(flight.tag.clone()).or_default();
            entry.remote.state = flight.state;
            entry.remote.settled = false;
        }
        self.inbox.push_back(delivery);
        Ok(Some((flight.tag, flight.settled)))
    }

    /// Pops the oldest reassembled delivery
    pub fn get(&mut self) -> Option<Delivery> {
        self.inbox.pop_front()
    }

    // -- settlement --

    /// Records a local state change; `settled=true` makes it terminal
    pub fn disposition(
        &mut self,
        tag: &DeliveryTag,
        state: Option<DeliveryState>,
        settled: bool,
    ) {
        if let Some(entry) = self.unsettled.get_mut(tag) {
            if entry.local.settled {
                return;
            }
            entry.local.state = state;
            entry.local.settled = settled;
            entry.local.modified = true;
        }
    }

    /// Settles locally; a second settle with no intervening transfer is
    /// a no-op
    pub fn settle(&mut self, tag: &DeliveryTag, state: Option<DeliveryState>) {
        let state = match (&state, self.unsettled.get(tag)) {
            (None, Some(entry)) => entry.local.state.clone(),
            _ => state,
        };
        self.disposition(tag, state, true);
    }

    /// The peer's disposition for one of our deliveries. Returns true
    /// when the entry was fully settled and removed.
    pub(crate) fn handle_disposition(
        &mut self,
        tag: &DeliveryTag,
        state: Option<DeliveryState>,
        settled: bool,
    ) -> bool {
        let Some(entry) = self.unsettled.get_mut(tag) else {
            return false;
        };
        entry.remote.state = state.clone();
        entry.remote.settled = settled;
        entry.remote.modified = true;
        if settled {
            // a settled delivery is never reopened; prune eagerly
            self.unsettled.shift_remove(tag);
            self.peer_settled.push((tag.clone(), state));
            return true;
        }
        false
    }

    /// The peer settled a resumed delivery with an empty resuming
    /// transfer; drop the entry without creating a delivery
    pub(crate) fn handle_resume_settle(&mut self, tag: &DeliveryTag, state: Option<DeliveryState>) {
        if self.role == Role::Receiver {
            // the transfer still counts against credit
            self.delivery_count = self.delivery_count.wrapping_add(1);
            self.link_credit = self.link_credit.saturating_sub(1);
        }
        if self.unsettled.shift_remove(tag).is_some() {
            self.peer_settled.push((tag.clone(), state));
        }
    }

    /// Deliveries the peer settled since the last call, for terminus
    /// reconciliation
    pub fn take_peer_settled(&mut self) -> Vec<(DeliveryTag, Option<DeliveryState>)> {
        std::mem::take(&mut self.peer_settled)
    }

    /// Remote-modified entries for the broker to reconcile; clears the
    /// modified marks
    pub fn take_remote_modified(&mut self) -> Vec<(DeliveryTag, SideState)> {
        let mut out = Vec::new();
        for (tag, entry) in self.unsettled.iter_mut() {
            if entry.remote.modified {
                entry.remote.modified = false;
                out.push((tag.clone(), entry.remote.clone()));
            }
        }
        out
    }

    /// Modified local entries grouped into contiguous-id ranges, one
    /// disposition body per `(settled, state)` group. Settled entries
    /// are removed; their ids are reported for the session map.
    pub(crate) fn collect_dispositions(
        &mut self,
        mut id_of: impl FnMut(&DeliveryTag) -> Option<DeliveryNumber>,
    ) -> (Vec<DispositionGroup>, Vec<DeliveryNumber>) {
        let mut changed: Vec<(DeliveryNumber, DeliveryTag, bool, Option<DeliveryState>)> =
            Vec::new();
        let mut resume_settles = Vec::new();
        for (tag, entry) in self.unsettled.iter_mut() {
            if entry.local.modified {
                entry.local.modified = false;
                match id_of(tag) {
                    Some(id) => changed.push((
                        id,
                        tag.clone(),
                        entry.local.settled,
                        entry.local.state.clone(),
                    )),
                    // a resumed delivery with no id in this session is
                    // settled with an empty resuming transfer instead
                    None if entry.local.resumed && entry.local.settled => {
                        resume_settles.push((tag.clone(), entry.local.state.clone()));
                    }
                    None => {}
                }
            }
        }
        for (tag, state) in resume_settles {
            self.unsettled.shift_remove(&tag);
            self.pending.push_back(PendingDelivery {
                tag,
                payload: Bytes::new(),
                settled: true,
                state,
                resume: true,
                message_format: Some(0),
            });
        }
        changed.sort_by_key(|(id, ..)| *id);

        let mut groups: Vec<DispositionGroup> = Vec::new();
        let mut settled_ids = Vec::new();
        for (id, tag, settled, state) in changed {
            if settled {
                settled_ids.push(id);
                self.unsettled.shift_remove(&tag);
            }
            match groups.last_mut() {
                Some(group)
                    if group.last.wrapping_add(1) == id
                        && group.settled == settled
                        && group.state == state =>
                {
                    group.last = id;
                }
                _ => groups.push(DispositionGroup {
                    role: self.role,
                    first: id,
                    last: id,
                    settled,
                    state,
                }),
            }
        }
        (groups, settled_ids)
    }
}

/// One coalesced disposition range
#[derive(Debug, Clone, PartialEq)]
pub struct DispositionGroup {
    /// Our role on the link
    pub role: Role,
    /// First id in the range
    pub first: DeliveryNumber,
    /// Last id in the range
    pub last: DeliveryNumber,
    /// The range is settled
    pub settled: bool,
    /// The new state
    pub state: Option<DeliveryState>,
}

impl LinkEndpoint {
    /// Drains queued handshake/flow outputs
    pub(crate) fn take_output(&mut self) -> impl Iterator<Item = LinkOutput> + '_ {
        self.output.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_codec::Binary;

    fn sender() -> LinkEndpoint {
        let mut link = LinkEndpoint::new(
            "snd".into(),
            Role::Sender,
            Handle(0),
            LinkOptions::default(),
        );
        link.attach().unwrap();
        link.handle_attach(Attach {
            name: "snd".into(),
            handle: Handle(0),
            role: Role::Receiver,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        });
        link
    }

    #[test]
    fn credit_reconciles_from_flow() {
        let mut link = sender();
        link.handle_flow(Some(0), Some(10), None, false, false);
        assert_eq!(link.credit(), 10);

        // peer re-advertises after we delivered three
        link.link_credit = 7;
        link.delivery_count = 3;
        link.handle_flow(Some(0), Some(10), None, false, false);
        assert_eq!(link.credit(), 7);
    }

    #[test]
    fn send_without_credit_blocks() {
        let mut link = sender();
        assert!(matches!(
            link.send("m", None, None),
            Err(LinkError::WouldBlock)
        ));
        link.handle_flow(Some(0), Some(1), None, false, false);
        link.send("m", None, None).unwrap();
        assert!(matches!(
            link.send("m2", None, None),
            Err(LinkError::WouldBlock)
        ));
    }

    #[test]
    fn default_tags_count_up_from_zero() {
        let mut link = sender();
        link.handle_flow(Some(0), Some(5), None, false, false);
        assert_eq!(link.send("a", None, None).unwrap(), Binary::from("0"));
        assert_eq!(link.send("b", None, None).unwrap(), Binary::from("1"));
    }

    #[test]
    fn fragmentation_shares_tag_and_ends_with_more_false() {
        let mut link = sender();
        link.handle_flow(Some(0), Some(1), None, false, false);
        link.send(Bytes::from(vec![7u8; 1000]), None, None).unwrap();

        let mut id = 41;
        let mut frames = Vec::new();
        while let Some((transfer, chunk)) = link.next_transfer(448, |_| {
            id += 1;
            id
        }) {
            frames.push((transfer, chunk));
        }
        assert_eq!(frames.len(), 3);
        assert!(frames[0].0.more && frames[1].0.more && !frames[2].0.more);
        let tags: Vec<_> = frames
            .iter()
            .map(|(t, _)| t.delivery_tag.clone().unwrap())
            .collect();
        assert!(tags.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(frames.iter().map(|(_, c)| c.len()).sum::<usize>(), 1000);
        // one delivery: one credit spent, one count
        assert_eq!(link.delivery_count(), 1);
        assert_eq!(link.credit(), 0);
    }

    #[test]
    fn drain_burns_remaining_credit_and_echoes() {
        let mut link = sender();
        link.handle_flow(Some(0), Some(5), None, true, false);
        assert_eq!(link.credit(), 5);
        assert!(link.next_transfer(512, |_| 0).is_none());
        assert_eq!(link.delivery_count(), 5);
        assert_eq!(link.credit(), 0);
        let flow = link.take_flow().expect("drained flow");
        assert_eq!(flow.delivery_count, Some(5));
        assert_eq!(flow.link_credit, Some(0));
        assert!(flow.drain);
    }

    fn receiver() -> LinkEndpoint {
        let mut link = LinkEndpoint::new(
            "rcv".into(),
            Role::Receiver,
            Handle(0),
            LinkOptions::default(),
        );
        link.attach().unwrap();
        link.attach_rcvd = true;
        link
    }

    #[test]
    fn receiver_reassembles_by_tag() {
        let mut link = receiver();
        link.flow(5, false);
        let tag = Binary::from("t");
        let fragment = |more: bool| Transfer {
            handle: Handle(0),
            delivery_id: Some(0),
            delivery_tag: Some(tag.clone()),
            more,
            ..Default::default()
        };
        assert_eq!(
            link.handle_transfer(fragment(true), 0, Bytes::from_static(b"he")).unwrap(),
            None
        );
        assert_eq!(
            link.handle_transfer(fragment(true), 0, Bytes::from_static(b"ll")).unwrap(),
            None
        );
        assert_eq!(
            link.handle_transfer(fragment(false), 0, Bytes::from_static(b"o")).unwrap(),
            Some((tag.clone(), false))
        );
        let delivery = link.get().unwrap();
        assert_eq!(&delivery.payload[..], b"hello");
        assert_eq!(link.pending(), 0);
        assert_eq!(link.credit(), 4);
        assert!(link.unsettled.contains_key(&tag));
    }

    #[test]
    fn transfer_without_credit_is_an_error() {
        let mut link = receiver();
        let transfer = Transfer {
            handle: Handle(0),
            delivery_tag: Some(Binary::from("t")),
            ..Default::default()
        };
        assert!(matches!(
            link.handle_transfer(transfer, 0, Bytes::new()),
            Err(LinkError::TransferLimitExceeded)
        ));
    }

    #[test]
    fn settlement_is_idempotent() {
        let mut link = receiver();
        link.flow(1, false);
        let transfer = Transfer {
            handle: Handle(0),
            delivery_tag: Some(Binary::from("t")),
            ..Default::default()
        };
        link.handle_transfer(transfer, 0, Bytes::from_static(b"x")).unwrap();

        let tag = Binary::from("t");
        link.settle(&tag, Some(DeliveryState::accepted()));
        let (groups, settled) = link.collect_dispositions(|_| Some(0));
        assert_eq!(groups.len(), 1);
        assert_eq!(settled, vec![0]);
        assert!(link.unsettled.is_empty());

        // second settle: no entry, no disposition
        link.settle(&tag, Some(DeliveryState::accepted()));
        let (groups, settled) = link.collect_dispositions(|_| Some(0));
        assert!(groups.is_empty() && settled.is_empty());
    }

    #[test]
    fn dispositions_coalesce_contiguous_ids() {
        let mut link = receiver();
        link.flow(10, false);
        for n in 0..5u32 {
            let transfer = Transfer {
                handle: Handle(0),
                delivery_tag: Some(Binary::from(format!("{n}").as_str())),
                ..Default::default()
            };
            link.handle_transfer(transfer, n, Bytes::from_static(b"x")).unwrap();
        }
        // settle 0,1,2 accepted and 4 released; 3 untouched
        for n in [0u32, 1, 2] {
            link.settle(
                &Binary::from(format!("{n}").as_str()),
                Some(DeliveryState::accepted()),
            );
        }
        link.settle(
            &Binary::from("4"),
            Some(DeliveryState::Released(Default::default())),
        );
        let (groups, _) = link.collect_dispositions(|tag| {
            std::str::from_utf8(tag).unwrap().parse().ok()
        });
        assert_eq!(groups.len(), 2);
        assert_eq!((groups[0].first, groups[0].last), (0, 2));
        assert_eq!((groups[1].first, groups[1].last), (4, 4));
    }

    #[test]
    fn peer_attach_unsettled_is_folded_in_with_resume_marks() {
        let mut link = sender();
        let mut peer = UnsettledMap::new();
        peer.insert(Binary::from("d1"), Some(DeliveryState::accepted()));
        link.handle_attach(Attach {
            name: "snd".into(),
            handle: Handle(9),
            role: Role::Receiver,
            snd_settle_mode: Default::default(),
            rcv_settle_mode: Default::default(),
            source: None,
            target: None,
            unsettled: Some(peer),
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        });
        let entry = link.unsettled.get(&Binary::from("d1")).unwrap();
        assert!(entry.local.resumed && entry.remote.resumed);
        assert_eq!(entry.remote.state, Some(DeliveryState::accepted()));
    }
}
