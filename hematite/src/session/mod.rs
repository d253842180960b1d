//! Session state machine: begin/end handshake, delivery-id windows,
//! handle dispatch, disposition fan-out, and flow reconciliation.
//!
//! The session owns its links and both delivery maps. Links queue their
//! own outputs; `tick` merges them into the session's frame queue,
//! filling in the fields only the session knows. The connection drains
//! that queue and stamps channels.

pub(crate) mod window;

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use hematite_types::definitions::{
    Error as WireError, Handle, Role, SequenceNo, SessionError as SessionCondition,
    TransferNumber,
};
use hematite_types::performatives::{
    Attach, Begin, Detach, Disposition, End, Flow, Transfer,
};
use hematite_types::states::SessionState;
use slab::Slab;
use thiserror::Error;

use crate::frames::FrameBody;
use crate::link::{Delivery, LinkEndpoint, LinkError, LinkOptions, LinkOutput};

pub use window::WindowPolicy;
use window::DeliveryMap;

/// Default incoming window, in transfer frames
pub const DEFAULT_WINDOW: u32 = 65536;

/// Payload headroom reserved for the frame header and performative
const TRANSFER_OVERHEAD: u32 = 64;

/// Session-fatal failures; the session is ended with an error body
#[derive(Debug, Error)]
pub enum SessionError {
    /// Begin after begin
    #[error("double begin")]
    DoubleBegin,

    /// End after end
    #[error("double end")]
    DoubleEnd,

    /// A frame referenced a handle no link is attached to
    #[error("unattached handle {0}")]
    UnattachedHandle(u32),

    /// An attach arrived on a handle already in use
    #[error("handle {0} already in use")]
    HandleInUse(u32),

    /// An attach arrived for a link name already attached
    #[error("double attach for link '{0}'")]
    DoubleAttach(String),

    /// Incoming transfer skipped a delivery id
    #[error("transfer id gap: got {got}, expected {expected}")]
    TransferIdGap {
        /// Id on the wire
        got: TransferNumber,
        /// Id the window expected
        expected: TransferNumber,
    },

    /// Incoming transfer exceeded the advertised window
    #[error("incoming window violated")]
    WindowViolation,

    /// A duplicate link name on attach from this side
    #[error("link name '{0}' already in use")]
    DuplicateLinkName(String),
}

impl SessionError {
    /// The error body for the End frame this failure provokes
    pub fn to_wire(&self) -> WireError {
        let condition = match self {
            SessionError::UnattachedHandle(_) => SessionCondition::UnattachedHandle,
            SessionError::HandleInUse(_) | SessionError::DoubleAttach(_) => {
                SessionCondition::HandleInUse
            }
            SessionError::TransferIdGap { .. } | SessionError::WindowViolation => {
                SessionCondition::WindowViolation
            }
            _ => SessionCondition::ErrantLink,
        };
        WireError::new(condition, self.to_string())
    }
}

/// One session endpoint
#[derive(Debug)]
pub struct Session {
    /// Our channel on the connection
    pub channel: u16,

    /// The channel the peer runs this session on
    pub remote_channel: Option<u16>,

    begin_sent: bool,
    begin_rcvd: bool,
    end_sent: bool,
    end_rcvd: bool,

    /// Negotiated connection max-frame-size, pushed down on open
    pub(crate) max_frame_size: u32,

    // frame-level transfer ids
    next_outgoing_id: TransferNumber,
    next_incoming_id: TransferNumber,

    incoming_window: u32,
    window_policy: WindowPolicy,
    outgoing_window: u32,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,
    flow_modified: bool,

    links: Slab<LinkEndpoint>,
    links_by_name: HashMap<String, usize>,
    remote_handles: HashMap<u32, usize>,

    incoming_deliveries: DeliveryMap,
    outgoing_deliveries: DeliveryMap,

    /// Link slots in completed-delivery arrival order
    arrival: VecDeque<usize>,

    output: VecDeque<FrameBody>,
}

impl Session {
    pub(crate) fn new(channel: u16) -> Self {
        Self {
            channel,
            remote_channel: None,
            begin_sent: false,
            begin_rcvd: false,
            end_sent: false,
            end_rcvd: false,
            max_frame_size: u32::MAX,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            incoming_window: DEFAULT_WINDOW,
            window_policy: WindowPolicy::Sliding,
            outgoing_window: DEFAULT_WINDOW,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            flow_modified: false,
            links: Slab::new(),
            links_by_name: HashMap::new(),
            remote_handles: HashMap::new(),
            incoming_deliveries: DeliveryMap::new(0),
            outgoing_deliveries: DeliveryMap::new(0),
            arrival: VecDeque::new(),
            output: VecDeque::new(),
        }
    }

    // -- handshake --

    /// The peer began and we have not answered
    pub fn beginning(&self) -> bool {
        self.begin_rcvd && !self.begin_sent
    }

    /// The peer ended and we have not answered
    pub fn ending(&self) -> bool {
        self.end_rcvd && !self.end_sent
    }

    /// Both begins seen, no end yet
    pub fn mapped(&self) -> bool {
        self.begin_sent && self.begin_rcvd && !(self.end_sent || self.end_rcvd)
    }

    /// Both ends seen
    pub fn ended(&self) -> bool {
        self.end_sent && self.end_rcvd
    }

    /// The handshake state as an enum, for diagnostics
    pub fn state(&self) -> SessionState {
        match (self.begin_sent, self.begin_rcvd, self.end_sent, self.end_rcvd) {
            (false, false, _, _) => SessionState::Unmapped,
            (true, false, _, _) => SessionState::BeginSent,
            (false, true, _, _) => SessionState::BeginReceived,
            (true, true, false, false) => SessionState::Mapped,
            (true, true, true, false) => SessionState::EndSent,
            (true, true, false, true) => SessionState::EndReceived,
            (true, true, true, true) => SessionState::Unmapped,
        }
    }

    /// Sends our Begin
    pub fn begin(&mut self) -> Result<(), SessionError> {
        if self.begin_sent {
            return Err(SessionError::DoubleBegin);
        }
        self.output.push_back(FrameBody::from_performative(Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: Handle::default(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }));
        self.begin_sent = true;
        Ok(())
    }

    pub(crate) fn handle_begin(&mut self, begin: Begin) -> Result<(), SessionError> {
        if self.begin_rcvd {
            return Err(SessionError::DoubleBegin);
        }
        self.begin_rcvd = true;
        self.next_incoming_id = begin.next_outgoing_id;
        self.incoming_deliveries.rebase(begin.next_outgoing_id);
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;
        Ok(())
    }

    /// Sends our End; pending link work is flushed first
    pub fn end(&mut self, error: Option<WireError>) -> Result<(), SessionError> {
        if self.end_sent {
            return Err(SessionError::DoubleEnd);
        }
        self.tick();
        self.output
            .push_back(FrameBody::from_performative(End { error }));
        self.end_sent = true;
        Ok(())
    }

    pub(crate) fn handle_end(&mut self, _end: End) -> Result<(), SessionError> {
        if self.end_rcvd {
            return Err(SessionError::DoubleEnd);
        }
        self.end_rcvd = true;
        Ok(())
    }

    // -- window configuration --

    /// Sets the incoming window and its refill policy; the change is
    /// echoed in a Flow on the next tick
    pub fn set_incoming_window(&mut self, window: u32, policy: WindowPolicy) {
        self.incoming_window = window;
        self.window_policy = policy;
        self.flow_modified = true;
    }

    /// Frames the peer may still send us before stalling
    pub fn incoming_window(&self) -> u32 {
        self.incoming_window
    }

    /// Frames we may still send before the peer stalls us
    pub fn outgoing_window(&self) -> u32 {
        self.remote_incoming_window
    }

    // -- links --

    /// Attaches a new sender link
    pub fn attach_sender(
        &mut self,
        name: impl Into<String>,
        options: LinkOptions,
    ) -> Result<usize, SessionError> {
        self.attach_local(name.into(), Role::Sender, options)
    }

    /// Attaches a new receiver link
    pub fn attach_receiver(
        &mut self,
        name: impl Into<String>,
        options: LinkOptions,
    ) -> Result<usize, SessionError> {
        self.attach_local(name.into(), Role::Receiver, options)
    }

    fn attach_local(
        &mut self,
        name: String,
        role: Role,
        options: LinkOptions,
    ) -> Result<usize, SessionError> {
        if self.links_by_name.contains_key(&name) {
            return Err(SessionError::DuplicateLinkName(name));
        }
        let entry = self.links.vacant_entry();
        let slot = entry.key();
        let mut link = LinkEndpoint::new(name.clone(), role, Handle(slot as u32), options);
        link.attach().expect("fresh link attaches");
        entry.insert(link);
        self.links_by_name.insert(name, slot);
        Ok(slot)
    }

    /// The link at `slot`
    pub fn link_mut(&mut self, slot: usize) -> Option<&mut LinkEndpoint> {
        self.links.get_mut(slot)
    }

    /// The link at `slot`
    pub fn link(&self, slot: usize) -> Option<&LinkEndpoint> {
        self.links.get(slot)
    }

    /// Looks a link up by name
    pub fn link_by_name(&self, name: &str) -> Option<usize> {
        self.links_by_name.get(name).copied()
    }

    /// Slots of every live link
    pub fn link_slots(&self) -> Vec<usize> {
        self.links.iter().map(|(slot, _)| slot).collect()
    }

    /// Removes a fully-detached link
    pub fn remove_link(&mut self, slot: usize) {
        if self.links.contains(slot) {
            let link = self.links.remove(slot);
            self.links_by_name.remove(&link.name);
            self.remote_handles.retain(|_, s| *s != slot);
        }
    }

    pub(crate) fn handle_attach(&mut self, attach: Attach) -> Result<(), SessionError> {
        let remote_handle = attach.handle.0;
        if self.remote_handles.contains_key(&remote_handle) {
            return Err(SessionError::HandleInUse(remote_handle));
        }
        let slot = match self.links_by_name.get(&attach.name) {
            Some(slot) => {
                let link = &self.links[*slot];
                if link.attached() {
                    return Err(SessionError::DoubleAttach(attach.name));
                }
                *slot
            }
            None => {
                // first attach in their direction: make the opposite end
                let entry = self.links.vacant_entry();
                let slot = entry.key();
                let link = LinkEndpoint::new(
                    attach.name.clone(),
                    attach.role.flip(),
                    Handle(slot as u32),
                    LinkOptions::default(),
                );
                entry.insert(link);
                self.links_by_name.insert(attach.name.clone(), slot);
                slot
            }
        };
        self.remote_handles.insert(remote_handle, slot);
        self.links[slot].handle_attach(attach);
        Ok(())
    }

    pub(crate) fn handle_detach(&mut self, detach: Detach) -> Result<(), SessionError> {
        let remote_handle = detach.handle.0;
        let slot = self
            .remote_handles
            .remove(&remote_handle)
            .ok_or(SessionError::UnattachedHandle(remote_handle))?;
        self.links[slot].handle_detach(detach);
        Ok(())
    }

    pub(crate) fn handle_flow(&mut self, flow: Flow) -> Result<(), SessionError> {
        self.next_incoming_id = flow.next_outgoing_id;
        self.remote_outgoing_window = flow.outgoing_window;
        // remote-incoming-window follows the peer's view of our ids
        self.remote_incoming_window = flow
            .next_incoming_id
            .unwrap_or(0)
            .wrapping_add(flow.incoming_window)
            .wrapping_sub(self.next_outgoing_id);

        if let Some(handle) = flow.handle {
            let slot = self
                .remote_handles
                .get(&handle.0)
                .copied()
                .ok_or(SessionError::UnattachedHandle(handle.0))?;
            self.links[slot].handle_flow(
                flow.delivery_count,
                flow.link_credit,
                flow.available,
                flow.drain,
                flow.echo,
            );
        } else if flow.echo {
            self.flow_modified = true;
        }
        Ok(())
    }

    pub(crate) fn handle_transfer(
        &mut self,
        transfer: Transfer,
        payload: Bytes,
    ) -> Result<(), SessionError> {
        let slot = self
            .remote_handles
            .get(&transfer.handle.0)
            .copied()
            .ok_or(SessionError::UnattachedHandle(transfer.handle.0))?;

        if self.incoming_window == 0 {
            return Err(SessionError::WindowViolation);
        }
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        self.remote_outgoing_window = self.remote_outgoing_window.saturating_sub(1);
        if self.window_policy == WindowPolicy::Fixed {
            self.incoming_window -= 1;
        }

        let link = &mut self.links[slot];

        // an empty resuming transfer settles a delivery that survived
        // reattach without re-sending its payload
        if transfer.resume && transfer.settled == Some(true) && !link.mid_delivery() {
            let expected = self.incoming_deliveries.next_id();
            let id = transfer.delivery_id.unwrap_or(expected);
            if id != expected {
                return Err(SessionError::TransferIdGap { got: id, expected });
            }
            if let Some(tag) = transfer.delivery_tag.clone() {
                let _ = self.incoming_deliveries.record(id, slot, tag.clone());
                self.incoming_deliveries.settle(id);
                link.handle_resume_settle(&tag, transfer.state.clone());
            }
            return Ok(());
        }

        let id = if link.mid_delivery() {
            self.incoming_deliveries.next_id().wrapping_sub(1)
        } else {
            let expected = self.incoming_deliveries.next_id();
            let id = transfer.delivery_id.unwrap_or(expected);
            if id != expected {
                return Err(SessionError::TransferIdGap { got: id, expected });
            }
            let Some(tag) = transfer.delivery_tag.clone() else {
                // a first fragment with no tag is fatal to the link only
                let wire = LinkError::MissingDeliveryTag.to_wire();
                let _ = link.detach(true, Some(wire));
                return Ok(());
            };
            self.incoming_deliveries
                .record(id, slot, tag)
                .map_err(|expected| SessionError::TransferIdGap { got: id, expected })?;
            id
        };

        match link.handle_transfer(transfer, id, payload) {
            Ok(Some((_tag, settled))) => {
                self.arrival.push_back(slot);
                if settled {
                    // pre-settled deliveries never wait in the map
                    self.incoming_deliveries.settle(id);
                }
                if self.window_policy == WindowPolicy::Sliding {
                    // refill by one per delivery accepted
                    self.flow_modified = true;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                // link failures detach the link, not the session
                let wire = err.to_wire();
                let _ = link.detach(true, Some(wire));
                Ok(())
            }
        }
    }

    pub(crate) fn handle_disposition(&mut self, disposition: Disposition) -> Result<(), SessionError> {
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        // the range names deliveries of the role the peer holds
        let map = match disposition.role {
            Role::Receiver => &mut self.outgoing_deliveries,
            Role::Sender => &mut self.incoming_deliveries,
        };
        for (id, slot, tag) in map.range(first, last) {
            if let Some(link) = self.links.get_mut(slot) {
                let removed = link.handle_disposition(
                    &tag,
                    disposition.state.clone(),
                    disposition.settled,
                );
                if removed {
                    map.settle(id);
                }
            }
        }
        Ok(())
    }

    // -- delivery order --

    /// The link holding the oldest undrained in-order delivery
    pub fn next_receiver(&mut self) -> Option<usize> {
        while let Some(slot) = self.arrival.pop_front() {
            if self
                .links
                .get(slot)
                .map(|link| link.pending() > 0)
                .unwrap_or(false)
            {
                return Some(slot);
            }
        }
        None
    }

    /// Pops the oldest in-order delivery across all links
    pub fn next_delivery(&mut self) -> Option<(usize, Delivery)> {
        let slot = self.next_receiver()?;
        let delivery = self.links[slot].get()?;
        Some((slot, delivery))
    }

    // -- tick --

    /// Flushes link handshakes, transfers under credit and window,
    /// coalesced dispositions, and any pending session flow
    pub fn tick(&mut self) {
        if self.flow_modified && self.begin_sent && !self.end_sent {
            self.flow_modified = false;
            let flow = self.session_flow(None);
            self.output.push_back(FrameBody::from_performative(flow));
        }

        let slots: Vec<usize> = self.links.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            self.tick_link(slot);
        }
    }

    fn tick_link(&mut self, slot: usize) {
        // handshakes first
        let mut handshakes = Vec::new();
        {
            let link = match self.links.get_mut(slot) {
                Some(link) => link,
                None => return,
            };
            for item in link.take_output() {
                match item {
                    LinkOutput::Attach(attach) => {
                        handshakes.push(FrameBody::from_performative(attach));
                    }
                    LinkOutput::Detach(detach) => {
                        handshakes.push(FrameBody::from_performative(detach));
                    }
                }
            }
        }
        self.output.extend(handshakes);

        // transfers, bounded by the peer's incoming window
        let max_payload = self
            .max_frame_size
            .saturating_sub(TRANSFER_OVERHEAD)
            .max(TRANSFER_OVERHEAD) as usize;
        loop {
            if self.remote_incoming_window == 0 {
                break;
            }
            let outgoing = &mut self.outgoing_deliveries;
            let link = match self.links.get_mut(slot) {
                Some(link) => link,
                None => return,
            };
            let next = link.next_transfer(max_payload, |tag| outgoing.assign(slot, tag.clone()));
            let Some((transfer, chunk)) = next else { break };
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
            self.remote_incoming_window -= 1;
            let settled_done = !transfer.more && transfer.settled == Some(true);
            let id = transfer.delivery_id;
            self.output.push_back(FrameBody::Performative {
                performative: transfer.into(),
                payload: chunk,
            });
            if settled_done {
                if let Some(id) = id {
                    self.outgoing_deliveries.settle(id);
                }
            }
        }

        // coalesced dispositions
        let (groups, settled_ids, role) = {
            let (links, incoming, outgoing) = (
                &mut self.links,
                &mut self.incoming_deliveries,
                &mut self.outgoing_deliveries,
            );
            let link = match links.get_mut(slot) {
                Some(link) => link,
                None => return,
            };
            let role = link.role;
            let map = match role {
                Role::Sender => outgoing,
                Role::Receiver => incoming,
            };
            let (groups, settled_ids) = link.collect_dispositions(|tag| map.id_of(slot, tag));
            (groups, settled_ids, role)
        };
        for id in settled_ids {
            match role {
                Role::Sender => self.outgoing_deliveries.settle(id),
                Role::Receiver => self.incoming_deliveries.settle(id),
            }
        }
        for group in groups {
            self.output.push_back(FrameBody::from_performative(Disposition {
                role: group.role,
                first: group.first,
                last: (group.last != group.first).then_some(group.last),
                settled: group.settled,
                state: group.state,
                batchable: false,
            }));
        }

        // link flow last, with up-to-date counts
        let pending_flow = self.links.get_mut(slot).and_then(|link| {
            let handle = link.handle;
            link.take_flow().map(|link_flow| (handle, link_flow))
        });
        if let Some((handle, link_flow)) = pending_flow {
            let mut flow = self.session_flow(Some(handle));
            flow.delivery_count = link_flow.delivery_count;
            flow.link_credit = link_flow.link_credit;
            flow.available = link_flow.available;
            flow.drain = link_flow.drain;
            flow.echo = link_flow.echo;
            self.output.push_back(FrameBody::from_performative(flow));
        }
    }

    fn session_flow(&self, handle: Option<Handle>) -> Flow {
        Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            handle,
            delivery_count: None,
            link_credit: None,
            available: None,
            drain: false,
            echo: false,
            properties: None,
        }
    }

    /// Drains frames queued for the connection
    pub(crate) fn take_output(&mut self) -> impl Iterator<Item = FrameBody> + '_ {
        self.output.drain(..)
    }

    /// Count of deliveries still tracked in either window
    pub fn live_deliveries(&self) -> usize {
        self.incoming_deliveries.live() + self.outgoing_deliveries.live()
    }

    /// Low-water mark of the delivery map for the given role's
    /// deliveries
    pub fn unsettled_lwm(&self, role: Role) -> SequenceNo {
        match role {
            Role::Sender => self.outgoing_deliveries.lwm(),
            Role::Receiver => self.incoming_deliveries.lwm(),
        }
    }
}
