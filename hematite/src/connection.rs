//! Connection state machine: open/close handshake, channel
//! multiplexing, max-frame negotiation, and the tick that drains every
//! session's frames into one output queue.

use std::collections::HashMap;

use hematite_types::definitions::{
    AmqpError, ConnectionError as ConnectionCondition, Error as WireError, Milliseconds,
};
use hematite_types::performatives::{Begin, Close, End, Open, Performative};
use hematite_types::states::ConnectionState;
use slab::Slab;
use thiserror::Error;

use crate::frames::{Frame, FrameBody};
use crate::session::{Session, SessionError};

/// Connection-fatal failures; the connection is closed with an error
/// body and the socket follows
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Open after open
    #[error("double open")]
    DoubleOpen,

    /// Close after close
    #[error("double close")]
    DoubleClose,

    /// Begin on an incoming channel already bound to a session
    #[error("double begin on channel {0}")]
    DoubleBegin(u16),

    /// End for a channel with no session
    #[error("end for unknown channel {0}")]
    UnknownChannel(u16),

    /// A session-bound frame arrived on an unbound channel
    #[error("frame for unbound channel {0}")]
    UnboundChannel(u16),

    /// A frame arrived before the Open handshake allows it
    #[error("illegal frame before open")]
    IllegalState,

    /// Frames may not be posted after close-sent
    #[error("connection is closed")]
    Closed,

    /// The peer closed with an error
    #[error("peer closed connection: {0}")]
    PeerClosed(WireError),

    /// Authentication failed before the AMQP handshake
    #[error("authentication failed: {0}")]
    AuthenticationFailed(u8),
}

impl ConnectionError {
    /// The error body for the Close frame this failure provokes
    pub fn to_wire(&self) -> WireError {
        match self {
            ConnectionError::DoubleOpen | ConnectionError::DoubleClose => {
                WireError::new(AmqpError::NotAllowed, self.to_string())
            }
            ConnectionError::DoubleBegin(_)
            | ConnectionError::UnknownChannel(_)
            | ConnectionError::UnboundChannel(_)
            | ConnectionError::IllegalState => {
                WireError::new(ConnectionCondition::FramingError, self.to_string())
            }
            _ => WireError::new(ConnectionCondition::ConnectionForced, self.to_string()),
        }
    }
}

/// Local parameters for the Open handshake
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Our container id
    pub container_id: String,

    /// Proposed maximum frame size
    pub max_frame_size: u32,

    /// Highest channel number we accept
    pub channel_max: u16,

    /// Idle timeout we ask the peer to honor
    pub idle_time_out: Option<Milliseconds>,

    /// Hostname for the Open frame
    pub hostname: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            container_id: uuid::Uuid::new_v4().to_string(),
            max_frame_size: u32::MAX,
            channel_max: 65535,
            idle_time_out: None,
            hostname: None,
        }
    }
}

impl ConnectionOptions {
    /// Options for a named container
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            ..Default::default()
        }
    }
}

/// One connection endpoint and its sessions
#[derive(Debug)]
pub struct Connection {
    options: ConnectionOptions,

    open_sent: bool,
    open_rcvd: bool,
    close_sent: bool,
    close_rcvd: bool,

    /// The peer's Open, once seen
    pub remote_open: Option<Open>,

    sessions: Slab<Session>,
    /// Incoming channel -> session slot
    incoming_channels: HashMap<u16, usize>,

    output: Vec<Frame>,
}

impl Connection {
    /// A fresh connection; nothing is sent until [`open`](Self::open)
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            open_sent: false,
            open_rcvd: false,
            close_sent: false,
            close_rcvd: false,
            remote_open: None,
            sessions: Slab::new(),
            incoming_channels: HashMap::new(),
            output: Vec::new(),
        }
    }

    /// Our container id
    pub fn container_id(&self) -> &str {
        &self.options.container_id
    }

    /// The peer's container id, once its Open arrives
    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote_open.as_ref().map(|open| open.container_id.as_str())
    }

    /// min(local, peer) once both Opens are seen, else the local value
    pub fn max_frame_size(&self) -> u32 {
        match &self.remote_open {
            Some(open) => self.options.max_frame_size.min(open.max_frame_size),
            None => self.options.max_frame_size,
        }
    }

    // -- state queries --

    /// The peer opened and we have not answered
    pub fn opening(&self) -> bool {
        self.open_rcvd && !self.open_sent
    }

    /// Both opens seen, no close yet
    pub fn opened(&self) -> bool {
        self.open_sent && self.open_rcvd && !(self.close_sent || self.close_rcvd)
    }

    /// The peer closed and we have not answered
    pub fn closing(&self) -> bool {
        self.close_rcvd && !self.close_sent
    }

    /// Both closes seen
    pub fn closed(&self) -> bool {
        self.close_sent && self.close_rcvd
    }

    /// The handshake state as an enum, for diagnostics
    pub fn state(&self) -> ConnectionState {
        match (self.open_sent, self.open_rcvd, self.close_sent, self.close_rcvd) {
            (false, false, _, _) => ConnectionState::HeaderExchange,
            (true, false, _, _) => ConnectionState::OpenSent,
            (false, true, _, _) => ConnectionState::OpenReceived,
            (true, true, false, false) => ConnectionState::Opened,
            (true, true, true, false) => ConnectionState::CloseSent,
            (true, true, false, true) => ConnectionState::CloseReceived,
            (true, true, true, true) => ConnectionState::End,
        }
    }

    // -- handshake --

    /// Sends our Open
    pub fn open(&mut self) -> Result<(), ConnectionError> {
        if self.open_sent {
            return Err(ConnectionError::DoubleOpen);
        }
        let mut open = Open::new(self.options.container_id.clone());
        open.hostname = self.options.hostname.clone();
        open.max_frame_size = self.options.max_frame_size;
        open.channel_max = self.options.channel_max;
        open.idle_time_out = self.options.idle_time_out;
        self.post(0, FrameBody::from_performative(open))?;
        self.open_sent = true;
        Ok(())
    }

    /// Sends our Close; sessions are flushed first so no frame strands
    pub fn close(&mut self, error: Option<WireError>) -> Result<(), ConnectionError> {
        if self.close_sent {
            return Err(ConnectionError::DoubleClose);
        }
        self.tick();
        self.post(0, FrameBody::from_performative(Close { error }))?;
        self.close_sent = true;
        Ok(())
    }

    // -- sessions --

    /// Creates a session and sends its Begin
    pub fn begin_session(&mut self) -> usize {
        let negotiated = self.max_frame_size();
        let entry = self.sessions.vacant_entry();
        let slot = entry.key();
        let mut session = Session::new(slot as u16);
        session.max_frame_size = negotiated;
        session.begin().expect("fresh session begins");
        entry.insert(session);
        slot
    }

    /// The session at `slot`
    pub fn session_mut(&mut self, slot: usize) -> Option<&mut Session> {
        self.sessions.get_mut(slot)
    }

    /// The session at `slot`
    pub fn session(&self, slot: usize) -> Option<&Session> {
        self.sessions.get(slot)
    }

    /// Slots of every live session
    pub fn session_slots(&self) -> Vec<usize> {
        self.sessions.iter().map(|(slot, _)| slot).collect()
    }

    /// Removes a fully-ended session
    pub fn remove_session(&mut self, slot: usize) {
        if self.sessions.contains(slot) {
            self.sessions.remove(slot);
            self.incoming_channels.retain(|_, s| *s != slot);
        }
    }

    // -- frame dispatch --

    /// Feeds one decoded frame body into the state machines
    pub fn handle_frame(
        &mut self,
        channel: u16,
        body: FrameBody,
    ) -> Result<(), ConnectionError> {
        let FrameBody::Performative {
            performative,
            payload,
        } = body
        else {
            // heartbeat
            return Ok(());
        };

        if self.close_rcvd {
            // frames after close are silently discarded
            return Ok(());
        }

        match performative {
            Performative::Open(open) => self.handle_open(open),
            Performative::Close(close) => self.handle_close(close),
            Performative::Begin(begin) => self.handle_begin(channel, begin),
            Performative::End(end) => self.handle_end(channel, end),
            other => {
                let slot = *self
                    .incoming_channels
                    .get(&channel)
                    .ok_or(ConnectionError::UnboundChannel(channel))?;
                let result = {
                    let session = &mut self.sessions[slot];
                    match other {
                        Performative::Attach(attach) => session.handle_attach(attach),
                        Performative::Flow(flow) => session.handle_flow(flow),
                        Performative::Transfer(transfer) => {
                            session.handle_transfer(transfer, payload)
                        }
                        Performative::Disposition(disposition) => {
                            session.handle_disposition(disposition)
                        }
                        Performative::Detach(detach) => session.handle_detach(detach),
                        Performative::Open(_)
                        | Performative::Begin(_)
                        | Performative::End(_)
                        | Performative::Close(_) => unreachable!("handled above"),
                    }
                };
                if let Err(err) = result {
                    self.end_session_with_error(slot, err);
                }
                Ok(())
            }
        }
    }

    fn handle_open(&mut self, open: Open) -> Result<(), ConnectionError> {
        if self.open_rcvd {
            // double open closes the connection with an error
            let _ = self.close(Some(ConnectionError::DoubleOpen.to_wire()));
            return Err(ConnectionError::DoubleOpen);
        }
        self.open_rcvd = true;
        self.remote_open = Some(open);
        let negotiated = self.max_frame_size();
        for (_, session) in self.sessions.iter_mut() {
            session.max_frame_size = negotiated;
        }
        Ok(())
    }

    fn handle_close(&mut self, close: Close) -> Result<(), ConnectionError> {
        self.close_rcvd = true;
        match close.error {
            Some(error) => Err(ConnectionError::PeerClosed(error)),
            None => Ok(()),
        }
    }

    fn handle_begin(&mut self, channel: u16, begin: Begin) -> Result<(), ConnectionError> {
        if self.incoming_channels.contains_key(&channel) {
            return Err(ConnectionError::DoubleBegin(channel));
        }
        let negotiated = self.max_frame_size();
        let slot = match begin.remote_channel {
            // the peer is answering a Begin of ours
            Some(ours) if self.sessions.contains(ours as usize) => ours as usize,
            _ => {
                // the peer is initiating: create our end lazily
                let entry = self.sessions.vacant_entry();
                let slot = entry.key();
                let mut session = Session::new(slot as u16);
                session.max_frame_size = negotiated;
                session.remote_channel = Some(channel);
                entry.insert(session);
                slot
            }
        };
        self.incoming_channels.insert(channel, slot);
        let session = &mut self.sessions[slot];
        session.remote_channel = Some(channel);
        if let Err(err) = session.handle_begin(begin) {
            self.end_session_with_error(slot, err);
        }
        Ok(())
    }

    fn handle_end(&mut self, channel: u16, end: End) -> Result<(), ConnectionError> {
        let slot = self
            .incoming_channels
            .remove(&channel)
            .ok_or(ConnectionError::UnknownChannel(channel))?;
        let session = &mut self.sessions[slot];
        if let Err(err) = session.handle_end(end) {
            self.end_session_with_error(slot, err);
        }
        Ok(())
    }

    /// Ends a session because of a session-fatal error
    fn end_session_with_error(&mut self, slot: usize, err: SessionError) {
        tracing::error!(target: "hematite::err", session = slot, error = %err, "session error");
        if let Some(session) = self.sessions.get_mut(slot) {
            let _ = session.end(Some(err.to_wire()));
        }
    }

    // -- output --

    fn post(&mut self, channel: u16, body: FrameBody) -> Result<(), ConnectionError> {
        if self.close_sent {
            return Err(ConnectionError::Closed);
        }
        self.output.push(Frame::amqp(channel, body.encode()));
        Ok(())
    }

    /// Queues a heartbeat frame
    pub fn post_empty(&mut self) {
        if !self.close_sent {
            self.output.push(Frame::empty());
        }
    }

    /// Ticks every session and drains their frames, stamping channels
    pub fn tick(&mut self) {
        if self.close_sent {
            return;
        }
        let slots: Vec<usize> = self.sessions.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let session = &mut self.sessions[slot];
            session.tick();
            let channel = session.channel;
            let bodies: Vec<FrameBody> = session.take_output().collect();
            for body in bodies {
                let _ = self.post(channel, body);
            }
        }
    }

    /// Drains frames ready for the wire
    pub fn take_output(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameBody;

    fn pump(a: &mut Connection, b: &mut Connection) {
        for _ in 0..8 {
            a.tick();
            for frame in a.take_output() {
                let body = FrameBody::decode(&frame.body).unwrap();
                b.handle_frame(frame.channel, body).unwrap();
            }
            b.tick();
            for frame in b.take_output() {
                let body = FrameBody::decode(&frame.body).unwrap();
                a.handle_frame(frame.channel, body).unwrap();
            }
        }
    }

    #[test]
    fn open_handshake_negotiates_max_frame() {
        let mut a = Connection::new(ConnectionOptions {
            max_frame_size: 512,
            ..ConnectionOptions::new("a")
        });
        let mut b = Connection::new(ConnectionOptions::new("b"));
        a.open().unwrap();
        pump(&mut a, &mut b);

        assert!(b.opening());
        b.open().unwrap();
        pump(&mut a, &mut b);

        assert!(a.opened() && b.opened());
        assert_eq!(a.remote_container_id(), Some("b"));
        assert_eq!(b.max_frame_size(), 512);
        assert_eq!(a.max_frame_size(), 512);
    }

    #[test]
    fn double_open_is_fatal() {
        let mut a = Connection::new(ConnectionOptions::new("a"));
        let open = Open::new("x");
        a.handle_frame(0, FrameBody::from_performative(open.clone()))
            .unwrap();
        let err = a
            .handle_frame(0, FrameBody::from_performative(open))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::DoubleOpen));
        // the close was queued with the error body
        assert!(a.close_sent);
    }

    #[test]
    fn close_handshake_in_both_orders() {
        let mut a = Connection::new(ConnectionOptions::new("a"));
        let mut b = Connection::new(ConnectionOptions::new("b"));
        a.open().unwrap();
        b.open().unwrap();
        pump(&mut a, &mut b);

        a.close(None).unwrap();
        pump(&mut a, &mut b);
        assert!(b.closing());
        b.close(None).unwrap();
        pump(&mut a, &mut b);
        assert!(a.closed() && b.closed());
    }

    #[test]
    fn begin_binds_channels_both_ways() {
        let mut a = Connection::new(ConnectionOptions::new("a"));
        let mut b = Connection::new(ConnectionOptions::new("b"));
        a.open().unwrap();
        b.open().unwrap();
        let ssn = a.begin_session();
        pump(&mut a, &mut b);

        // b created its end lazily and answers on tick
        let bs = b.session_slots();
        assert_eq!(bs.len(), 1);
        assert!(b.session(bs[0]).unwrap().beginning());
        b.session_mut(bs[0]).unwrap().begin().unwrap();
        pump(&mut a, &mut b);

        assert!(a.session(ssn).unwrap().mapped());
        assert!(b.session(bs[0]).unwrap().mapped());
    }

    #[test]
    fn double_begin_on_same_channel_is_fatal() {
        let mut a = Connection::new(ConnectionOptions::new("a"));
        a.open().unwrap();
        let begin = Begin {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: 10,
            outgoing_window: 10,
            handle_max: Default::default(),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        a.handle_frame(3, FrameBody::from_performative(begin.clone()))
            .unwrap();
        assert!(matches!(
            a.handle_frame(3, FrameBody::from_performative(begin)),
            Err(ConnectionError::DoubleBegin(3))
        ));
    }

    #[test]
    fn post_after_close_is_rejected() {
        let mut a = Connection::new(ConnectionOptions::new("a"));
        a.open().unwrap();
        a.close(None).unwrap();
        assert!(matches!(a.open(), Err(ConnectionError::DoubleOpen)));
        let mut b = Connection::new(ConnectionOptions::new("b"));
        b.close(None).unwrap();
        assert!(matches!(b.close(None), Err(ConnectionError::DoubleClose)));
    }
}
