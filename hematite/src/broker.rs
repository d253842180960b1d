//! Broker glue: the node address table, per-link terminus continuity
//! keyed by `(container-id, link-name)`, attach resolution including
//! dynamic nodes and the transaction coordinator, the per-tick
//! sender/receiver processing, orphan handling, and the tokio listener
//! that runs one engine per accepted socket.

use std::collections::HashMap;
use std::sync::Arc;

use hematite_types::definitions::{AmqpError, Error as WireError, ReceiverSettleMode, Role};
use hematite_types::messaging::{self, DeliveryState, TargetArchetype};
use hematite_types::sasl::SaslCode;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::connection::{Connection, ConnectionOptions};
use crate::link::LinkEndpoint;
use crate::sasl::SaslServer;
use crate::session::WindowPolicy;
use crate::terminus::{Node, Queue, QueueNode, QueueOptions, SharedQueue, Source, Target};
use crate::trace::Trace;
use crate::transaction::{PendingDischarge, SharedCoordinator, TxnCoordinator, TxnTarget, TxnWork};
use crate::transport::{Transport, TransportError};

/// Credit granted to a fresh receiver link
const INITIAL_CREDIT: u32 = 20;

/// Receiver credit is topped back up below this
const CREDIT_LOW_WATER: u32 = 10;

/// Broker-level failures
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The listener could not bind
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    /// The accept loop failed
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// Shared broker state: nodes, terminus continuity, the coordinator
pub struct BrokerCore {
    container_id: String,
    window: u32,
    window_policy: WindowPolicy,
    nodes: HashMap<String, Arc<dyn Node>>,
    sources: HashMap<(String, String), Box<dyn Source>>,
    targets: HashMap<(String, String), Box<dyn Target>>,
    coordinator: SharedCoordinator,
    next_dynamic: u64,
    trace: Trace,
}

impl std::fmt::Debug for BrokerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCore")
            .field("container_id", &self.container_id)
            .field("nodes", &self.nodes.keys())
            .field("sources", &self.sources.keys())
            .field("targets", &self.targets.keys())
            .finish()
    }
}

impl BrokerCore {
    /// A core for `container_id` with no nodes yet
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            window: crate::session::DEFAULT_WINDOW,
            window_policy: WindowPolicy::Sliding,
            nodes: HashMap::new(),
            sources: HashMap::new(),
            targets: HashMap::new(),
            coordinator: TxnCoordinator::shared(),
            next_dynamic: 0,
            trace: Trace::from_env(),
        }
    }

    /// Our container id
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Registers a node under an address
    pub fn add_node(&mut self, address: impl Into<String>, node: Arc<dyn Node>) {
        self.nodes.insert(address.into(), node);
    }

    /// Creates and registers a queue node; the queue handle is returned
    /// for inspection
    pub fn add_queue(&mut self, address: impl Into<String>, options: QueueOptions) -> SharedQueue {
        let queue = Queue::shared(options);
        self.add_node(address, Arc::new(QueueNode::new(queue.clone())));
        queue
    }

    /// The transaction coordinator
    pub fn coordinator(&self) -> SharedCoordinator {
        self.coordinator.clone()
    }

    /// Incoming-window configuration applied to every session
    pub fn set_window(&mut self, window: u32, policy: WindowPolicy) {
        self.window = window;
        self.window_policy = policy;
    }

    /// One cooperative pass over a connection: answer handshakes,
    /// resolve attaches, feed senders, drain receivers in arrival
    /// order, reap detaches, and run discharged transaction work
    pub fn tick(&mut self, conn: &mut Connection) {
        if conn.opening() {
            let _ = conn.open();
        }
        let container = conn
            .remote_container_id()
            .unwrap_or_default()
            .to_string();
        let mut discharges: Vec<PendingDischarge> = Vec::new();

        for ssn_slot in conn.session_slots() {
            if let Some(ssn) = conn.session_mut(ssn_slot) {
                if ssn.beginning() {
                    let _ = ssn.begin();
                    ssn.set_incoming_window(self.window, self.window_policy);
                }
            }

            let link_slots = conn
                .session(ssn_slot)
                .map(|s| s.link_slots())
                .unwrap_or_default();
            for link_slot in link_slots.iter().copied() {
                self.service_link(conn, &container, ssn_slot, link_slot);
            }

            self.drain_receivers(conn, &container, ssn_slot, &mut discharges);

            for link_slot in link_slots {
                self.reap_link(conn, &container, ssn_slot, link_slot, &mut discharges);
            }

            let ending = conn
                .session(ssn_slot)
                .map(|s| s.ending())
                .unwrap_or(false);
            if ending {
                self.orphan_session(conn, &container, ssn_slot, &mut discharges);
                if let Some(ssn) = conn.session_mut(ssn_slot) {
                    let _ = ssn.end(None);
                }
            }
            if conn
                .session(ssn_slot)
                .map(|s| s.ended())
                .unwrap_or(false)
            {
                conn.remove_session(ssn_slot);
            }
        }

        self.run_discharges(conn, discharges);

        if conn.closing() {
            let _ = conn.close(None);
        }
    }

    fn service_link(
        &mut self,
        conn: &mut Connection,
        container: &str,
        ssn_slot: usize,
        link_slot: usize,
    ) {
        let Some(ssn) = conn.session_mut(ssn_slot) else {
            return;
        };
        let Some(link) = ssn.link_mut(link_slot) else {
            return;
        };

        if link.attaching() {
            let resolved = match link.role {
                Role::Sender => self.attach_sender(container, link),
                Role::Receiver => self.attach_receiver(container, link),
            };
            if resolved {
                self.trace
                    .ops(&self.container_id, format_args!("attached link '{}'", link.name));
                let _ = link.attach();
            } else {
                // answer the handshake, then refuse the link
                let _ = link.attach();
                let _ = link.detach(
                    true,
                    Some(WireError::new(AmqpError::NotFound, "no such node")),
                );
                return;
            }
        }

        if link.attached() || link.detaching() {
            match link.role {
                Role::Sender => self.process_sender(container, ssn_slot, link_slot, link),
                Role::Receiver => self.process_receiver_flow(container, link),
            }
        }
    }

    fn source_key(&self, container: &str, link: &LinkEndpoint) -> (String, String) {
        (container.to_string(), link.name.clone())
    }

    fn dynamic_address(&mut self) -> String {
        let address = format!("dynamic-{}", self.next_dynamic);
        self.next_dynamic += 1;
        address
    }

    fn attach_sender(&mut self, container: &str, link: &mut LinkEndpoint) -> bool {
        let key = self.source_key(container, link);
        if let Some(source) = self.sources.get_mut(&key) {
            // the link survives a detach or reconnect; re-align state
            source.resume(&link.unsettled_snapshot());
            link.source = link.remote_source.clone();
            link.target = link.remote_target.clone();
            return true;
        }
        let Some(remote_source) = link.remote_source.clone() else {
            return false;
        };
        let node: Option<Arc<dyn Node>> = match &remote_source.address {
            Some(address) => self.nodes.get(address).cloned(),
            None if remote_source.dynamic => {
                let address = self.dynamic_address();
                let queue = Queue::shared(QueueOptions::work_queue());
                let node: Arc<dyn Node> = Arc::new(QueueNode::new(queue));
                self.nodes.insert(address.clone(), node.clone());
                link.source = Some(messaging::Source {
                    address: Some(address),
                    ..remote_source.clone()
                });
                Some(node)
            }
            None => None,
        };
        let Some(node) = node else { return false };
        let mut source = node.source();
        let configured = source.configure(&remote_source);
        source.resume(&link.unsettled_snapshot());
        self.sources.insert(key, source);
        if link.source.is_none() {
            link.source = Some(configured);
        }
        link.target = link.remote_target.clone();
        true
    }

    fn attach_receiver(&mut self, container: &str, link: &mut LinkEndpoint) -> bool {
        let key = self.source_key(container, link);
        if let Some(target) = self.targets.get_mut(&key) {
            target.resume(&link.unsettled_snapshot());
            link.source = link.remote_source.clone();
            link.target = link.remote_target.clone();
            if target.capacity() && link.credit() < CREDIT_LOW_WATER {
                link.flow(INITIAL_CREDIT, false);
            }
            return true;
        }
        let Some(remote_target) = link.remote_target.clone() else {
            return false;
        };
        let target: Option<Box<dyn Target>> = match &remote_target {
            TargetArchetype::Coordinator(_) => {
                link.target = Some(remote_target.clone());
                Some(Box::new(TxnTarget::new(self.coordinator.clone())))
            }
            TargetArchetype::Target(t) => {
                let node: Option<Arc<dyn Node>> = match &t.address {
                    Some(address) => self.nodes.get(address).cloned(),
                    None if t.dynamic => {
                        let address = self.dynamic_address();
                        let queue = Queue::shared(QueueOptions::work_queue());
                        let node: Arc<dyn Node> = Arc::new(QueueNode::new(queue));
                        self.nodes.insert(address.clone(), node.clone());
                        link.target = Some(TargetArchetype::Target(messaging::Target {
                            address: Some(address),
                            ..t.clone()
                        }));
                        Some(node)
                    }
                    None => None,
                };
                node.map(|node| {
                    let mut target = node.target();
                    let configured = target.configure(&remote_target);
                    if link.target.is_none() {
                        link.target = Some(configured);
                    }
                    target
                })
            }
        };
        let Some(target) = target else { return false };
        link.source = link.remote_source.clone();
        if target.capacity() {
            link.flow(INITIAL_CREDIT, false);
        }
        self.targets.insert(key, target);
        true
    }

    fn process_sender(
        &mut self,
        container: &str,
        ssn_slot: usize,
        link_slot: usize,
        link: &mut LinkEndpoint,
    ) {
        let key = self.source_key(container, link);
        let Some(source) = self.sources.get_mut(&key) else {
            return;
        };

        // feed the link while the receiver's credit allows
        while link.capacity() > 0 {
            match source.get() {
                Some((tag, payload)) => {
                    let _ = link.send(payload, Some(tag), None);
                }
                None => break,
            }
        }

        // deliveries the peer settled outright (mode First)
        for (tag, state) in link.take_peer_settled() {
            source.settle(&tag, state);
        }

        // unsettled state changes: settle now, or defer into a txn
        for (tag, remote) in link.take_remote_modified() {
            if !(remote.settled || remote.state.is_some()) {
                continue;
            }
            if let Some(state @ DeliveryState::TransactionalState(_)) = &remote.state {
                let outcome = match state {
                    DeliveryState::TransactionalState(ts) => {
                        ts.outcome.clone().map(DeliveryState::from)
                    }
                    _ => None,
                };
                let mut coordinator = self.coordinator.lock();
                if let Some(txn) = coordinator.transaction_mut(state) {
                    txn.add_work(TxnWork::Retire {
                        source_key: key.clone(),
                        session: ssn_slot,
                        link: link_slot,
                        tag,
                        state: outcome,
                    });
                    continue;
                }
            }
            let settled = source.settle(&tag, remote.state.clone());
            link.settle(&tag, settled);
        }
    }

    fn process_receiver_flow(&mut self, container: &str, link: &mut LinkEndpoint) {
        let key = self.source_key(container, link);
        let Some(target) = self.targets.get_mut(&key) else {
            return;
        };
        for (tag, state) in link.take_peer_settled() {
            target.settle(&tag, state);
        }
        if target.capacity() && link.credit() < CREDIT_LOW_WATER {
            link.flow(CREDIT_LOW_WATER, false);
        }
    }

    /// Drains completed deliveries in arrival order across the
    /// session's receiver links
    fn drain_receivers(
        &mut self,
        conn: &mut Connection,
        container: &str,
        ssn_slot: usize,
        discharges: &mut Vec<PendingDischarge>,
    ) {
        loop {
            let Some(ssn) = conn.session_mut(ssn_slot) else {
                return;
            };
            let Some((link_slot, delivery)) = ssn.next_delivery() else {
                return;
            };
            let (name, rcv_settle_mode) = match ssn.link(link_slot) {
                Some(link) => (link.name.clone(), link.rcv_settle_mode),
                None => continue,
            };
            let key = (container.to_string(), name);
            let Some(target) = self.targets.get_mut(&key) else {
                continue;
            };

            // a transactional delivery enlists instead of landing
            let mut owner = None;
            let mut enlist = false;
            if !target.is_coordinator() {
                if let Some(state) = &delivery.state {
                    if let Some(txn) = self.coordinator.lock().transaction_mut(state) {
                        owner = Some(txn.owner);
                        enlist = true;
                    }
                }
            }

            let put = target.put(delivery.tag.clone(), delivery.payload.clone(), owner);
            discharges.extend(target.take_txn_work());
            if enlist {
                if let Some(state) = &delivery.state {
                    if let Some(txn) = self.coordinator.lock().transaction_mut(state) {
                        if let (Some(entry), Some(queue)) = (put.entry, target.queue()) {
                            txn.add_work(TxnWork::Enlist { queue, entry });
                        }
                        // the outcome stays invisible until commit
                        txn.add_work(TxnWork::Settle {
                            session: ssn_slot,
                            link: link_slot,
                            tag: delivery.tag.clone(),
                            state: Some(DeliveryState::accepted()),
                        });
                        continue;
                    }
                }
            }

            let outcome = put.outcome.unwrap_or_else(DeliveryState::accepted);
            if !delivery.settled {
                if let Some(link) = ssn.link_mut(link_slot) {
                    link.disposition(&delivery.tag, Some(outcome), false);
                    if rcv_settle_mode == ReceiverSettleMode::First {
                        link.settle(&delivery.tag, None);
                    }
                }
            } else {
                // sender pre-settled: the terminus is done with it too
                target.settle(&delivery.tag, delivery.state.clone());
            }
        }
    }

    fn reap_link(
        &mut self,
        conn: &mut Connection,
        container: &str,
        ssn_slot: usize,
        link_slot: usize,
        discharges: &mut Vec<PendingDischarge>,
    ) {
        let Some(ssn) = conn.session_mut(ssn_slot) else {
            return;
        };
        let Some(link) = ssn.link_mut(link_slot) else {
            return;
        };

        if link.detaching() {
            let closed = link.remote_closed;
            let key = self.source_key(container, link);
            if closed {
                match link.role {
                    Role::Sender => {
                        if let Some(mut source) = self.sources.remove(&key) {
                            source.close();
                        }
                    }
                    Role::Receiver => {
                        if let Some(mut target) = self.targets.remove(&key) {
                            // a closing coordinator fails its live txns
                            target.close();
                            discharges.extend(target.take_txn_work());
                        }
                    }
                }
            }
            let _ = link.detach(closed, None);
        }

        if link.detached() {
            ssn.remove_link(link_slot);
        }
    }

    /// Drops termini whose session is going away, per their own
    /// orphaning policy
    fn orphan_session(
        &mut self,
        conn: &Connection,
        container: &str,
        ssn_slot: usize,
        discharges: &mut Vec<PendingDischarge>,
    ) {
        let Some(ssn) = conn.session(ssn_slot) else {
            return;
        };
        let links: Vec<(Role, String)> = ssn
            .link_slots()
            .into_iter()
            .filter_map(|slot| ssn.link(slot))
            .map(|link| (link.role, link.name.clone()))
            .collect();
        for (role, name) in links {
            let key = (container.to_string(), name);
            match role {
                Role::Sender => {
                    let orphaned = self
                        .sources
                        .get_mut(&key)
                        .map(|s| s.orphaned())
                        .unwrap_or(false);
                    if orphaned {
                        self.sources.remove(&key);
                    }
                }
                Role::Receiver => {
                    let orphaned = match self.targets.get_mut(&key) {
                        Some(target) => {
                            let orphaned = target.orphaned();
                            if orphaned {
                                // a dying coordinator fails its live txns
                                target.close();
                                discharges.extend(target.take_txn_work());
                            }
                            orphaned
                        }
                        None => false,
                    };
                    if orphaned {
                        self.targets.remove(&key);
                    }
                }
            }
        }
    }

    /// Applies discharged work lists: commit releases enlisted entries
    /// and settles retirements with their recorded state; rollback
    /// removes enlisted entries and releases retirements
    fn run_discharges(&mut self, conn: &mut Connection, discharges: Vec<PendingDischarge>) {
        for PendingDischarge { work, fail } in discharges {
            for item in work {
                match item {
                    TxnWork::Enlist { queue, entry } => {
                        let mut queue = queue.lock();
                        if fail {
                            queue.remove(entry);
                        } else {
                            queue.release(entry);
                        }
                    }
                    TxnWork::Retire {
                        source_key,
                        session,
                        link,
                        tag,
                        state,
                    } => {
                        let applied = match self.sources.get_mut(&source_key) {
                            Some(source) => {
                                if fail {
                                    source.settle(&tag, None)
                                } else {
                                    source.settle(&tag, state.clone())
                                }
                            }
                            None => None,
                        };
                        if let Some(ssn) = conn.session_mut(session) {
                            if let Some(endpoint) = ssn.link_mut(link) {
                                let final_state = if fail {
                                    applied
                                } else {
                                    state.or_else(|| Some(DeliveryState::accepted()))
                                };
                                endpoint.settle(&tag, final_state);
                            }
                        }
                    }
                    TxnWork::Settle {
                        session,
                        link,
                        tag,
                        state,
                    } => {
                        let final_state = if fail {
                            Some(DeliveryState::Released(Default::default()))
                        } else {
                            state
                        };
                        if let Some(ssn) = conn.session_mut(session) {
                            if let Some(endpoint) = ssn.link_mut(link) {
                                endpoint.settle(&tag, final_state);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Interface to bind
    pub host: String,

    /// Port to bind
    pub port: u16,

    /// Require a SASL exchange before AMQP
    pub auth: bool,

    /// Mechanisms offered when `auth` is on
    pub mechanisms: Vec<String>,

    /// `user -> password` table for PLAIN
    pub passwords: HashMap<String, String>,

    /// Our proposed max-frame-size
    pub max_frame_size: u32,

    /// Idle timeout we request from peers, in milliseconds
    pub idle_time_out: Option<u32>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5672,
            auth: false,
            mechanisms: vec!["ANONYMOUS".to_string()],
            passwords: HashMap::new(),
            max_frame_size: u32::MAX,
            idle_time_out: None,
        }
    }
}

/// The broker: shared core plus the accept loop
#[derive(Debug)]
pub struct Broker {
    core: Arc<Mutex<BrokerCore>>,
    options: BrokerOptions,
}

impl Broker {
    /// A broker for `container_id` with default options
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            core: Arc::new(Mutex::new(BrokerCore::new(container_id))),
            options: BrokerOptions::default(),
        }
    }

    /// Replaces the listener options
    pub fn with_options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    /// The shared core, for registering nodes
    pub fn core(&self) -> Arc<Mutex<BrokerCore>> {
        self.core.clone()
    }

    /// Creates and registers a queue
    pub fn add_queue(&self, address: impl Into<String>, options: QueueOptions) -> SharedQueue {
        self.core.lock().add_queue(address, options)
    }

    /// Binds and serves until the listener fails
    pub async fn run(self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind((self.options.host.as_str(), self.options.port))
            .await
            .map_err(BrokerError::Bind)?;
        tracing::info!(
            host = %self.options.host,
            port = self.options.port,
            "broker listening"
        );
        self.serve(listener).await
    }

    /// Serves an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), BrokerError> {
        loop {
            let (stream, peer) = listener.accept().await.map_err(BrokerError::Accept)?;
            let core = self.core.clone();
            let options = self.options.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(core, options, stream).await {
                    tracing::debug!(peer = %peer, error = %err, "connection ended");
                }
            });
        }
    }
}

async fn serve_connection(
    core: Arc<Mutex<BrokerCore>>,
    options: BrokerOptions,
    mut stream: TcpStream,
) -> Result<(), crate::engine::EngineError> {
    let _ = stream.set_nodelay(true);
    let trace = Trace::from_env();
    let mut buf = vec![0u8; 64 * 1024];
    let mut leftover = bytes::Bytes::new();

    if options.auth {
        let mut sasl = SaslServer::new(options.mechanisms.clone(), options.passwords.clone());
        loop {
            let bytes = sasl.take_output();
            if !bytes.is_empty() {
                stream.write_all(&bytes).await?;
            }
            if sasl.is_done() {
                break;
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            sasl.feed(&buf[..n])?;
        }
        if sasl.outcome != Some(SaslCode::Ok) {
            // the failure outcome was written; drop the socket
            return Ok(());
        }
        leftover = sasl.take_remaining_input();
    }

    let container_id = core.lock().container_id().to_string();
    let mut conn = Connection::new(ConnectionOptions {
        container_id,
        max_frame_size: options.max_frame_size,
        idle_time_out: options.idle_time_out,
        ..Default::default()
    });
    let mut transport = Transport::new(format!("srv-{}", uuid::Uuid::new_v4()), trace);
    if !leftover.is_empty() {
        if let Err(err) = transport.feed(&leftover, &mut conn) {
            return finish_with_error(&mut stream, &mut transport, &mut conn, err).await;
        }
    }

    loop {
        core.lock().tick(&mut conn);
        let bytes = transport.flush(&mut conn);
        if !bytes.is_empty() {
            stream.write_all(&bytes).await?;
        }
        if conn.closed() {
            return Ok(());
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = buf[..n].to_vec();
        if let Err(err) = transport.feed(&chunk, &mut conn) {
            return finish_with_error(&mut stream, &mut transport, &mut conn, err).await;
        }
    }
}

/// Posts a Close carrying the failure, flushes, and gives up the socket
async fn finish_with_error(
    stream: &mut TcpStream,
    transport: &mut Transport,
    conn: &mut Connection,
    err: TransportError,
) -> Result<(), crate::engine::EngineError> {
    let body = match &err {
        TransportError::Connection(conn_err) => Some(conn_err.to_wire()),
        TransportError::Framing(_) => Some(WireError::new(
            hematite_types::definitions::ConnectionError::FramingError,
            err.to_string(),
        )),
        TransportError::BadProtocolHeader(_) => None,
    };
    if let Some(body) = body {
        let _ = conn.close(Some(body));
        let bytes = transport.flush(conn);
        let _ = stream.write_all(&bytes).await;
    }
    Err(err.into())
}
