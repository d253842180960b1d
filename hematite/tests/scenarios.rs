//! End-to-end scenarios driven through two sans-IO engines pumped
//! against each other in memory: a broker core on one side, a plain
//! peer on the other, bytes on the wire in between.

use bytes::{Bytes, BytesMut};
use hematite::broker::BrokerCore;
use hematite::connection::{Connection, ConnectionOptions};
use hematite::frames::{FrameBody, FrameCodec};
use hematite::link::LinkOptions;
use hematite::terminus::QueueOptions;
use hematite::trace::Trace;
use hematite::transport::Transport;
use hematite_codec::Binary;
use hematite_types::definitions::ReceiverSettleMode;
use hematite_types::messaging::{DeliveryState, Message, Source, Target};
use hematite_types::performatives::Performative;
use hematite_types::transaction::{Coordinator, Declare, Declared, Discharge, TransactionalState};
use hematite_types::Composite;
use tokio_util::codec::Decoder;

/// One client connection wired to one broker-side connection
struct Wire {
    server: Connection,
    st: Transport,
    client: Connection,
    ct: Transport,
    /// `(from_client, body)` for every frame that crossed
    log: Vec<(bool, FrameBody)>,
    client_acc: (BytesMut, bool),
    server_acc: (BytesMut, bool),
}

impl Wire {
    fn new(container_id: &str) -> Self {
        Self::with_options(ConnectionOptions::new(container_id))
    }

    fn with_options(options: ConnectionOptions) -> Self {
        let quiet = Trace::from_categories("");
        Wire {
            server: Connection::new(ConnectionOptions::new("broker")),
            st: Transport::new("srv", quiet),
            client: Connection::new(options),
            ct: Transport::new("cli", quiet),
            log: Vec::new(),
            client_acc: (BytesMut::new(), false),
            server_acc: (BytesMut::new(), false),
        }
    }

    fn record(
        log: &mut Vec<(bool, FrameBody)>,
        acc: &mut (BytesMut, bool),
        from_client: bool,
        bytes: &Bytes,
    ) {
        acc.0.extend_from_slice(bytes);
        if !acc.1 {
            if acc.0.len() < 8 {
                return;
            }
            let _header = acc.0.split_to(8);
            acc.1 = true;
        }
        let mut codec = FrameCodec::new();
        while let Some(frame) = codec.decode(&mut acc.0).unwrap() {
            log.push((from_client, FrameBody::decode(&frame.body).unwrap()));
        }
    }

    /// Runs broker ticks and shuttles bytes until both sides go quiet
    fn pump(&mut self, broker: &mut BrokerCore) {
        for _ in 0..12 {
            broker.tick(&mut self.server);
            let bytes = self.st.flush(&mut self.server);
            Self::record(&mut self.log, &mut self.server_acc, false, &bytes);
            self.ct.feed(&bytes, &mut self.client).unwrap();

            let bytes = self.ct.flush(&mut self.client);
            Self::record(&mut self.log, &mut self.client_acc, true, &bytes);
            self.st.feed(&bytes, &mut self.server).unwrap();
        }
    }

    /// Opens the connection and one session, returning the session slot
    fn open_session(&mut self, broker: &mut BrokerCore) -> usize {
        self.client.open().unwrap();
        self.pump(broker);
        assert!(self.client.opened(), "open handshake completed");
        let ssn = self.client.begin_session();
        self.pump(broker);
        assert!(self.client.session(ssn).unwrap().mapped());
        ssn
    }

    fn transfers_from_client(&self) -> Vec<(hematite_types::performatives::Transfer, Bytes)> {
        self.log
            .iter()
            .filter(|(from_client, _)| *from_client)
            .filter_map(|(_, body)| match body {
                FrameBody::Performative {
                    performative: Performative::Transfer(t),
                    payload,
                } => Some((t.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }
}

fn sender_to(address: &str) -> LinkOptions {
    LinkOptions {
        target: Some(Target::with_address(address).into()),
        ..Default::default()
    }
}

fn receiver_from(address: &str) -> LinkOptions {
    LinkOptions {
        source: Some(Source::with_address(address)),
        ..Default::default()
    }
}

#[test]
fn hello_delivery() {
    let mut broker = BrokerCore::new("broker");
    let queue = broker.add_queue("q", QueueOptions::work_queue());
    let mut wire = Wire::new("client");
    let ssn = wire.open_session(&mut broker);

    let snd = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender("hello-snd", sender_to("q"))
        .unwrap();
    wire.pump(&mut broker);

    let tag = {
        let link = wire.client.session_mut(ssn).unwrap().link_mut(snd).unwrap();
        assert!(link.attached());
        assert!(link.credit() >= 1, "broker granted initial credit");
        link.send("m1", None, None).unwrap()
    };
    assert_eq!(tag, Binary::from("0"), "engine assigns tag 0");
    wire.pump(&mut broker);

    {
        let link = wire.client.session_mut(ssn).unwrap().link_mut(snd).unwrap();
        let settled = link.take_peer_settled();
        assert_eq!(settled.len(), 1);
        assert!(matches!(settled[0].1, Some(DeliveryState::Accepted(_))));
        assert!(link.unsettled.is_empty(), "settled entries are pruned");
    }
    assert_eq!(queue.lock().len(), 1);

    // read it back over a receiver link
    let rcv = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_receiver("hello-rcv", receiver_from("q"))
        .unwrap();
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(rcv)
        .unwrap()
        .flow(10, false);
    wire.pump(&mut broker);

    let delivery = {
        let link = wire.client.session_mut(ssn).unwrap().link_mut(rcv).unwrap();
        link.get().expect("delivery arrived")
    };
    assert_eq!(&delivery.payload[..], b"m1");

    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(rcv)
        .unwrap()
        .settle(&delivery.tag, Some(DeliveryState::accepted()));
    wire.pump(&mut broker);
    assert!(queue.lock().is_empty(), "accepted delivery dequeued");
}

#[test]
fn fragmented_transfer() {
    let mut broker = BrokerCore::new("broker");
    let queue = broker.add_queue("q", QueueOptions::work_queue());
    let mut wire = Wire::with_options(ConnectionOptions {
        max_frame_size: 512,
        ..ConnectionOptions::new("client")
    });
    let ssn = wire.open_session(&mut broker);
    assert_eq!(wire.client.max_frame_size(), 512);

    let snd = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender("frag-snd", sender_to("q"))
        .unwrap();
    wire.pump(&mut broker);

    let payload: Vec<u8> = (0..1500u32).map(|n| n as u8).collect();
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(snd)
        .unwrap()
        .send(Bytes::from(payload.clone()), None, None)
        .unwrap();
    wire.pump(&mut broker);

    let transfers = wire.transfers_from_client();
    assert!(transfers.len() >= 3, "got {} frames", transfers.len());
    let (more_flags, tags): (Vec<bool>, Vec<_>) = transfers
        .iter()
        .map(|(t, _)| (t.more, t.delivery_tag.clone().unwrap()))
        .unzip();
    assert!(more_flags[..more_flags.len() - 1].iter().all(|m| *m));
    assert!(!more_flags[more_flags.len() - 1]);
    assert!(tags.windows(2).all(|w| w[0] == w[1]), "fragments share the tag");

    // the stored message is the fragments concatenated
    let stored: Vec<u8> = queue
        .lock()
        .head_payload()
        .expect("message stored")
        .to_vec();
    assert_eq!(stored, payload);
}

#[test]
fn credit_drain() {
    let mut broker = BrokerCore::new("broker");
    let _queue = broker.add_queue("q", QueueOptions::work_queue());
    let mut wire = Wire::new("client");
    let ssn = wire.open_session(&mut broker);

    let rcv = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_receiver("drain-rcv", receiver_from("q"))
        .unwrap();
    wire.pump(&mut broker);

    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(rcv)
        .unwrap()
        .flow(5, true);
    wire.pump(&mut broker);

    let link = wire.client.session_mut(ssn).unwrap().link_mut(rcv).unwrap();
    assert_eq!(link.credit(), 0, "drained credit burned");
    assert_eq!(link.delivery_count(), 5, "count advanced by the credit");
    assert_eq!(link.pending(), 0, "no transfers were sent");

    // the sender echoed the drained flow
    let echoed = wire.log.iter().any(|(from_client, body)| {
        !from_client
            && matches!(
                body,
                FrameBody::Performative {
                    performative: Performative::Flow(flow),
                    ..
                } if flow.drain && flow.link_credit == Some(0) && flow.delivery_count == Some(5)
            )
    });
    assert!(echoed, "drained flow echoed: {:#?}", wire.log);
}

#[test]
fn ring_queue_eviction() {
    let mut broker = BrokerCore::new("broker");
    let queue = broker.add_queue(
        "ring",
        QueueOptions {
            ring: Some(3),
            ..Default::default()
        },
    );
    for n in 1..=5u32 {
        queue
            .lock()
            .put(Binary::from(format!("{n}").as_str()), Bytes::from(format!("m{n}")), None);
    }

    let mut wire = Wire::new("client");
    let ssn = wire.open_session(&mut broker);
    let rcv = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_receiver("ring-rcv", receiver_from("ring"))
        .unwrap();
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(rcv)
        .unwrap()
        .flow(10, false);
    wire.pump(&mut broker);

    let link = wire.client.session_mut(ssn).unwrap().link_mut(rcv).unwrap();
    let mut seen = Vec::new();
    while let Some(delivery) = link.get() {
        seen.push(String::from_utf8(delivery.payload.to_vec()).unwrap());
    }
    assert_eq!(seen, vec!["m3", "m4", "m5"], "oldest two evicted");
}

fn declared_txn_id(wire: &mut Wire, ssn: usize, ctl: usize) -> Binary {
    let link = wire.client.session_mut(ssn).unwrap().link_mut(ctl).unwrap();
    let settled = link.take_peer_settled();
    for (_, state) in settled {
        if let Some(DeliveryState::Declared(Declared { txn_id })) = state {
            return txn_id;
        }
    }
    panic!("no declared outcome");
}

#[test]
fn transactional_commit() {
    let mut broker = BrokerCore::new("broker");
    let queue = broker.add_queue("q", QueueOptions::work_queue());
    let mut wire = Wire::new("client");
    let ssn = wire.open_session(&mut broker);

    // control link to the coordinator
    let ctl = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender(
            "txn-ctl",
            LinkOptions {
                target: Some(Coordinator::default().into()),
                ..Default::default()
            },
        )
        .unwrap();
    // data link into the queue, and a receiver watching for visibility
    let snd = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender("txn-snd", sender_to("q"))
        .unwrap();
    let rcv = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_receiver("txn-rcv", receiver_from("q"))
        .unwrap();
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(rcv)
        .unwrap()
        .flow(10, false);
    wire.pump(&mut broker);

    // declare
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(ctl)
        .unwrap()
        .send(Message::value(Declare::default().to_value()).encode(), None, None)
        .unwrap();
    wire.pump(&mut broker);
    let txn_id = declared_txn_id(&mut wire, ssn, ctl);

    // transfer inside the transaction
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(snd)
        .unwrap()
        .send(
            "m1",
            None,
            Some(DeliveryState::TransactionalState(TransactionalState::new(
                txn_id.clone(),
            ))),
        )
        .unwrap();
    wire.pump(&mut broker);

    // stored but invisible, unacknowledged, until the discharge
    assert_eq!(queue.lock().len(), 1);
    {
        let link = wire.client.session_mut(ssn).unwrap().link_mut(snd).unwrap();
        assert!(link.take_peer_settled().is_empty(), "no outcome before commit");
        assert_eq!(link.unsettled.len(), 1);
    }
    {
        let link = wire.client.session_mut(ssn).unwrap().link_mut(rcv).unwrap();
        assert!(link.get().is_none(), "entry invisible before commit");
    }

    // discharge fail=false
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(ctl)
        .unwrap()
        .send(
            Message::value(
                Discharge {
                    txn_id,
                    fail: Some(false),
                }
                .to_value(),
            )
            .encode(),
            None,
            None,
        )
        .unwrap();
    wire.pump(&mut broker);

    {
        let link = wire.client.session_mut(ssn).unwrap().link_mut(snd).unwrap();
        let settled = link.take_peer_settled();
        assert_eq!(settled.len(), 1, "accepted after the discharge");
        assert!(link.unsettled.is_empty());
    }
    let delivery = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .link_mut(rcv)
        .unwrap()
        .get()
        .expect("released into view by the commit");
    assert_eq!(&delivery.payload[..], b"m1");
}

#[test]
fn transactional_rollback() {
    let mut broker = BrokerCore::new("broker");
    let queue = broker.add_queue("q", QueueOptions::work_queue());
    let mut wire = Wire::new("client");
    let ssn = wire.open_session(&mut broker);

    let ctl = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender(
            "txn-ctl",
            LinkOptions {
                target: Some(Coordinator::default().into()),
                ..Default::default()
            },
        )
        .unwrap();
    let snd = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender("txn-snd", sender_to("q"))
        .unwrap();
    wire.pump(&mut broker);

    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(ctl)
        .unwrap()
        .send(Message::value(Declare::default().to_value()).encode(), None, None)
        .unwrap();
    wire.pump(&mut broker);
    let txn_id = declared_txn_id(&mut wire, ssn, ctl);

    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(snd)
        .unwrap()
        .send(
            "m1",
            None,
            Some(DeliveryState::TransactionalState(TransactionalState::new(
                txn_id.clone(),
            ))),
        )
        .unwrap();
    wire.pump(&mut broker);
    assert_eq!(queue.lock().len(), 1);

    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(ctl)
        .unwrap()
        .send(
            Message::value(
                Discharge {
                    txn_id,
                    fail: Some(true),
                }
                .to_value(),
            )
            .encode(),
            None,
            None,
        )
        .unwrap();
    wire.pump(&mut broker);

    assert!(queue.lock().is_empty(), "rolled-back entry removed");
    let link = wire.client.session_mut(ssn).unwrap().link_mut(snd).unwrap();
    assert!(link.unsettled.is_empty(), "delivery settled on rollback");
}

#[test]
fn link_resume() {
    let mut broker = BrokerCore::new("broker");
    let queue = broker.add_queue("q", QueueOptions::work_queue());

    // first connection: one unsettled delivery, then the wire drops
    let snapshot = {
        let mut wire = Wire::new("client");
        let ssn = wire.open_session(&mut broker);
        let snd = wire
            .client
            .session_mut(ssn)
            .unwrap()
            .attach_sender(
                "L1",
                LinkOptions {
                    rcv_settle_mode: ReceiverSettleMode::Second,
                    ..sender_to("q")
                },
            )
            .unwrap();
        wire.pump(&mut broker);
        wire.client
            .session_mut(ssn)
            .unwrap()
            .link_mut(snd)
            .unwrap()
            .send("payload-d1", None, None)
            .unwrap();
        wire.pump(&mut broker);

        let link = wire.client.session_mut(ssn).unwrap().link_mut(snd).unwrap();
        assert_eq!(link.unsettled.len(), 1, "mode Second leaves it unsettled");
        link.unsettled_snapshot()
        // wire dropped here with no Close: state survives in the broker
    };
    assert_eq!(queue.lock().len(), 1);

    // second connection, same container, same link name
    let mut wire = Wire::new("client");
    let ssn = wire.open_session(&mut broker);
    let snd = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender(
            "L1",
            LinkOptions {
                rcv_settle_mode: ReceiverSettleMode::Second,
                unsettled: snapshot,
                ..sender_to("q")
            },
        )
        .unwrap();
    wire.pump(&mut broker);

    // the attach advertised the surviving delivery
    let advertised = wire.log.iter().any(|(from_client, body)| {
        *from_client
            && matches!(
                body,
                FrameBody::Performative {
                    performative: Performative::Attach(attach),
                    ..
                } if attach
                    .unsettled
                    .as_ref()
                    .map(|u| u.contains_key(&Binary::from("0")))
                    .unwrap_or(false)
            )
    });
    assert!(advertised, "attach carries the unsettled map");
    assert!(
        wire.transfers_from_client().is_empty(),
        "no payload re-sent on resume"
    );

    // settling locally travels as an empty resuming transfer
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(snd)
        .unwrap()
        .settle(&Binary::from("0"), Some(DeliveryState::accepted()));
    wire.pump(&mut broker);

    let resumed: Vec<_> = wire.transfers_from_client();
    assert_eq!(resumed.len(), 1);
    assert!(resumed[0].0.resume && resumed[0].0.settled == Some(true));
    assert!(resumed[0].1.is_empty(), "resuming transfer carries no payload");

    assert!(
        wire.client
            .session_mut(ssn)
            .unwrap()
            .link_mut(snd)
            .unwrap()
            .unsettled
            .is_empty(),
        "client side settled"
    );
    let server_ssn = wire.server.session_slots()[0];
    let server_link = wire
        .server
        .session(server_ssn)
        .unwrap()
        .link_by_name("L1")
        .unwrap();
    assert!(
        wire.server
            .session(server_ssn)
            .unwrap()
            .link(server_link)
            .unwrap()
            .unsettled
            .is_empty(),
        "broker side settled"
    );
}

#[test]
fn deliveries_interleave_in_arrival_order() {
    // two sender links into one queue; the broker drains them with
    // next_receiver so arrival order holds across links
    let mut broker = BrokerCore::new("broker");
    let queue = broker.add_queue("q", QueueOptions::work_queue());
    let mut wire = Wire::new("client");
    let ssn = wire.open_session(&mut broker);

    let one = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender("ord-1", sender_to("q"))
        .unwrap();
    let two = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_sender("ord-2", sender_to("q"))
        .unwrap();
    wire.pump(&mut broker);

    for (slot, payload) in [(one, "a1"), (two, "b1"), (one, "a2")] {
        wire.client
            .session_mut(ssn)
            .unwrap()
            .link_mut(slot)
            .unwrap()
            .send(payload, None, None)
            .unwrap();
    }
    wire.pump(&mut broker);

    assert_eq!(queue.lock().len(), 3);
    let rcv = wire
        .client
        .session_mut(ssn)
        .unwrap()
        .attach_receiver("ord-rcv", receiver_from("q"))
        .unwrap();
    wire.client
        .session_mut(ssn)
        .unwrap()
        .link_mut(rcv)
        .unwrap()
        .flow(10, false);
    wire.pump(&mut broker);

    let link = wire.client.session_mut(ssn).unwrap().link_mut(rcv).unwrap();
    let mut seen = Vec::new();
    while let Some(delivery) = link.get() {
        seen.push(String::from_utf8(delivery.payload.to_vec()).unwrap());
    }
    // the client session drains link 'ord-1' before 'ord-2' within one
    // tick, so that is the order the frames hit the wire; the broker
    // preserves it across both links
    assert_eq!(seen, vec!["a1", "a2", "b1"], "arrival order held");
}
