//! Termini: the attachment points where deliveries enter and leave the
//! broker. A queue-backed node hands out sources and targets; the
//! transaction coordinator supplies its own target elsewhere.
//!
//! Entries carry monotonically increasing ids. Sources keep a cursor id
//! instead of holding references into the queue; when an entry below a
//! cursor is released, a generation counter tells the source to rewind
//! on its next `get`.

use std::sync::Arc;

use bytes::Bytes;
use hematite_types::definitions::DeliveryTag;
use hematite_types::messaging::{self, DeliveryState, TargetArchetype};
use indexmap::IndexMap;
use parking_lot::Mutex;

/// A shared queue handle
pub type SharedQueue = Arc<Mutex<Queue>>;

/// What a target reports for one put
#[derive(Debug, Default)]
pub struct Put {
    /// Entry the message landed in, when the target is queue-backed
    pub entry: Option<u64>,

    /// Outcome to attach to the disposition; Accepted when absent
    pub outcome: Option<DeliveryState>,
}

/// The outgoing half of a terminus
pub trait Source: Send {
    /// Accepts or refines the terminus the peer asked for
    fn configure(&mut self, remote: &messaging::Source) -> messaging::Source {
        remote.clone()
    }

    /// The next deliverable entry, or None when drained
    fn get(&mut self) -> Option<(DeliveryTag, Bytes)>;

    /// Aligns the unacked set with what the peer reports surviving
    fn resume(&mut self, unsettled: &messaging::UnsettledMap);

    /// Applies a settlement; a null state releases for re-delivery
    fn settle(&mut self, tag: &DeliveryTag, state: Option<DeliveryState>)
        -> Option<DeliveryState>;

    /// Releases everything still held
    fn close(&mut self);

    /// The terminus survives its link
    fn durable(&self) -> bool {
        false
    }

    /// True when the broker should drop this terminus now that no link
    /// holds it
    fn orphaned(&mut self) -> bool {
        true
    }
}

/// The incoming half of a terminus
pub trait Target: Send {
    /// Accepts or refines the terminus the peer asked for
    fn configure(&mut self, remote: &TargetArchetype) -> TargetArchetype {
        remote.clone()
    }

    /// There is room for another message
    fn capacity(&self) -> bool;

    /// Stores a message; `owner` marks the entry acquired (invisible)
    /// until a transaction releases it
    fn put(&mut self, tag: DeliveryTag, payload: Bytes, owner: Option<u64>) -> Put;

    /// Aligns unsettled bookkeeping with what the peer reports
    fn resume(&mut self, unsettled: &messaging::UnsettledMap);

    /// Applies a settlement, returning the final state
    fn settle(&mut self, tag: &DeliveryTag, state: Option<DeliveryState>)
        -> Option<DeliveryState>;

    /// Abandons the terminus
    fn close(&mut self);

    /// The terminus survives its link
    fn durable(&self) -> bool {
        false
    }

    /// True when the broker should drop this terminus now that no link
    /// holds it
    fn orphaned(&mut self) -> bool {
        true
    }

    /// Discharges queued by a coordinator terminus for the broker to
    /// run; every other target has none
    fn take_txn_work(&mut self) -> Vec<crate::transaction::PendingDischarge> {
        Vec::new()
    }

    /// The queue behind this target, when there is one
    fn queue(&self) -> Option<SharedQueue> {
        None
    }

    /// True for the transaction coordinator's terminus
    fn is_coordinator(&self) -> bool {
        false
    }
}

/// A node resolves an address to terminus factories
pub trait Node: Send + Sync {
    /// A fresh source reading from this node
    fn source(&self) -> Box<dyn Source>;

    /// A fresh target writing into this node
    fn target(&self) -> Box<dyn Target>;
}

/// Tuning knobs for a queue
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Refuse puts at this depth
    pub threshold: Option<usize>,

    /// Evict the oldest entry beyond this depth
    pub ring: Option<usize>,

    /// Sources take ownership of entries they pass
    pub acquire: bool,

    /// Settlement with a state removes the entry; otherwise it is
    /// released for re-delivery
    pub dequeue: bool,
}

impl QueueOptions {
    /// The configuration of an ordinary work queue
    pub fn work_queue() -> Self {
        Self {
            threshold: None,
            ring: None,
            acquire: true,
            dequeue: true,
        }
    }
}

/// One stored message
#[derive(Debug, Clone)]
pub struct Entry {
    /// Queue-scoped id, monotonic
    pub id: u64,

    /// Tag of the delivery that stored it
    pub tag: DeliveryTag,

    /// Message payload as transferred
    pub payload: Bytes,

    /// Cursor or transaction currently owning the entry
    pub acquired_by: Option<u64>,
}

/// An in-memory queue with ring/threshold limits
#[derive(Debug, Default)]
pub struct Queue {
    options: QueueOptions,
    entries: std::collections::VecDeque<Entry>,
    next_id: u64,
    next_cursor: u64,
    /// Bumped whenever an entry is released or removed out of order
    generation: u64,
}

impl Queue {
    /// An empty queue with the given knobs
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// A shareable queue
    pub fn shared(options: QueueOptions) -> SharedQueue {
        Arc::new(Mutex::new(Self::new(options)))
    }

    /// Entries currently stored, acquired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Room for another entry under the threshold
    pub fn has_capacity(&self) -> bool {
        match self.options.threshold {
            Some(threshold) => self.entries.len() < threshold,
            None => true,
        }
    }

    /// Id of the oldest stored entry
    pub fn head_id(&self) -> u64 {
        self.entries.front().map(|e| e.id).unwrap_or(self.next_id)
    }

    /// Payload of the oldest stored entry
    pub fn head_payload(&self) -> Option<Bytes> {
        self.entries.front().map(|e| e.payload.clone())
    }

    fn allocate_cursor(&mut self) -> u64 {
        self.next_cursor += 1;
        self.next_cursor
    }

    /// Appends an entry; the ring may evict the oldest. Returns None
    /// when the threshold refuses the put.
    pub fn put(&mut self, tag: DeliveryTag, payload: Bytes, owner: Option<u64>) -> Option<u64> {
        if !self.has_capacity() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(Entry {
            id,
            tag,
            payload,
            acquired_by: owner,
        });
        if let Some(ring) = self.options.ring {
            while self.entries.len() > ring {
                self.entries.pop_front();
                self.generation += 1;
            }
        }
        Some(id)
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.entries.binary_search_by_key(&id, |e| e.id).ok()
    }

    /// Makes an acquired entry visible again
    pub fn release(&mut self, id: u64) {
        if let Some(index) = self.position(id) {
            self.entries[index].acquired_by = None;
            self.generation += 1;
        }
    }

    /// Drops an entry outright
    pub fn remove(&mut self, id: u64) -> Option<Entry> {
        let index = self.position(id)?;
        self.generation += 1;
        self.entries.remove(index)
    }

    /// The next visible entry at or beyond `from`, optionally acquiring
    /// it for `cursor`
    fn next_visible(&mut self, from: u64, cursor: Option<u64>) -> Option<Entry> {
        let start = self
            .entries
            .partition_point(|e| e.id < from);
        for index in start..self.entries.len() {
            if self.entries[index].acquired_by.is_none() {
                if let Some(cursor) = cursor {
                    self.entries[index].acquired_by = Some(cursor);
                }
                return Some(self.entries[index].clone());
            }
        }
        None
    }
}

/// A queue-backed node
#[derive(Debug)]
pub struct QueueNode {
    queue: SharedQueue,
}

impl QueueNode {
    /// Wraps a queue as a node
    pub fn new(queue: SharedQueue) -> Self {
        Self { queue }
    }

    /// The underlying queue
    pub fn queue(&self) -> SharedQueue {
        self.queue.clone()
    }
}

impl Node for QueueNode {
    fn source(&self) -> Box<dyn Source> {
        let mut queue = self.queue.lock();
        let cursor = queue.allocate_cursor();
        let next = queue.head_id();
        let generation = queue.generation;
        drop(queue);
        Box::new(QueueSource {
            queue: self.queue.clone(),
            cursor,
            next,
            generation,
            unacked: IndexMap::new(),
        })
    }

    fn target(&self) -> Box<dyn Target> {
        Box::new(QueueTarget {
            queue: self.queue.clone(),
            unsettled: IndexMap::new(),
        })
    }
}

/// A cursor over a queue, destructive or browsing per the queue's
/// acquire/dequeue flags
#[derive(Debug)]
pub struct QueueSource {
    queue: SharedQueue,
    cursor: u64,
    /// Id the cursor will look at next
    next: u64,
    /// Queue generation the cursor last observed
    generation: u64,
    /// `tag -> entry id` for deliveries handed out and not yet settled
    unacked: IndexMap<DeliveryTag, u64>,
}

impl Source for QueueSource {
    fn get(&mut self) -> Option<(DeliveryTag, Bytes)> {
        let mut queue = self.queue.lock();
        if queue.generation != self.generation {
            // something below the cursor was released; rewind
            self.generation = queue.generation;
            self.next = queue.head_id();
        }
        let acquire = queue.options.acquire.then_some(self.cursor);
        loop {
            let entry = queue.next_visible(self.next, acquire)?;
            self.next = entry.id + 1;
            if self.unacked.contains_key(&entry.tag) {
                // already delivered by this source, awaiting settlement
                continue;
            }
            self.unacked.insert(entry.tag.clone(), entry.id);
            return Some((entry.tag, entry.payload));
        }
    }

    fn resume(&mut self, unsettled: &messaging::UnsettledMap) {
        // keep only what the peer still reports, and rewind to the
        // oldest surviving entry
        self.unacked.retain(|tag, _| unsettled.contains_key(tag));
        let mut queue = self.queue.lock();
        self.generation = queue.generation;
        self.next = self
            .unacked
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| queue.head_id());
        // surviving entries stay acquired by this cursor
        for id in self.unacked.values() {
            if let Some(index) = queue.position(*id) {
                queue.entries[index].acquired_by = Some(self.cursor);
            }
        }
    }

    fn settle(
        &mut self,
        tag: &DeliveryTag,
        state: Option<DeliveryState>,
    ) -> Option<DeliveryState> {
        let id = self.unacked.shift_remove(tag)?;
        let mut queue = self.queue.lock();
        if state.is_some() && queue.options.dequeue {
            queue.remove(id);
        } else {
            queue.release(id);
        }
        state
    }

    fn close(&mut self) {
        let mut queue = self.queue.lock();
        for (_, id) in self.unacked.drain(..) {
            queue.release(id);
        }
    }
}

/// The write end of a queue
#[derive(Debug)]
pub struct QueueTarget {
    queue: SharedQueue,
    /// `tag -> entry id` for deliveries stored and not yet settled
    unsettled: IndexMap<DeliveryTag, u64>,
}

impl Target for QueueTarget {
    fn capacity(&self) -> bool {
        self.queue.lock().has_capacity()
    }

    fn put(&mut self, tag: DeliveryTag, payload: Bytes, owner: Option<u64>) -> Put {
        let mut queue = self.queue.lock();
        match queue.put(tag.clone(), payload, owner) {
            Some(id) => {
                self.unsettled.insert(tag, id);
                Put {
                    entry: Some(id),
                    outcome: None,
                }
            }
            None => Put {
                entry: None,
                outcome: Some(DeliveryState::Rejected(messaging::Rejected {
                    error: Some(hematite_types::definitions::Error::condition(
                        hematite_types::definitions::AmqpError::ResourceLimitExceeded,
                    )),
                })),
            },
        }
    }

    fn resume(&mut self, unsettled: &messaging::UnsettledMap) {
        self.unsettled.retain(|tag, _| unsettled.contains_key(tag));
    }

    fn settle(
        &mut self,
        tag: &DeliveryTag,
        state: Option<DeliveryState>,
    ) -> Option<DeliveryState> {
        self.unsettled.shift_remove(tag);
        state
    }

    fn close(&mut self) {
        self.unsettled.clear();
    }

    fn queue(&self) -> Option<SharedQueue> {
        Some(self.queue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_codec::Binary;

    fn tag(n: u32) -> DeliveryTag {
        Binary::from(format!("{n}").as_str())
    }

    fn filled(options: QueueOptions, n: u32) -> SharedQueue {
        let queue = Queue::shared(options);
        for i in 0..n {
            queue
                .lock()
                .put(tag(i), Bytes::from(format!("m{i}")), None);
        }
        queue
    }

    #[test]
    fn ring_evicts_oldest() {
        let queue = filled(
            QueueOptions {
                ring: Some(3),
                ..Default::default()
            },
            5,
        );
        let node = QueueNode::new(queue);
        let mut source = node.source();
        let got: Vec<String> = std::iter::from_fn(|| source.get())
            .map(|(_, payload)| String::from_utf8(payload.to_vec()).unwrap())
            .collect();
        assert_eq!(got, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn threshold_refuses_puts() {
        let queue = filled(
            QueueOptions {
                threshold: Some(2),
                ..Default::default()
            },
            2,
        );
        assert!(!queue.lock().has_capacity());
        assert_eq!(queue.lock().put(tag(9), Bytes::new(), None), None);
    }

    #[test]
    fn acquiring_sources_do_not_share_entries() {
        let queue = filled(QueueOptions::work_queue(), 2);
        let node = QueueNode::new(queue);
        let mut one = node.source();
        let mut two = node.source();
        let first = one.get().unwrap();
        let second = two.get().unwrap();
        assert_ne!(first.0, second.0, "each entry goes to one source");
        assert!(one.get().is_none() && two.get().is_none());
    }

    #[test]
    fn released_entries_rewind_other_cursors() {
        let queue = filled(QueueOptions::work_queue(), 1);
        let node = QueueNode::new(queue);
        let mut one = node.source();
        let mut two = node.source();
        let (t, _) = one.get().unwrap();
        assert!(two.get().is_none());

        // settle with no state: released for re-delivery
        one.settle(&t, None);
        let redelivered = two.get().expect("rewound cursor sees the release");
        assert_eq!(redelivered.0, t);
    }

    #[test]
    fn settle_with_state_dequeues() {
        let queue = filled(QueueOptions::work_queue(), 1);
        let node = QueueNode::new(queue.clone());
        let mut source = node.source();
        let (t, _) = source.get().unwrap();
        source.settle(&t, Some(DeliveryState::accepted()));
        assert!(queue.lock().is_empty());
    }

    #[test]
    fn browsing_source_leaves_entries_in_place() {
        let queue = filled(QueueOptions::default(), 3);
        let node = QueueNode::new(queue.clone());
        let mut browser = node.source();
        let seen: Vec<_> = std::iter::from_fn(|| browser.get()).collect();
        assert_eq!(seen.len(), 3);
        assert_eq!(queue.lock().len(), 3);

        // a second browser sees the same entries
        let mut again = node.source();
        assert_eq!(std::iter::from_fn(|| again.get()).count(), 3);
    }

    #[test]
    fn close_releases_held_entries() {
        let queue = filled(QueueOptions::work_queue(), 2);
        let node = QueueNode::new(queue);
        let mut one = node.source();
        let _ = one.get().unwrap();
        let _ = one.get().unwrap();
        one.close();
        let mut two = node.source();
        assert_eq!(std::iter::from_fn(|| two.get()).count(), 2);
    }

    #[test]
    fn acquired_puts_stay_invisible_until_released() {
        let queue = Queue::shared(QueueOptions::work_queue());
        let node = QueueNode::new(queue.clone());
        let mut target = node.target();
        let put = target.put(tag(0), Bytes::from_static(b"m"), Some(77));
        let id = put.entry.unwrap();

        let mut source = node.source();
        assert!(source.get().is_none(), "acquired entry is invisible");
        queue.lock().release(id);
        assert!(source.get().is_some(), "released entry is delivered");
    }
}
