//! Delivery-id bookkeeping for one direction of a session.
//!
//! Ids are RFC-1982 serial numbers. The map keeps every live delivery
//! between the unsettled low-water mark and the next id, aliased both
//! ways: `(link, tag) -> id` and `id -> (link, tag)`. Settled ids are
//! blanked in place and the low-water mark advances over the settled
//! prefix, so `lwm <= id < next` holds for every live id.

use std::collections::HashMap;

use hematite_types::definitions::{DeliveryNumber, DeliveryTag};

/// Serial less-than over u32 ids
pub(crate) fn serial_lt(a: DeliveryNumber, b: DeliveryNumber) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// How the incoming window refills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowPolicy {
    /// Refills by one per delivery accepted; the peer sees a steady
    /// window
    #[default]
    Sliding,

    /// Holds until reset via `set_incoming_window`
    Fixed,
}

/// One direction's delivery map
#[derive(Debug, Default)]
pub(crate) struct DeliveryMap {
    /// `(link slot, tag) -> id`
    aliases: HashMap<(usize, DeliveryTag), DeliveryNumber>,

    /// `id - lwm -> (link slot, tag)`; settled entries are blanked
    deliveries: std::collections::VecDeque<Option<(usize, DeliveryTag)>>,

    /// Id of the oldest entry still tracked
    lwm: DeliveryNumber,

    /// The id the next delivery will take; hwm is `next - 1`
    next: DeliveryNumber,
}

impl DeliveryMap {
    pub(crate) fn new(initial: DeliveryNumber) -> Self {
        Self {
            aliases: HashMap::new(),
            deliveries: Default::default(),
            lwm: initial,
            next: initial,
        }
    }

    /// Re-bases an incoming map once the peer's Begin arrives
    pub(crate) fn rebase(&mut self, initial: DeliveryNumber) {
        debug_assert!(self.deliveries.is_empty());
        self.lwm = initial;
        self.next = initial;
    }

    pub(crate) fn lwm(&self) -> DeliveryNumber {
        self.lwm
    }

    /// The id the next delivery will take
    pub(crate) fn next_id(&self) -> DeliveryNumber {
        self.next
    }

    /// Assigns the next id to an outgoing delivery
    pub(crate) fn assign(&mut self, slot: usize, tag: DeliveryTag) -> DeliveryNumber {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        self.deliveries.push_back(Some((slot, tag.clone())));
        self.aliases.insert((slot, tag), id);
        id
    }

    /// Records an incoming delivery id, which must be the expected next
    pub(crate) fn record(
        &mut self,
        id: DeliveryNumber,
        slot: usize,
        tag: DeliveryTag,
    ) -> Result<(), DeliveryNumber> {
        if id != self.next {
            return Err(self.next);
        }
        self.assign(slot, tag);
        Ok(())
    }

    pub(crate) fn id_of(&self, slot: usize, tag: &DeliveryTag) -> Option<DeliveryNumber> {
        self.aliases.get(&(slot, tag.clone())).copied()
    }

    pub(crate) fn get(&self, id: DeliveryNumber) -> Option<&(usize, DeliveryTag)> {
        if serial_lt(id, self.lwm) || !serial_lt(id, self.next) {
            return None;
        }
        let index = id.wrapping_sub(self.lwm) as usize;
        self.deliveries.get(index)?.as_ref()
    }

    /// The live ids within `[max(lwm, first), last]`, oldest first
    pub(crate) fn range(
        &self,
        first: DeliveryNumber,
        last: DeliveryNumber,
    ) -> Vec<(DeliveryNumber, usize, DeliveryTag)> {
        let mut out = Vec::new();
        let start = if serial_lt(first, self.lwm) {
            self.lwm
        } else {
            first
        };
        let mut id = start;
        while !serial_lt(last, id) {
            if let Some((slot, tag)) = self.get(id) {
                out.push((id, *slot, tag.clone()));
            }
            if !serial_lt(id, self.next) {
                break;
            }
            id = id.wrapping_add(1);
        }
        out
    }

    /// Removes a settled id; the low-water mark advances over the
    /// settled prefix
    pub(crate) fn settle(&mut self, id: DeliveryNumber) {
        if serial_lt(id, self.lwm) || !serial_lt(id, self.next) {
            return;
        }
        let index = id.wrapping_sub(self.lwm) as usize;
        if let Some(entry) = self.deliveries.get_mut(index) {
            if let Some((slot, tag)) = entry.take() {
                self.aliases.remove(&(slot, tag));
            }
        }
        while matches!(self.deliveries.front(), Some(None)) {
            self.deliveries.pop_front();
            self.lwm = self.lwm.wrapping_add(1);
        }
    }

    /// Count of live deliveries
    pub(crate) fn live(&self) -> usize {
        self.aliases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_codec::Binary;

    fn tag(n: u32) -> DeliveryTag {
        Binary::from(format!("{n}").as_str())
    }

    #[test]
    fn assign_is_monotonic_and_gap_free() {
        let mut map = DeliveryMap::new(10);
        assert_eq!(map.assign(0, tag(0)), 10);
        assert_eq!(map.assign(0, tag(1)), 11);
        assert_eq!(map.assign(1, tag(0)), 12);
        assert_eq!(map.lwm(), 10);
        assert_eq!(map.next_id(), 13);
    }

    #[test]
    fn record_rejects_gaps() {
        let mut map = DeliveryMap::new(0);
        map.record(0, 0, tag(0)).unwrap();
        assert_eq!(map.record(2, 0, tag(2)), Err(1));
    }

    #[test]
    fn lwm_advances_over_contiguous_settled_prefix() {
        let mut map = DeliveryMap::new(0);
        for n in 0..4 {
            map.assign(0, tag(n));
        }
        map.settle(1);
        assert_eq!(map.lwm(), 0, "id 0 still live");
        map.settle(0);
        assert_eq!(map.lwm(), 2, "0 and 1 both settled");
        assert!(map.get(1).is_none());
        assert_eq!(map.get(2), Some(&(0, tag(2))));
        // settling again is a no-op
        map.settle(0);
        assert_eq!(map.lwm(), 2);
        assert_eq!(map.live(), 2);
    }

    #[test]
    fn range_clamps_to_lwm() {
        let mut map = DeliveryMap::new(5);
        for n in 0..3 {
            map.assign(0, tag(n));
        }
        map.settle(5);
        let ids: Vec<_> = map.range(0, 7).into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec![6, 7]);
    }

    #[test]
    fn aliases_resolve_both_ways() {
        let mut map = DeliveryMap::new(0);
        let id = map.assign(3, tag(9));
        assert_eq!(map.id_of(3, &tag(9)), Some(id));
        assert_eq!(map.get(id), Some(&(3, tag(9))));
        map.settle(id);
        assert_eq!(map.id_of(3, &tag(9)), None);
    }

    #[test]
    fn serial_comparison_wraps() {
        assert!(serial_lt(u32::MAX, 0));
        assert!(serial_lt(u32::MAX - 1, 1));
        assert!(!serial_lt(1, u32::MAX));
    }
}
