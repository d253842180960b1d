//! Transaction coordinator: declare/discharge of transaction ids and
//! the per-transaction deferred work list.
//!
//! Work items are do/undo pairs expressed as data and executed against
//! broker state on discharge. Settlements recorded inside a transaction
//! are held on the work list and are not visible to the peer until the
//! commit runs; rollback runs the undo side instead.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use hematite_types::definitions::{DeliveryTag, Error as WireError, TransactionError};
use hematite_types::messaging::{self, DeliveryState, Message, TargetArchetype};
use hematite_types::transaction::{Declare, Declared, Discharge, TransactionId, TransactionalState};
use hematite_types::Composite;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::terminus::{Put, SharedQueue, Target};

/// A shared coordinator handle
pub type SharedCoordinator = Arc<Mutex<TxnCoordinator>>;

/// One do/undo pair, deferred until discharge
#[derive(Debug)]
pub enum TxnWork {
    /// Sender-side retirement: settle at the source and at the link on
    /// commit; release on rollback
    Retire {
        /// `(container-id, link-name)` key into the broker's sources
        source_key: (String, String),
        /// Session slot holding the link
        session: usize,
        /// Link slot within the session
        link: usize,
        /// The delivery being retired
        tag: DeliveryTag,
        /// State to apply on commit
        state: Option<DeliveryState>,
    },

    /// Receiver-side enlistment: the entry is already stored but
    /// acquired by the transaction; commit releases it into view,
    /// rollback removes it
    Enlist {
        /// The queue holding the entry
        queue: SharedQueue,
        /// The acquired entry
        entry: u64,
    },

    /// Receiver-side settlement of an enlisted delivery, deferred so
    /// the peer sees no outcome until the discharge runs
    Settle {
        /// Session slot holding the link
        session: usize,
        /// Link slot within the session
        link: usize,
        /// The delivery to settle
        tag: DeliveryTag,
        /// State to apply on commit
        state: Option<DeliveryState>,
    },
}

/// A transaction and its deferred work
#[derive(Debug)]
pub struct Transaction {
    /// Coordinator-issued id
    pub txn_id: TransactionId,

    /// Work to run (or undo) at discharge
    pub work: Vec<TxnWork>,

    /// Queue-entry owner token for enlisted entries
    pub owner: u64,
}

impl Transaction {
    /// Defers a do/undo pair until discharge
    pub fn add_work(&mut self, work: TxnWork) {
        self.work.push(work);
    }
}

/// Allocates transaction ids and tracks live transactions
#[derive(Debug, Default)]
pub struct TxnCoordinator {
    transactions: HashMap<TransactionId, Transaction>,
    next_id: u64,
}

impl TxnCoordinator {
    /// An empty coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// A shareable coordinator
    pub fn shared() -> SharedCoordinator {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Allocates a fresh transaction
    pub fn declare(&mut self) -> TransactionId {
        let id = self.next_id;
        self.next_id += 1;
        let txn_id = hematite_codec::Binary::from(format!("txn-{id}").as_str());
        self.transactions.insert(
            txn_id.clone(),
            Transaction {
                txn_id: txn_id.clone(),
                work: Vec::new(),
                // owner tokens share the id space with queue cursors by
                // offset, so they never collide
                owner: u64::MAX - id,
            },
        );
        txn_id
    }

    /// The live transaction a transactional delivery state names
    pub fn transaction_mut(&mut self, state: &DeliveryState) -> Option<&mut Transaction> {
        match state {
            DeliveryState::TransactionalState(TransactionalState { txn_id, .. }) => {
                self.transactions.get_mut(txn_id)
            }
            _ => None,
        }
    }

    /// Looks a transaction up by id
    pub fn get_mut(&mut self, txn_id: &TransactionId) -> Option<&mut Transaction> {
        self.transactions.get_mut(txn_id)
    }

    /// Removes a transaction, handing its work list to the caller;
    /// None for an unknown id
    pub fn discharge(&mut self, txn_id: &TransactionId) -> Option<Vec<TxnWork>> {
        self.transactions.remove(txn_id).map(|txn| txn.work)
    }

    /// Ids of every live transaction
    pub fn live(&self) -> Vec<TransactionId> {
        self.transactions.keys().cloned().collect()
    }
}

/// A discharge the broker still has to run
#[derive(Debug)]
pub struct PendingDischarge {
    /// The work list removed from the coordinator
    pub work: Vec<TxnWork>,

    /// True to roll back
    pub fail: bool,
}

/// The coordinator's terminus: recognizes Declare and Discharge control
/// messages in the message body
#[derive(Debug)]
pub struct TxnTarget {
    coordinator: SharedCoordinator,
    /// `tag -> outcome` for control deliveries not yet settled
    unsettled: IndexMap<DeliveryTag, DeliveryState>,
    pending: Vec<PendingDischarge>,
}

impl TxnTarget {
    /// A terminus dispatching into `coordinator`
    pub fn new(coordinator: SharedCoordinator) -> Self {
        Self {
            coordinator,
            unsettled: IndexMap::new(),
            pending: Vec::new(),
        }
    }

    fn unknown_id() -> DeliveryState {
        DeliveryState::Rejected(messaging::Rejected {
            error: Some(WireError::condition(TransactionError::UnknownId)),
        })
    }
}

impl Target for TxnTarget {
    fn configure(&mut self, remote: &TargetArchetype) -> TargetArchetype {
        remote.clone()
    }

    fn capacity(&self) -> bool {
        true
    }

    fn put(&mut self, tag: DeliveryTag, payload: Bytes, _owner: Option<u64>) -> Put {
        let body = Message::decode(&payload)
            .ok()
            .and_then(|message| message.body_value().cloned());

        let outcome = match body {
            Some(value) if Declare::descriptor_matches_value(&value) => {
                let txn_id = self.coordinator.lock().declare();
                DeliveryState::Declared(Declared { txn_id })
            }
            Some(value) if Discharge::descriptor_matches_value(&value) => {
                match Discharge::from_value(value) {
                    Ok(discharge) => {
                        let work = self.coordinator.lock().discharge(&discharge.txn_id);
                        match work {
                            Some(work) => {
                                self.pending.push(PendingDischarge {
                                    work,
                                    fail: discharge.fail.unwrap_or(false),
                                });
                                DeliveryState::accepted()
                            }
                            None => Self::unknown_id(),
                        }
                    }
                    Err(_) => Self::unknown_id(),
                }
            }
            _ => DeliveryState::Rejected(messaging::Rejected {
                error: Some(WireError::new(
                    hematite_types::definitions::AmqpError::DecodeError,
                    "expected a declare or discharge body",
                )),
            }),
        };

        self.unsettled.insert(tag, outcome.clone());
        Put {
            entry: None,
            outcome: Some(outcome),
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
        self.unsettled.shift_remove(tag).or(state)
    }

    fn close(&mut self) {
        // every live transaction fails when its control link goes away
        let live = self.coordinator.lock().live();
        for txn_id in live {
            if let Some(work) = self.coordinator.lock().discharge(&txn_id) {
                self.pending.push(PendingDischarge { work, fail: true });
            }
        }
    }

    fn take_txn_work(&mut self) -> Vec<PendingDischarge> {
        std::mem::take(&mut self.pending)
    }

    fn is_coordinator(&self) -> bool {
        true
    }
}

trait DescriptorProbe {
    fn descriptor_matches_value(value: &hematite_codec::Value) -> bool;
}

impl<T: Composite> DescriptorProbe for T {
    fn descriptor_matches_value(value: &hematite_codec::Value) -> bool {
        value
            .as_described()
            .map(|described| T::descriptor_matches(&described.descriptor))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hematite_codec::Binary;

    fn declare_payload() -> Bytes {
        Message::value(Declare::default().to_value()).encode()
    }

    fn discharge_payload(txn_id: &TransactionId, fail: bool) -> Bytes {
        Message::value(
            Discharge {
                txn_id: txn_id.clone(),
                fail: Some(fail),
            }
            .to_value(),
        )
        .encode()
    }

    #[test]
    fn declare_allocates_distinct_ids() {
        let coordinator = TxnCoordinator::shared();
        let mut target = TxnTarget::new(coordinator.clone());

        let one = target.put(Binary::from("0"), declare_payload(), None);
        let two = target.put(Binary::from("1"), declare_payload(), None);
        let id = |put: Put| match put.outcome {
            Some(DeliveryState::Declared(Declared { txn_id })) => txn_id,
            other => panic!("expected declared, got {other:?}"),
        };
        assert_ne!(id(one), id(two));
        assert_eq!(coordinator.lock().live().len(), 2);
    }

    #[test]
    fn discharge_removes_and_hands_back_work() {
        let coordinator = TxnCoordinator::shared();
        let mut target = TxnTarget::new(coordinator.clone());
        let txn_id = coordinator.lock().declare();
        let queue = crate::terminus::Queue::shared(Default::default());
        coordinator
            .lock()
            .get_mut(&txn_id)
            .unwrap()
            .add_work(TxnWork::Enlist {
                queue,
                entry: 0,
            });

        let put = target.put(Binary::from("d"), discharge_payload(&txn_id, false), None);
        assert!(matches!(put.outcome, Some(DeliveryState::Accepted(_))));
        let pending = target.take_txn_work();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].work.len(), 1);
        assert!(!pending[0].fail);
        assert!(coordinator.lock().live().is_empty());
    }

    #[test]
    fn unknown_id_is_rejected_not_fatal() {
        let coordinator = TxnCoordinator::shared();
        let mut target = TxnTarget::new(coordinator);
        let put = target.put(
            Binary::from("d"),
            discharge_payload(&Binary::from("txn-99"), false),
            None,
        );
        match put.outcome {
            Some(DeliveryState::Rejected(rejected)) => {
                let condition = rejected.error.unwrap().condition;
                assert_eq!(
                    condition,
                    hematite_types::definitions::ErrorCondition::Transaction(
                        TransactionError::UnknownId
                    )
                );
            }
            other => panic!("expected rejected, got {other:?}"),
        }
    }

    #[test]
    fn close_discharges_live_txns_as_failed() {
        let coordinator = TxnCoordinator::shared();
        let mut target = TxnTarget::new(coordinator.clone());
        coordinator.lock().declare();
        coordinator.lock().declare();
        target.close();
        let pending = target.take_txn_work();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|p| p.fail));
        assert!(coordinator.lock().live().is_empty());
    }
}
