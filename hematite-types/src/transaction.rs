//! Transaction types from Part 4

use hematite_codec::{Binary, Symbol, Value};

use crate::binding::{field, optional, Composite, Error as BindError, FieldValue, ListDecoder, Multiple};
use crate::messaging::Outcome;

/// 4.5.2 Transaction Id: opaque binary issued by the coordinator
pub type TransactionId = Binary;

/// Well-known txn-capability symbols
pub mod capability {
    /// Local transactions only
    pub const LOCAL_TRANSACTIONS: &str = "amqp:local-transactions";
    /// Multiple active transactions on one session
    pub const MULTI_TXNS_PER_SSN: &str = "amqp:multi-txns-per-ssn";
    /// One transaction spanning multiple sessions
    pub const MULTI_SSNS_PER_TXN: &str = "amqp:multi-ssns-per-txn";
}

/// 4.5.1 Coordinator
///
/// A special target used for establishing a link with the transaction
/// coordinator.
///
/// <descriptor name="amqp:coordinator:list" code="0x00000000:0x00000030"/>
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coordinator {
    /// Capabilities desired (controller) or offered (resource)
    pub capabilities: Option<Multiple<Symbol>>,
}

impl Composite for Coordinator {
    const NAME: &'static str = "amqp:coordinator:list";
    const CODE: u64 = 0x0000_0000_0000_0030;

    fn to_list(&self) -> Vec<Value> {
        vec![optional(self.capabilities.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            capabilities: decoder.optional("capabilities")?,
        })
    }
}

/// 4.5.3 Declare
///
/// Message body that asks the coordinator to allocate a transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declare {
    /// Global id of the enclosing distributed transaction, if any
    pub global_id: Option<Value>,
}

impl Composite for Declare {
    const NAME: &'static str = "amqp:declare:list";
    const CODE: u64 = 0x0000_0000_0000_0031;

    fn to_list(&self) -> Vec<Value> {
        vec![optional(self.global_id.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            global_id: decoder.optional("global-id")?,
        })
    }
}

/// 4.5.4 Discharge
///
/// Message body that commits (`fail=false`) or rolls back (`fail=true`)
/// a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Discharge {
    /// The transaction being discharged
    pub txn_id: TransactionId,

    /// True to roll back
    pub fail: Option<bool>,
}

impl Composite for Discharge {
    const NAME: &'static str = "amqp:discharge:list";
    const CODE: u64 = 0x0000_0000_0000_0032;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.txn_id.clone()), optional(self.fail)]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            txn_id: decoder.mandatory("txn-id")?,
            fail: decoder.optional("fail")?,
        })
    }
}

/// 4.5.5 Declared
///
/// Outcome carrying the allocated transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct Declared {
    /// The allocated transaction id
    pub txn_id: TransactionId,
}

impl Composite for Declared {
    const NAME: &'static str = "amqp:declared:list";
    const CODE: u64 = 0x0000_0000_0000_0033;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.txn_id.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            txn_id: decoder.mandatory("txn-id")?,
        })
    }
}

/// 4.5.6 Transactional State
///
/// Delivery state that scopes an outcome to a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionalState {
    /// The enclosing transaction
    pub txn_id: TransactionId,

    /// The provisional outcome inside the transaction
    pub outcome: Option<Outcome>,
}

impl TransactionalState {
    /// Scopes a delivery to `txn_id` with no provisional outcome
    pub fn new(txn_id: TransactionId) -> Self {
        Self {
            txn_id,
            outcome: None,
        }
    }
}

impl Composite for TransactionalState {
    const NAME: &'static str = "amqp:transactional-state:list";
    const CODE: u64 = 0x0000_0000_0000_0034;

    fn to_list(&self) -> Vec<Value> {
        vec![field(self.txn_id.clone()), optional(self.outcome.clone())]
    }

    fn from_list(fields: Vec<Value>) -> Result<Self, BindError> {
        let mut decoder = ListDecoder::new(Self::NAME, fields);
        Ok(Self {
            txn_id: decoder.mandatory("txn-id")?,
            outcome: decoder.optional("outcome")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::Accepted;

    #[test]
    fn declare_and_discharge_round_trip() {
        let declare = Declare::default();
        assert_eq!(
            Declare::decode(&declare.encode()).unwrap(),
            declare
        );

        let discharge = Discharge {
            txn_id: Binary::from("txn-0"),
            fail: Some(false),
        };
        assert_eq!(Discharge::decode(&discharge.encode()).unwrap(), discharge);
    }

    #[test]
    fn transactional_state_round_trip() {
        let state = TransactionalState {
            txn_id: Binary::from("txn-1"),
            outcome: Some(Outcome::Accepted(Accepted)),
        };
        assert_eq!(
            TransactionalState::decode(&state.encode()).unwrap(),
            state
        );
    }

    #[test]
    fn discharge_requires_txn_id() {
        let err = Discharge::from_list(vec![Value::Null, Value::Bool(true)]).unwrap_err();
        assert!(matches!(err, BindError::MandatoryFieldNull { field: "txn-id", .. }));
    }
}
