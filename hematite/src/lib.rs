//! An AMQP 1.0 protocol engine, peer library, and message broker.
//!
//! The engine is a single-threaded cooperative state machine: bytes go
//! in through the [`transport::Transport`], frames climb through the
//! [`connection::Connection`] to its sessions and links, and replies
//! come back down the same path when the I/O driver ticks. No layer
//! blocks and no layer reads the clock; [`engine::Engine`] and the
//! [`broker::Broker`] listener own the sockets and the timers.

#![deny(missing_docs, missing_debug_implementations)]

pub mod broker;
pub mod connection;
pub mod engine;
pub mod frames;
pub mod link;
pub mod sasl;
pub mod session;
pub mod terminus;
pub mod trace;
pub mod transaction;
pub mod transport;

/// Transfer payload bytes as they ride through the engine
pub type Payload = bytes::Bytes;

pub use broker::{Broker, BrokerCore, BrokerOptions};
pub use connection::{Connection, ConnectionError, ConnectionOptions};
pub use engine::{Engine, EngineError};
pub use link::{Delivery, LinkEndpoint, LinkOptions};
pub use session::{Session, SessionError, WindowPolicy};
