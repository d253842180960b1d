//! Wire-level types for the AMQP 1.0 protocol engine.
//!
//! The protocol schema declares every body as a composite: a descriptor
//! plus an ordered field list with mandatory/multiple/default markers.
//! This crate is the generated, hand-maintained form of that table:
//! structs bound through the [`binding`] kernel over the typed-value
//! codec, with dispatch enums ([`performatives::Performative`],
//! [`sasl::SaslFrameBody`], [`messaging::DeliveryState`]) in place of
//! any runtime schema lookup.

#![deny(missing_docs, missing_debug_implementations)]

pub mod binding;
pub mod definitions;
pub mod messaging;
pub mod performatives;
pub mod sasl;
pub mod states;
pub mod transaction;

pub use binding::{Composite, Error as BindError, FieldValue, Multiple};
