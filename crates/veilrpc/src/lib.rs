//! # Veilrpc
//!
//! The envelope protocol for cross-context service calls, layered on
//! [`veilpack`] wire values.
//!
//! ## Architecture
//!
//! A [`Frame`] is the unit a message channel carries: a request, a reply
//! (success or fault), or one of the incremental frames of a streaming call.
//! Every frame is tagged with a service key so multiple services can share
//! one channel without collision, and a correlation id linking it to the
//! call it belongs to.
//!
//! This crate knows nothing about channels or dispatchers; it is a pure
//! mapping between [`Frame`] and [`veilpack::WireValue`].

pub mod error;
pub mod frame;


pub use error::Fault;
pub use error::ProtocolError;
pub use error::Result;
pub use frame::Frame;
pub use frame::decode_key;
pub use frame::decode_seq;
