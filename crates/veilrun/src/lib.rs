//! # Veilrun
//!
//! Cross-context service dispatch: the same named service methods are
//! callable from any execution context, while one context (the background
//! process) holds the real implementation. Proxy calls marshal across a
//! message channel as [`veilrpc`] frames carrying [`veilpack`] wire values.
//!
//! ## Architecture
//!
//! - [`channel`]: fire-and-forget message conduits between contexts, with
//!   a loopback variant that never leaves the process.
//! - [`service`]: the explicit service interface and dispatch tables.
//! - [`dispatcher`]: plain calls, correlation ids, the pending-call table,
//!   request serving, error marshalling.
//! - [`stream`]: generator-style calls, in-order incremental values,
//!   consumer-driven cancellation.
//! - [`registry`]: the per-process name to dispatcher table, with execution
//!   roles and mock wiring for isolated UI development.

pub mod channel;
pub mod dispatcher;
pub mod registry;
pub mod service;
pub mod stream;

#[cfg(test)]
mod tests;

pub use channel::Channel;
pub use channel::LoopbackChannel;
pub use channel::PairChannel;
pub use dispatcher::CallDispatcher;
pub use dispatcher::CallError;
pub use dispatcher::DispatchOptions;
pub use dispatcher::LogOptions;
pub use registry::ExecutionRole;
pub use registry::ServiceRegistry;
pub use registry::Wiring;
pub use service::EmptyService;
pub use service::MethodTable;
pub use service::Service;
pub use stream::StreamDispatcher;
pub use stream::StreamService;
pub use stream::ValueStream;
