//! # Call Dispatcher
//!
//! Connects a local service implementation and a remote proxy through one
//! message channel. Each dispatcher is both sides at once: an async pump
//! serves inbound requests against the local implementation, and routes
//! inbound replies to the pending call they correlate with.
//!
//! ## Invariants
//!
//! - Correlation ids come from a monotonic counter, unique for the lifetime
//!   of the dispatcher instance; a pending call settles at most once.
//! - Frames tagged with another service key are ignored, so multiple
//!   dispatchers can share a channel without collision.
//! - A failed or missing remote method surfaces as an ordinary error on the
//!   caller side; nothing tears down the pump.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::oneshot;

use veilpack::SerializationError;
use veilpack::Value;
use veilpack::WireValue;
use veilpack::deserialize;
use veilpack::serialize;
use veilrpc::Fault;
use veilrpc::Frame;
use veilrpc::ProtocolError;
use veilrpc::decode_key;
use veilrpc::decode_seq;

use crate::channel::Channel;
use crate::channel::ChannelError;
use crate::channel::Subscription;
use crate::service::Service;
use crate::service::ServiceFault;

/// Which events a dispatcher reports through `tracing`.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log every inbound and outbound call with its rendered signature.
    pub calls: bool,
    /// Log faults raised by the local implementation.
    pub local_errors: bool,
    /// Log rejections coming back from the remote side.
    pub remote_errors: bool,
    /// Include the local stack in error replies sent to the remote caller.
    pub send_local_stack: bool,
}

impl LogOptions {
    pub fn verbose() -> Self {
        Self {
            calls: true,
            local_errors: true,
            remote_errors: true,
            send_local_stack: true,
        }
    }

    pub fn quiet() -> Self {
        Self {
            calls: false,
            local_errors: false,
            remote_errors: false,
            send_local_stack: false,
        }
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self::verbose()
    }
}

/// Configuration of one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Unique key identifying this service on the shared channel.
    pub key: String,
    /// Strict dispatchers answer undecodable frames with a protocol fault
    /// when a correlation id can still be recovered; lenient ones drop them.
    pub strict: bool,
    /// Bypass the channel when the current context holds the implementation.
    pub prefer_local: bool,
    pub log: LogOptions,
}

impl DispatchOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            strict: false,
            prefer_local: false,
            log: LogOptions::default(),
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn prefer_local(mut self, prefer_local: bool) -> Self {
        self.prefer_local = prefer_local;
        self
    }

    pub fn log(mut self, log: LogOptions) -> Self {
        self.log = log;
        self
    }
}

/// A remote implementation ran and failed.
#[derive(Debug, Clone)]
pub struct RemoteFault {
    pub message: String,
    /// The remote stack, when the remote dispatcher chose to send it.
    pub stack: Option<String>,
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors a caller can observe from a dispatched call.
#[derive(Debug, Clone)]
pub enum CallError {
    /// An argument or result could not be encoded or decoded.
    Serialization(SerializationError),
    /// The method does not exist on the implementation side.
    MethodNotFound { service: String, method: String },
    /// The remote implementation threw; message and optional stack survive
    /// the marshalling.
    Remote(RemoteFault),
    /// A malformed or out-of-sequence envelope failed the call locally.
    Protocol(ProtocolError),
    /// The channel can no longer deliver or answer.
    ChannelClosed,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::MethodNotFound { service, method } => {
                write!(f, "Method {}.{} not found", service, method)
            }
            Self::Remote(fault) => write!(f, "Remote execution error: {}", fault),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::ChannelClosed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialization(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SerializationError> for CallError {
    fn from(e: SerializationError) -> Self {
        Self::Serialization(e)
    }
}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ChannelError> for CallError {
    fn from(_: ChannelError) -> Self {
        Self::ChannelClosed
    }
}

/// Lets producer code propagate dispatch failures (for example a closed
/// channel under a stream sink) with `?`.
impl From<CallError> for ServiceFault {
    fn from(e: CallError) -> Self {
        ServiceFault::failed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

/// One unanswered outbound call.
struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct Inner {
    options: DispatchOptions,
    local: Arc<dyn Service>,
    channel: Arc<dyn Channel>,
    pending: DashMap<u64, PendingCall>,
    seq_gen: AtomicU64,
}

/// The dispatcher for plain (single-result) calls.
///
/// Cheap to clone; every clone shares the pump, the pending-call table, and
/// the correlation counter.
#[derive(Clone)]
pub struct CallDispatcher {
    inner: Arc<Inner>,
}

impl CallDispatcher {
    /// Wires `local` and the proxy side onto `channel` and spawns the pump.
    pub fn new(
        local: Arc<dyn Service>,
        channel: Arc<dyn Channel>,
        options: DispatchOptions,
    ) -> Self {
        let subscription = channel.subscribe();
        let inner = Arc::new(Inner {
            options,
            local,
            channel,
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
        });

        tokio::spawn(pump(subscription, Arc::downgrade(&inner)));

        Self { inner }
    }

    /// The service key this dispatcher answers to.
    pub fn key(&self) -> &str {
        &self.inner.options.key
    }

    /// Invokes `method` with `args`, locally when preferred and possible,
    /// otherwise across the channel.
    ///
    /// There is no built-in timeout: a stalled channel leaves the returned
    /// future pending indefinitely.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let inner = &self.inner;

        if inner.options.log.calls {
            tracing::debug!(
                service = %inner.options.key,
                "call {}",
                signature(&inner.options.key, method, &args)
            );
        }

        // The context that owns the implementation skips the round trip.
        if inner.options.prefer_local && inner.local.has_method(method) {
            return inner.call_local(method, args).await;
        }

        let mut wire_args = Vec::with_capacity(args.len());
        for arg in &args {
            wire_args.push(serialize(arg)?);
        }

        let seq = inner.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            seq,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        let request = Frame::Request {
            key: inner.options.key.clone(),
            seq,
            method: method.to_string(),
            args: wire_args,
        };
        if let Err(e) = inner.channel.send(request.encode()) {
            inner.pending.remove(&seq);
            return Err(e.into());
        }

        match rx.await {
            Ok(result) => {
                if inner.options.log.remote_errors {
                    if let Err(error) = &result {
                        tracing::warn!(
                            service = %inner.options.key,
                            method,
                            %error,
                            stack = remote_stack(error),
                            "remote call rejected"
                        );
                    }
                }
                result
            }
            // The pump dropped the entry without settling; only happens when
            // the pump itself died.
            Err(_) => {
                inner.pending.remove(&seq);
                Err(CallError::ChannelClosed)
            }
        }
    }
}

async fn pump(mut subscription: Subscription, inner: Weak<Inner>) {
    while let Some(message) = subscription.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_message(&inner, message);
    }
    // The channel side is gone; fail whatever is still waiting.
    if let Some(inner) = inner.upgrade() {
        inner.close_pending();
    }
}

impl Inner {
    fn handle_message(&self, this: &Arc<Inner>, message: WireValue) {
        match Frame::decode(&message) {
            Ok(frame) => {
                // Another service's traffic on the shared channel.
                if frame.key() != self.options.key {
                    return;
                }
                match frame {
                    Frame::Request {
                        seq, method, args, ..
                    } => self.serve(this, seq, method, args),
                    Frame::ReplyOk { seq, result, .. } => {
                        let outcome = deserialize(&result).map_err(CallError::from);
                        self.settle(seq, outcome);
                    }
                    Frame::ReplyErr {
                        seq,
                        fault,
                        message,
                        stack,
                        ..
                    } => {
                        let error = self.remote_error(seq, fault, message, stack);
                        self.settle(seq, Err(error));
                    }
                    // Stream frames belong to a streaming dispatcher.
                    Frame::Next { .. } | Frame::Done { .. } | Frame::Cancel { .. } => {}
                }
            }
            Err(error) => self.reject_malformed(&message, error),
        }
    }

    /// A frame that failed to decode. Strict dispatchers answer with a
    /// protocol fault when the header is still readable; lenient ones drop.
    fn reject_malformed(&self, message: &WireValue, error: ProtocolError) {
        let ours = decode_key(message).is_ok_and(|key| key == self.options.key);
        if !ours {
            return;
        }
        tracing::debug!(service = %self.options.key, %error, "dropping malformed frame");
        if !self.options.strict {
            return;
        }
        if let Ok(seq) = decode_seq(message) {
            let reply = Frame::ReplyErr {
                key: self.options.key.clone(),
                seq,
                fault: Fault::Protocol,
                message: error.to_string(),
                stack: None,
            };
            let _ = self.channel.send(reply.encode());
        }
    }

    /// Serves one inbound request on its own task, so slow methods do not
    /// block the pump or each other.
    fn serve(&self, this: &Arc<Inner>, seq: u64, method: String, args: Vec<WireValue>) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let reply = inner.execute(seq, &method, args).await;
            if let Err(error) = inner.channel.send(reply.encode()) {
                tracing::warn!(
                    service = %inner.options.key,
                    method,
                    seq,
                    %error,
                    "reply could not be delivered"
                );
            }
        });
    }

    async fn execute(&self, seq: u64, method: &str, args: Vec<WireValue>) -> Frame {
        let key = self.options.key.clone();

        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            match deserialize(arg) {
                Ok(value) => values.push(value),
                Err(error) => {
                    return Frame::ReplyErr {
                        key,
                        seq,
                        fault: Fault::Protocol,
                        message: error.to_string(),
                        stack: None,
                    };
                }
            }
        }

        if self.options.log.calls {
            tracing::debug!(service = %key, "serving {}", signature(&key, method, &values));
        }

        match self.local.call(method, values).await {
            Ok(result) => match serialize(&result) {
                Ok(wire) => Frame::ReplyOk {
                    key,
                    seq,
                    result: wire,
                },
                Err(error) => Frame::ReplyErr {
                    key,
                    seq,
                    fault: Fault::Execution,
                    message: error.to_string(),
                    stack: None,
                },
            },
            Err(ServiceFault::MethodNotFound) => {
                if self.options.log.local_errors {
                    tracing::warn!(service = %key, method, "method not found");
                }
                Frame::ReplyErr {
                    key: key.clone(),
                    seq,
                    fault: Fault::MethodNotFound,
                    message: format!("Method {}.{} not found", key, method),
                    stack: None,
                }
            }
            Err(ServiceFault::Failed { message, stack }) => {
                if self.options.log.local_errors {
                    tracing::warn!(
                        service = %key,
                        method,
                        %message,
                        stack = stack.as_deref(),
                        "local implementation failed"
                    );
                }
                let stack = if self.options.log.send_local_stack {
                    stack
                } else {
                    None
                };
                Frame::ReplyErr {
                    key,
                    seq,
                    fault: Fault::Execution,
                    message,
                    stack,
                }
            }
        }
    }

    /// The local bypass used when `prefer_local` is set and the current
    /// context owns the implementation.
    async fn call_local(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match self.local.call(method, args).await {
            Ok(value) => Ok(value),
            Err(ServiceFault::MethodNotFound) => Err(CallError::MethodNotFound {
                service: self.options.key.clone(),
                method: method.to_string(),
            }),
            Err(ServiceFault::Failed { message, stack }) => {
                if self.options.log.local_errors {
                    tracing::warn!(service = %self.options.key, method, %message, "local call failed");
                }
                Err(CallError::Remote(RemoteFault { message, stack }))
            }
        }
    }

    /// Fails every outstanding call; used when the pump loses its channel.
    fn close_pending(&self) {
        let waiting: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for seq in waiting {
            self.settle(seq, Err(CallError::ChannelClosed));
        }
    }

    /// Settles a pending call at most once; unknown or already-settled
    /// correlation ids are dropped silently (duplicate or very late reply).
    fn settle(&self, seq: u64, outcome: Result<Value>) {
        if let Some((_, pending)) = self.pending.remove(&seq) {
            let _ = pending.tx.send(outcome);
        }
    }

    /// Maps a fault reply back into the caller-facing error.
    fn remote_error(
        &self,
        seq: u64,
        fault: Fault,
        message: String,
        stack: Option<String>,
    ) -> CallError {
        match fault {
            Fault::MethodNotFound => {
                let method = self
                    .pending
                    .get(&seq)
                    .map(|entry| entry.method.clone())
                    .unwrap_or_default();
                CallError::MethodNotFound {
                    service: self.options.key.clone(),
                    method,
                }
            }
            Fault::Execution | Fault::Protocol => CallError::Remote(RemoteFault { message, stack }),
        }
    }
}

/// Renders a human-readable call signature for logging.
fn signature(key: &str, method: &str, args: &[Value]) -> String {
    let rendered: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    format!("{}.{}({})", key, method, rendered.join(", "))
}

fn remote_stack(error: &CallError) -> Option<&str> {
    match error {
        CallError::Remote(fault) => fault.stack.as_deref(),
        _ => None,
    }
}
