//! # Streaming Dispatcher
//!
//! The generator-style variant of the call dispatcher: a method yields many
//! values over time, each travelling as its own `Next` frame with a
//! monotonically increasing index, closed by a terminal `Done` or error
//! frame.
//!
//! ## Cancellation
//!
//! The consumer may stop early: dropping a [`ValueStream`] before its
//! terminal frame sends a `Cancel` envelope, and the producer side aborts
//! the generator task so no further values are computed.
//!
//! ## Ordering
//!
//! Indices must arrive exactly in order. An out-of-order or duplicate index
//! terminates the stream with a protocol error and cancels the producer.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

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
use crate::channel::Subscription;
use crate::dispatcher::CallError;
use crate::dispatcher::DispatchOptions;
use crate::dispatcher::RemoteFault;
use crate::dispatcher::Result;
use crate::service::ServiceFault;

/// A generator-style service: each method produces a sequence of values
/// through the [`StreamSink`] handed to it.
#[async_trait::async_trait]
pub trait StreamService: Send + Sync + 'static {
    /// The method names this implementation exposes.
    fn methods(&self) -> Vec<&'static str>;

    /// Runs `method`, feeding yielded values into `sink`. Returning `Ok`
    /// completes the stream; returning `Err` fails it.
    async fn open(
        &self,
        method: &str,
        args: Vec<Value>,
        sink: StreamSink,
    ) -> std::result::Result<(), ServiceFault>;
}

/// A stream service with no methods: the proxy-only side.
pub struct EmptyStreamService;

#[async_trait::async_trait]
impl StreamService for EmptyStreamService {
    fn methods(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn open(
        &self,
        _method: &str,
        _args: Vec<Value>,
        _sink: StreamSink,
    ) -> std::result::Result<(), ServiceFault> {
        Err(ServiceFault::MethodNotFound)
    }
}

struct SinkInner {
    channel: Arc<dyn Channel>,
    key: String,
    seq: u64,
    index: AtomicU64,
}

/// The producer's handle for yielding values into an open stream.
#[derive(Clone)]
pub struct StreamSink {
    inner: Arc<SinkInner>,
}

impl StreamSink {
    /// Serializes `value` and sends it as the next incremental frame.
    ///
    /// Suspends briefly after sending; a cancelled producer task is aborted
    /// at that point and never computes another value.
    pub async fn feed(&self, value: Value) -> Result<()> {
        // Cancellation point before any work on the next value.
        tokio::task::yield_now().await;
        let item = serialize(&value)?;
        let index = self.inner.index.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Next {
            key: self.inner.key.clone(),
            seq: self.inner.seq,
            index,
            item,
        };
        self.inner.channel.send(frame.encode())?;
        Ok(())
    }

    /// How many values have been fed so far.
    fn count(&self) -> u64 {
        self.inner.index.load(Ordering::Relaxed)
    }
}

/// One stream this side is consuming.
struct ConsumerEntry {
    method: String,
    next_index: u64,
    tx: mpsc::UnboundedSender<Result<Value>>,
}

struct StreamInner {
    options: DispatchOptions,
    local: Arc<dyn StreamService>,
    channel: Arc<dyn Channel>,
    consuming: DashMap<u64, ConsumerEntry>,
    producing: DashMap<u64, JoinHandle<()>>,
    seq_gen: AtomicU64,
}

/// The dispatcher for streaming (multi-result) calls.
///
/// Same wiring as [`crate::dispatcher::CallDispatcher`], but an accepted
/// request spawns a producer task, and the consumer side reconstructs an
/// in-order async sequence from the incremental frames.
#[derive(Clone)]
pub struct StreamDispatcher {
    inner: Arc<StreamInner>,
}

impl StreamDispatcher {
    pub fn new(
        local: Arc<dyn StreamService>,
        channel: Arc<dyn Channel>,
        options: DispatchOptions,
    ) -> Self {
        let subscription = channel.subscribe();
        let inner = Arc::new(StreamInner {
            options,
            local,
            channel,
            consuming: DashMap::new(),
            producing: DashMap::new(),
            seq_gen: AtomicU64::new(1),
        });

        tokio::spawn(pump(subscription, Arc::downgrade(&inner)));

        Self { inner }
    }

    pub fn key(&self) -> &str {
        &self.inner.options.key
    }

    /// Starts a streaming call and returns the async sequence of its
    /// yielded values.
    ///
    /// A missing remote method or a remote failure arrives through the
    /// stream as its terminal item.
    pub async fn open(&self, method: &str, args: Vec<Value>) -> Result<ValueStream> {
        let inner = &self.inner;

        if inner.options.log.calls {
            tracing::debug!(service = %inner.options.key, method, "opening stream");
        }

        let mut wire_args = Vec::with_capacity(args.len());
        for arg in &args {
            wire_args.push(serialize(arg)?);
        }

        let seq = inner.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        inner.consuming.insert(
            seq,
            ConsumerEntry {
                method: method.to_string(),
                next_index: 0,
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
            inner.consuming.remove(&seq);
            return Err(e.into());
        }

        Ok(ValueStream {
            shared: Arc::downgrade(inner),
            seq,
            rx,
            finished: false,
        })
    }
}

/// The consumer's view of one streaming call: an async lazy sequence.
///
/// Values arrive in index order. The stream ends with `None` after a clean
/// completion, or with one terminal `Err` item. Dropping it early cancels
/// the producer.
pub struct ValueStream {
    shared: Weak<StreamInner>,
    seq: u64,
    rx: mpsc::UnboundedReceiver<Result<Value>>,
    finished: bool,
}

impl ValueStream {
    /// Waits for the next yielded value.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(value)) => Some(Ok(value)),
            Some(Err(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Drains the stream to completion, failing on its first error.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }
}

impl Drop for ValueStream {
    fn drop(&mut self) {
        let Some(inner) = self.shared.upgrade() else {
            return;
        };
        // Still live: the consumer walked away early, tell the producer.
        if inner.consuming.remove(&self.seq).is_some() {
            let cancel = Frame::Cancel {
                key: inner.options.key.clone(),
                seq: self.seq,
            };
            let _ = inner.channel.send(cancel.encode());
        }
    }
}

async fn pump(mut subscription: Subscription, inner: Weak<StreamInner>) {
    while let Some(message) = subscription.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_message(&inner, message);
    }
    // The channel side is gone; terminate every open stream.
    if let Some(inner) = inner.upgrade() {
        let open: Vec<u64> = inner.consuming.iter().map(|entry| *entry.key()).collect();
        for seq in open {
            if let Some((_, entry)) = inner.consuming.remove(&seq) {
                let _ = entry.tx.send(Err(CallError::ChannelClosed));
            }
        }
    }
}

impl StreamInner {
    fn handle_message(&self, this: &Arc<StreamInner>, message: WireValue) {
        match Frame::decode(&message) {
            Ok(frame) => {
                if frame.key() != self.options.key {
                    return;
                }
                match frame {
                    Frame::Request {
                        seq, method, args, ..
                    } => self.produce(this, seq, method, args),
                    Frame::Next {
                        seq, index, item, ..
                    } => self.deliver(seq, index, &item),
                    Frame::Done { seq, index, .. } => self.complete(seq, index),
                    Frame::ReplyErr {
                        seq,
                        fault,
                        message,
                        stack,
                        ..
                    } => self.fail(seq, fault, message, stack),
                    Frame::Cancel { seq, .. } => self.cancel(seq),
                    // Plain replies have no meaning on a stream key.
                    Frame::ReplyOk { .. } => {}
                }
            }
            Err(error) => {
                let ours = decode_key(&message).is_ok_and(|key| key == self.options.key);
                if !ours {
                    return;
                }
                tracing::debug!(service = %self.options.key, %error, "dropping malformed frame");
                if self.options.strict {
                    if let Ok(seq) = decode_seq(&message) {
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
            }
        }
    }

    /// Producer side: spawn the generator task for one inbound request.
    fn produce(&self, this: &Arc<StreamInner>, seq: u64, method: String, args: Vec<WireValue>) {
        let inner = Arc::clone(this);

        // The task waits until its handle is registered, so a racing Cancel
        // always finds something to abort.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;

            let reply = inner.run_producer(seq, &method, args).await;
            if let Some(reply) = reply {
                if let Err(error) = inner.channel.send(reply.encode()) {
                    tracing::warn!(
                        service = %inner.options.key,
                        method,
                        seq,
                        %error,
                        "stream terminal frame could not be delivered"
                    );
                }
            }
            inner.producing.remove(&seq);
        });

        self.producing.insert(seq, handle);
        let _ = registered_tx.send(());
    }

    /// Runs the local generator and returns the terminal frame, if any.
    async fn run_producer(&self, seq: u64, method: &str, args: Vec<WireValue>) -> Option<Frame> {
        let key = self.options.key.clone();

        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            match deserialize(arg) {
                Ok(value) => values.push(value),
                Err(error) => {
                    return Some(Frame::ReplyErr {
                        key,
                        seq,
                        fault: Fault::Protocol,
                        message: error.to_string(),
                        stack: None,
                    });
                }
            }
        }

        if self.options.log.calls {
            tracing::debug!(service = %key, method, seq, "stream started");
        }

        let sink = StreamSink {
            inner: Arc::new(SinkInner {
                channel: Arc::clone(&self.channel),
                key: key.clone(),
                seq,
                index: AtomicU64::new(0),
            }),
        };
        let progress = sink.clone();

        match self.local.open(method, values, sink).await {
            Ok(()) => Some(Frame::Done {
                key,
                seq,
                index: progress.count(),
            }),
            Err(ServiceFault::MethodNotFound) => {
                if self.options.log.local_errors {
                    tracing::warn!(service = %key, method, "stream method not found");
                }
                Some(Frame::ReplyErr {
                    key: key.clone(),
                    seq,
                    fault: Fault::MethodNotFound,
                    message: format!("Method {}.{} not found", key, method),
                    stack: None,
                })
            }
            Err(ServiceFault::Failed { message, stack }) => {
                if self.options.log.local_errors {
                    tracing::warn!(service = %key, method, %message, "stream failed");
                }
                let stack = if self.options.log.send_local_stack {
                    stack
                } else {
                    None
                };
                Some(Frame::ReplyErr {
                    key,
                    seq,
                    fault: Fault::Execution,
                    message,
                    stack,
                })
            }
        }
    }

    /// Consumer side: one incremental value arrived.
    fn deliver(&self, seq: u64, index: u64, item: &WireValue) {
        let Some(mut entry) = self.consuming.get_mut(&seq) else {
            // Cancelled or unknown; values in flight are expected, drop them.
            return;
        };

        if index != entry.next_index {
            let error = ProtocolError::OutOfSequence {
                expected: entry.next_index,
                received: index,
            };
            drop(entry);
            self.abandon(seq, CallError::Protocol(error));
            return;
        }
        entry.next_index += 1;

        match deserialize(item) {
            Ok(value) => {
                let _ = entry.tx.send(Ok(value));
            }
            Err(error) => {
                drop(entry);
                self.abandon(seq, CallError::Serialization(error));
            }
        }
    }

    /// Consumer side: clean completion after `index` values.
    fn complete(&self, seq: u64, index: u64) {
        let Some((_, entry)) = self.consuming.remove(&seq) else {
            return;
        };
        if index != entry.next_index {
            let error = ProtocolError::OutOfSequence {
                expected: entry.next_index,
                received: index,
            };
            let _ = entry.tx.send(Err(CallError::Protocol(error)));
        }
        // Dropping the sender closes the stream.
    }

    /// Consumer side: the producer reported a failure.
    fn fail(&self, seq: u64, fault: Fault, message: String, stack: Option<String>) {
        let Some((_, entry)) = self.consuming.remove(&seq) else {
            return;
        };
        let error = match fault {
            Fault::MethodNotFound => CallError::MethodNotFound {
                service: self.options.key.clone(),
                method: entry.method.clone(),
            },
            Fault::Execution | Fault::Protocol => CallError::Remote(RemoteFault { message, stack }),
        };
        if self.options.log.remote_errors {
            tracing::warn!(service = %self.options.key, method = %entry.method, %error, "stream rejected");
        }
        let _ = entry.tx.send(Err(error));
    }

    /// Producer side: the consumer walked away; stop computing.
    fn cancel(&self, seq: u64) {
        if let Some((_, handle)) = self.producing.remove(&seq) {
            handle.abort();
            tracing::debug!(service = %self.options.key, seq, "stream cancelled by consumer");
        }
    }

    /// Terminates a consuming stream locally with `error` and tells the
    /// producer to stop.
    fn abandon(&self, seq: u64, error: CallError) {
        if let Some((_, entry)) = self.consuming.remove(&seq) {
            let _ = entry.tx.send(Err(error));
        }
        let cancel = Frame::Cancel {
            key: self.options.key.clone(),
            seq,
        };
        let _ = self.channel.send(cancel.encode());
    }
}
