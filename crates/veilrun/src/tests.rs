//! Tests for the dispatchers and the registry, over loopback and paired
//! channels plus a few hand-rolled mock channels.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use veilpack::Identifier;
use veilpack::ProfileIdentifier;
use veilpack::Value;
use veilpack::WireValue;
use veilrpc::Fault;
use veilrpc::Frame;
use veilrpc::ProtocolError;

use crate::channel::Channel;
use crate::channel::ChannelError;
use crate::channel::LoopbackChannel;
use crate::channel::PairChannel;
use crate::channel::Subscription;
use crate::dispatcher::CallDispatcher;
use crate::dispatcher::CallError;
use crate::dispatcher::DispatchOptions;
use crate::registry::ChannelMap;
use crate::registry::ExecutionRole;
use crate::registry::RegistrationError;
use crate::registry::ServiceRegistry;
use crate::registry::Wiring;
use crate::service::EmptyService;
use crate::service::MethodTable;
use crate::service::Service;
use crate::service::ServiceFault;
use crate::stream::StreamDispatcher;
use crate::stream::StreamService;
use crate::stream::StreamSink;

/// Opt-in trace output: `RUST_LOG=veilrun=debug cargo test`.
fn trace_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn echo_service() -> Arc<dyn Service> {
    Arc::new(
        MethodTable::new()
            .with("ping", |mut args: Vec<Value>| async move {
                Ok(args.pop().unwrap_or(Value::Null))
            })
            .with("double", |mut args: Vec<Value>| async move {
                match args.pop() {
                    Some(Value::Int(x)) => Ok(Value::Int(x * 2)),
                    other => Err(ServiceFault::failed(format!("expected int, got {:?}", other))),
                }
            })
            .with("boom", |_args: Vec<Value>| async move {
                Err(ServiceFault::failed("bad"))
            }),
    )
}

fn loopback_dispatcher(key: &str) -> CallDispatcher {
    let channel: Arc<dyn Channel> = Arc::new(LoopbackChannel::new());
    CallDispatcher::new(echo_service(), channel, DispatchOptions::new(key))
}

#[tokio::test]
async fn loopback_echo_resolves() {
    trace_init();
    let echo = loopback_dispatcher("Echo");
    let result = echo.call("ping", vec!["hello".into()]).await.unwrap();
    assert_eq!(result, Value::text("hello"));
}

#[tokio::test]
async fn failing_method_rejects_with_message() {
    let fail = loopback_dispatcher("Fail");
    let err = fail.call("boom", vec![]).await.unwrap_err();
    match err {
        CallError::Remote(fault) => assert_eq!(fault.message, "bad"),
        other => panic!("Expected Remote, got {:?}", other),
    }
}

#[tokio::test]
async fn method_not_found_does_not_kill_the_dispatcher() {
    let echo = loopback_dispatcher("Echo");

    let err = echo.call("missing", vec![]).await.unwrap_err();
    match err {
        CallError::MethodNotFound { service, method } => {
            assert_eq!(service, "Echo");
            assert_eq!(method, "missing");
        }
        other => panic!("Expected MethodNotFound, got {:?}", other),
    }

    // The pump must still be serving.
    let result = echo.call("ping", vec![Value::Int(1)]).await.unwrap();
    assert_eq!(result, Value::Int(1));
}

#[tokio::test]
async fn pair_channel_crosses_contexts() -> anyhow::Result<()> {
    let (content_end, background_end) = PairChannel::pair();

    let _background = CallDispatcher::new(
        echo_service(),
        Arc::new(background_end),
        DispatchOptions::new("Echo"),
    );
    let content = CallDispatcher::new(
        Arc::new(EmptyService),
        Arc::new(content_end),
        DispatchOptions::new("Echo"),
    );

    let result = content.call("ping", vec!["across".into()]).await?;
    assert_eq!(result, Value::text("across"));
    Ok(())
}

#[tokio::test]
async fn identifiers_survive_a_round_trip_call() {
    let echo = loopback_dispatcher("Echo");
    let id = Value::Id(Identifier::Profile(ProfileIdentifier::new(
        "example.com",
        "alice",
    )));
    let result = echo.call("ping", vec![id.clone()]).await.unwrap();
    assert_eq!(result, id);
}

#[tokio::test]
async fn concurrent_calls_settle_independently() {
    let echo = loopback_dispatcher("Echo");

    let inputs: Vec<i64> = {
        let mut rng = rand::thread_rng();
        (0..32).map(|_| rng.gen_range(-1000..1000)).collect()
    };

    let mut tasks = Vec::new();
    for (i, x) in inputs.iter().copied().enumerate() {
        let echo = echo.clone();
        // Every fourth call fails; its error must not leak into the others.
        tasks.push(tokio::spawn(async move {
            if i % 4 == 0 {
                (x, echo.call("boom", vec![]).await)
            } else {
                (x, echo.call("double", vec![Value::Int(x)]).await)
            }
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let (x, outcome) = task.await.unwrap();
        if i % 4 == 0 {
            match outcome.unwrap_err() {
                CallError::Remote(fault) => assert_eq!(fault.message, "bad"),
                other => panic!("Expected Remote, got {:?}", other),
            }
        } else {
            assert_eq!(outcome.unwrap(), Value::Int(x * 2));
        }
    }
}

#[tokio::test]
async fn two_services_share_one_channel() -> anyhow::Result<()> {
    let (ui_end, background_end) = PairChannel::pair();
    let ui_end: Arc<dyn Channel> = Arc::new(ui_end);
    let background_end: Arc<dyn Channel> = Arc::new(background_end);

    let a_impl = Arc::new(MethodTable::new().with("m1", |_args: Vec<Value>| async move {
        Ok(Value::text("from A"))
    }));
    let b_impl = Arc::new(MethodTable::new().with("m2", |_args: Vec<Value>| async move {
        Ok(Value::text("from B"))
    }));

    let _a_server = CallDispatcher::new(a_impl, background_end.clone(), DispatchOptions::new("A"));
    let _b_server = CallDispatcher::new(b_impl, background_end, DispatchOptions::new("B"));

    let a = CallDispatcher::new(Arc::new(EmptyService), ui_end.clone(), DispatchOptions::new("A"));
    let b = CallDispatcher::new(Arc::new(EmptyService), ui_end, DispatchOptions::new("B"));

    let (from_a, from_b) = tokio::join!(a.call("m1", vec![]), b.call("m2", vec![]));
    assert_eq!(from_a?, Value::text("from A"));
    assert_eq!(from_b?, Value::text("from B"));
    Ok(())
}

/// A channel that records sends and refuses them all.
struct DeadChannel {
    sends: AtomicUsize,
    keep_alive: Mutex<Vec<mpsc::UnboundedSender<WireValue>>>,
}

impl DeadChannel {
    fn new() -> Self {
        Self {
            sends: AtomicUsize::new(0),
            keep_alive: Mutex::new(Vec::new()),
        }
    }
}

impl Channel for DeadChannel {
    fn send(&self, _message: WireValue) -> crate::channel::Result<()> {
        self.sends.fetch_add(1, Ordering::Relaxed);
        Err(ChannelError::Closed)
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.keep_alive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        Subscription::new(rx)
    }
}

#[tokio::test]
async fn prefer_local_bypasses_the_channel() {
    let channel = Arc::new(DeadChannel::new());
    let dispatcher = CallDispatcher::new(
        echo_service(),
        channel.clone(),
        DispatchOptions::new("Echo").prefer_local(true),
    );

    let result = dispatcher.call("ping", vec![Value::Int(9)]).await.unwrap();
    assert_eq!(result, Value::Int(9));
    assert_eq!(channel.sends.load(Ordering::Relaxed), 0);

    // A method the local side lacks still goes to the (dead) channel.
    let err = dispatcher.call("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::ChannelClosed), "{:?}", err);
    assert_eq!(channel.sends.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn undeserializable_argument_gets_a_protocol_fault_reply() {
    let channel: Arc<dyn Channel> = Arc::new(LoopbackChannel::new());
    let mut observer = channel.subscribe();
    let _server = CallDispatcher::new(echo_service(), channel.clone(), DispatchOptions::new("X"));

    let mut bogus = BTreeMap::new();
    bogus.insert("$type".to_string(), WireValue::Text("bogus".to_string()));
    let request = Frame::Request {
        key: "X".to_string(),
        seq: 99,
        method: "ping".to_string(),
        args: vec![WireValue::Map(bogus)],
    };
    channel.send(request.encode()).unwrap();

    // First the request itself, then the server's reply.
    let _own = observer.recv().await.unwrap();
    let reply = Frame::decode(&observer.recv().await.unwrap()).unwrap();
    match reply {
        Frame::ReplyErr { seq, fault, .. } => {
            assert_eq!(seq, 99);
            assert_eq!(fault, Fault::Protocol);
        }
        other => panic!("Expected ReplyErr, got {:?}", other),
    }
}

fn malformed_request(seq: u64) -> WireValue {
    // A request frame with no args field.
    let mut map = BTreeMap::new();
    map.insert("type".to_string(), WireValue::Text("request".to_string()));
    map.insert("key".to_string(), WireValue::Text("X".to_string()));
    map.insert("seq".to_string(), WireValue::Int(seq as i64));
    map.insert("method".to_string(), WireValue::Text("ping".to_string()));
    WireValue::Map(map)
}

#[tokio::test]
async fn strict_dispatcher_answers_malformed_frames() {
    let channel: Arc<dyn Channel> = Arc::new(LoopbackChannel::new());
    let mut observer = channel.subscribe();
    let _server = CallDispatcher::new(
        echo_service(),
        channel.clone(),
        DispatchOptions::new("X").strict(true),
    );

    channel.send(malformed_request(7)).unwrap();

    let _own = observer.recv().await.unwrap();
    let reply = Frame::decode(&observer.recv().await.unwrap()).unwrap();
    match reply {
        Frame::ReplyErr { seq, fault, .. } => {
            assert_eq!(seq, 7);
            assert_eq!(fault, Fault::Protocol);
        }
        other => panic!("Expected ReplyErr, got {:?}", other),
    }
}

#[tokio::test]
async fn lenient_dispatcher_drops_malformed_frames() {
    let channel: Arc<dyn Channel> = Arc::new(LoopbackChannel::new());
    let mut observer = channel.subscribe();
    let _server = CallDispatcher::new(echo_service(), channel.clone(), DispatchOptions::new("X"));

    channel.send(malformed_request(7)).unwrap();
    // A valid request after the malformed one; its reply must be the only
    // frame the server ever sends.
    let request = Frame::Request {
        key: "X".to_string(),
        seq: 8,
        method: "ping".to_string(),
        args: vec![WireValue::Int(5)],
    };
    channel.send(request.encode()).unwrap();

    let _malformed = observer.recv().await.unwrap();
    let _request = observer.recv().await.unwrap();
    let reply = Frame::decode(&observer.recv().await.unwrap()).unwrap();
    match reply {
        Frame::ReplyOk { seq, result, .. } => {
            assert_eq!(seq, 8);
            assert_eq!(result, WireValue::Int(5));
        }
        other => panic!("Expected ReplyOk for seq 8, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

struct CountdownService;

#[async_trait::async_trait]
impl StreamService for CountdownService {
    fn methods(&self) -> Vec<&'static str> {
        vec!["count"]
    }

    async fn open(
        &self,
        method: &str,
        args: Vec<Value>,
        sink: StreamSink,
    ) -> Result<(), ServiceFault> {
        if method != "count" {
            return Err(ServiceFault::MethodNotFound);
        }
        let Some(Value::Int(n)) = args.first() else {
            return Err(ServiceFault::failed("expected a count"));
        };
        for i in 1..=*n {
            sink.feed(Value::Int(i)).await?;
        }
        Ok(())
    }
}

fn stream_pair() -> (StreamDispatcher, StreamDispatcher) {
    let (consumer_end, producer_end) = PairChannel::pair();
    let producer = StreamDispatcher::new(
        Arc::new(CountdownService),
        Arc::new(producer_end),
        DispatchOptions::new("Progress+"),
    );
    let consumer = StreamDispatcher::new(
        Arc::new(crate::stream::EmptyStreamService),
        Arc::new(consumer_end),
        DispatchOptions::new("Progress+"),
    );
    (consumer, producer)
}

#[tokio::test]
async fn stream_yields_in_order_then_terminates() {
    trace_init();
    let (consumer, _producer) = stream_pair();

    let stream = consumer.open("count", vec![Value::Int(3)]).await.unwrap();
    let values = stream.collect().await.unwrap();
    assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[tokio::test]
async fn stream_method_not_found() {
    let (consumer, _producer) = stream_pair();

    let mut stream = consumer.open("missing", vec![]).await.unwrap();
    match stream.next().await {
        Some(Err(CallError::MethodNotFound { method, .. })) => assert_eq!(method, "missing"),
        other => panic!("Expected MethodNotFound, got {:?}", other),
    }
    assert!(stream.next().await.is_none());
}

struct TickService {
    ticks: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl StreamService for TickService {
    fn methods(&self) -> Vec<&'static str> {
        vec!["ticks"]
    }

    async fn open(
        &self,
        _method: &str,
        _args: Vec<Value>,
        sink: StreamSink,
    ) -> Result<(), ServiceFault> {
        let mut i: i64 = 0;
        loop {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            sink.feed(Value::Int(i)).await?;
            i += 1;
        }
    }
}

#[tokio::test]
async fn cancelled_stream_stops_the_producer() {
    let ticks = Arc::new(AtomicU64::new(0));

    let (consumer_end, producer_end) = PairChannel::pair();
    let _producer = StreamDispatcher::new(
        Arc::new(TickService {
            ticks: ticks.clone(),
        }),
        Arc::new(producer_end),
        DispatchOptions::new("Ticks+"),
    );
    let consumer = StreamDispatcher::new(
        Arc::new(crate::stream::EmptyStreamService),
        Arc::new(consumer_end),
        DispatchOptions::new("Ticks+"),
    );

    let mut stream = consumer.open("ticks", vec![]).await.unwrap();
    for _ in 0..3 {
        assert!(matches!(stream.next().await, Some(Ok(Value::Int(_)))));
    }
    drop(stream);

    // Let the cancellation land, then verify the producer went quiet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn out_of_sequence_stream_index_is_a_protocol_error() {
    let (consumer_end, producer_end) = PairChannel::pair();
    let consumer = StreamDispatcher::new(
        Arc::new(crate::stream::EmptyStreamService),
        Arc::new(consumer_end),
        DispatchOptions::new("S+"),
    );
    let producer_channel: Arc<dyn Channel> = Arc::new(producer_end);
    let mut producer_inbox = producer_channel.subscribe();

    let mut stream = consumer.open("gen", vec![]).await.unwrap();

    // Play the producer by hand: one good frame, then a skipped index.
    let request = Frame::decode(&producer_inbox.recv().await.unwrap()).unwrap();
    let Frame::Request { seq, .. } = request else {
        panic!("Expected Request, got {:?}", request);
    };
    let next = |index, item| Frame::Next {
        key: "S+".to_string(),
        seq,
        index,
        item,
    };
    producer_channel.send(next(0, WireValue::Int(1)).encode()).unwrap();
    producer_channel.send(next(2, WireValue::Int(2)).encode()).unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap(), Value::Int(1));
    match stream.next().await {
        Some(Err(CallError::Protocol(ProtocolError::OutOfSequence {
            expected: 1,
            received: 2,
        }))) => {}
        other => panic!("Expected OutOfSequence, got {:?}", other),
    }

    // The consumer must have told the producer to stop.
    let cancel = Frame::decode(&producer_inbox.recv().await.unwrap()).unwrap();
    assert!(matches!(cancel, Frame::Cancel { seq: s, .. } if s == seq));
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn background_registry_calls_its_own_implementation() {
    let registry = ServiceRegistry::new(
        ExecutionRole::Background,
        Wiring::Live(Arc::new(ChannelMap::new())),
    );
    registry.register("Echo", echo_service(), None).unwrap();

    // prefer_local: no peer channel is needed in the owning context.
    let result = registry
        .call("Echo", "ping", vec!["local".into()])
        .await
        .unwrap();
    assert_eq!(result, Value::text("local"));
}

#[tokio::test]
async fn live_registries_route_between_contexts() -> anyhow::Result<()> {
    trace_init();
    let content_channels = Arc::new(ChannelMap::new());
    let background_channels = Arc::new(ChannelMap::new());
    let (content_end, background_end) = PairChannel::pair();
    content_channels.insert("Echo", Arc::new(content_end));
    background_channels.insert("Echo", Arc::new(background_end));

    let background =
        ServiceRegistry::new(ExecutionRole::Background, Wiring::Live(background_channels));
    background
        .register("Echo", echo_service(), None)
        .expect("recognized context");

    let content = ServiceRegistry::new(ExecutionRole::Content, Wiring::Live(content_channels));
    content
        .register("Echo", Arc::new(EmptyService), None)
        .expect("recognized context");

    let result = content.call("Echo", "ping", vec!["routed".into()]).await?;
    assert_eq!(result, Value::text("routed"));
    Ok(())
}

#[tokio::test]
async fn unknown_context_refuses_registration() {
    let registry = ServiceRegistry::new(
        ExecutionRole::Unknown,
        Wiring::Live(Arc::new(ChannelMap::new())),
    );

    let err = registry
        .register("Echo", echo_service(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        RegistrationError::UnrecognizedContext(ExecutionRole::Unknown)
    ));
    assert!(registry.get("Echo").is_none());

    // The empty slot degrades to MethodNotFound instead of panicking.
    let err = registry.call("Echo", "ping", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::MethodNotFound { .. }));
}

#[tokio::test]
async fn isolated_wiring_serves_the_mock() {
    let registry = ServiceRegistry::new(ExecutionRole::Options, Wiring::Isolated);

    let mock = Arc::new(MethodTable::new().with("greet", |_args: Vec<Value>| async move {
        Ok(Value::text("hi from the mock"))
    }));
    registry.register("Helper", Arc::new(EmptyService), Some(mock)).unwrap();

    let result = registry.call("Helper", "greet", vec![]).await.unwrap();
    assert_eq!(result, Value::text("hi from the mock"));

    // A method the mock does not provide resolves to null.
    let result = registry.call("Helper", "unmocked", vec![]).await.unwrap();
    assert_eq!(result, Value::Null);
}

#[tokio::test]
async fn duplicate_registration_overwrites() {
    let registry = ServiceRegistry::new(
        ExecutionRole::Background,
        Wiring::Live(Arc::new(ChannelMap::new())),
    );

    let first = Arc::new(MethodTable::new().with("which", |_args: Vec<Value>| async move {
        Ok(Value::text("first"))
    }));
    let second = Arc::new(MethodTable::new().with("which", |_args: Vec<Value>| async move {
        Ok(Value::text("second"))
    }));

    registry.register("Svc", first, None).unwrap();
    registry.register("Svc", second, None).unwrap();

    let result = registry.call("Svc", "which", vec![]).await.unwrap();
    assert_eq!(result, Value::text("second"));
}

#[tokio::test]
async fn streaming_registration_and_call() {
    let registry = ServiceRegistry::new(ExecutionRole::Options, Wiring::Isolated);
    registry
        .register_streaming("Progress", Arc::new(CountdownService), None)
        .unwrap();

    let stream = registry
        .open_stream("Progress", "count", vec![Value::Int(2)])
        .await
        .unwrap();
    let values = stream.collect().await.unwrap();
    assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
}
