//! # Services
//!
//! The explicit service interface: a named set of async methods reached
//! through `call(method, args)`. One process holds a real implementation,
//! every other context holds an [`EmptyService`] and reaches it through a
//! dispatcher proxy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use veilpack::Value;

/// What a local implementation reports back to its dispatcher.
///
/// Distinct from the caller-facing error type: a fault is the
/// *implementation* side failing, before any marshalling happens.
#[derive(Debug, Clone)]
pub enum ServiceFault {
    /// The requested method is not part of this service.
    MethodNotFound,
    /// The method ran and failed.
    Failed {
        message: String,
        stack: Option<String>,
    },
}

impl ServiceFault {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }

    /// A failure that carries a captured backtrace, for dispatchers
    /// configured to surface local stacks to the remote caller.
    pub fn failed_with_stack(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: Some(std::backtrace::Backtrace::force_capture().to_string()),
        }
    }
}

impl std::fmt::Display for ServiceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MethodNotFound => write!(f, "Method not found"),
            Self::Failed { message, .. } => write!(f, "Service failed: {}", message),
        }
    }
}

impl std::error::Error for ServiceFault {}

pub type Result<T> = std::result::Result<T, ServiceFault>;

/// A named set of async methods.
///
/// Object-safe so dispatchers can hold `Arc<dyn Service>`.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    /// The method names this implementation exposes.
    fn methods(&self) -> Vec<&'static str>;

    /// Whether `method` is declared by this implementation.
    fn has_method(&self, method: &str) -> bool {
        self.methods().contains(&method)
    }

    /// Invokes `method` with already-deserialized arguments.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value>;
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<Result<Value>> + Send + Sync>;

/// A dispatch table mapping method names to async closures.
///
/// The usual way to declare a service implementation:
///
/// ```
/// use veilpack::Value;
/// use veilrun::service::MethodTable;
///
/// let echo = MethodTable::new().with("ping", |mut args: Vec<Value>| async move {
///     Ok(args.pop().unwrap_or(Value::Null))
/// });
/// ```
pub struct MethodTable {
    handlers: HashMap<&'static str, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Adds a method. A repeated name overwrites the earlier handler.
    pub fn with<F, Fut>(mut self, name: &'static str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(name, Arc::new(move |args| Box::pin(handler(args))));
        self
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Service for MethodTable {
    fn methods(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match self.handlers.get(method) {
            Some(handler) => handler(args).await,
            None => Err(ServiceFault::MethodNotFound),
        }
    }
}

/// The proxy-only side of a service: no local methods at all.
///
/// Contexts that do not own the real implementation register this, so every
/// call is forwarded over the channel.
pub struct EmptyService;

#[async_trait::async_trait]
impl Service for EmptyService {
    fn methods(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn call(&self, _method: &str, _args: Vec<Value>) -> Result<Value> {
        Err(ServiceFault::MethodNotFound)
    }
}

/// Wraps a (possibly partial) mock implementation for isolated UI
/// development: a method the mock does not provide resolves to
/// [`Value::Null`] instead of failing, so UI code can run unmodified
/// against an incomplete mock.
pub struct MockService {
    inner: Arc<dyn Service>,
}

impl MockService {
    pub fn new(inner: Arc<dyn Service>) -> Self {
        Self { inner }
    }

    pub fn empty() -> Self {
        Self::new(Arc::new(EmptyService))
    }
}

#[async_trait::async_trait]
impl Service for MockService {
    fn methods(&self) -> Vec<&'static str> {
        self.inner.methods()
    }

    // Every method "exists" on a mock.
    fn has_method(&self, _method: &str) -> bool {
        true
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match self.inner.call(method, args).await {
            Err(ServiceFault::MethodNotFound) => Ok(Value::Null),
            other => other,
        }
    }
}
