//! # Service Registry
//!
//! The process-wide mapping from service name to dispatcher, populated once
//! at startup and read thereafter. Construction pins down the execution
//! role (which context this process is) and the wiring strategy (real
//! channels, or loopback mocks for isolated UI development).

use std::sync::Arc;

use dashmap::DashMap;

use veilpack::Value;

use crate::channel::Channel;
use crate::channel::LoopbackChannel;
use crate::dispatcher::CallDispatcher;
use crate::dispatcher::CallError;
use crate::dispatcher::DispatchOptions;
use crate::service::MockService;
use crate::service::Service;
use crate::stream::StreamDispatcher;
use crate::stream::StreamService;
use crate::stream::ValueStream;

/// The execution context this process runs as.
///
/// Replaces the original string-tag context detection with an explicit
/// parameter chosen at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionRole {
    /// Injected into a third-party page.
    Content,
    /// The options / dashboard UI.
    Options,
    /// A debugging surface.
    Debugging,
    /// The background process that owns the real implementations.
    Background,
    /// Anything else; registration is refused here.
    Unknown,
}

impl ExecutionRole {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, ExecutionRole::Unknown)
    }
}

impl std::fmt::Display for ExecutionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionRole::Content => "content",
            ExecutionRole::Options => "options",
            ExecutionRole::Debugging => "debugging",
            ExecutionRole::Background => "background",
            ExecutionRole::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Registration attempted outside a recognized context.
///
/// Deliberately non-fatal: the registry stays unpopulated for that name and
/// calls through it degrade to [`CallError::MethodNotFound`].
#[derive(Debug, Clone)]
pub enum RegistrationError {
    UnrecognizedContext(ExecutionRole),
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnrecognizedContext(role) => {
                write!(f, "Unrecognized execution context: {}", role)
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

/// Supplies the channel a service key should talk over.
///
/// In a real deployment this is the extension's cross-context transport;
/// tests hand out pre-linked pair endpoints.
pub trait ChannelProvider: Send + Sync + 'static {
    fn channel(&self, key: &str) -> Arc<dyn Channel>;
}

/// A fixed table of channels, keyed by service key.
pub struct ChannelMap {
    channels: DashMap<String, Arc<dyn Channel>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, channel: Arc<dyn Channel>) {
        self.channels.insert(key.into(), channel);
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelProvider for ChannelMap {
    /// An unknown key gets a fresh loopback with no peer: sends vanish and
    /// calls stay pending, the same behavior as a disconnected context.
    fn channel(&self, key: &str) -> Arc<dyn Channel> {
        match self.channels.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => Arc::new(LoopbackChannel::new()),
        }
    }
}

/// How dispatchers get their channels and implementations.
///
/// Chosen once at construction instead of branching on environment flags
/// inside the core.
pub enum Wiring {
    /// Real cross-context channels from the embedder.
    Live(Arc<dyn ChannelProvider>),
    /// Isolated UI development: every service is wired over an internal
    /// loopback against its mock implementation; no background process
    /// required.
    Isolated,
}

/// The per-process service registry.
///
/// Populated synchronously during startup; afterwards consumers only read,
/// so no locking beyond the concurrent maps is needed.
pub struct ServiceRegistry {
    role: ExecutionRole,
    wiring: Wiring,
    services: DashMap<String, CallDispatcher>,
    streams: DashMap<String, StreamDispatcher>,
}

impl ServiceRegistry {
    pub fn new(role: ExecutionRole, wiring: Wiring) -> Self {
        Self {
            role,
            wiring,
            services: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    pub fn role(&self) -> ExecutionRole {
        self.role
    }

    /// Registers a plain-call service under `name`.
    ///
    /// `local` is the real implementation where this context owns it
    /// (typically only in [`ExecutionRole::Background`]) and
    /// [`crate::service::EmptyService`] everywhere else. `mock` is the
    /// substitute used by [`Wiring::Isolated`].
    ///
    /// Registering a name twice silently overwrites the earlier entry.
    pub fn register(
        &self,
        name: &str,
        local: Arc<dyn Service>,
        mock: Option<Arc<dyn Service>>,
    ) -> Result<(), RegistrationError> {
        if !self.role.is_recognized() {
            tracing::warn!(service = name, role = %self.role, "unknown environment, service not registered");
            return Err(RegistrationError::UnrecognizedContext(self.role));
        }

        let options = DispatchOptions::new(name)
            .prefer_local(self.role == ExecutionRole::Background);

        let dispatcher = match &self.wiring {
            Wiring::Live(provider) => CallDispatcher::new(local, provider.channel(name), options),
            Wiring::Isolated => {
                // One dispatcher is both caller and callee on a loopback:
                // its own pump serves its requests with the mock, so the
                // full marshalling path is exercised without a peer.
                let mock: Arc<dyn Service> = Arc::new(match mock {
                    Some(mock) => MockService::new(mock),
                    None => MockService::empty(),
                });
                let loopback: Arc<dyn Channel> = Arc::new(LoopbackChannel::new());
                CallDispatcher::new(mock, loopback, options)
            }
        };

        if self.role != ExecutionRole::Debugging {
            tracing::info!(service = name, role = %self.role, "service registered");
        }
        self.services.insert(name.to_string(), dispatcher);
        Ok(())
    }

    /// Registers a streaming service under `name`.
    ///
    /// The channel key is `name` suffixed with `+`, so a streaming service
    /// can share its name with a plain one without frame collision.
    pub fn register_streaming(
        &self,
        name: &str,
        local: Arc<dyn StreamService>,
        mock: Option<Arc<dyn StreamService>>,
    ) -> Result<(), RegistrationError> {
        if !self.role.is_recognized() {
            tracing::warn!(service = name, role = %self.role, "unknown environment, service not registered");
            return Err(RegistrationError::UnrecognizedContext(self.role));
        }

        let key = format!("{}+", name);
        let options = DispatchOptions::new(&key);

        let dispatcher = match &self.wiring {
            Wiring::Live(provider) => StreamDispatcher::new(local, provider.channel(&key), options),
            Wiring::Isolated => {
                let implementation = mock.unwrap_or(local);
                let loopback: Arc<dyn Channel> = Arc::new(LoopbackChannel::new());
                StreamDispatcher::new(implementation, loopback, options)
            }
        };

        if self.role != ExecutionRole::Debugging {
            tracing::info!(service = name, role = %self.role, "streaming service registered");
        }
        self.streams.insert(name.to_string(), dispatcher);
        Ok(())
    }

    /// The dispatcher registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<CallDispatcher> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// The streaming dispatcher registered under `name`, if any.
    pub fn get_streaming(&self, name: &str) -> Option<StreamDispatcher> {
        self.streams.get(name).map(|entry| entry.value().clone())
    }

    /// Calls through the registry; an unpopulated slot rejects instead of
    /// panicking, so a refused registration degrades gracefully.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        match self.get(service) {
            Some(dispatcher) => dispatcher.call(method, args).await,
            None => Err(CallError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            }),
        }
    }

    /// Opens a stream through the registry, with the same degradation as
    /// [`ServiceRegistry::call`].
    pub async fn open_stream(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ValueStream, CallError> {
        match self.get_streaming(service) {
            Some(dispatcher) => dispatcher.open(method, args).await,
            None => Err(CallError::MethodNotFound {
                service: service.to_string(),
                method: method.to_string(),
            }),
        }
    }
}
