//! The context: a factory and registry for connections sharing one decoder set and executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::connection::{Address, Connection, ConnectionConfig, ConnectionId};
use crate::message::DecoderRegistry;
use crate::rt::{Exec, Executor};

/// Builds a [`Context`], mirroring the handshake-`Builder` pattern this crate's connection layer
/// follows: defaults suitable for immediate use, with setters for anything an embedder wants to
/// override.
pub struct Builder {
    decoders: DecoderRegistry,
    config: ConnectionConfig,
    exec: Exec,
}

impl Builder {
    fn new() -> Builder {
        Builder {
            decoders: DecoderRegistry::new(),
            config: ConnectionConfig::default(),
            exec: Exec::default(),
        }
    }

    /// Registers a decoder for `type_char` on every connection this context creates.
    pub fn decoder(mut self, type_char: char, decoder: Arc<dyn crate::message::Decoder>) -> Self {
        self.decoders.register(type_char, decoder);
        self
    }

    /// Overrides the default connect/read timeouts and body size cap.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the executor used to drive worker tasks and HTTP/1 connections.
    pub fn executor<E>(mut self, executor: E) -> Self
    where
        E: Executor<crate::rt::BoxSendFuture> + Send + Sync + 'static,
    {
        self.exec = Exec::new(executor);
        self
    }

    /// Builds the context.
    pub fn build(self) -> Context {
        Context {
            decoders: self.decoders,
            config: self.config,
            exec: self.exec,
            connections: Mutex::new(HashMap::new()),
        }
    }
}

/// Shared state for a group of connections: the registered message decoders, connection
/// timeouts, the executor driving worker tasks, and a registry of live connections keyed by
/// their server-assigned id (per spec §4.4).
pub struct Context {
    decoders: DecoderRegistry,
    config: ConnectionConfig,
    exec: Exec,
    connections: Mutex<HashMap<ConnectionId, Weak<Connection>>>,
}

impl Default for Context {
    fn default() -> Context {
        Context::builder().build()
    }
}

impl Context {
    /// A context with no decoders registered, default timeouts, and the Tokio executor.
    pub fn new() -> Context {
        Context::default()
    }

    /// Starts building a [`Context`] with custom decoders, config, or executor.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Creates a new, not-yet-started [`Connection`] to `address`, under `id`, registering it in
    /// this context so [`Context::close_all`] can reach it later. `id` assignment (how the
    /// server comes to know this identifier) is out of this crate's scope; it is expected to be
    /// supplied by whatever upper-layer handshake negotiates it.
    pub fn register(&self, id: ConnectionId, address: Address) -> Arc<Connection> {
        let connection = Connection::new(
            id.clone(),
            address,
            self.config.clone(),
            self.decoders.clone(),
            self.exec.clone(),
        );
        self.connections
            .lock()
            .unwrap()
            .insert(id, Arc::downgrade(&connection));
        connection
    }

    /// Looks up a still-live connection previously registered under `id`.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(id).and_then(Weak::upgrade)
    }

    /// Closes every still-live connection registered with this context, pruning the registry as
    /// it goes.
    pub async fn close_all(&self) {
        let live: Vec<Arc<Connection>> = {
            let mut guard = self.connections.lock().unwrap();
            let live = guard.values().filter_map(Weak::upgrade).collect();
            guard.retain(|_, weak| weak.strong_count() > 0);
            live
        };
        for connection in live {
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("connections", &self.connections.lock().unwrap().len())
            .finish()
    }
}
