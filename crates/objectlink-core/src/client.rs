//! Client side: sinks, the sink registry, and the per-connection client
//! node.
//!
//! A sink is the application's local representative of a remote object.
//! Sinks register with a [`ClientRegistry`] under their object name; a
//! [`ClientNode`] then links them over one transport, translating sink
//! actions into outbound frames and inbound frames into sink callbacks.

use crate::codec::MessageFormat;
use crate::error::Result;
use crate::message::MessageKind;
use crate::name;
use crate::protocol::{InvokeFuture, MessageWriter, Protocol, ProtocolListener};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

/// Client-side representative of a remote object.
///
/// Owned by the application. Lifecycle: registered, linked by exactly one
/// client node at a time, eventually released.
pub trait ObjectSink: Send + Sync {
    /// Object name the sink registers under (`module.Interface`).
    fn object_name(&self) -> String;

    /// Called when the link handshake completes. `node` stays valid for
    /// remote calls until `on_release`.
    fn on_init(&self, name: &str, props: Map<String, Value>, node: Arc<ClientNode>);

    /// Called when the link is torn down; the node handle is no longer
    /// usable afterwards.
    fn on_release(&self);

    /// A server-initiated signal for this object.
    fn on_signal(&self, member: &str, args: Vec<Value>);

    /// A property of this object changed on the server.
    fn on_property_changed(&self, member: &str, value: Value);
}

struct SinkEntry {
    sink: Arc<dyn ObjectSink>,
    node: Option<Arc<ClientNode>>,
}

/// Process-scoped index of sinks by object name.
///
/// Shared across client nodes; the only client-side state touched from
/// more than one task. At most one sink per name, and the node pointer is
/// set exactly while the object is linked over some transport.
#[derive(Default)]
pub struct ClientRegistry {
    entries: Mutex<HashMap<String, SinkEntry>>,
}

impl ClientRegistry {
    /// A fresh registry, for tests and applications that wire their own.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The shared process-wide registry.
    pub fn process_default() -> Arc<Self> {
        static DEFAULT: OnceLock<Arc<ClientRegistry>> = OnceLock::new();
        DEFAULT.get_or_init(Self::new).clone()
    }

    /// Registers a sink under its object name. Re-adding a name keeps the
    /// existing entry.
    pub fn add_sink(&self, sink: Arc<dyn ObjectSink>) {
        let name = sink.object_name();
        self.entries
            .lock()
            .entry(name)
            .or_insert(SinkEntry { sink, node: None });
    }

    /// Drops a sink entry, clearing its node pointer with it.
    pub fn remove_sink(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    pub fn sink(&self, name: &str) -> Option<Arc<dyn ObjectSink>> {
        self.entries.lock().get(name).map(|entry| entry.sink.clone())
    }

    /// Points a registered name at the node currently carrying it, or at
    /// nothing when unlinked.
    pub fn set_node(&self, name: &str, node: Option<Arc<ClientNode>>) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.node = node;
        }
    }

    pub fn node(&self, name: &str) -> Option<Arc<ClientNode>> {
        self.entries.lock().get(name).and_then(|entry| entry.node.clone())
    }
}

/// Per-connection façade pairing a protocol engine with the sink registry.
///
/// The node is the engine's listener: inbound frames become sink
/// callbacks, sink actions become outbound frames.
pub struct ClientNode {
    engine: Protocol,
    registry: Arc<ClientRegistry>,
    links: Mutex<HashSet<String>>,
    self_ref: Weak<ClientNode>,
}

impl ClientNode {
    pub fn new(
        registry: Arc<ClientRegistry>,
        writer: Arc<dyn MessageWriter>,
        format: MessageFormat,
    ) -> Arc<Self> {
        Arc::new_cyclic(|node: &Weak<ClientNode>| {
            let listener: Weak<dyn ProtocolListener> = node.clone();
            ClientNode {
                engine: Protocol::new(listener, writer, format),
                registry,
                links: Mutex::new(HashSet::new()),
                self_ref: node.clone(),
            }
        })
    }

    /// Feeds one inbound frame from the transport.
    pub fn handle_message(&self, data: &[u8]) {
        self.engine.handle_message(data);
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Starts the link handshake for a registered sink.
    pub fn link_sink(&self, name: &str) -> Result<()> {
        tracing::debug!("linking {name}");
        self.links.lock().insert(name.to_string());
        self.engine.write_link(name)
    }

    /// Tears the link down: writes UNLINK, releases the sink and clears
    /// the registry's node pointer.
    pub fn unlink_sink(&self, name: &str) -> Result<()> {
        tracing::debug!("unlinking {name}");
        self.links.lock().remove(name);
        let written = self.engine.write_unlink(name);
        if let Some(sink) = self.registry.sink(name) {
            sink.on_release();
        }
        self.registry.set_node(name, None);
        written
    }

    /// Invokes a remote method. Await the returned handle for the reply,
    /// or drop it when the reply is of no interest.
    pub fn invoke_remote(&self, member: &str, args: &[Value]) -> Result<InvokeFuture> {
        self.engine.write_invoke(member, args)
    }

    /// Requests a property change on the remote object. The authoritative
    /// new value comes back as a PROPERTY_CHANGE.
    pub fn set_remote_property(&self, member: &str, value: Value) -> Result<()> {
        self.engine.write_set_property(member, value)
    }

    /// Shuts the node down: outstanding invokes cancel, every linked sink
    /// is released, and further writes fail fast.
    pub fn close(&self) {
        self.engine.shutdown();
        let links: Vec<String> = self.links.lock().drain().collect();
        for name in links {
            if let Some(sink) = self.registry.sink(&name) {
                sink.on_release();
            }
            self.registry.set_node(&name, None);
        }
    }

    /// Server-bound kinds arriving at a client are protocol faults.
    fn reject(&self, kind: MessageKind, id: u64, what: &str) {
        tracing::warn!("client node received server-bound {what}");
        let _ = self
            .engine
            .write_error(kind.tag(), id, &format!("{what} not handled by a client node"));
    }
}

impl ProtocolListener for ClientNode {
    fn on_link(&self, _name: &str) {
        self.reject(MessageKind::Link, 0, "LINK");
    }

    fn on_unlink(&self, _name: &str) {
        self.reject(MessageKind::Unlink, 0, "UNLINK");
    }

    fn on_set_property(&self, _member: &str, _value: Value) {
        self.reject(MessageKind::SetProperty, 0, "SET_PROPERTY");
    }

    fn on_invoke(&self, id: u64, _member: &str, _args: Vec<Value>) {
        self.reject(MessageKind::Invoke, id, "INVOKE");
    }

    fn on_init(&self, name: &str, props: Map<String, Value>) {
        let Some(sink) = self.registry.sink(name) else {
            tracing::warn!("INIT for unregistered sink '{name}'");
            return;
        };
        let Some(node) = self.self_ref.upgrade() else {
            return;
        };
        tracing::debug!("linked {name}");
        self.registry.set_node(name, Some(node.clone()));
        sink.on_init(name, props, node);
    }

    fn on_property_change(&self, member: &str, value: Value) {
        match self.registry.sink(name::resource_of(member)) {
            Some(sink) => sink.on_property_changed(member, value),
            None => tracing::warn!("property change for unregistered sink '{member}'"),
        }
    }

    fn on_signal(&self, member: &str, args: Vec<Value>) {
        match self.registry.sink(name::resource_of(member)) {
            Some(sink) => sink.on_signal(member, args),
            None => tracing::warn!("signal for unregistered sink '{member}'"),
        }
    }

    fn on_invoke_reply(&self, id: u64, member: &str, _value: Value) {
        // Matched replies were already completed by the engine.
        tracing::debug!("invoke reply {id} for {member}");
    }

    fn on_error(&self, offending: i64, id: u64, message: &str) {
        tracing::warn!("peer reported error (kind {offending}, request {id}): {message}");
    }
}
