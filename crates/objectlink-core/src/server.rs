//! Server side: sources, the source registry, and the per-connection
//! server node.
//!
//! A source is the application object whose state and behavior are exposed
//! remotely. One source may be linked to many transports at once; the
//! [`ServerRegistry`] keeps the set of server nodes currently carrying
//! each source, and property changes and signals fan out to that whole
//! set.

use crate::codec::MessageFormat;
use crate::error::{Error, Result};
use crate::message::MessageKind;
use crate::name;
use crate::protocol::{MessageWriter, Protocol, ProtocolListener};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

/// Server-side object exposed to remote peers.
pub trait ObjectSource: Send + Sync {
    /// Object name the source registers under (`module.Interface`).
    fn object_name(&self) -> String;

    /// Handles a remote method invocation. A returned error travels back
    /// to the caller as an ERROR frame with the original request id.
    fn invoke(&self, member: &str, args: &[Value]) -> Result<Value>;

    /// Handles a remote property-set request. The source decides whether
    /// to accept and notifies the new value itself.
    fn set_property(&self, member: &str, value: Value);

    /// Snapshot of the current property state, sent as INIT on every link.
    fn collect_properties(&self) -> Map<String, Value>;

    /// A remote node linked this object; `node` is the capability for
    /// pushing state until `unlinked`.
    fn linked(&self, name: &str, node: Arc<dyn RemoteNode>);

    /// A remote node unlinked this object.
    fn unlinked(&self, name: &str);
}

/// Capability handed to sources for pushing state to linked peers.
///
/// Both notifications address the whole link set of the member's object,
/// not just the node the capability came from; this is how one source
/// reaches many clients.
pub trait RemoteNode: Send + Sync {
    fn notify_property_change(&self, member: &str, value: Value);
    fn notify_signal(&self, member: &str, args: Vec<Value>);
}

struct SourceEntry {
    source: Arc<dyn ObjectSource>,
    nodes: Vec<Arc<ServerNode>>,
}

/// Process-scoped index of sources and the nodes linked to them.
///
/// The node set for a name holds exactly the server nodes that received
/// LINK and not yet UNLINK for it. Detaching the last node keeps the
/// source registered.
#[derive(Default)]
pub struct ServerRegistry {
    entries: Mutex<HashMap<String, SourceEntry>>,
}

impl ServerRegistry {
    /// A fresh registry, for tests and applications that wire their own.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The shared process-wide registry.
    pub fn process_default() -> Arc<Self> {
        static DEFAULT: OnceLock<Arc<ServerRegistry>> = OnceLock::new();
        DEFAULT.get_or_init(Self::new).clone()
    }

    /// Registers a source under its object name. Re-adding a name keeps
    /// the existing entry.
    pub fn add_source(&self, source: Arc<dyn ObjectSource>) {
        let name = source.object_name();
        self.entries
            .lock()
            .entry(name)
            .or_insert(SourceEntry { source, nodes: Vec::new() });
    }

    /// Drops a source and whatever node set it still had.
    pub fn remove_source(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn ObjectSource>> {
        self.entries.lock().get(name).map(|entry| entry.source.clone())
    }

    /// Adds a node to the link set for `name`. Attaching twice is a no-op.
    pub fn attach_node(&self, name: &str, node: &Arc<ServerNode>) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            if !entry.nodes.iter().any(|other| Arc::ptr_eq(other, node)) {
                entry.nodes.push(node.clone());
            }
        }
    }

    /// Removes a node from the link set for `name`.
    pub fn detach_node(&self, name: &str, node: &Arc<ServerNode>) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.nodes.retain(|other| !Arc::ptr_eq(other, node));
        }
    }

    /// Snapshot of the nodes currently linked to `name`. Fan-out iterates
    /// the snapshot so re-entrant link changes cannot perturb it.
    pub fn nodes_of(&self, name: &str) -> Vec<Arc<ServerNode>> {
        self.entries
            .lock()
            .get(name)
            .map(|entry| entry.nodes.clone())
            .unwrap_or_default()
    }
}

/// Per-connection façade routing remote requests to sources.
pub struct ServerNode {
    engine: Protocol,
    registry: Arc<ServerRegistry>,
    links: Mutex<HashSet<String>>,
    self_ref: Weak<ServerNode>,
}

impl ServerNode {
    pub fn new(
        registry: Arc<ServerRegistry>,
        writer: Arc<dyn MessageWriter>,
        format: MessageFormat,
    ) -> Arc<Self> {
        Arc::new_cyclic(|node: &Weak<ServerNode>| {
            let listener: Weak<dyn ProtocolListener> = node.clone();
            ServerNode {
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

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Shuts the node down: detaches from every linked source (telling
    /// each one), then cancels whatever the engine still had pending.
    pub fn close(&self) {
        let links: Vec<String> = self.links.lock().drain().collect();
        if let Some(node) = self.self_ref.upgrade() {
            for name in links {
                self.registry.detach_node(&name, &node);
                if let Some(source) = self.registry.source(&name) {
                    source.unlinked(&name);
                }
            }
        }
        self.engine.shutdown();
    }

    /// Client-bound kinds arriving at a server are protocol faults.
    fn reject(&self, kind: MessageKind, id: u64, what: &str) {
        tracing::warn!("server node received client-bound {what}");
        let _ = self
            .engine
            .write_error(kind.tag(), id, &format!("{what} not handled by a server node"));
    }
}

impl ProtocolListener for ServerNode {
    fn on_link(&self, name: &str) {
        let Some(source) = self.registry.source(name) else {
            tracing::warn!("LINK for unknown source '{name}'");
            let _ = self.engine.write_error(
                MessageKind::Link.tag(),
                0,
                &format!("no such source '{name}'"),
            );
            return;
        };
        let Some(node) = self.self_ref.upgrade() else {
            return;
        };
        if !self.links.lock().insert(name.to_string()) {
            tracing::warn!("redundant LINK for '{name}'");
        }
        tracing::debug!("linked {name}");
        self.registry.attach_node(name, &node);
        source.linked(name, node);
        // INIT goes out unconditionally, even for an empty property map.
        let _ = self.engine.write_init(name, &source.collect_properties());
    }

    fn on_unlink(&self, name: &str) {
        if !self.links.lock().remove(name) {
            tracing::warn!("UNLINK for '{name}' that was not linked");
            return;
        }
        tracing::debug!("unlinked {name}");
        if let Some(node) = self.self_ref.upgrade() {
            self.registry.detach_node(name, &node);
        }
        if let Some(source) = self.registry.source(name) {
            source.unlinked(name);
        }
    }

    fn on_set_property(&self, member: &str, value: Value) {
        let name = name::resource_of(member);
        match self.registry.source(name) {
            Some(source) => source.set_property(member, value),
            None => {
                tracing::warn!("SET_PROPERTY for unknown source '{name}'");
                let _ = self.engine.write_error(
                    MessageKind::SetProperty.tag(),
                    0,
                    &Error::UnknownObject(name.to_string()).to_string(),
                );
            }
        }
    }

    fn on_invoke(&self, id: u64, member: &str, args: Vec<Value>) {
        let name = name::resource_of(member);
        let Some(source) = self.registry.source(name) else {
            tracing::warn!("INVOKE for unknown source '{name}'");
            let _ = self.engine.write_error(
                MessageKind::Invoke.tag(),
                id,
                &Error::UnknownObject(name.to_string()).to_string(),
            );
            return;
        };
        match source.invoke(member, &args) {
            Ok(value) => {
                let _ = self.engine.write_invoke_reply(id, member, value);
            }
            Err(e) => {
                tracing::warn!("invoke {member} failed: {e}");
                let _ = self.engine.write_error(MessageKind::Invoke.tag(), id, &e.to_string());
            }
        }
    }

    fn on_init(&self, _name: &str, _props: Map<String, Value>) {
        self.reject(MessageKind::Init, 0, "INIT");
    }

    fn on_property_change(&self, _member: &str, _value: Value) {
        self.reject(MessageKind::PropertyChange, 0, "PROPERTY_CHANGE");
    }

    fn on_signal(&self, _member: &str, _args: Vec<Value>) {
        self.reject(MessageKind::Signal, 0, "SIGNAL");
    }

    fn on_invoke_reply(&self, id: u64, member: &str, _value: Value) {
        // An unmatched reply already produced an ERROR inside the engine.
        tracing::warn!("unexpected invoke reply {id} for {member}");
    }

    fn on_error(&self, offending: i64, id: u64, message: &str) {
        tracing::warn!("peer reported error (kind {offending}, request {id}): {message}");
    }
}

impl RemoteNode for ServerNode {
    fn notify_property_change(&self, member: &str, value: Value) {
        for node in self.registry.nodes_of(name::resource_of(member)) {
            let _ = node.engine.write_property_change(member, value.clone());
        }
    }

    fn notify_signal(&self, member: &str, args: Vec<Value>) {
        for node in self.registry.nodes_of(name::resource_of(member)) {
            let _ = node.engine.write_signal(member, &args);
        }
    }
}
