// objectlink-core: protocol engine and object registries for the
// ObjectLink object-linking RPC protocol.
//
// Transports, UI binding layers and the domain objects themselves live
// outside this crate; they plug into the writer, listener, sink and
// source interfaces defined here.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod name;
pub mod protocol;
pub mod server;

pub use client::{ClientNode, ClientRegistry, ObjectSink};
pub use codec::MessageFormat;
pub use error::{Error, Result};
pub use message::{Message, MessageKind};
pub use protocol::{InvokeFuture, InvokeReply, MessageWriter, Protocol, ProtocolListener};
pub use server::{ObjectSource, RemoteNode, ServerNode, ServerRegistry};
