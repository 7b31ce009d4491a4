//! Bidirectional protocol engine.
//!
//! This module implements the request/response correlation layer on top of
//! an externally owned transport. It handles:
//! - Generating unique request IDs
//! - Correlating INVOKE_REPLY frames with pending invokes
//! - Parsing inbound frames and dispatching them to a listener
//! - Building outbound frames for every message kind
//!
//! # Message Flow
//!
//! 1. A node calls `write_invoke()` with a member id and arguments
//! 2. The engine allocates the next request id and registers a oneshot
//!    sender before the frame leaves, so a reply can never race the entry
//! 3. The frame is encoded and handed to the transport writer
//! 4. The caller holds the receiving half and awaits (or drops) it
//! 5. The transport feeds inbound bytes to `handle_message()`
//! 6. A matching INVOKE_REPLY consumes the pending entry and completes the
//!    oneshot, then the listener is notified
//!
//! The engine itself is synchronous: `handle_message` finishes, including
//! any nested outbound writes the listener performs, before it returns.
//! Suspension only ever happens inside the transport.

use crate::codec::{self, MessageFormat};
use crate::error::{Error, Result};
use crate::message::{self, Message, MessageKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Capability the engine requires of its transport.
///
/// `write` hands one encoded frame over and is synchronous from the
/// engine's viewpoint. It may be called re-entrantly while an inbound
/// frame is being dispatched (a listener replying inside `on_invoke`).
pub trait MessageWriter: Send + Sync {
    fn write(&self, frame: Vec<u8>);
}

/// Inbound dispatch interface, one hook per message kind.
///
/// The engine makes no threading assumptions: hooks run on the transport's
/// task and may re-enter the engine through the write methods.
pub trait ProtocolListener: Send + Sync {
    fn on_link(&self, name: &str);
    fn on_init(&self, name: &str, props: Map<String, Value>);
    fn on_unlink(&self, name: &str);
    fn on_set_property(&self, member: &str, value: Value);
    fn on_property_change(&self, member: &str, value: Value);
    fn on_invoke(&self, id: u64, member: &str, args: Vec<Value>);
    fn on_invoke_reply(&self, id: u64, member: &str, value: Value);
    fn on_signal(&self, member: &str, args: Vec<Value>);
    fn on_error(&self, offending: i64, id: u64, message: &str);
}

/// Completion payload for a matched INVOKE_REPLY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeReply {
    /// Member id the invoke addressed
    pub member: String,
    /// Value returned by the source
    pub value: Value,
}

/// One-shot handle resolving to the outcome of a remote invoke.
///
/// Resolves `Ok(reply)` on a matching INVOKE_REPLY or `Err(Cancelled)`
/// when the engine shuts down first. Dropping the handle is the no-op
/// continuation.
pub type InvokeFuture = oneshot::Receiver<Result<InvokeReply>>;

/// Bidirectional protocol state machine, one per transport.
///
/// Owned by exactly one node; only the registries behind that node are
/// shared across transports.
pub struct Protocol {
    listener: Weak<dyn ProtocolListener>,
    writer: Arc<dyn MessageWriter>,
    format: MessageFormat,
    /// Last allocated request id; the first emitted id is 1
    last_id: AtomicU64,
    /// Pending invoke completions keyed by request id
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<InvokeReply>>>>,
    closed: AtomicBool,
}

impl Protocol {
    /// Creates an engine bound to its listener, transport writer and wire
    /// format. The listener is held weakly; the node that owns the engine
    /// is expected to be the listener.
    pub fn new(
        listener: Weak<dyn ProtocolListener>,
        writer: Arc<dyn MessageWriter>,
        format: MessageFormat,
    ) -> Self {
        Self {
            listener,
            writer,
            format,
            last_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The wire format this engine was constructed with.
    pub fn format(&self) -> MessageFormat {
        self.format
    }

    /// Feeds one inbound frame from the transport.
    ///
    /// Undecodable frames and frames outside the message taxonomy are
    /// logged and dropped, answered with a best-effort `ERROR(0, 0, …)`;
    /// they never propagate and never close the transport.
    pub fn handle_message(&self, data: &[u8]) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("dropping frame received after shutdown");
            return;
        }

        let frame = match codec::decode(self.format, data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping undecodable frame: {e}");
                self.report_malformed(&e);
                return;
            }
        };
        let parsed = match Message::from_value(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("dropping malformed frame: {e}");
                self.report_malformed(&e);
                return;
            }
        };

        let Some(listener) = self.listener.upgrade() else {
            tracing::warn!("frame received after listener was dropped");
            return;
        };

        tracing::debug!("dispatching {:?}", parsed.kind());
        match parsed {
            Message::Link { name } => listener.on_link(&name),
            Message::Init { name, props } => listener.on_init(&name, props),
            Message::Unlink { name } => listener.on_unlink(&name),
            Message::SetProperty { member, value } => listener.on_set_property(&member, value),
            Message::PropertyChange { member, value } => {
                listener.on_property_change(&member, value)
            }
            Message::Invoke { id, member, args } => listener.on_invoke(id, &member, args),
            Message::InvokeReply { id, member, value } => {
                // The pending entry is consumed before the listener runs so
                // the completion fires at most once.
                match self.pending.lock().remove(&id) {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(Ok(InvokeReply {
                            member: member.clone(),
                            value: value.clone(),
                        }));
                    }
                    None => {
                        tracing::warn!("no pending invoke {id} for {member}");
                        let _ = self.write_error(
                            MessageKind::Invoke.tag(),
                            id,
                            &Error::InvokeMismatch(id).to_string(),
                        );
                    }
                }
                listener.on_invoke_reply(id, &member, value);
            }
            Message::Signal { member, args } => listener.on_signal(&member, args),
            Message::Error { offending, id, message } => {
                listener.on_error(offending, id, &message)
            }
        }
    }

    /// Best effort: the peer may be talking a broken dialect, or the
    /// transport may already be gone.
    fn report_malformed(&self, cause: &Error) {
        let _ = self.write_error(message::NO_KIND, 0, &cause.to_string());
    }

    fn write_frame(&self, frame: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let data = codec::encode(self.format, &frame)?;
        self.writer.write(data);
        Ok(())
    }

    pub fn write_link(&self, name: &str) -> Result<()> {
        self.write_frame(message::link(name))
    }

    pub fn write_unlink(&self, name: &str) -> Result<()> {
        self.write_frame(message::unlink(name))
    }

    pub fn write_init(&self, name: &str, props: &Map<String, Value>) -> Result<()> {
        self.write_frame(message::init(name, props))
    }

    pub fn write_set_property(&self, member: &str, value: Value) -> Result<()> {
        self.write_frame(message::set_property(member, value))
    }

    pub fn write_property_change(&self, member: &str, value: Value) -> Result<()> {
        self.write_frame(message::property_change(member, value))
    }

    /// Starts a remote invoke and returns the completion handle.
    ///
    /// The pending entry is registered before the frame is handed to the
    /// writer, so a reply delivered re-entrantly from inside the write
    /// still finds it. If encoding fails the entry is taken back out and
    /// nothing is emitted.
    pub fn write_invoke(&self, member: &str, args: &[Value]) -> Result<InvokeFuture> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.lock().insert(id, reply_tx);

        tracing::debug!("invoke {id}: {member}");
        if let Err(e) = self.write_frame(message::invoke(id, member, args)) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(reply_rx)
    }

    pub fn write_invoke_reply(&self, id: u64, member: &str, value: Value) -> Result<()> {
        self.write_frame(message::invoke_reply(id, member, value))
    }

    pub fn write_signal(&self, member: &str, args: &[Value]) -> Result<()> {
        self.write_frame(message::signal(member, args))
    }

    pub fn write_error(&self, offending: i64, id: u64, text: &str) -> Result<()> {
        self.write_frame(message::error(offending, id, text))
    }

    /// Shuts the engine down: every pending invoke completes exactly once
    /// with `Error::Cancelled`, and all further writes fail fast with
    /// `Error::Closed`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled: Vec<_> = self.pending.lock().drain().collect();
        if !cancelled.is_empty() {
            tracing::debug!("cancelling {} pending invokes", cancelled.len());
        }
        for (_, reply_tx) in cancelled {
            let _ = reply_tx.send(Err(Error::Cancelled));
        }
    }

    /// True once `shutdown` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Captures every frame the engine writes, decoded back to values.
    #[derive(Default)]
    struct RecordingWriter {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingWriter {
        fn decoded(&self, format: MessageFormat) -> Vec<Value> {
            self.frames
                .lock()
                .iter()
                .map(|data| codec::decode(format, data).unwrap())
                .collect()
        }
    }

    impl MessageWriter for RecordingWriter {
        fn write(&self, frame: Vec<u8>) {
            self.frames.lock().push(frame);
        }
    }

    /// Records which hooks fired, in order.
    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn push(&self, event: String) {
            self.events.lock().push(event);
        }
    }

    impl ProtocolListener for RecordingListener {
        fn on_link(&self, name: &str) {
            self.push(format!("link {name}"));
        }
        fn on_init(&self, name: &str, props: Map<String, Value>) {
            self.push(format!("init {name} {}", Value::Object(props)));
        }
        fn on_unlink(&self, name: &str) {
            self.push(format!("unlink {name}"));
        }
        fn on_set_property(&self, member: &str, value: Value) {
            self.push(format!("set {member}={value}"));
        }
        fn on_property_change(&self, member: &str, value: Value) {
            self.push(format!("change {member}={value}"));
        }
        fn on_invoke(&self, id: u64, member: &str, _args: Vec<Value>) {
            self.push(format!("invoke {id} {member}"));
        }
        fn on_invoke_reply(&self, id: u64, member: &str, value: Value) {
            self.push(format!("reply {id} {member}={value}"));
        }
        fn on_signal(&self, member: &str, _args: Vec<Value>) {
            self.push(format!("signal {member}"));
        }
        fn on_error(&self, offending: i64, id: u64, message: &str) {
            self.push(format!("error {offending} {id} {message}"));
        }
    }

    fn test_engine() -> (Protocol, Arc<RecordingListener>, Arc<RecordingWriter>) {
        let listener = Arc::new(RecordingListener::default());
        let writer = Arc::new(RecordingWriter::default());
        let listener_dyn: Arc<dyn ProtocolListener> = listener.clone();
        let weak: Weak<dyn ProtocolListener> = Arc::downgrade(&listener_dyn);
        let engine = Protocol::new(weak, writer.clone(), MessageFormat::Json);
        (engine, listener, writer)
    }

    fn encode_json(frame: Value) -> Vec<u8> {
        codec::encode(MessageFormat::Json, &frame).unwrap()
    }

    #[test]
    fn test_request_ids_start_at_one_and_increment() {
        let (engine, _listener, writer) = test_engine();

        engine.write_invoke("demo.Calc/add", &[json!(4)]).unwrap();
        engine.write_invoke("demo.Calc/add", &[json!(6)]).unwrap();

        let frames = writer.decoded(MessageFormat::Json);
        assert_eq!(frames[0], json!([30, 1, "demo.Calc/add", [4]]));
        assert_eq!(frames[1], json!([30, 2, "demo.Calc/add", [6]]));
    }

    #[test]
    fn test_outbound_order_matches_call_order() {
        let (engine, _listener, writer) = test_engine();

        engine.write_link("demo.Calc").unwrap();
        engine
            .write_property_change("demo.Calc/total", json!(5))
            .unwrap();
        engine.write_signal("demo.Calc/hitUpper", &[json!(10)]).unwrap();
        engine.write_unlink("demo.Calc").unwrap();

        let tags: Vec<i64> = writer
            .decoded(MessageFormat::Json)
            .iter()
            .map(|frame| frame[0].as_i64().unwrap())
            .collect();
        assert_eq!(tags, vec![10, 21, 40, 12]);
    }

    #[tokio::test]
    async fn test_matched_reply_completes_future_then_notifies_listener() {
        let (engine, listener, _writer) = test_engine();

        let pending = engine.write_invoke("demo.Calc/add", &[json!(4)]).unwrap();
        engine.handle_message(&encode_json(json!([31, 1, "demo.Calc/add", 5])));

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.member, "demo.Calc/add");
        assert_eq!(reply.value, json!(5));
        assert_eq!(
            listener.events.lock().as_slice(),
            ["reply 1 demo.Calc/add=5"]
        );
    }

    #[test]
    fn test_unmatched_reply_reports_error_and_survives() {
        let (engine, listener, writer) = test_engine();

        engine.handle_message(&encode_json(json!([31, 999, "demo.Calc/add", 0])));

        let frames = writer.decoded(MessageFormat::Json);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], json!(90));
        assert_eq!(frames[0][1], json!(30));
        assert_eq!(frames[0][2], json!(999));
        // The listener is still told, after the error went out.
        assert_eq!(listener.events.lock().len(), 1);
    }

    #[test]
    fn test_undecodable_frame_is_dropped_with_best_effort_error() {
        let (engine, listener, writer) = test_engine();

        engine.handle_message(b"this is not json");

        assert!(listener.events.lock().is_empty());
        let frames = writer.decoded(MessageFormat::Json);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], json!(90));
        assert_eq!(frames[0][1], json!(0));
        assert_eq!(frames[0][2], json!(0));
    }

    #[test]
    fn test_unknown_kind_tag_is_dropped() {
        let (engine, listener, writer) = test_engine();

        engine.handle_message(&encode_json(json!([77, "demo.Calc"])));

        assert!(listener.events.lock().is_empty());
        let frames = writer.decoded(MessageFormat::Json);
        assert_eq!(frames[0][0], json!(90));
    }

    #[test]
    fn test_inbound_dispatch_reaches_all_hooks() {
        let (engine, listener, _writer) = test_engine();

        engine.handle_message(&encode_json(json!([10, "demo.Calc"])));
        engine.handle_message(&encode_json(json!([20, "demo.Calc/total", 7])));
        engine.handle_message(&encode_json(json!([40, "demo.Calc/hitUpper", [10]])));
        engine.handle_message(&encode_json(json!([90, 10, 0, "no such source"])));

        assert_eq!(
            listener.events.lock().as_slice(),
            [
                "link demo.Calc",
                "set demo.Calc/total=7",
                "signal demo.Calc/hitUpper",
                "error 10 0 no such source",
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_and_fails_further_writes() {
        let (engine, _listener, _writer) = test_engine();

        let pending = engine.write_invoke("demo.Calc/add", &[json!(4)]).unwrap();
        engine.shutdown();

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(Error::Cancelled)));

        assert!(matches!(engine.write_link("demo.Calc"), Err(Error::Closed)));
        assert!(matches!(
            engine.write_invoke("demo.Calc/add", &[]),
            Err(Error::Closed)
        ));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_frames_after_shutdown_are_dropped() {
        let (engine, listener, writer) = test_engine();

        engine.shutdown();
        engine.handle_message(&encode_json(json!([10, "demo.Calc"])));

        assert!(listener.events.lock().is_empty());
        assert!(writer.frames.lock().is_empty());
    }
}
