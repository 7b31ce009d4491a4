//! Protocol frames.
//!
//! Every frame on the wire is an array whose first element is a numeric
//! kind tag. The builder functions here are the only place that positional
//! layout exists; the rest of the crate (and any integration) goes
//! through them, never hand-assembling arrays at call sites.
//!
//! Inbound, a decoded frame is parsed into the [`Message`] enum so that
//! dispatch over kinds stays exhaustive at compile time.

use crate::error::{Error, Result};
use serde_json::{Map, Value, json};

/// Kind tag reported in ERROR frames when the offending frame carried no
/// usable kind (undecodable bytes, non-array value, unknown tag).
pub const NO_KIND: i64 = 0;

/// Numeric kind tags, as they appear in the first array slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MessageKind {
    Link = 10,
    Init = 11,
    Unlink = 12,
    SetProperty = 20,
    PropertyChange = 21,
    Invoke = 30,
    InvokeReply = 31,
    Signal = 40,
    Error = 90,
}

impl MessageKind {
    /// The wire tag for this kind.
    pub fn tag(self) -> i64 {
        self as i64
    }

    /// Looks a wire tag up; `None` for tags outside the taxonomy.
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            10 => Some(Self::Link),
            11 => Some(Self::Init),
            12 => Some(Self::Unlink),
            20 => Some(Self::SetProperty),
            21 => Some(Self::PropertyChange),
            30 => Some(Self::Invoke),
            31 => Some(Self::InvokeReply),
            40 => Some(Self::Signal),
            90 => Some(Self::Error),
            _ => None,
        }
    }
}

/// `[LINK, object-id]`
pub fn link(name: &str) -> Value {
    json!([MessageKind::Link.tag(), name])
}

/// `[INIT, object-id, properties]`
pub fn init(name: &str, props: &Map<String, Value>) -> Value {
    json!([MessageKind::Init.tag(), name, props])
}

/// `[UNLINK, object-id]`
pub fn unlink(name: &str) -> Value {
    json!([MessageKind::Unlink.tag(), name])
}

/// `[SET_PROPERTY, member-id, value]`
pub fn set_property(member: &str, value: Value) -> Value {
    json!([MessageKind::SetProperty.tag(), member, value])
}

/// `[PROPERTY_CHANGE, member-id, value]`
pub fn property_change(member: &str, value: Value) -> Value {
    json!([MessageKind::PropertyChange.tag(), member, value])
}

/// `[INVOKE, request-id, member-id, args]`
pub fn invoke(id: u64, member: &str, args: &[Value]) -> Value {
    json!([MessageKind::Invoke.tag(), id, member, args])
}

/// `[INVOKE_REPLY, request-id, member-id, value]`
pub fn invoke_reply(id: u64, member: &str, value: Value) -> Value {
    json!([MessageKind::InvokeReply.tag(), id, member, value])
}

/// `[SIGNAL, member-id, args]`
pub fn signal(member: &str, args: &[Value]) -> Value {
    json!([MessageKind::Signal.tag(), member, args])
}

/// `[ERROR, offending-kind, request-id-or-0, message]`
pub fn error(offending: i64, id: u64, text: &str) -> Value {
    json!([MessageKind::Error.tag(), offending, id, text])
}

/// A parsed protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Link { name: String },
    Init { name: String, props: Map<String, Value> },
    Unlink { name: String },
    SetProperty { member: String, value: Value },
    PropertyChange { member: String, value: Value },
    Invoke { id: u64, member: String, args: Vec<Value> },
    InvokeReply { id: u64, member: String, value: Value },
    Signal { member: String, args: Vec<Value> },
    Error { offending: i64, id: u64, message: String },
}

impl Message {
    /// Parses a decoded frame into its typed form.
    ///
    /// Rejects anything that is not an array, carries an unknown kind tag,
    /// or is missing a positional field of the expected type.
    pub fn from_value(frame: Value) -> Result<Self> {
        let Value::Array(items) = frame else {
            return Err(Error::Malformed("frame is not an array".to_string()));
        };
        let tag = items
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Malformed("frame has no numeric kind tag".to_string()))?;
        let kind = MessageKind::from_tag(tag)
            .ok_or_else(|| Error::Malformed(format!("unknown kind tag {tag}")))?;

        let message = match kind {
            MessageKind::Link => Message::Link { name: text_at(&items, 1)? },
            MessageKind::Init => Message::Init {
                name: text_at(&items, 1)?,
                props: props_at(&items, 2)?,
            },
            MessageKind::Unlink => Message::Unlink { name: text_at(&items, 1)? },
            MessageKind::SetProperty => Message::SetProperty {
                member: text_at(&items, 1)?,
                value: value_at(&items, 2)?,
            },
            MessageKind::PropertyChange => Message::PropertyChange {
                member: text_at(&items, 1)?,
                value: value_at(&items, 2)?,
            },
            MessageKind::Invoke => Message::Invoke {
                id: id_at(&items, 1)?,
                member: text_at(&items, 2)?,
                args: args_at(&items, 3)?,
            },
            MessageKind::InvokeReply => Message::InvokeReply {
                id: id_at(&items, 1)?,
                member: text_at(&items, 2)?,
                value: value_at(&items, 3)?,
            },
            MessageKind::Signal => Message::Signal {
                member: text_at(&items, 1)?,
                args: args_at(&items, 2)?,
            },
            MessageKind::Error => Message::Error {
                offending: items
                    .get(1)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| missing(1, "kind tag"))?,
                id: id_at(&items, 2)?,
                message: text_at(&items, 3)?,
            },
        };
        Ok(message)
    }

    /// The kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Link { .. } => MessageKind::Link,
            Message::Init { .. } => MessageKind::Init,
            Message::Unlink { .. } => MessageKind::Unlink,
            Message::SetProperty { .. } => MessageKind::SetProperty,
            Message::PropertyChange { .. } => MessageKind::PropertyChange,
            Message::Invoke { .. } => MessageKind::Invoke,
            Message::InvokeReply { .. } => MessageKind::InvokeReply,
            Message::Signal { .. } => MessageKind::Signal,
            Message::Error { .. } => MessageKind::Error,
        }
    }
}

fn missing(pos: usize, what: &str) -> Error {
    Error::Malformed(format!("frame slot {pos} is not a {what}"))
}

fn text_at(items: &[Value], pos: usize) -> Result<String> {
    items
        .get(pos)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(pos, "string"))
}

fn id_at(items: &[Value], pos: usize) -> Result<u64> {
    items
        .get(pos)
        .and_then(Value::as_u64)
        .ok_or_else(|| missing(pos, "request id"))
}

fn value_at(items: &[Value], pos: usize) -> Result<Value> {
    items.get(pos).cloned().ok_or_else(|| missing(pos, "value"))
}

fn props_at(items: &[Value], pos: usize) -> Result<Map<String, Value>> {
    match items.get(pos) {
        Some(Value::Object(props)) => Ok(props.clone()),
        _ => Err(missing(pos, "property map")),
    }
}

fn args_at(items: &[Value], pos: usize) -> Result<Vec<Value>> {
    match items.get(pos) {
        Some(Value::Array(args)) => Ok(args.clone()),
        _ => Err(missing(pos, "argument array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_match_wire_shape() {
        assert_eq!(link("demo.Calc"), json!([10, "demo.Calc"]));
        assert_eq!(unlink("demo.Calc"), json!([12, "demo.Calc"]));

        let mut props = Map::new();
        props.insert("total".to_string(), json!(1));
        assert_eq!(init("demo.Calc", &props), json!([11, "demo.Calc", {"total": 1}]));

        assert_eq!(
            set_property("demo.Calc/total", json!(7)),
            json!([20, "demo.Calc/total", 7])
        );
        assert_eq!(
            property_change("demo.Calc/total", json!(5)),
            json!([21, "demo.Calc/total", 5])
        );
        assert_eq!(
            invoke(1, "demo.Calc/add", &[json!(4)]),
            json!([30, 1, "demo.Calc/add", [4]])
        );
        assert_eq!(
            invoke_reply(1, "demo.Calc/add", json!(5)),
            json!([31, 1, "demo.Calc/add", 5])
        );
        assert_eq!(
            signal("demo.Calc/hitUpper", &[json!(10)]),
            json!([40, "demo.Calc/hitUpper", [10]])
        );
        assert_eq!(
            error(MessageKind::Invoke.tag(), 999, "no pending invoke"),
            json!([90, 30, 999, "no pending invoke"])
        );
    }

    #[test]
    fn test_parse_invoke() {
        let message = Message::from_value(json!([30, 1, "demo.Calc/add", [4]])).unwrap();
        assert_eq!(
            message,
            Message::Invoke {
                id: 1,
                member: "demo.Calc/add".to_string(),
                args: vec![json!(4)],
            }
        );
        assert_eq!(message.kind(), MessageKind::Invoke);
    }

    #[test]
    fn test_parse_init_requires_property_map() {
        let result = Message::from_value(json!([11, "demo.Calc", [1, 2]]));
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn test_parse_rejects_non_array() {
        let result = Message::from_value(json!({"kind": 10}));
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let result = Message::from_value(json!([77, "demo.Calc"]));
        assert!(matches!(result, Err(Error::Malformed(_))));
    }

    #[test]
    fn test_parse_rejects_missing_slots() {
        assert!(Message::from_value(json!([10])).is_err());
        assert!(Message::from_value(json!([30, "not-an-id", "demo.Calc/add", []])).is_err());
    }

    #[test]
    fn test_every_builder_parses_back() {
        let mut props = Map::new();
        props.insert("total".to_string(), json!(1));

        let frames = vec![
            link("demo.Calc"),
            init("demo.Calc", &props),
            unlink("demo.Calc"),
            set_property("demo.Calc/total", json!(7)),
            property_change("demo.Calc/total", json!(5)),
            invoke(1, "demo.Calc/add", &[json!(4)]),
            invoke_reply(1, "demo.Calc/add", json!(5)),
            signal("demo.Calc/hitUpper", &[json!(10)]),
            error(NO_KIND, 0, "unreadable frame"),
        ];
        for frame in frames {
            let parsed = Message::from_value(frame.clone()).unwrap();
            assert_eq!(parsed.kind().tag(), frame[0].as_i64().unwrap());
        }
    }
}
