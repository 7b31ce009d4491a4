//! Wire encodings for protocol frames.
//!
//! The codec converts between the dynamic value tree (`serde_json::Value`)
//! and framed byte strings. Four formats are supported; the choice is made
//! per connection when the protocol engine is constructed, and both peers
//! must agree out-of-band. JSON is the default.
//!
//! `decode(encode(v))` preserves the value model (numbers, strings, arrays
//! and string-keyed maps); map key order is not part of the contract.

use crate::error::{Error, Result};
use serde_json::Value;

/// Selects how frames are laid out on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageFormat {
    /// JSON text (default)
    #[default]
    Json,
    /// Binary JSON
    Bson,
    /// MessagePack
    MsgPack,
    /// Concise Binary Object Representation
    Cbor,
}

/// Encodes one value as a wire frame.
pub fn encode(format: MessageFormat, value: &Value) -> Result<Vec<u8>> {
    match format {
        MessageFormat::Json => {
            serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
        }
        MessageFormat::Bson => {
            // BSON only allows a document at the top level; frames are
            // arrays, so they travel nested under a single key.
            let body = bson::to_bson(value).map_err(|e| Error::Encode(e.to_string()))?;
            bson::to_vec(&bson::doc! { "frame": body }).map_err(|e| Error::Encode(e.to_string()))
        }
        MessageFormat::MsgPack => {
            rmp_serde::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
        }
        MessageFormat::Cbor => {
            serde_cbor::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
        }
    }
}

/// Decodes one wire frame back into a value.
pub fn decode(format: MessageFormat, data: &[u8]) -> Result<Value> {
    match format {
        MessageFormat::Json => {
            serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
        }
        MessageFormat::Bson => {
            let doc: bson::Document =
                bson::from_slice(data).map_err(|e| Error::Decode(e.to_string()))?;
            let body = doc
                .get("frame")
                .cloned()
                .ok_or_else(|| Error::Decode("document has no frame body".to_string()))?;
            Ok(body.into_relaxed_extjson())
        }
        MessageFormat::MsgPack => {
            rmp_serde::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
        }
        MessageFormat::Cbor => {
            serde_cbor::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL_FORMATS: [MessageFormat; 4] = [
        MessageFormat::Json,
        MessageFormat::Bson,
        MessageFormat::MsgPack,
        MessageFormat::Cbor,
    ];

    #[test]
    fn test_round_trip_preserves_frame_shape() {
        // A representative INVOKE frame: mixed ints, strings, nested
        // arrays and a map payload.
        let frame = json!([30, 7, "demo.Calc/add", [4, "label", {"nested": true}, null, 2.5]]);

        for format in ALL_FORMATS {
            let bytes = encode(format, &frame).unwrap();
            let decoded = decode(format, &bytes).unwrap();
            assert_eq!(decoded, frame, "round trip failed for {format:?}");
        }
    }

    #[test]
    fn test_json_is_plain_text() {
        let frame = json!([10, "demo.Calc"]);
        let bytes = encode(MessageFormat::Json, &frame).unwrap();
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), r#"[10,"demo.Calc"]"#);
    }

    #[test]
    fn test_default_format_is_json() {
        assert_eq!(MessageFormat::default(), MessageFormat::Json);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        // 0xc1 is reserved in MessagePack and nonsense in the other three.
        for format in ALL_FORMATS {
            let result = decode(format, b"\xc1\xc1\xc1");
            assert!(matches!(result, Err(Error::Decode(_))), "{format:?} accepted garbage");
        }
    }

    #[test]
    fn test_formats_are_not_interchangeable() {
        let frame = json!([12, "demo.Calc"]);
        let bytes = encode(MessageFormat::MsgPack, &frame).unwrap();
        assert!(decode(MessageFormat::Json, &bytes).is_err());
    }
}
