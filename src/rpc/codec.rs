//! Envelope encoding and tolerant frame decoding.
//!
//! The router service occasionally emits frames containing invalid byte
//! sequences (truncated multi-byte characters from device names, raw control
//! characters from command output). Decoding therefore runs in stages:
//!
//! 1. Standard JSON decoding.
//! 2. Strip control bytes and lead bytes that can never start a valid
//!    character, then decode again.
//! 3. Keep only printable ASCII and valid non-ASCII characters, then decode
//!    again.
//!
//! A frame that survives none of the stages is dropped and logged. It never
//! surfaces as an error to any caller.

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::error::RpcError;

/// Maximum number of characters of a dropped frame included in the log.
const LOG_PREVIEW_CHARS: usize = 120;

/// Serialize a request envelope, stamping it with its correlation id.
///
/// The message must be a JSON object carrying a string `action`. Any `id`
/// already present is overwritten.
///
/// # Errors
///
/// Returns `RpcError::Protocol` if the message is not an object, has no
/// `action`, or cannot be serialized.
pub fn encode_request(message: &Value, id: u64) -> Result<String, RpcError> {
    let Value::Object(fields) = message else {
        return Err(RpcError::Protocol(
            "request envelope must be a JSON object".to_string(),
        ));
    };

    if !fields.get("action").is_some_and(Value::is_string) {
        return Err(RpcError::Protocol(
            "request envelope is missing a string `action`".to_string(),
        ));
    }

    let mut envelope: Map<String, Value> = fields.clone();
    envelope.insert("id".to_string(), Value::from(id));

    Ok(serde_json::to_string(&envelope)?)
}

/// Decode an inbound frame, repairing invalid encoding where possible.
///
/// Returns `None` when the frame cannot be recovered.
pub fn decode_frame(raw: &[u8]) -> Option<Value> {
    let first_error = match serde_json::from_slice::<Value>(raw) {
        Ok(value) => return Some(value),
        Err(e) => e,
    };
    debug!("Frame failed to decode ({}), attempting repair", first_error);

    let stripped = strip_invalid_bytes(raw);
    match serde_json::from_slice::<Value>(&stripped) {
        Ok(value) => {
            debug!("Frame decoded after stripping invalid bytes");
            return Some(value);
        }
        Err(e) => {
            warn!(
                "Frame still invalid after basic repair ({}), filtering to printable characters",
                e
            );
        }
    }

    let filtered = keep_printable(&stripped);
    match serde_json::from_str::<Value>(&filtered) {
        Ok(value) => {
            warn!("Frame decoded after aggressive repair; some characters were discarded");
            Some(value)
        }
        Err(e) => {
            let preview: String = filtered.chars().take(LOG_PREVIEW_CHARS).collect();
            error!("Dropping unrecoverable frame ({}): {}", e, preview);
            None
        }
    }
}

/// Remove control and replacement characters from text received from the
/// router before it is surfaced to callers.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() && *c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Extract the correlation id of an inbound envelope.
///
/// Accepts integer ids and integer ids sent as strings. Anything else means
/// the frame is not a response.
pub fn response_id(value: &Value) -> Option<u64> {
    match value.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Stage one: drop ASCII control bytes (keeping JSON whitespace), bytes that
/// are never valid in UTF-8, encoded C1 controls, and orphaned lead bytes of
/// the two-byte sequences the router is known to truncate.
fn strip_invalid_bytes(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        let byte = raw[i];
        let next = raw.get(i + 1).copied();

        match byte {
            0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F => {}
            0xC0 | 0xC1 | 0xF5..=0xFF => {}
            // U+0080..U+009F
            0xC2 if next.is_some_and(|n| (0x80..=0x9F).contains(&n)) => i += 1,
            0xC2 | 0xC3 | 0xC9 if next.map_or(true, |n| n < 0x80) => {}
            _ => out.push(byte),
        }

        i += 1;
    }

    out
}

/// Stage two: keep printable ASCII and any well-formed non-ASCII character
/// from U+00A0 up, discarding everything else.
fn keep_printable(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| matches!(c, ' '..='~') || (*c >= '\u{A0}' && *c != char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_encode_request_stamps_id() {
        let message = json!({"action": "get_status", "router_id": "r1"});
        let encoded = encode_request(&message, 7).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(
            decoded,
            json!({"action": "get_status", "router_id": "r1", "id": 7})
        );
    }

    #[test]
    fn test_encode_request_overwrites_existing_id() {
        let message = json!({"action": "get_status", "id": 99});
        let encoded = encode_request(&message, 3).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["id"], json!(3));
    }

    #[test]
    fn test_encode_request_rejects_non_object() {
        let err = encode_request(&json!(["get_status"]), 1).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn test_encode_request_requires_action() {
        let err = encode_request(&json!({"router_id": "r1"}), 1).unwrap_err();
        assert!(err.to_string().contains("action"));
    }

    #[test]
    fn test_decode_valid_frame() {
        let value = decode_frame(br#"{"id":1,"success":true}"#).unwrap();
        assert_eq!(value, json!({"id": 1, "success": true}));
    }

    #[test]
    fn test_decode_strips_leading_control_bytes() {
        let mut raw = vec![0x00, 0x01, 0x1B];
        raw.extend_from_slice(br#"{"id":2,"success":true}"#);
        let value = decode_frame(&raw).unwrap();
        assert_eq!(value["id"], json!(2));
    }

    #[test]
    fn test_decode_strips_raw_control_inside_string() {
        let raw = b"{\"id\":3,\"output\":\"line\x07one\"}";
        let value = decode_frame(raw).unwrap();
        assert_eq!(value["output"], json!("lineone"));
    }

    #[test]
    fn test_decode_drops_truncated_lead_byte() {
        // "caf" followed by a lone 0xC3 and the closing quote
        let raw = b"{\"id\":4,\"name\":\"caf\xC3\"}";
        let value = decode_frame(raw).unwrap();
        assert_eq!(value["name"], json!("caf"));
    }

    #[test]
    fn test_decode_keeps_valid_multibyte_characters() {
        let raw = "{\"id\":5,\"name\":\"Jo\u{e3}o \u{2013} \u{1f4e1}\"}\u{1}".as_bytes();
        let value = decode_frame(raw).unwrap();
        assert_eq!(value["name"], json!("Jo\u{e3}o \u{2013} \u{1f4e1}"));
    }

    #[test]
    fn test_decode_aggressive_repair_drops_orphan_continuation_bytes() {
        let raw = b"{\"id\":6,\"name\":\"ether\x80\x81 1\"}";
        let value = decode_frame(raw).unwrap();
        assert_eq!(value["name"], json!("ether 1"));
    }

    #[test]
    fn test_decode_unrecoverable_frame_is_dropped() {
        assert!(decode_frame(b"\xFF\xFE not json at all {").is_none());
        assert!(decode_frame(b"").is_none());
    }

    #[test]
    fn test_decode_never_panics_on_noise() {
        let noise: Vec<u8> = (0u8..=255).cycle().take(2048).collect();
        let _ = decode_frame(&noise);

        let mut wrapped = noise.clone();
        wrapped.extend_from_slice(br#"{"id":8}"#);
        let _ = decode_frame(&wrapped);
    }

    #[test]
    fn test_sanitize_text_removes_controls() {
        assert_eq!(
            sanitize_text("login\u{0}failed\u{85}: bad\u{fffd} password\n"),
            "loginfailed: bad password"
        );
        assert_eq!(sanitize_text("conex\u{e3}o recusada"), "conex\u{e3}o recusada");
    }

    #[test]
    fn test_response_id_forms() {
        assert_eq!(response_id(&json!({"id": 12})), Some(12));
        assert_eq!(response_id(&json!({"id": "13"})), Some(13));
        assert_eq!(response_id(&json!({"id": null})), None);
        assert_eq!(response_id(&json!({"id": -1})), None);
        assert_eq!(response_id(&json!({"event": "route_added"})), None);
    }
}
