//! Payload provenance tagging
//!
//! Every forwarded JSON object carries a `$mesh_source` field naming the
//! agent that originated it: the device serial number for locally-produced
//! messages, a `cloud-<host>` label for messages arriving from the cloud
//! broker. Payloads that already carry the field, or that are not JSON
//! objects at all, pass through untouched: a payload the tagger cannot
//! parse is forwarded verbatim, never dropped.

use bytes::Bytes;
use serde_json::Value;

/// Provenance field inserted into forwarded JSON object payloads.
pub const SOURCE_KEY: &str = "$mesh_source";

/// Tag a payload with its provenance label.
///
/// If the payload parses as a JSON object lacking [`SOURCE_KEY`], the key is
/// inserted and the object re-encoded. Anything else is returned unchanged.
pub fn tag(payload: &[u8], source: &str) -> Bytes {
    let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(payload) else {
        return Bytes::copy_from_slice(payload);
    };

    if map.contains_key(SOURCE_KEY) {
        return Bytes::copy_from_slice(payload);
    }

    map.insert(SOURCE_KEY.to_string(), Value::String(source.to_string()));
    match serde_json::to_vec(&map) {
        Ok(encoded) => Bytes::from(encoded),
        Err(_) => Bytes::copy_from_slice(payload),
    }
}

/// Provenance label for messages originating at the cloud broker.
///
/// Dots in the host are flattened to underscores so the label reads as a
/// single identifier.
pub fn cloud_source(host: &str) -> String {
    format!("cloud-{}", host.replace('.', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_tag_inserts_source() {
        let tagged = tag(br#"{"a":1}"#, "serial-123");
        assert_eq!(parse(&tagged), json!({"a": 1, "$mesh_source": "serial-123"}));
    }

    #[test]
    fn test_tag_preserves_existing_source() {
        let payload = br#"{"a":1,"$mesh_source":"x"}"#;
        let tagged = tag(payload, "serial-123");
        assert_eq!(tagged.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_tag_is_idempotent() {
        let once = tag(br#"{"a":1}"#, "s");
        let twice = tag(&once, "s");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_non_json_passthrough() {
        let tagged = tag(b"not-json", "serial-123");
        assert_eq!(tagged.as_ref(), b"not-json".as_slice());
    }

    #[test]
    fn test_non_object_json_passthrough() {
        let tagged = tag(b"[1,2,3]", "serial-123");
        assert_eq!(tagged.as_ref(), b"[1,2,3]".as_slice());

        let tagged = tag(b"42", "serial-123");
        assert_eq!(tagged.as_ref(), b"42".as_slice());
    }

    #[test]
    fn test_empty_payload_passthrough() {
        let tagged = tag(b"", "serial-123");
        assert!(tagged.is_empty());
    }

    #[test]
    fn test_cloud_source_flattens_host() {
        assert_eq!(cloud_source("cloud.example.com"), "cloud-cloud_example_com");
        assert_eq!(cloud_source("localhost"), "cloud-localhost");
    }
}
