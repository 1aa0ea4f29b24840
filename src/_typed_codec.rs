//! Payload codec used by the typed registration and client helpers.
//!
//! Every payload that crosses the history boundary is an opaque string; typed
//! helpers encode through here so the wire form stays in one place.

use serde::Serialize;
use serde::de::DeserializeOwned;

pub trait Codec {
    fn encode<T: Serialize>(v: &T) -> Result<String, String>;
    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
}

/// JSON codec backed by `serde_json`.
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Msg {
        seq: u32,
        text: String,
    }

    #[test]
    fn decode_reports_malformed_payload() {
        let err = Json::decode::<Msg>("{not json").unwrap_err();
        assert!(err.starts_with("decode:"), "unexpected error: {err}");
    }

    #[test]
    fn encode_produces_plain_json() {
        let s = Json::encode(&Msg {
            seq: 3,
            text: "bye".into(),
        })
        .unwrap();
        assert_eq!(s, r#"{"seq":3,"text":"bye"}"#);
        let back: Msg = Json::decode(&s).unwrap();
        assert_eq!(back.seq, 3);
    }
}
