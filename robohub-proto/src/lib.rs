//! Robohub wire protocol - GATT registry and payload codec
//!
//! Control payloads travel as JSON text, file contents as base64 text inside
//! a JSON envelope. Reads are decoded best-effort: invalid UTF-8 never fails,
//! it comes back as base64.

pub mod ble;

pub use ble::{CharacteristicKey, Endpoint, ProtocolVersion};

use data_encoding::BASE64;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] data_encoding::DecodeError),
    #[error("unknown protocol version: {0} (expected legacy or current)")]
    UnknownProtocol(String),
}

/// Decoded value of one characteristic read or notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Utf8(String),
    /// The raw bytes were not valid UTF-8
    Base64(String),
}

impl Payload {
    pub fn decode(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Payload::Utf8(text.to_string()),
            Err(_) => Payload::Base64(BASE64.encode(bytes)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Payload::Utf8(s) | Payload::Base64(s) => s,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Payload::Utf8(_))
    }

    /// The bytes that were on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Payload::Utf8(s) => Ok(s.as_bytes().to_vec()),
            Payload::Base64(s) => decode_base64(s),
        }
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hub response: JSON when it parses, otherwise the text verbatim
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Json(serde_json::Value),
    Text(String),
}

impl Reply {
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(value) => Reply::Json(value),
            Err(_) => Reply::Text(text.to_string()),
        }
    }

    pub fn from_payload(payload: Payload) -> Self {
        match payload {
            Payload::Utf8(text) => Reply::parse(&text),
            Payload::Base64(text) => Reply::Text(text),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(s) => Some(s),
            Reply::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Reply::Json(v) => Some(v),
            Reply::Text(_) => None,
        }
    }

    /// File names from a listing, given either as `["a", ...]` or
    /// `{"files": ["a", ...]}`. Plain text is split on lines.
    pub fn file_names(&self) -> Vec<String> {
        let entries = match self {
            Reply::Json(serde_json::Value::Array(items)) => items,
            Reply::Json(serde_json::Value::Object(map)) => match map.get("files") {
                Some(serde_json::Value::Array(items)) => items,
                _ => return Vec::new(),
            },
            Reply::Json(_) => return Vec::new(),
            Reply::Text(text) => {
                return text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect();
            }
        };

        entries
            .iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(o) => o.get("name").and_then(|n| n.as_str()).map(String::from),
                _ => None,
            })
            .collect()
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Json(v) => write!(f, "{v}"),
            Reply::Text(s) => f.write_str(s),
        }
    }
}

/// Wi-Fi network selection, written to SetNetwork
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
}

/// `{path}`, used by read/list/delete/mkdir
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

/// File upload: `data` is base64 text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub data: String,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_overwrite() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreate {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Opens a script upload session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptStart {
    #[serde(rename = "type")]
    pub kind: String,
    pub filename: String,
}

impl ScriptStart {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            kind: "start".to_string(),
            filename: filename.into(),
        }
    }
}

/// `{ok: true}`, returned locally by fire-and-forget writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

/// JSON text as UTF-8 bytes, ready for a characteristic write
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Standard padded base64; surrounding and embedded whitespace is ignored
pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(BASE64.decode(compact.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_utf8_falls_back_to_base64() {
        let payload = Payload::decode(&[0xff, 0xfe, 0x00, 0x41]);
        assert_eq!(payload, Payload::Base64("//4AQQ==".to_string()));
        assert_eq!(payload.to_bytes().unwrap(), vec![0xff, 0xfe, 0x00, 0x41]);
    }

    #[test]
    fn utf8_is_kept_as_text() {
        let payload = Payload::decode("connected: home".as_bytes());
        assert!(payload.is_text());
        assert_eq!(payload.as_str(), "connected: home");
    }

    #[test]
    fn non_json_reply_is_verbatim_text() {
        assert_eq!(Reply::parse("OK"), Reply::Text("OK".to_string()));
        assert_eq!(Reply::parse(""), Reply::Text(String::new()));
        assert_eq!(
            Reply::parse(r#"{"connected":true}"#),
            Reply::Json(serde_json::json!({"connected": true}))
        );
    }

    #[test]
    fn credentials_encoding() {
        let creds = WifiCredentials {
            ssid: "home".to_string(),
            psk: Some("secret".to_string()),
        };
        assert_eq!(encode_json(&creds).unwrap(), br#"{"ssid":"home","psk":"secret"}"#.to_vec());

        let open = WifiCredentials {
            ssid: "cafe".to_string(),
            psk: None,
        };
        assert_eq!(encode_json(&open).unwrap(), br#"{"ssid":"cafe"}"#.to_vec());
    }

    #[test]
    fn envelopes() {
        let write = FileWrite {
            path: "/main.py".to_string(),
            data: encode_base64(b"print(1)"),
            overwrite: true,
        };
        assert_eq!(
            String::from_utf8(encode_json(&write).unwrap()).unwrap(),
            r#"{"path":"/main.py","data":"cHJpbnQoMSk=","overwrite":true}"#
        );
        assert_eq!(
            String::from_utf8(encode_json(&ScriptStart::new("main.py")).unwrap()).unwrap(),
            r#"{"type":"start","filename":"main.py"}"#
        );
        let create: FileCreate = serde_json::from_str(r#"{"path":"/a"}"#).unwrap();
        assert_eq!(create.data, None);
    }

    #[test]
    fn file_names_from_either_shape() {
        assert_eq!(Reply::parse(r#"["a.py","b.py"]"#).file_names(), vec!["a.py", "b.py"]);
        assert_eq!(Reply::parse(r#"{"files":["a.py"]}"#).file_names(), vec!["a.py"]);
        assert_eq!(Reply::parse("a.py\nb.py\n").file_names(), vec!["a.py", "b.py"]);
        assert!(Reply::parse("42").file_names().is_empty());
    }

    #[test]
    fn base64_tolerates_whitespace() {
        assert_eq!(decode_base64("aGVs\nbG8=\n").unwrap(), b"hello");
        assert!(decode_base64("not base64!").is_err());
    }
}
