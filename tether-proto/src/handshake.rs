use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

/// Response code meaning the server accepted the handshake
pub(crate) const CODE_OK: u64 = 200;

#[derive(Debug, Deserialize)]
pub(crate) struct HandshakeResponse {
    pub(crate) code: u64,
    #[serde(default)]
    pub(crate) sys: Option<HandshakeSys>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HandshakeSys {
    /// Heartbeat interval in seconds; 0 or absent disables heartbeats
    #[serde(default)]
    pub(crate) heartbeat: Option<u64>,
    #[serde(default)]
    pub(crate) serializer: Option<String>,
    /// Route→code dictionary advertised by the server
    #[serde(default)]
    pub(crate) dict: Option<HashMap<String, u16>>,
}

/// Build the handshake request body
///
/// The base identifies this client under `sys`; caller-supplied options are
/// merged in — top-level keys land beside `sys`, and a caller `sys` object
/// is merged key-by-key into ours. A non-object option value goes under
/// `user`, which is where servers expect application data anyway.
pub(crate) fn request_body(opts: Option<&Value>) -> Vec<u8> {
    let mut sys = Map::new();
    sys.insert("type".into(), Value::from("tether"));
    sys.insert("version".into(), Value::from(env!("CARGO_PKG_VERSION")));

    let mut root = Map::new();
    match opts {
        Some(Value::Object(map)) => {
            for (key, value) in map {
                match (key.as_str(), value) {
                    ("sys", Value::Object(extra)) => {
                        for (k, v) in extra {
                            sys.insert(k.clone(), v.clone());
                        }
                    }
                    _ => {
                        root.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Some(other) => {
            root.insert("user".into(), other.clone());
        }
        None => {}
    }
    root.insert("sys".into(), Value::Object(sys));
    serde_json::to_vec(&Value::Object(root)).expect("JSON object serialization does not fail")
}

pub(crate) fn parse_response(body: &[u8]) -> Result<HandshakeResponse, serde_json::Error> {
    serde_json::from_slice(body)
}
