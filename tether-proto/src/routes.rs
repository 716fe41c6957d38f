use std::collections::HashMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Persisted local state, read once at init and written back after a
/// handshake updates the route dictionary
///
/// The two-phase length-probe read of the original C interface collapses
/// into returning an owned buffer.
pub trait Storage: Send + 'static {
    /// Returns the previously persisted blob, or `None` if there is none
    fn read(&self) -> Option<Vec<u8>>;
    /// Replaces the persisted blob; failures are the implementation's problem
    fn write(&self, data: &[u8]);
}

#[derive(Default, Serialize, Deserialize)]
struct Persisted {
    #[serde(skip_serializing_if = "Option::is_none")]
    route_to_code: Option<HashMap<String, u16>>,
    /// JSON object keys are strings, so codes are stringified here
    #[serde(skip_serializing_if = "Option::is_none")]
    code_to_route: Option<HashMap<String, String>>,
}

/// Bidirectional route-name ↔ code mapping
///
/// Compresses repeated route strings in data traffic. Strictly an
/// optimization: the dictionary is either fully populated or empty, and an
/// empty dictionary merely means routes travel uncompressed.
#[derive(Debug, Default)]
pub struct RouteDictionary {
    route_to_code: FxHashMap<String, u16>,
    code_to_route: FxHashMap<u16, String>,
}

impl RouteDictionary {
    /// Best-effort load from a persisted blob
    ///
    /// Malformed JSON or a missing half yields an empty dictionary; the only
    /// observable effect is a warning.
    pub fn load(data: &[u8]) -> Self {
        let persisted: Persisted = match serde_json::from_slice(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("discarding persisted route dictionary: {e}");
                return Self::default();
            }
        };
        let (Some(forward), Some(backward)) = (persisted.route_to_code, persisted.code_to_route)
        else {
            warn!("persisted route dictionary is incomplete, discarding");
            return Self::default();
        };
        let mut code_to_route = FxHashMap::default();
        for (code, route) in backward {
            let Ok(code) = code.parse::<u16>() else {
                warn!("persisted route dictionary has non-numeric code {code:?}, discarding");
                return Self::default();
            };
            code_to_route.insert(code, route);
        }
        debug!(routes = forward.len(), "loaded route dictionary");
        Self {
            route_to_code: forward.into_iter().collect(),
            code_to_route,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.route_to_code.is_empty()
    }

    pub fn len(&self) -> usize {
        self.route_to_code.len()
    }

    pub fn code_for(&self, route: &str) -> Option<u16> {
        self.route_to_code.get(route).copied()
    }

    pub fn route_for(&self, code: u16) -> Option<&str> {
        self.code_to_route.get(&code).map(String::as_str)
    }

    /// Replace the dictionary with the route→code map a handshake advertised
    ///
    /// Returns whether anything changed, so callers know to persist.
    pub fn apply_handshake_dict(&mut self, dict: HashMap<String, u16>) -> bool {
        let forward: FxHashMap<String, u16> = dict.into_iter().collect();
        if forward == self.route_to_code {
            return false;
        }
        self.code_to_route = forward
            .iter()
            .map(|(route, &code)| (code, route.clone()))
            .collect();
        self.route_to_code = forward;
        debug!(routes = self.route_to_code.len(), "route dictionary updated");
        true
    }

    /// Serialize for the `Storage` write-back
    pub fn to_persisted(&self) -> Vec<u8> {
        let persisted = Persisted {
            route_to_code: Some(self.route_to_code.iter().map(|(k, &v)| (k.clone(), v)).collect()),
            code_to_route: Some(
                self.code_to_route
                    .iter()
                    .map(|(&code, route)| (code.to_string(), route.clone()))
                    .collect(),
            ),
        };
        serde_json::to_vec(&persisted).expect("maps with string keys always serialize")
    }
}
