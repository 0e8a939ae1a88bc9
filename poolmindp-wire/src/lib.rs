//! Wire lib defining the JSON frames exchanged with the pool
//! controller, shared by the broker (network) layer and the
//! daemon.
//!
//! The controller speaks a request/response protocol over a
//! WebSocket (or a framing-free raw TCP stream carrying the same
//! JSON):
//!
//! 1. Requests name a command, an optional condition (e.g.
//! `OBJTYP=BODY`) and a list of objects + the param keys wanted
//! for each. Each request carries a `messageID` that the response
//! echoes back.
//!
//! 2. Responses carry a response code (`"200"` on success) and the
//! requested params per object, always as strings.
//!
//! 3. Push notifications (`NotifyList`) arrive unsolicited on any
//! connection that has subscribed, carrying only the params that
//! changed.
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Json Error")]
    Json(#[from] serde_json::Error),
}

/// Response code the controller uses for success
pub const RESPONSE_OK: &str = "200";

/// Object name that asks the controller to iterate every object
/// matching the request condition
pub const ALL_OBJECTS: &str = "INCR";

/// Object holding system-wide settings (e.g. freeze protection)
pub const SYSTEM_OBJECT: &str = "_5451";

/// Object name prefix the controller gives feature circuits
pub const FEATURE_PREFIX: &str = "FTR";

pub mod command {
    pub const GET_PARAM_LIST: &str = "GetParamList";
    pub const REQUEST_PARAM_LIST: &str = "RequestParamList";
    pub const SEND_PARAM_LIST: &str = "SendParamList";
    pub const NOTIFY_LIST: &str = "NotifyList";
}

/// Values of the `OBJTYP` param
pub mod objtyp {
    pub const BODY: &str = "BODY";
    pub const HEATER: &str = "HEATER";
    pub const PUMP: &str = "PUMP";
    pub const CIRCUIT: &str = "CIRCUIT";
    pub const SENSOR: &str = "SENSE";
    pub const SYSTEM: &str = "SYSTEM";
}

/// Values of the `SUBTYP` param that matter for classification
pub mod subtyp {
    pub const AIR: &str = "AIR";
    pub const SOLAR: &str = "SOLAR";
    pub const POOL: &str = "POOL";
    pub const SPA: &str = "SPA";
}

/// Param keys
pub mod key {
    pub const OBJTYP: &str = "OBJTYP";
    pub const SUBTYP: &str = "SUBTYP";
    pub const SNAME: &str = "SNAME";
    pub const STATUS: &str = "STATUS";
    pub const TEMP: &str = "TEMP";
    pub const PROBE: &str = "PROBE";
    pub const HTMODE: &str = "HTMODE";
    pub const HTSRC: &str = "HTSRC";
    pub const LOTMP: &str = "LOTMP";
    pub const HITMP: &str = "HITMP";
    pub const RPM: &str = "RPM";
    pub const GPM: &str = "GPM";
    pub const WATTS: &str = "WATTS";
    pub const FREEZE: &str = "FREEZE";
    pub const SHOMNU: &str = "SHOMNU";
}

/// Raw on/off values the controller reports in `STATUS` / `FREEZE`
pub const ON: &str = "ON";
pub const OFF: &str = "OFF";

/// One object + the param keys requested for it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectQuery {
    #[serde(rename = "objnam")]
    pub object_name: String,
    pub keys: Vec<String>,
}

impl ObjectQuery {
    pub fn new(object_name: &str, keys: &[&str]) -> Self {
        Self {
            object_name: object_name.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub command: String,
    pub condition: String,
    #[serde(rename = "objectList")]
    pub object_list: Vec<ObjectQuery>,
}

impl Request {
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One object in a response or push notification. Push frames only
/// carry the params that changed.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectData {
    #[serde(rename = "objnam")]
    pub object_name: String,
    #[serde(default, deserialize_with = "string_params")]
    pub params: HashMap<String, String>,
}

impl ObjectData {
    pub fn new(object_name: &str, params: &[(&str, &str)]) -> Self {
        Self {
            object_name: object_name.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|v| v.as_str())
    }

    /// Display name, falling back to the object name
    pub fn name(&self) -> &str {
        match self.get(key::SNAME) {
            Some(name) if !name.is_empty() => name,
            _ => &self.object_name,
        }
    }

    pub fn object_type(&self) -> Option<&str> {
        self.get(key::OBJTYP)
    }

    /// Overlay `other`'s params onto ours; used to fold partial push
    /// updates into the last full view of an object
    pub fn merge(&mut self, other: &ObjectData) {
        for (k, v) in other.params.iter() {
            self.params.insert(k.clone(), v.clone());
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    #[serde(default)]
    pub command: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "response", default, deserialize_with = "response_code")]
    pub response_code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "objectList", default)]
    pub object_list: Vec<ObjectData>,
}

impl Response {
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Unsolicited notification rather than an answer to a request
    pub fn is_push(&self) -> bool {
        self.command == command::NOTIFY_LIST
    }

    pub fn is_success(&self) -> bool {
        self.response_code.as_deref() == Some(RESPONSE_OK)
    }
}

// The controller sends every param as a string, but older firmware
// has been seen sending bare numbers; arrays / objects (e.g. nested
// OBJLIST) are not params we classify and are dropped
fn string_params<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, serde_json::Value> = HashMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            serde_json::Value::Bool(b) => Some((k, b.to_string())),
            _ => None,
        })
        .collect())
}

fn response_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
