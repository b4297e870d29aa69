//! Wire-facing types: envelopes, response codes, link states, discovery records.
//!
//! Payloads are opaque byte buffers (JSON by convention); the core only reads
//! routing fields and forwards payload bytes untouched.

use serde::{Deserialize, Serialize};

/// Framework version reported on the reserved `Version` route.
pub const FRAMEWORK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Well-known name of the per-device discovery/registry module.
pub const ROUTE_MODULE: &str = "Route";

/// Reserved route names.
pub mod routes {
    /// Stop the module (system route, never delegated).
    pub const EXIT: &str = "Exit";
    /// Report module/framework version (system route, never delegated).
    pub const VERSION: &str = "Version";
    /// Discovery handshake against the `Route` module.
    pub const KNOCK_DOOR: &str = "KnockDoor";
    /// Liveness heartbeat to the `Route` module.
    pub const HEART: &str = "Heart";
    /// Module-to-device map query on the `Route` module.
    pub const MODULE_LIST: &str = "ModuleList";
    /// Parent/server device id query on the `Route` module.
    pub const SERVER_DEV_ID: &str = "ServerDevId";
    /// Router-forwarding entry point on the `Route` module.
    pub const FORWARD: &str = "Request";
}

/// Response code carried on every response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    UnLinked,
    Success,
    BadReq,
    RouteNotFind,
    Error,
    Timeout,
    Forbidden,
}

impl ResponseCode {
    /// Stable numeric wire value. HTTP-flavored for log legibility.
    pub fn wire_value(self) -> u16 {
        match self {
            ResponseCode::UnLinked => 0,
            ResponseCode::Success => 200,
            ResponseCode::BadReq => 400,
            ResponseCode::Forbidden => 403,
            ResponseCode::RouteNotFind => 404,
            ResponseCode::Timeout => 408,
            ResponseCode::Error => 500,
        }
    }

    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(ResponseCode::UnLinked),
            200 => Some(ResponseCode::Success),
            400 => Some(ResponseCode::BadReq),
            403 => Some(ResponseCode::Forbidden),
            404 => Some(ResponseCode::RouteNotFind),
            408 => Some(ResponseCode::Timeout),
            500 => Some(ResponseCode::Error),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ResponseCode::Success
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResponseCode::UnLinked => "UnLinked",
            ResponseCode::Success => "Success",
            ResponseCode::BadReq => "BadReq",
            ResponseCode::RouteNotFind => "RouteNotFind",
            ResponseCode::Error => "Error",
            ResponseCode::Timeout => "Timeout",
            ResponseCode::Forbidden => "Forbidden",
        };
        f.write_str(s)
    }
}

/// Transport link state. Exactly one is active per runtime at a time;
/// transitions are driven only by adapter callbacks and Stop/Reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connecting,
    Linked,
    LinkLost,
    Fault,
    Stopped,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::Connecting => "Connecting",
            LinkState::Linked => "Linked",
            LinkState::LinkLost => "LinkLost",
            LinkState::Fault => "Fault",
            LinkState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Inbound/outbound request. `from`/`to` are qualified module identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub from: String,
    pub to: String,
    pub route: String,
    pub payload: Vec<u8>,
}

impl RequestEnvelope {
    pub fn new(from: &str, to: &str, route: &str, payload: &[u8]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            route: route.to_string(),
            payload: payload.to_vec(),
        }
    }
}

/// Response to a request, correlated by envelope id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub route: String,
    pub code: ResponseCode,
    pub payload: Vec<u8>,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(request: &RequestEnvelope, payload: Vec<u8>) -> Self {
        Self {
            id: request.id.clone(),
            route: request.route.clone(),
            code: ResponseCode::Success,
            payload,
            error: None,
        }
    }

    pub fn failure(request: &RequestEnvelope, code: ResponseCode, message: &str) -> Self {
        Self {
            id: request.id.clone(),
            route: request.route.clone(),
            code,
            payload: Vec::new(),
            error: Some(message.to_string()),
        }
    }

    /// Response for a request that never reached a peer (no envelope to echo).
    pub fn orphan(code: ResponseCode, message: &str) -> Self {
        Self {
            id: String::new(),
            route: String::new(),
            code,
            payload: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

/// Fire-and-forget notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeEnvelope {
    pub id: String,
    pub from: String,
    pub route: String,
    pub payload: Vec<u8>,
}

impl NoticeEnvelope {
    pub fn new(from: &str, route: &str, payload: &[u8]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            route: route.to_string(),
            payload: payload.to_vec(),
        }
    }
}

/// One module hosted on a device, as announced during knock-door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub desc: String,
    pub version: String,
}

/// Self-description a module sends to the `Route` registry during knock-door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub device_id: String,
    pub name: String,
    pub parent_device_id: String,
    pub modules: Vec<ModuleInfo>,
}
