//! Server metadata carried by the INFO frame.

use serde::{Deserialize, Serialize};

/// Server capabilities advertised in `INFO <json>`
///
/// Every field is optional on the wire; keys this client does not model are
/// kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Unique server identifier
    pub server_id: String,
    /// Human readable server name
    pub server_name: String,
    /// Server version string
    pub version: String,
    /// Protocol level supported by the server
    pub proto: i32,
    /// Git commit the server was built from
    pub git_commit: String,
    /// Go runtime version
    pub go: String,
    /// Host the server listens on
    pub host: String,
    /// Port the server listens on
    pub port: u16,
    /// Whether the server accepts HPUB and may send HMSG
    pub headers: bool,
    /// Largest payload the server accepts, in bytes
    pub max_payload: u64,
    /// Whether JetStream is enabled
    pub jetstream: bool,
    /// Connection id the server assigned to this client
    pub client_id: u64,
    /// Client address as seen by the server
    pub client_ip: String,
    /// Whether the server requires authentication
    pub auth_required: bool,
    /// Whether the server requires TLS
    pub tls_required: bool,
    /// Any keys not listed above
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerInfo {
    /// Parse the JSON document following the INFO token
    pub fn from_json(json: &[u8]) -> Result<Self, crate::WireError> {
        serde_json::from_slice(json).map_err(|e| crate::WireError::InvalidInfo(e.to_string()))
    }
}
