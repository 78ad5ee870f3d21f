//! CONNECT handshake.
//!
//! The server speaks first with INFO; the client answers with CONNECT. No
//! reply is awaited unless `verbose` is set, in which case the server sends
//! `+OK`.

use bytes::Bytes;
use nats_wire::{ClientOp, ServerInfo, WireError};
use serde::{Deserialize, Serialize};

/// Protocol level claimed in CONNECT. Level 1 accepts async INFO updates.
pub const PROTOCOL_VERSION: u8 = 1;

/// Client side options that shape the CONNECT line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Connection name shown in server monitoring
    pub name: Option<String>,
    /// Ask the server to `+OK` every operation
    pub verbose: bool,
    /// Ask the server for strict subject checking
    pub pedantic: bool,
    /// Receive our own publications
    pub echo: bool,
    /// Use headers if the server supports them
    pub headers: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            name: None,
            verbose: false,
            pedantic: false,
            echo: true,
            headers: true,
        }
    }
}

/// JSON body of CONNECT
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    /// Request `+OK` acknowledgements
    pub verbose: bool,
    /// Strict subject checking
    pub pedantic: bool,
    /// Connection name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Client implementation language
    pub lang: String,
    /// Client version
    pub version: String,
    /// Protocol level
    pub protocol: u8,
    /// Headers supported
    pub headers: bool,
    /// Receive 503 status messages when a request has no responders
    pub no_responders: bool,
    /// Receive our own publications
    pub echo: bool,
}

impl ConnectInfo {
    /// Build CONNECT for the given server
    ///
    /// Headers, and with them no-responders, are only claimed when both
    /// sides support them.
    pub fn for_server(info: &ServerInfo, options: &ConnectOptions) -> Self {
        let headers = options.headers && info.headers;
        Self {
            verbose: options.verbose,
            pedantic: options.pedantic,
            name: options.name.clone(),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            headers,
            no_responders: headers,
            echo: options.echo,
        }
    }

    /// Encode the full `CONNECT <json>\r\n` line
    pub fn to_line(&self) -> Result<Bytes, WireError> {
        ClientOp::Connect(self).to_bytes()
    }
}

/// Build the CONNECT line answering `info`
pub fn build_connect(info: &ServerInfo, options: &ConnectOptions) -> Result<Bytes, WireError> {
    ConnectInfo::for_server(info, options).to_line()
}
