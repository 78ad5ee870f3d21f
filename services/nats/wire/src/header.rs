//! Message header blocks.
//!
//! HMSG and HPUB frames carry a length-declared header block ahead of the
//! payload:
//!
//! ```text
//! NATS/1.0[ <status>[ <description>]]\r\n
//! Key: Value\r\n
//! Key: Other value\r\n
//! \r\n
//! ```
//!
//! The trailing blank line is part of the block and counts toward its
//! declared size.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Header version line prefix
pub const HEADER_VERSION: &str = "NATS/1.0";

/// Status code the server uses when a request has no responders
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Parsed header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<u16>,
    description: Option<String>,
    entries: BTreeMap<String, Vec<String>>,
}

impl HeaderMap {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `key`, keeping earlier values
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    /// Replace all values under `key`
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), vec![value.into()]);
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values for `key`
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Inline status code from the version line, e.g. 503
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Inline status description from the version line
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether this block signals "no responders" for a request
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(STATUS_NO_RESPONDERS)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(key, value)` pairs, one per value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Parse a raw header block as captured from an HMSG frame
    pub fn decode(block: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| WireError::Header("header block is not valid UTF-8".to_string()))?;

        let mut lines = text.split("\r\n");

        let version_line = lines.next().unwrap_or_default();
        let rest = version_line
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| WireError::Header(format!("bad version line: {version_line:?}")))?;

        let mut map = Self::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(char::is_whitespace) {
                Some((code, description)) => (code, Some(description.trim())),
                None => (rest, None),
            };
            map.status = Some(
                code.parse()
                    .map_err(|_| WireError::Header(format!("bad status code: {code:?}")))?,
            );
            map.description = description.filter(|d| !d.is_empty()).map(str::to_string);
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| WireError::Header(format!("bad header line: {line:?}")))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(WireError::Header(format!("empty header name: {line:?}")));
            }
            map.append(key, value.trim());
        }

        Ok(map)
    }

    /// Encode as a header block, including the terminating blank line
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = self.status {
            buf.put_slice(format!(" {status}").as_bytes());
            if let Some(description) = &self.description {
                buf.put_u8(b' ');
                buf.put_slice(description.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");

        for (key, value) in self.iter() {
            if key.is_empty() || key.contains([':', '\r', '\n', ' ']) || value.contains(['\r', '\n'])
            {
                return Err(WireError::Header(format!(
                    "cannot encode header {key:?}: {value:?}"
                )));
            }
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");

        Ok(buf.freeze())
    }
}
