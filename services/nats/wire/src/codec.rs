//! Outbound encoding for client operations.
//!
//! Every operation validates its subjects before anything is written, so a
//! rejected operation never leaves a partial line in the output buffer.

use crate::frame::CRLF;
use crate::header::HeaderMap;
use crate::subject::{validate_queue_group, validate_reply, validate_subject, SubjectFilter};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// `PING\r\n`
pub const PING: &[u8] = b"PING\r\n";
/// `PONG\r\n`
pub const PONG: &[u8] = b"PONG\r\n";

/// An operation sent from client to server
#[derive(Debug, Clone)]
pub enum ClientOp<'a, C: Serialize = serde_json::Value> {
    /// `CONNECT <json>`
    Connect(&'a C),
    /// `PUB <subject> [reply] <size>` plus payload
    Pub {
        /// Destination subject
        subject: &'a str,
        /// Optional reply subject
        reply_to: Option<&'a str>,
        /// Message body
        payload: &'a [u8],
    },
    /// `HPUB <subject> [reply] <hdr_size> <total_size>` plus headers and payload
    HPub {
        /// Destination subject
        subject: &'a str,
        /// Optional reply subject
        reply_to: Option<&'a str>,
        /// Message headers
        headers: &'a HeaderMap,
        /// Message body
        payload: &'a [u8],
    },
    /// `SUB <subject> [queue] <sid>`
    Sub {
        /// Subscription filter
        filter: &'a SubjectFilter,
        /// Optional queue group
        queue_group: Option<&'a str>,
        /// Client-assigned subscription id
        sid: u64,
    },
    /// `UNSUB <sid> [max]`
    Unsub {
        /// Subscription id
        sid: u64,
        /// Unsubscribe automatically after this many messages
        max_msgs: Option<u64>,
    },
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
}

impl<C: Serialize> ClientOp<'_, C> {
    /// Append the encoded operation to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            ClientOp::Connect(info) => {
                let json = serde_json::to_vec(info)
                    .map_err(|e| WireError::InvalidInfo(e.to_string()))?;
                buf.reserve(json.len() + 10);
                buf.put_slice(b"CONNECT ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            ClientOp::Pub {
                subject,
                reply_to,
                payload,
            } => {
                validate_subject(subject)?;
                if let Some(reply) = reply_to {
                    validate_reply(reply)?;
                }
                buf.reserve(subject.len() + payload.len() + 32);
                buf.put_slice(b"PUB ");
                put_subject_reply(buf, subject, *reply_to);
                put_decimal(buf, payload.len() as u64);
                buf.put_slice(CRLF);
                buf.put_slice(payload);
                buf.put_slice(CRLF);
            }
            ClientOp::HPub {
                subject,
                reply_to,
                headers,
                payload,
            } => {
                validate_subject(subject)?;
                if let Some(reply) = reply_to {
                    validate_reply(reply)?;
                }
                let block = headers.encode()?;
                buf.reserve(subject.len() + block.len() + payload.len() + 48);
                buf.put_slice(b"HPUB ");
                put_subject_reply(buf, subject, *reply_to);
                put_decimal(buf, block.len() as u64);
                buf.put_u8(b' ');
                put_decimal(buf, (block.len() + payload.len()) as u64);
                buf.put_slice(CRLF);
                buf.put_slice(&block);
                buf.put_slice(payload);
                buf.put_slice(CRLF);
            }
            ClientOp::Sub {
                filter,
                queue_group,
                sid,
            } => {
                if let Some(queue) = queue_group {
                    validate_queue_group(queue)?;
                }
                buf.put_slice(b"SUB ");
                buf.put_slice(filter.as_str().as_bytes());
                buf.put_u8(b' ');
                if let Some(queue) = queue_group {
                    buf.put_slice(queue.as_bytes());
                    buf.put_u8(b' ');
                }
                put_decimal(buf, *sid);
                buf.put_slice(CRLF);
            }
            ClientOp::Unsub { sid, max_msgs } => {
                buf.put_slice(b"UNSUB ");
                put_decimal(buf, *sid);
                if let Some(max) = max_msgs.filter(|m| *m > 0) {
                    buf.put_u8(b' ');
                    put_decimal(buf, max);
                }
                buf.put_slice(CRLF);
            }
            ClientOp::Ping => buf.put_slice(PING),
            ClientOp::Pong => buf.put_slice(PONG),
        }
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn put_subject_reply(buf: &mut BytesMut, subject: &str, reply_to: Option<&str>) {
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(reply) = reply_to {
        buf.put_slice(reply.as_bytes());
        buf.put_u8(b' ');
    }
}

fn put_decimal(buf: &mut BytesMut, n: u64) {
    buf.put_slice(n.to_string().as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, RawFrame};

    fn encode(op: ClientOp<'_>) -> Vec<u8> {
        op.to_bytes().unwrap().to_vec()
    }

    #[test]
    fn test_pub_without_reply() {
        let wire = encode(ClientOp::Pub {
            subject: "test",
            reply_to: None,
            payload: b"heyaaa",
        });
        assert_eq!(wire, b"PUB test 6\r\nheyaaa\r\n");
    }

    #[test]
    fn test_pub_with_reply() {
        let wire = encode(ClientOp::Pub {
            subject: "svc.echo",
            reply_to: Some("_INBOX.abc"),
            payload: b"",
        });
        assert_eq!(wire, b"PUB svc.echo _INBOX.abc 0\r\n\r\n");
    }

    #[test]
    fn test_pub_rejects_wildcard_subject() {
        let op: ClientOp<'_> = ClientOp::Pub {
            subject: "a.*",
            reply_to: None,
            payload: b"x",
        };
        let mut buf = BytesMut::new();
        assert!(op.encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_hpub_sizes() {
        let mut headers = HeaderMap::new();
        headers.insert("A", "b");

        let wire = encode(ClientOp::HPub {
            subject: "foo",
            reply_to: None,
            headers: &headers,
            payload: b"hello",
        });
        let block = b"NATS/1.0\r\nA: b\r\n\r\n";
        let mut expected = format!("HPUB foo {} {}\r\n", block.len(), block.len() + 5).into_bytes();
        expected.extend_from_slice(block);
        expected.extend_from_slice(b"hello\r\n");
        assert_eq!(wire, expected);
    }

    #[test]
    fn test_sub_and_unsub() {
        let filter = SubjectFilter::parse("orders.>").unwrap();
        assert_eq!(
            encode(ClientOp::Sub {
                filter: &filter,
                queue_group: None,
                sid: 3
            }),
            b"SUB orders.> 3\r\n"
        );
        assert_eq!(
            encode(ClientOp::Sub {
                filter: &filter,
                queue_group: Some("workers"),
                sid: 4
            }),
            b"SUB orders.> workers 4\r\n"
        );
        assert_eq!(
            encode(ClientOp::Unsub {
                sid: 3,
                max_msgs: None
            }),
            b"UNSUB 3\r\n"
        );
        assert_eq!(
            encode(ClientOp::Unsub {
                sid: 3,
                max_msgs: Some(0)
            }),
            b"UNSUB 3\r\n"
        );
        assert_eq!(
            encode(ClientOp::Unsub {
                sid: 3,
                max_msgs: Some(10)
            }),
            b"UNSUB 3 10\r\n"
        );
    }

    #[test]
    fn test_ops_share_one_buffer() {
        let filter = SubjectFilter::parse("orders.*.created").unwrap();
        let mut out = BytesMut::new();
        let sub: ClientOp<'_> = ClientOp::Sub {
            filter: &filter,
            queue_group: None,
            sid: 1,
        };
        sub.encode(&mut out).unwrap();
        let publish: ClientOp<'_> = ClientOp::Pub {
            subject: "orders.eu.created",
            reply_to: None,
            payload: b"{\"id\":42}",
        };
        publish.encode(&mut out).unwrap();

        assert_eq!(
            &out[..],
            b"SUB orders.*.created 1\r\nPUB orders.eu.created 9\r\n{\"id\":42}\r\n"
        );
    }

    #[test]
    fn test_connect_json() {
        let connect = serde_json::json!({ "verbose": false });
        assert_eq!(
            encode(ClientOp::Connect(&connect)),
            b"CONNECT {\"verbose\":false}\r\n"
        );
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(encode(ClientOp::Ping), b"PING\r\n");
        assert_eq!(encode(ClientOp::Pong), b"PONG\r\n");
    }

    #[test]
    fn test_pub_line_is_readable_by_decoder_shape() {
        // PUB shares its layout with MSG minus the sid; rewrite and decode it
        let wire = encode(ClientOp::Pub {
            subject: "a.b",
            reply_to: Some("r"),
            payload: b"x\r\ny",
        });
        let as_msg = String::from_utf8(wire)
            .unwrap()
            .replacen("PUB a.b r", "MSG a.b 9 r", 1);

        let mut decoder = FrameDecoder::new();
        match &decoder.feed(as_msg.as_bytes())[..] {
            [RawFrame::Msg(m)] => assert_eq!(&m.payload[..], b"x\r\ny"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
