//! Property-based tests for the stream decoder.
//!
//! These tests use proptest to verify invariants hold for arbitrary frame
//! sequences and arbitrary chunking of the byte stream:
//! - Splitting the stream anywhere never changes the decoded frames
//! - Payload and header lengths always equal their declared sizes
//! - Nothing is left buffered once a valid stream has been fully fed

use bytes::Bytes;
use nats_wire::{FrameDecoder, HMsgFrame, HeaderMap, MsgFrame, RawFrame, WireError};
use proptest::prelude::*;
use proptest::sample::Index;

/// A server frame together with its wire encoding
#[derive(Debug, Clone)]
struct Encoded {
    wire: Vec<u8>,
    frame: RawFrame,
}

fn subject_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,5}(\\.[a-z0-9]{1,5}){0,3}"
}

// Payload bytes biased toward CR and LF so terminators show up inside bodies
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        prop_oneof![Just(b'\r'), Just(b'\n'), any::<u8>()],
        0..48,
    )
}

fn msg_strategy() -> impl Strategy<Value = Encoded> {
    (
        subject_strategy(),
        1u64..10_000,
        prop::option::of(subject_strategy()),
        payload_strategy(),
    )
        .prop_map(|(subject, sid, reply_to, payload)| {
            let mut wire = match &reply_to {
                Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()),
                None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
            }
            .into_bytes();
            wire.extend_from_slice(&payload);
            wire.extend_from_slice(b"\r\n");

            Encoded {
                wire,
                frame: RawFrame::Msg(MsgFrame {
                    subject,
                    sid,
                    reply_to,
                    payload: Bytes::from(payload),
                }),
            }
        })
}

fn hmsg_strategy() -> impl Strategy<Value = Encoded> {
    (
        subject_strategy(),
        1u64..10_000,
        prop::option::of(subject_strategy()),
        prop::collection::vec(("[A-Z][a-z-]{0,8}", "[a-z0-9 ]{0,12}"), 0..4),
        payload_strategy(),
    )
        .prop_map(|(subject, sid, reply_to, pairs, payload)| {
            let mut headers = HeaderMap::new();
            for (k, v) in pairs {
                headers.append(k, v);
            }
            let block = headers.encode().expect("generated headers are encodable");

            let mut wire = match &reply_to {
                Some(reply) => format!(
                    "HMSG {subject} {sid} {reply} {} {}\r\n",
                    block.len(),
                    payload.len()
                ),
                None => format!("HMSG {subject} {sid} {} {}\r\n", block.len(), payload.len()),
            }
            .into_bytes();
            wire.extend_from_slice(&block);
            wire.extend_from_slice(&payload);
            wire.extend_from_slice(b"\r\n");

            Encoded {
                wire,
                frame: RawFrame::HMsg(HMsgFrame {
                    subject,
                    sid,
                    reply_to,
                    header_block: block,
                    payload: Bytes::from(payload),
                }),
            }
        })
}

fn control_strategy() -> impl Strategy<Value = Encoded> {
    prop_oneof![
        Just(Encoded {
            wire: b"PING\r\n".to_vec(),
            frame: RawFrame::Ping
        }),
        Just(Encoded {
            wire: b"PONG\r\n".to_vec(),
            frame: RawFrame::Pong
        }),
        Just(Encoded {
            wire: b"+OK\r\n".to_vec(),
            frame: RawFrame::Ok
        }),
        "[A-Za-z][A-Za-z ]{0,20}".prop_map(|msg| Encoded {
            wire: format!("-ERR '{msg}'\r\n").into_bytes(),
            frame: RawFrame::ProtocolError(WireError::Server(msg)),
        }),
    ]
}

fn stream_strategy() -> impl Strategy<Value = Vec<Encoded>> {
    prop::collection::vec(
        prop_oneof![msg_strategy(), hmsg_strategy(), control_strategy()],
        1..12,
    )
}

fn concat(frames: &[Encoded]) -> (Vec<u8>, Vec<RawFrame>) {
    let wire = frames.iter().flat_map(|e| e.wire.iter().copied()).collect();
    let expected = frames.iter().map(|e| e.frame.clone()).collect();
    (wire, expected)
}

fn feed_in_pieces(wire: &[u8], cuts: &[Index]) -> (Vec<RawFrame>, usize) {
    let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
    points.sort_unstable();
    points.dedup();

    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut start = 0;
    for point in points.into_iter().chain(std::iter::once(wire.len())) {
        frames.extend(decoder.feed(&wire[start..point]));
        start = point;
    }
    (frames, decoder.buffered_len())
}

proptest! {
    #[test]
    fn prop_whole_stream_decodes_to_expected(frames in stream_strategy()) {
        let (wire, expected) = concat(&frames);

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&wire);

        prop_assert_eq!(decoded, expected);
        prop_assert_eq!(decoder.buffered_len(), 0);
        prop_assert!(!decoder.is_awaiting_payload());
    }

    #[test]
    fn prop_split_anywhere_is_invariant(
        frames in stream_strategy(),
        cuts in prop::collection::vec(any::<Index>(), 0..10),
    ) {
        let (wire, expected) = concat(&frames);

        let (decoded, leftover) = feed_in_pieces(&wire, &cuts);

        prop_assert_eq!(decoded, expected);
        prop_assert_eq!(leftover, 0);
    }

    #[test]
    fn prop_byte_at_a_time(frames in stream_strategy()) {
        let (wire, expected) = concat(&frames);

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in &wire {
            decoded.extend(decoder.feed(std::slice::from_ref(byte)));
        }

        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn prop_truncated_stream_never_emits_partial_frame(
        frames in stream_strategy(),
        cut in any::<Index>(),
    ) {
        let (wire, expected) = concat(&frames);
        let cut = cut.index(wire.len() + 1);

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&wire[..cut]);

        // whatever came out is a prefix of the full decode
        prop_assert!(decoded.len() <= expected.len());
        prop_assert_eq!(&decoded[..], &expected[..decoded.len()]);
    }
}
