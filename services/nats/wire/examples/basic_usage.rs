//! Basic usage example for the NATS wire crate.

use bytes::BytesMut;
use nats_wire::{matches, ClientOp, FrameDecoder, HeaderMap, RawFrame, SubjectFilter};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== NATS Wire Protocol Example ===\n");

    // 1. Encode outbound operations
    println!("1. Encoding SUB and PUB...");
    let filter = SubjectFilter::parse("orders.*.created")?;
    let mut out = BytesMut::new();
    let sub: ClientOp<'_> = ClientOp::Sub {
        filter: &filter,
        queue_group: None,
        sid: 1,
    };
    sub.encode(&mut out)?;
    let publish: ClientOp<'_> = ClientOp::Pub {
        subject: "orders.eu.created",
        reply_to: None,
        payload: b"{\"id\":42}",
    };
    publish.encode(&mut out)?;
    println!("   {:?}", String::from_utf8_lossy(&out));

    // 2. Decode a server stream delivered in awkward pieces
    println!("\n2. Decoding a fragmented stream...");
    let mut headers = HeaderMap::new();
    headers.insert("Trace-Id", "t-1");
    let block = headers.encode()?;

    let mut stream = Vec::new();
    stream.extend_from_slice(b"PING\r\nMSG orders.eu.created 1 12\r\nline1\r\nline2\r\n");
    stream.extend_from_slice(
        format!("HMSG orders.us.created 1 {} 2\r\n", block.len()).as_bytes(),
    );
    stream.extend_from_slice(&block);
    stream.extend_from_slice(b"ok\r\n");

    let mut decoder = FrameDecoder::new();
    for chunk in stream.chunks(7) {
        for frame in decoder.feed(chunk) {
            match frame {
                RawFrame::Msg(m) => println!("   MSG {} payload={:?}", m.subject, m.payload),
                RawFrame::HMsg(m) => {
                    let headers = HeaderMap::decode(&m.header_block)?;
                    println!(
                        "   HMSG {} trace={:?} payload={:?}",
                        m.subject,
                        headers.get("Trace-Id"),
                        m.payload
                    );
                }
                other => println!("   {}", other.name()),
            }
        }
    }

    // 3. Subject matching
    println!("\n3. Matching subjects...");
    for (subject, filter) in [("a.b.c", "a.*.c"), ("a.b.c", "a.*"), ("a.b.c", "a.>"), ("a.b", "a.b.c")] {
        println!("   {subject:8} ~ {filter:8} => {}", matches(subject, filter));
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
