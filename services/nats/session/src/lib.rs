//! Connection sessions for the NATS client: dispatch, handshake, keepalive,
//! the session loop and the client handle.
//!
//! ## Features
//!
//! - **Dispatcher**: routes decoded frames to subscriptions and answers
//!   server PINGs before the next frame is handled
//! - **Handshake**: CONNECT built from the server's INFO
//! - **Keepalive**: client PINGs with RTT measurement and stale detection
//! - **Session loop**: read/dispatch/write over any async stream
//! - **Client**: publish, subscribe, unsubscribe and request/reply
//!
//! ## Example
//!
//! ```rust,no_run
//! use nats_session::{Client, ClientEvent, SessionConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), nats_session::SessionError> {
//! let mut conn = Client::connect("127.0.0.1:4222", SessionConfig::default()).await?;
//!
//! let mut sub = conn.client.subscribe("orders.>")?;
//! conn.client.publish("orders.eu.created", "{\"id\":42}")?;
//!
//! if let Some(message) = sub.next().await {
//!     println!("{} -> {:?}", message.subject, message.payload);
//! }
//!
//! let reply = conn
//!     .client
//!     .request("svc.echo", "hello", Duration::from_secs(2))
//!     .await?;
//! println!("reply: {:?}", reply.payload);
//!
//! while let Ok(event) = conn.events.try_recv() {
//!     if let ClientEvent::Error(e) = event {
//!         eprintln!("protocol error: {e}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export main types
pub use client::{new_inbox, Client, Connection, Subscriber, INBOX_PREFIX};
pub use dispatcher::{ClientEvent, DispatchStats, Dispatcher, ErrorPolicy, Flow, Outbound};
pub use error::SessionError;
pub use handshake::{build_connect, ConnectInfo, ConnectOptions, PROTOCOL_VERSION};
pub use keepalive::{build_ping, build_pong, Keepalive};
pub use registry::{next_sid, Delivery, Message, MessageHandler, Subscription, SubscriptionRegistry};
pub use session::{Session, SessionCommand, SessionConfig, SessionStats};
pub use transport::connect_tcp;
