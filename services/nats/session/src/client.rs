//! Client handle over a running session.
//!
//! A [`Client`] is cheap to clone. Every clone shares the subscription
//! registry with the session task and queues encoded operations on its
//! command channel, so operations from one handle reach the wire in call
//! order.

use crate::dispatcher::ClientEvent;
use crate::error::SessionError;
use crate::registry::{Message, MessageHandler, Subscription, SubscriptionRegistry};
use crate::session::{Session, SessionCommand, SessionConfig, SessionStats};
use crate::transport::connect_tcp;
use nats_wire::{validate_subject, ClientOp, HeaderMap};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Prefix for request reply subjects
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Generate a unique reply subject
pub fn new_inbox() -> String {
    format!("{INBOX_PREFIX}{}", Uuid::new_v4().simple())
}

/// A started connection
pub struct Connection {
    /// Handle for issuing operations
    pub client: Client,
    /// Connection-level events
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    /// The session task
    pub task: JoinHandle<Result<SessionStats, SessionError>>,
}

/// Handle for publishing and subscribing
#[derive(Clone, Debug)]
pub struct Client {
    registry: SubscriptionRegistry,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl Client {
    /// Connect over TCP and start a session task
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: SessionConfig,
    ) -> Result<Connection, SessionError> {
        let stream = connect_tcp(addr).await?;
        Ok(Self::start(stream, config))
    }

    /// Start a session task over an established stream
    pub fn start<S>(stream: S, config: SessionConfig) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = SubscriptionRegistry::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(Session::run(
            config,
            stream,
            registry.clone(),
            command_rx,
            event_tx,
        ));
        Connection {
            client: Self { registry, commands },
            events,
            task,
        }
    }

    /// Publish `payload` on `subject`
    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<(), SessionError> {
        self.send_op(ClientOp::Pub {
            subject,
            reply_to: None,
            payload: payload.as_ref(),
        })
    }

    /// Publish with a reply subject
    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<(), SessionError> {
        self.send_op(ClientOp::Pub {
            subject,
            reply_to: Some(reply_to),
            payload: payload.as_ref(),
        })
    }

    /// Publish with headers (HPUB)
    pub fn publish_with_headers(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> Result<(), SessionError> {
        self.send_op(ClientOp::HPub {
            subject,
            reply_to,
            headers,
            payload: payload.as_ref(),
        })
    }

    /// Subscribe to `filter`, receiving messages on a channel
    pub fn subscribe(&self, filter: &str) -> Result<Subscriber, SessionError> {
        self.subscribe_channel(filter, None)
    }

    /// Subscribe as a member of `queue_group`
    pub fn queue_subscribe(&self, filter: &str, queue_group: &str) -> Result<Subscriber, SessionError> {
        self.subscribe_channel(filter, Some(queue_group))
    }

    /// Subscribe with a callback run inside the dispatch pass
    pub fn subscribe_with(
        &self,
        filter: &str,
        queue_group: Option<&str>,
        handler: impl MessageHandler + 'static,
    ) -> Result<Subscription, SessionError> {
        let subscription = self.registry.register(filter, queue_group, handler)?;
        let sent = self.send_op(ClientOp::Sub {
            filter: &subscription.filter,
            queue_group,
            sid: subscription.sid,
        });
        if let Err(e) = sent {
            self.registry.unregister(subscription.sid);
            return Err(e);
        }
        debug!("Subscribed to {} (sid {})", subscription.filter, subscription.sid);
        Ok(subscription)
    }

    fn subscribe_channel(
        &self,
        filter: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscriber, SessionError> {
        let (tx, messages) = mpsc::unbounded_channel();
        let subscription = self.subscribe_with(filter, queue_group, move |m: Message| {
            // Receiver dropped means the subscriber lost interest
            let _ = tx.send(m);
        })?;
        Ok(Subscriber {
            subscription,
            messages,
            client: self.clone(),
        })
    }

    /// Unsubscribe now, or after `max_msgs` total deliveries
    pub fn unsubscribe(&self, sid: u64, max_msgs: Option<u64>) -> Result<(), SessionError> {
        match max_msgs.filter(|max| *max > 0) {
            Some(max) => {
                self.registry.set_max_msgs(sid, max);
            }
            None => {
                self.registry.unregister(sid);
            }
        }
        self.send_op(ClientOp::Unsub { sid, max_msgs })
    }

    /// Send a request and wait for the first reply
    ///
    /// The reply inbox is unsubscribed after one message or on timeout.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Message, SessionError> {
        validate_subject(subject)?;
        let inbox = new_inbox();
        let mut replies = self.subscribe(&inbox)?;
        replies.unsubscribe_after(1)?;
        self.publish_with_reply(subject, &inbox, payload)?;

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => {
                let no_responders = reply
                    .headers
                    .as_ref()
                    .is_some_and(HeaderMap::is_no_responders);
                if no_responders && reply.payload.is_empty() {
                    Err(SessionError::NoResponders(subject.to_string()))
                } else {
                    Ok(reply)
                }
            }
            Ok(None) => Err(SessionError::Closed),
            Err(_) => {
                let _ = self.unsubscribe(replies.sid(), None);
                Err(SessionError::Timeout(timeout))
            }
        }
    }

    /// Send a PING; the PONG arrives as [`ClientEvent::Pong`]
    pub fn ping(&self) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::Ping)
            .map_err(|_| SessionError::Closed)
    }

    /// Ask the session to close
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    /// Subscription registry shared with the session
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    fn send_op(&self, op: ClientOp<'_>) -> Result<(), SessionError> {
        let bytes = op.to_bytes()?;
        self.commands
            .send(SessionCommand::Write(bytes))
            .map_err(|_| SessionError::Closed)
    }
}

/// A subscription whose messages arrive on a channel
#[derive(Debug)]
pub struct Subscriber {
    subscription: Subscription,
    messages: mpsc::UnboundedReceiver<Message>,
    client: Client,
}

impl Subscriber {
    /// Subscription id
    pub fn sid(&self) -> u64 {
        self.subscription.sid
    }

    /// The subscription
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Next message, or `None` once the subscription is gone and drained
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Remove the subscription after `max_msgs` total deliveries
    pub fn unsubscribe_after(&self, max_msgs: u64) -> Result<(), SessionError> {
        self.client.unsubscribe(self.sid(), Some(max_msgs))
    }

    /// Unsubscribe now
    pub fn unsubscribe(self) -> Result<(), SessionError> {
        self.client.unsubscribe(self.sid(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{
        AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
        WriteHalf,
    };

    struct FakeServer {
        rx: BufReader<ReadHalf<DuplexStream>>,
        tx: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.rx.read_line(&mut line).await.unwrap();
            line
        }

        async fn payload(&mut self, len: usize) -> Vec<u8> {
            let mut buf = vec![0u8; len + 2];
            self.rx.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf[len..], b"\r\n");
            buf.truncate(len);
            buf
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.tx.write_all(bytes).await.unwrap();
        }
    }

    async fn start() -> (Connection, FakeServer) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let config = SessionConfig {
            ping_interval: Duration::ZERO,
            ..Default::default()
        };
        let connection = Client::start(client, config);
        let (rx, tx) = tokio::io::split(server);
        let mut server = FakeServer {
            rx: BufReader::new(rx),
            tx,
        };

        server
            .send(b"INFO {\"server_id\":\"T1\",\"headers\":true}\r\n")
            .await;
        assert!(server.line().await.starts_with("CONNECT "));
        (connection, server)
    }

    fn tokens(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_publish() {
        let (conn, mut server) = start().await;
        conn.client.publish("orders.created", "hello").unwrap();

        assert_eq!(server.line().await, "PUB orders.created 5\r\n");
        assert_eq!(server.payload(5).await, b"hello");
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_subject() {
        let (conn, _server) = start().await;
        assert!(matches!(
            conn.client.publish("orders.*", "x"),
            Err(SessionError::Wire(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_with_headers() {
        let (conn, mut server) = start().await;
        let mut headers = HeaderMap::new();
        headers.insert("Trace-Id", "t1");
        conn.client
            .publish_with_headers("a.b", None, &headers, "xy")
            .unwrap();

        let line = tokens(&server.line().await);
        assert_eq!(line[0], "HPUB");
        let hdr_len: usize = line[2].parse().unwrap();
        let total: usize = line[3].parse().unwrap();
        assert_eq!(total, hdr_len + 2);
        let body = server.payload(total).await;
        assert_eq!(HeaderMap::decode(&body[..hdr_len]).unwrap().get("Trace-Id"), Some("t1"));
        assert_eq!(&body[hdr_len..], b"xy");
    }

    #[tokio::test]
    async fn test_subscribe_receives_messages() {
        let (conn, mut server) = start().await;
        let mut sub = conn.client.subscribe("orders.>").unwrap();

        assert_eq!(server.line().await, format!("SUB orders.> {}\r\n", sub.sid()));
        server
            .send(format!("MSG orders.eu.created {} 2\r\nhi\r\n", sub.sid()).as_bytes())
            .await;

        let message = sub.next().await.unwrap();
        assert_eq!(message.subject, "orders.eu.created");
        assert_eq!(&message.payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_queue_subscribe() {
        let (conn, mut server) = start().await;
        let sub = conn.client.queue_subscribe("jobs", "workers").unwrap();

        assert_eq!(
            server.line().await,
            format!("SUB jobs workers {}\r\n", sub.sid())
        );
        assert_eq!(sub.subscription().queue_group.as_deref(), Some("workers"));
    }

    #[tokio::test]
    async fn test_unsubscribe_after_max() {
        let (conn, mut server) = start().await;
        let mut sub = conn.client.subscribe("foo").unwrap();
        sub.unsubscribe_after(1).unwrap();
        let sid = sub.sid();

        assert_eq!(server.line().await, format!("SUB foo {sid}\r\n"));
        assert_eq!(server.line().await, format!("UNSUB {sid} 1\r\n"));

        server
            .send(format!("MSG foo {sid} 1\r\na\r\nMSG foo {sid} 1\r\nb\r\n").as_bytes())
            .await;

        assert_eq!(&sub.next().await.unwrap().payload[..], b"a");
        assert!(sub.next().await.is_none());
        assert!(conn.client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_now() {
        let (conn, mut server) = start().await;
        let sub = conn.client.subscribe("foo").unwrap();
        let sid = sub.sid();
        sub.unsubscribe().unwrap();

        server.line().await;
        assert_eq!(server.line().await, format!("UNSUB {sid}\r\n"));
        assert!(conn.client.registry().get(sid).is_none());
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (conn, mut server) = start().await;
        let client = conn.client.clone();
        let request = tokio::spawn(async move {
            client
                .request("svc.echo", "ping", Duration::from_secs(5))
                .await
        });

        let sub = tokens(&server.line().await);
        assert_eq!(sub[0], "SUB");
        let (inbox, sid) = (sub[1].clone(), sub[2].clone());
        assert!(inbox.starts_with(INBOX_PREFIX));
        assert_eq!(server.line().await, format!("UNSUB {sid} 1\r\n"));
        assert_eq!(server.line().await, format!("PUB svc.echo {inbox} 4\r\n"));
        assert_eq!(server.payload(4).await, b"ping");

        server
            .send(format!("MSG {inbox} {sid} 4\r\npong\r\n").as_bytes())
            .await;

        let reply = request.await.unwrap().unwrap();
        assert_eq!(&reply.payload[..], b"pong");
        assert!(conn.client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_request_no_responders() {
        let (conn, mut server) = start().await;
        let client = conn.client.clone();
        let request = tokio::spawn(async move {
            client.request("svc.none", "", Duration::from_secs(5)).await
        });

        let sub = tokens(&server.line().await);
        let (inbox, sid) = (sub[1].clone(), sub[2].clone());
        let block = "NATS/1.0 503\r\n\r\n";
        server
            .send(format!("HMSG {inbox} {sid} {} 0\r\n{block}\r\n", block.len()).as_bytes())
            .await;

        assert!(matches!(
            request.await.unwrap(),
            Err(SessionError::NoResponders(subject)) if subject == "svc.none"
        ));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (conn, _server) = start().await;
        let result = conn
            .client
            .request("svc.slow", "x", Duration::from_millis(30))
            .await;

        assert!(matches!(result, Err(SessionError::Timeout(_))));
        assert!(conn.client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_ping_reports_rtt() {
        let (mut conn, mut server) = start().await;
        conn.client.ping().unwrap();

        assert_eq!(server.line().await, "PING\r\n");
        server.send(b"PONG\r\n").await;
        // INFO from the handshake comes first
        loop {
            match conn.events.recv().await {
                Some(ClientEvent::Pong { rtt }) => {
                    assert!(rtt.is_some());
                    break;
                }
                Some(_) => continue,
                None => panic!("session ended before PONG"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let (conn, _server) = start().await;
        conn.client.close();

        assert!(conn.task.await.unwrap().is_ok());
        assert!(matches!(
            conn.client.publish("a", "b"),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn test_inbox_is_unique() {
        let a = new_inbox();
        let b = new_inbox();
        assert!(a.starts_with("_INBOX."));
        assert_ne!(a, b);
        assert!(validate_subject(&a).is_ok());
    }
}
