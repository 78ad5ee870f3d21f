//! NATS command line client.
//!
//! Subscribes, publishes and sends requests against a NATS server, logging
//! protocol activity in the redb service format.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use nats_session::{Client, ClientEvent, Connection, ErrorPolicy, Message};
use nats_wire::{HeaderMap, ServerInfo};
use std::{path::PathBuf, time::Duration};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NatsConfig;
use logging::RedbLogFormatter;

// Component logging macros are defined in logging.rs and available via #[macro_export]

/// How long to wait for the server's INFO after connecting
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// NATS protocol client
#[derive(Parser, Debug)]
#[command(name = "redb-nats", version, about = "NATS protocol client")]
struct Args {
    /// Server address, e.g. 127.0.0.1:4222
    #[arg(long, global = true)]
    server: Option<String>,

    /// Connection name reported to the server
    #[arg(long, global = true)]
    name: Option<String>,

    /// Client PING interval, e.g. 2m
    #[arg(long, global = true)]
    ping_interval: Option<humantime::Duration>,

    /// What to do on a non-fatal protocol error: skip or close
    #[arg(long, global = true)]
    on_protocol_error: Option<ErrorPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a subject and print messages
    Sub {
        /// Subject filter, wildcards allowed
        subject: String,
        /// Join a queue group
        #[arg(long)]
        queue: Option<String>,
        /// Answer requests with this payload
        #[arg(long)]
        reply: Option<String>,
        /// Exit after this many messages
        #[arg(long)]
        count: Option<u64>,
    },
    /// Publish a message
    Pub {
        /// Destination subject
        subject: String,
        /// Message body
        #[arg(default_value = "")]
        payload: String,
        /// Reply subject
        #[arg(long)]
        reply_to: Option<String>,
        /// Header as Key:Value (repeatable)
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// Send a request and print the reply
    Request {
        /// Destination subject
        subject: String,
        /// Request body
        #[arg(default_value = "")]
        payload: String,
        /// How long to wait for a reply
        #[arg(long)]
        timeout: Option<humantime::Duration>,
    },
}

impl Args {
    /// Command line flags win over file and environment
    fn apply_to(&self, config: &mut NatsConfig) {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(interval) = &self.ping_interval {
            config.ping_interval = **interval;
        }
        if let Some(policy) = self.on_protocol_error {
            config.on_protocol_error = policy;
        }
    }
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected Key:Value, got {s:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty header name in {s:?}"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("redb_nats={}", args.log_level).parse()?)
        .add_directive(format!("nats_session={}", args.log_level).parse()?)
        .add_directive(format!("nats_wire={}", args.log_level).parse()?);

    let formatter = RedbLogFormatter::new("nats".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(formatter)
        .init();

    info!("Starting reDB NATS client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NatsConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let Connection {
        client,
        mut events,
        task,
    } = Client::connect(config.server.as_str(), config.session_config())
        .await
        .with_context(|| format!("failed to connect to {}", config.server))?;

    let server = wait_for_info(&mut events).await?;
    component_info!(
        "session",
        "Connected to {} ({} {})",
        config.server,
        server.server_name,
        server.version
    );

    let outcome = match args.command {
        Command::Sub {
            subject,
            queue,
            reply,
            count,
        } => run_sub(&client, &mut events, &subject, queue.as_deref(), reply.as_deref(), count).await,
        Command::Pub {
            subject,
            payload,
            reply_to,
            headers,
        } => run_pub(&client, &mut events, &subject, reply_to.as_deref(), &headers, &payload).await,
        Command::Request {
            subject,
            payload,
            timeout,
        } => {
            let timeout = timeout.map_or(config.request_timeout, Into::into);
            run_request(&client, &subject, &payload, timeout).await
        }
    };

    client.close();
    let stats = task.await.context("session task panicked")??;
    component_info!(
        "session",
        "Closed: {} bytes in, {} bytes out, {} messages delivered, {} protocol errors",
        stats.bytes_in,
        stats.bytes_out,
        stats.messages_delivered,
        stats.protocol_errors
    );
    outcome
}

async fn wait_for_info(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> anyhow::Result<Box<ServerInfo>> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Info(info) => return Ok(info),
                other => log_event(other),
            }
        }
        Err(anyhow!("connection closed before server INFO"))
    };
    tokio::time::timeout(CONNECT_TIMEOUT, wait)
        .await
        .context("timed out waiting for server INFO")?
}

async fn run_sub(
    client: &Client,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    subject: &str,
    queue: Option<&str>,
    reply: Option<&str>,
    count: Option<u64>,
) -> anyhow::Result<()> {
    let mut sub = match queue {
        Some(queue) => client.queue_subscribe(subject, queue)?,
        None => client.subscribe(subject)?,
    };
    if let Some(max) = count {
        sub.unsubscribe_after(max)?;
    }
    component_info!("sub", "Listening on [{}]", subject);

    let mut received = 0u64;
    loop {
        tokio::select! {
            message = sub.next() => {
                let Some(message) = message else {
                    component_debug!("sub", "Subscription on [{}] finished", subject);
                    break;
                };
                received += 1;
                print_message(received, &message);
                if let (Some(reply), Some(reply_to)) = (reply, message.reply_to.as_deref()) {
                    client.publish(reply_to, reply)?;
                }
            }
            event = events.recv() => match event {
                Some(event) => log_event(event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                component_info!("sub", "Interrupted after {} messages", received);
                break;
            }
        }
    }
    Ok(())
}

async fn run_pub(
    client: &Client,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    subject: &str,
    reply_to: Option<&str>,
    headers: &[(String, String)],
    payload: &str,
) -> anyhow::Result<()> {
    if headers.is_empty() {
        match reply_to {
            Some(reply_to) => client.publish_with_reply(subject, reply_to, payload)?,
            None => client.publish(subject, payload)?,
        }
    } else {
        let mut map = HeaderMap::new();
        for (key, value) in headers {
            map.append(key.as_str(), value.as_str());
        }
        client.publish_with_headers(subject, reply_to, &map, payload)?;
    }

    // The server answers PINGs in order, so a PONG means the publish was processed
    client.ping()?;
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Pong { .. } => {
                println!("Published [{}] : '{}'", subject, payload);
                return Ok(());
            }
            other => log_event(other),
        }
    }
    Err(anyhow!("connection closed before publish was confirmed"))
}

async fn run_request(
    client: &Client,
    subject: &str,
    payload: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    component_debug!("request", "Sending request on [{}]", subject);
    let reply = client.request(subject, payload, timeout).await?;
    println!(
        "Received [{}] : '{}'",
        reply.subject,
        String::from_utf8_lossy(&reply.payload)
    );
    Ok(())
}

fn print_message(n: u64, message: &Message) {
    let reply = message
        .reply_to
        .as_deref()
        .map(|r| format!(" (reply to {r})"))
        .unwrap_or_default();
    println!(
        "[#{}] Received on [{}]{}: '{}'",
        n,
        message.subject,
        reply,
        String::from_utf8_lossy(&message.payload)
    );
    if let Some(headers) = &message.headers {
        for (key, value) in headers.iter() {
            println!("    {key}: {value}");
        }
    }
}

fn log_event(event: ClientEvent) {
    match event {
        ClientEvent::Info(info) => {
            component_debug!("session", "INFO update from {}", info.server_id)
        }
        ClientEvent::Pong { rtt } => component_debug!("session", "PONG (rtt: {:?})", rtt),
        ClientEvent::Ok => component_debug!("session", "+OK"),
        ClientEvent::Error(e) => component_warn!("session", "Protocol error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Trace-Id: abc"),
            Ok(("Trace-Id".to_string(), "abc".to_string()))
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "redb-nats",
            "--server",
            "10.0.0.5:4222",
            "--ping-interval",
            "15s",
            "--on-protocol-error",
            "close",
            "pub",
            "orders.created",
            "hello",
        ]);
        let mut config = NatsConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.server, "10.0.0.5:4222");
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.on_protocol_error, ErrorPolicy::Close);
        assert!(matches!(args.command, Command::Pub { .. }));
    }

    #[test]
    fn test_sub_subcommand() {
        let args = Args::parse_from(["redb-nats", "sub", "svc.>", "--reply", "pong", "--count", "3"]);
        match args.command {
            Command::Sub {
                subject,
                reply,
                count,
                queue,
            } => {
                assert_eq!(subject, "svc.>");
                assert_eq!(reply.as_deref(), Some("pong"));
                assert_eq!(count, Some(3));
                assert!(queue.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
