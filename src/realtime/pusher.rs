//! Pusher protocol (v7) transport over a websocket, as spoken by Reverb and
//! other Pusher-compatible broadcasters.
//!
//! One websocket per channel. Private channels are authorized through the
//! helpdesk API using the socket id handed out on connect.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::api::{Error, HelpdeskClient, Result};
use crate::config::RealtimeConfig;

use super::transport::{ChannelEvent, EventStream, RealtimeTransport};

const PROTOCOL_VERSION: u8 = 7;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Used when the server doesn't announce an activity timeout
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;
type Source = SplitStream<Socket>;

/// Realtime transport for Pusher-compatible servers.
pub struct PusherTransport {
  client: HelpdeskClient,
  config: RealtimeConfig,
}

impl PusherTransport {
  pub fn new(client: HelpdeskClient, config: RealtimeConfig) -> Self {
    Self { client, config }
  }
}

#[async_trait]
impl RealtimeTransport for PusherTransport {
  async fn subscribe(&self, channel: &str) -> Result<EventStream> {
    let url = connect_url(&self.config);
    debug!(url = %url, channel, "connecting to broadcaster");

    let (socket, _) = connect_async(url.as_str()).await.map_err(channel_error)?;
    let (mut sink, mut source) = socket.split();

    let connection = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_connection(&mut source))
      .await
      .map_err(|_| Error::ChannelError("timed out waiting for connection".to_string()))??;

    let auth = self
      .client
      .authorize_channel(&self.config.auth_endpoint, &connection.socket_id, channel)
      .await?;
    sink
      .send(Message::Text(subscribe_frame(channel, &auth)))
      .await
      .map_err(channel_error)?;

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run_socket(
      sink,
      source,
      channel.to_string(),
      connection.activity_timeout,
      tx,
    ));

    let stream = futures::stream::unfold(rx, |mut rx| async move {
      rx.recv().await.map(|item| (item, rx))
    });
    Ok(stream.boxed())
  }
}

struct Connection {
  socket_id: String,
  activity_timeout: Duration,
}

/// Read frames until the server hands out a socket id.
async fn await_connection(source: &mut Source) -> Result<Connection> {
  while let Some(message) = source.next().await {
    let Message::Text(text) = message.map_err(channel_error)? else {
      continue;
    };
    match parse_frame(&text)? {
      Frame::ConnectionEstablished {
        socket_id,
        activity_timeout,
      } => {
        debug!(socket_id = %socket_id, "connection established");
        return Ok(Connection {
          socket_id,
          activity_timeout,
        });
      }
      Frame::Error { message, code } => {
        return Err(Error::ChannelError(describe_error(&message, code)));
      }
      _ => {}
    }
  }
  Err(Error::ChannelError("connection closed during handshake".to_string()))
}

/// Drive one socket until the receiving side goes away or the connection
/// drops.
async fn run_socket(
  mut sink: Sink,
  mut source: Source,
  channel: String,
  activity_timeout: Duration,
  tx: mpsc::Sender<Result<ChannelEvent>>,
) {
  let mut keepalive = tokio::time::interval(activity_timeout);
  keepalive.reset();

  loop {
    tokio::select! {
      _ = tx.closed() => {
        debug!(channel = %channel, "unsubscribing");
        let _ = sink.send(Message::Text(unsubscribe_frame(&channel))).await;
        let _ = sink.close().await;
        return;
      }
      _ = keepalive.tick() => {
        trace!(channel = %channel, "ping");
        if let Err(e) = sink.send(Message::Text(ping_frame())).await {
          warn!(channel = %channel, error = %e, "keepalive failed");
        }
      }
      message = source.next() => {
        let message = match message {
          Some(Ok(message)) => message,
          Some(Err(e)) => {
            let _ = tx.send(Err(channel_error(e))).await;
            return;
          }
          None => {
            info!(channel = %channel, "broadcaster closed the connection");
            return;
          }
        };
        keepalive.reset();

        match message {
          Message::Text(text) => {
            if !handle_text(&mut sink, &channel, &text, &tx).await {
              return;
            }
          }
          Message::Ping(data) => {
            let _ = sink.send(Message::Pong(data)).await;
          }
          Message::Close(_) => {
            info!(channel = %channel, "broadcaster closed the connection");
            return;
          }
          _ => {}
        }
      }
    }
  }
}

/// Returns false once the receiving side is gone.
async fn handle_text(
  sink: &mut Sink,
  channel: &str,
  text: &str,
  tx: &mpsc::Sender<Result<ChannelEvent>>,
) -> bool {
  let frame = match parse_frame(text) {
    Ok(frame) => frame,
    Err(e) => return tx.send(Err(e)).await.is_ok(),
  };

  match frame {
    Frame::Ping => {
      let _ = sink.send(Message::Text(pong_frame())).await;
      true
    }
    Frame::SubscriptionSucceeded { channel: subscribed } => {
      info!(channel = %subscribed, "subscribed");
      true
    }
    Frame::Error { message, code } => tx
      .send(Err(Error::ChannelError(describe_error(&message, code))))
      .await
      .is_ok(),
    Frame::Event(event) if event.channel == channel => tx.send(Ok(event)).await.is_ok(),
    Frame::Event(event) => {
      trace!(channel = %event.channel, event = %event.event, "event for another channel");
      true
    }
    Frame::ConnectionEstablished { .. } | Frame::Other(_) => true,
  }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, PartialEq)]
enum Frame {
  ConnectionEstablished {
    socket_id: String,
    activity_timeout: Duration,
  },
  SubscriptionSucceeded {
    channel: String,
  },
  Ping,
  Error {
    message: String,
    code: Option<u16>,
  },
  Event(ChannelEvent),
  Other(String),
}

#[derive(Deserialize)]
struct RawFrame {
  event: String,
  #[serde(default)]
  channel: Option<String>,
  #[serde(default)]
  data: Value,
}

fn parse_frame(text: &str) -> Result<Frame> {
  let raw: RawFrame = serde_json::from_str(text).map_err(|e| Error::ChannelError(format!("malformed frame: {}", e)))?;
  let data = decode_data(raw.data);

  Ok(match raw.event.as_str() {
    "pusher:connection_established" => {
      let socket_id = data
        .get("socket_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ChannelError("connection frame without socket id".to_string()))?
        .to_string();
      let activity_timeout = data
        .get("activity_timeout")
        .and_then(Value::as_u64)
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_ACTIVITY_TIMEOUT);
      Frame::ConnectionEstablished {
        socket_id,
        activity_timeout,
      }
    }
    "pusher_internal:subscription_succeeded" => Frame::SubscriptionSucceeded {
      channel: raw.channel.unwrap_or_default(),
    },
    "pusher:ping" => Frame::Ping,
    "pusher:error" | "pusher:subscription_error" => Frame::Error {
      message: data
        .get("message")
        .or_else(|| data.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string(),
      code: data.get("code").and_then(Value::as_u64).and_then(|c| u16::try_from(c).ok()),
    },
    event if event.starts_with("pusher") => Frame::Other(event.to_string()),
    _ => match raw.channel {
      Some(channel) => Frame::Event(ChannelEvent {
        channel,
        event: raw.event.clone(),
        payload: data,
      }),
      None => Frame::Other(raw.event.clone()),
    },
  })
}

/// Event data usually arrives as a JSON-encoded string.
fn decode_data(data: Value) -> Value {
  match data {
    Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
    other => other,
  }
}

fn describe_error(message: &str, code: Option<u16>) -> String {
  match code {
    Some(code) => format!("{} (code {})", message, code),
    None => message.to_string(),
  }
}

fn connect_url(config: &RealtimeConfig) -> String {
  format!(
    "{}/app/{}?protocol={}&client=tkt&version={}&flash=false",
    config.url.trim_end_matches('/'),
    config.app_key,
    PROTOCOL_VERSION,
    env!("CARGO_PKG_VERSION"),
  )
}

fn subscribe_frame(channel: &str, auth: &str) -> String {
  json!({ "event": "pusher:subscribe", "data": { "auth": auth, "channel": channel } }).to_string()
}

fn unsubscribe_frame(channel: &str) -> String {
  json!({ "event": "pusher:unsubscribe", "data": { "channel": channel } }).to_string()
}

fn ping_frame() -> String {
  json!({ "event": "pusher:ping", "data": {} }).to_string()
}

fn pong_frame() -> String {
  json!({ "event": "pusher:pong", "data": {} }).to_string()
}

fn channel_error(e: impl std::fmt::Display) -> Error {
  Error::ChannelError(e.to_string())
}
