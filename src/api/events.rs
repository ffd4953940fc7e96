//! Realtime change feed over the backend's Phoenix-channel websocket.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::{self, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

use crate::api::models::{ChangeEvent, ChangeKind};
use crate::chat::store::{ChangeNotifier, Subscription};
use crate::error::{ChatError, Result};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound on the websocket handshake; polling covers the gap after.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    fn new(topic: &str, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
        }
    }

    /// Join request listening to every change on `schema.table`.
    pub fn join(
        topic: &str,
        schema: &str,
        table: &str,
        access_token: Option<&str>,
        reference: String,
    ) -> Self {
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": schema, "table": table }
                ]
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        Self::new(topic, "phx_join", payload, reference)
    }

    pub fn heartbeat(reference: String) -> Self {
        Self::new("phoenix", "heartbeat", json!({}), reference)
    }

    pub fn leave(topic: &str, reference: String) -> Self {
        Self::new(topic, "phx_leave", json!({}), reference)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The row change this frame announces, if any.
    pub fn change(&self) -> Option<ChangeEvent> {
        let (record, kind_field) = match self.event.as_str() {
            "postgres_changes" => (self.payload.get("data")?, "type"),
            "INSERT" | "UPDATE" | "DELETE" => (&self.payload, "type"),
            _ => return None,
        };
        let kind = record
            .get(kind_field)
            .and_then(Value::as_str)
            .map(ChangeKind::parse)
            .unwrap_or_else(|| ChangeKind::parse(&self.event));
        let table = record
            .get("table")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(ChangeEvent { table, kind })
    }

    /// Reason the server refused the channel, if this frame says so.
    pub fn rejection(&self) -> Option<String> {
        let errored = self.payload.get("status").and_then(Value::as_str) == Some("error");
        match self.event.as_str() {
            "phx_reply" if errored => Some(
                self.payload
                    .get("response")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "unknown".into()),
            ),
            "system" if errored => Some(
                self.payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            ),
            "phx_error" => Some("channel error".into()),
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        self.event == "phx_close"
    }
}

/// `wss://…/realtime/v1/websocket?apikey=…&vsn=1.0.0` for a REST base URL.
pub fn socket_url(base: &Url, anon_key: &str) -> Result<Url> {
    let mut url = base.join("realtime/v1/websocket")?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(ChatError::Config(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot switch {} to {}", base, scheme)))?;
    url.query_pairs_mut()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

fn next_ref(counter: &mut u64) -> String {
    *counter += 1;
    counter.to_string()
}

pub struct RealtimeNotifier {
    socket_url: Url,
    access_token: Option<String>,
    schema: String,
    table: String,
    connect_timeout: Duration,
}

impl RealtimeNotifier {
    pub fn new(base: &Url, anon_key: &str, access_token: Option<String>) -> Result<Self> {
        Ok(Self {
            socket_url: socket_url(base, anon_key)?,
            access_token,
            schema: "public".to_string(),
            table: "messages".to_string(),
            connect_timeout: CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = limit;
        self
    }
}

#[async_trait]
impl ChangeNotifier for RealtimeNotifier {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let handshake = connect_async(self.socket_url.as_str());
        let (socket, _) = time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ChatError::Realtime(format!(
                    "no handshake from {} within {:?}",
                    self.socket_url.host_str().unwrap_or("server"),
                    self.connect_timeout
                ))
            })??;
        let (mut sink, mut stream) = socket.split();
        let topic = format!("realtime:{}", channel);
        let mut refs = 0u64;

        let join = PhoenixFrame::join(
            &topic,
            &self.schema,
            &self.table,
            self.access_token.as_deref(),
            next_ref(&mut refs),
        );
        sink.send(WsMessage::Text(join.encode()?)).await?;
        info!("joined {}", topic);

        let (subscription, events, mut released) = Subscription::channel();
        tokio::spawn(async move {
            let mut heartbeat = time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut released => {
                        if let Ok(leave) = PhoenixFrame::leave(&topic, next_ref(&mut refs)).encode() {
                            let _ = sink.send(WsMessage::Text(leave)).await;
                        }
                        let _ = sink.close().await;
                        debug!("left {}", topic);
                        break;
                    }
                    _ = heartbeat.tick() => {
                        let beat = match PhoenixFrame::heartbeat(next_ref(&mut refs)).encode() {
                            Ok(beat) => beat,
                            Err(e) => {
                                warn!("encoding heartbeat failed: {}", e);
                                break;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(beat)).await {
                            warn!("{} heartbeat failed: {}", topic, e);
                            break;
                        }
                    }
                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => match PhoenixFrame::decode(&text) {
                            Ok(frame) => {
                                if let Some(change) = frame.change() {
                                    if events.send(change).is_err() {
                                        break;
                                    }
                                } else if let Some(reason) = frame.rejection() {
                                    warn!("{} rejected: {}", topic, reason);
                                    break;
                                } else if frame.is_close() {
                                    debug!("{} closed by server", topic);
                                    break;
                                }
                            }
                            Err(e) => debug!("ignoring frame on {}: {}", topic, e),
                        },
                        Some(Ok(WsMessage::Close(_))) | None => {
                            warn!("realtime socket for {} closed", topic);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("realtime socket for {} failed: {}", topic, e);
                            break;
                        }
                    },
                }
            }
        });

        Ok(subscription)
    }
}
