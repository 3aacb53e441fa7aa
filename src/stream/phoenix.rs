//! Phoenix channels (v2 JSON serializer) client over a websocket.

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use opentelemetry::KeyValue;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::Metrics;
use crate::models::common::StreamConfig;
use crate::models::errors::{ConfigError, StreamError};
use crate::stream::{ChannelSocket, StreamEventKind};
use crate::utils::retry::ReconnectBackoff;

const PROTOCOL_VERSION: &str = "2.0.0";
const HEARTBEAT_TOPIC: &str = "phoenix";

/// `[join_ref, ref, topic, event, payload]`
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn encode(&self) -> Result<String, StreamError> {
        Ok(serde_json::to_string(&(
            &self.join_ref,
            &self.msg_ref,
            &self.topic,
            &self.event,
            &self.payload,
        ))?)
    }

    pub fn decode(text: &str) -> Result<Self, StreamError> {
        let (join_ref, msg_ref, topic, event, payload): (
            Option<String>,
            Option<String>,
            String,
            String,
            Value,
        ) = serde_json::from_str(text)?;

        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

/// An event received on a joined collection channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceEvent {
    pub kind: StreamEventKind,
    pub slug: String,
    pub payload: Value,
}

fn join_frame(topic: &str, join_ref: String) -> Frame {
    Frame {
        join_ref: Some(join_ref.clone()),
        msg_ref: Some(join_ref),
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload: Value::Object(Default::default()),
    }
}

#[derive(Debug)]
struct JoinedTopic {
    join_ref: String,
    events: HashSet<StreamEventKind>,
}

#[derive(Debug, Default)]
struct ChannelState {
    topics: HashMap<String, JoinedTopic>,
    next_ref: u64,
}

impl ChannelState {
    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    /// Fresh join frames for every joined topic, used after a reconnect.
    fn rejoin_frames(&mut self) -> Vec<Frame> {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        topics
            .into_iter()
            .map(|topic| {
                let join_ref = self.next_ref();
                if let Some(joined) = self.topics.get_mut(&topic) {
                    joined.join_ref = join_ref.clone();
                }
                join_frame(&topic, join_ref)
            })
            .collect()
    }

    fn heartbeat_frame(&mut self) -> Frame {
        Frame {
            join_ref: None,
            msg_ref: Some(self.next_ref()),
            topic: HEARTBEAT_TOPIC.to_string(),
            event: "heartbeat".to_string(),
            payload: Value::Object(Default::default()),
        }
    }

    fn is_subscribed(&self, topic: &str, kind: StreamEventKind) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|joined| joined.events.contains(&kind))
    }
}

/// Handle used to join and leave channels. Frames are written by the
/// [`PhoenixConnection`] task, which also re-joins all channels after a
/// reconnect.
#[derive(Clone)]
pub struct PhoenixSocket {
    state: Arc<Mutex<ChannelState>>,
    outgoing: mpsc::UnboundedSender<Frame>,
}

pub struct PhoenixConnection {
    url: Url,
    state: Arc<Mutex<ChannelState>>,
    outgoing: mpsc::UnboundedReceiver<Frame>,
    events_tx: mpsc::Sender<MarketplaceEvent>,
    heartbeat: Duration,
    backoff: ReconnectBackoff,
    metrics: Option<Arc<Metrics>>,
}

/// Websocket URL carrying the api key and protocol version.
pub fn socket_url(endpoint: &str, api_key: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(endpoint)?;
    url.query_pairs_mut()
        .append_pair("token", api_key)
        .append_pair("vsn", PROTOCOL_VERSION);
    Ok(url)
}

impl PhoenixSocket {
    pub fn new(
        config: &StreamConfig,
        api_key: &str,
        events_tx: mpsc::Sender<MarketplaceEvent>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<(Self, PhoenixConnection), ConfigError> {
        let url = socket_url(&config.endpoint, api_key)?;
        let state = Arc::new(Mutex::new(ChannelState::default()));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let socket = Self {
            state: state.clone(),
            outgoing: outgoing_tx,
        };
        let connection = PhoenixConnection {
            url,
            state,
            outgoing: outgoing_rx,
            events_tx,
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
            backoff: ReconnectBackoff::from(&config.reconnect),
            metrics,
        };

        Ok((socket, connection))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, frame: Frame) -> Result<(), StreamError> {
        self.outgoing.send(frame).map_err(|_| StreamError::Closed)
    }
}

#[async_trait]
impl ChannelSocket for PhoenixSocket {
    async fn join(&self, topic: &str, kind: StreamEventKind) -> Result<(), StreamError> {
        let frame = {
            let mut state = self.state();
            if let Some(joined) = state.topics.get_mut(topic) {
                joined.events.insert(kind);
                None
            } else {
                let join_ref = state.next_ref();
                state.topics.insert(
                    topic.to_string(),
                    JoinedTopic {
                        join_ref: join_ref.clone(),
                        events: HashSet::from([kind]),
                    },
                );
                Some(join_frame(topic, join_ref))
            }
        };

        if let Some(frame) = frame {
            debug!("👋 joining channel {}", topic);
            self.queue(frame)?;
        }
        debug!("␚ 🔔 subscribed to {} for {}", kind, topic);
        Ok(())
    }

    async fn leave(&self, topic: &str, kind: StreamEventKind) -> Result<(), StreamError> {
        let frame = {
            let mut state = self.state();
            let Some(joined) = state.topics.get_mut(topic) else {
                return Ok(());
            };

            joined.events.remove(&kind);
            if !joined.events.is_empty() {
                None
            } else {
                let join_ref = joined.join_ref.clone();
                state.topics.remove(topic);
                let msg_ref = state.next_ref();
                Some(Frame {
                    join_ref: Some(join_ref),
                    msg_ref: Some(msg_ref),
                    topic: topic.to_string(),
                    event: "phx_leave".to_string(),
                    payload: Value::Object(Default::default()),
                })
            }
        };

        if let Some(frame) = frame {
            info!("Leaving channel {}", topic);
            self.queue(frame)?;
        }
        Ok(())
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), StreamError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let text = frame.encode()?;
    sink.send(Message::text(text))
        .await
        .map_err(|e| StreamError::Send(e.to_string()))
}

impl PhoenixConnection {
    fn state(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First frames on a fresh connection: a re-join for every joined topic,
    /// then the queued frames those re-joins do not already cover. A queued
    /// join for a re-joined topic is dropped, and so is a leave for a join
    /// this connection never sent.
    fn reconnect_frames(&mut self) -> Vec<Frame> {
        let mut frames = self.state().rejoin_frames();
        let mut live: HashMap<String, Option<String>> = frames
            .iter()
            .map(|frame| (frame.topic.clone(), frame.join_ref.clone()))
            .collect();

        while let Ok(frame) = self.outgoing.try_recv() {
            let keep = match frame.event.as_str() {
                "phx_join" => !live.contains_key(&frame.topic),
                "phx_leave" => live.get(&frame.topic) == Some(&frame.join_ref),
                _ => true,
            };
            if !keep {
                debug!("dropping queued {} for {}", frame.event, frame.topic);
                continue;
            }

            match frame.event.as_str() {
                "phx_join" => {
                    live.insert(frame.topic.clone(), frame.join_ref.clone());
                }
                "phx_leave" => {
                    live.remove(&frame.topic);
                }
                _ => {}
            }
            frames.push(frame);
        }

        frames
    }

    /// Keeps the socket connected until shutdown, reconnecting with a linear
    /// backoff after every close or error.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            match self.session(&mut shutdown).await {
                Ok(()) => {
                    info!("⚓️ stream socket shut down");
                    return;
                }
                Err(e) => warn!("⚓️❕ stream socket closed: {}", e),
            }

            let delay = self.backoff.next_delay();
            if let Some(metrics) = &self.metrics {
                metrics
                    .stream_reconnects
                    .add(1, &[KeyValue::new("instance", metrics.instance.clone())]);
            }
            warn!(
                "⚓️❕ stream socket retry after {:?} (attempt {})",
                delay,
                self.backoff.attempt()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    /// One connection lifetime. `Ok` means shutdown was requested.
    async fn session(&mut self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), StreamError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        info!("⚓️ connected to marketplace stream");
        self.backoff.reset();

        let frames = self.reconnect_frames();
        for frame in &frames {
            send_frame(&mut sink, frame).await?;
        }
        if !frames.is_empty() {
            info!("⚓️ sent {} join/leave frames after connecting", frames.len());
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = self.outgoing.recv() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    send_frame(&mut sink, &frame).await?;
                }
                _ = heartbeat.tick() => {
                    let frame = self.state().heartbeat_frame();
                    send_frame(&mut sink, &frame).await?;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => return Err(StreamError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(StreamError::Connect(e.to_string())),
                },
                _ = shutdown.recv() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("invalid stream frame: {}", e);
                return;
            }
        };

        match frame.event.as_str() {
            "phx_reply" => {
                let status = frame.payload.get("status").and_then(Value::as_str);
                debug!("reply on {}: {:?}", frame.topic, status);
            }
            "phx_error" | "phx_close" => {
                warn!("channel {} reported {}", frame.topic, frame.event);
            }
            event => {
                let Some(kind) = StreamEventKind::from_name(event) else {
                    debug!("ignoring {} on {}", event, frame.topic);
                    return;
                };
                let subscribed = self.state().is_subscribed(&frame.topic, kind);
                if !subscribed {
                    return;
                }

                let slug = frame
                    .topic
                    .strip_prefix(crate::stream::COLLECTION_TOPIC_PREFIX)
                    .unwrap_or(&frame.topic)
                    .to_string();

                let event = MarketplaceEvent {
                    kind,
                    slug,
                    payload: frame.payload,
                };
                if self.events_tx.send(event).await.is_err() {
                    debug!("marketplace event receiver is gone");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip_with_null_refs() {
        let text = r#"[null,"7","phoenix","heartbeat",{}]"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.join_ref, None);
        assert_eq!(frame.msg_ref.as_deref(), Some("7"));
        assert_eq!(frame.encode().unwrap(), text);
    }

    #[test]
    fn test_socket_url_carries_token_and_version() {
        let url = socket_url("wss://stream.example.com/socket/websocket", "k3y").unwrap();
        assert_eq!(url.query(), Some("token=k3y&vsn=2.0.0"));
    }

    #[tokio::test]
    async fn test_join_once_per_topic_and_leave_after_last_event() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (socket, mut connection) = PhoenixSocket::new(
            &StreamConfig::default(),
            "k3y",
            events_tx,
            None,
        )
        .unwrap();

        socket.join("collection:a", StreamEventKind::ItemListed).await.unwrap();
        socket.join("collection:a", StreamEventKind::ItemSold).await.unwrap();
        socket.leave("collection:a", StreamEventKind::ItemListed).await.unwrap();
        socket.leave("collection:a", StreamEventKind::ItemSold).await.unwrap();

        let join = connection.outgoing.recv().await.unwrap();
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.topic, "collection:a");

        let leave = connection.outgoing.recv().await.unwrap();
        assert_eq!(leave.event, "phx_leave");
        assert_eq!(leave.join_ref, join.join_ref);
        assert!(connection.outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_only_subscribed_events_are_forwarded() {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (socket, connection) =
            PhoenixSocket::new(&StreamConfig::default(), "k3y", events_tx, None).unwrap();

        socket
            .join("collection:a", StreamEventKind::CollectionOffer)
            .await
            .unwrap();

        connection
            .handle_text(r#"[null,null,"collection:a","item_listed",{}]"#)
            .await;
        connection
            .handle_text(r#"[null,null,"collection:a","collection_offer",{"x":1}]"#)
            .await;

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.kind, StreamEventKind::CollectionOffer);
        assert_eq!(event.slug, "a");
        assert!(events_rx.try_recv().is_err());

        // rejoin after reconnect refreshes the join ref
        let frames = connection.state().rejoin_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].topic, "collection:a");
    }

    #[tokio::test]
    async fn test_reconnect_sends_each_join_once() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (socket, mut connection) =
            PhoenixSocket::new(&StreamConfig::default(), "k3y", events_tx, None).unwrap();

        // queued while disconnected, already part of the joined state
        socket.join("collection:a", StreamEventKind::ItemSold).await.unwrap();
        socket.join("collection:b", StreamEventKind::ItemSold).await.unwrap();
        socket.leave("collection:b", StreamEventKind::ItemSold).await.unwrap();

        let frames = connection.reconnect_frames();
        let summary: Vec<_> = frames
            .iter()
            .map(|frame| (frame.event.as_str(), frame.topic.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("phx_join", "collection:a"),
                ("phx_join", "collection:b"),
                ("phx_leave", "collection:b"),
            ]
        );
        assert!(connection.outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_drops_stale_leave_of_rejoined_topic() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (socket, mut connection) =
            PhoenixSocket::new(&StreamConfig::default(), "k3y", events_tx, None).unwrap();

        socket.join("collection:a", StreamEventKind::ItemSold).await.unwrap();
        socket.leave("collection:a", StreamEventKind::ItemSold).await.unwrap();
        socket.join("collection:a", StreamEventKind::ItemListed).await.unwrap();

        let frames = connection.reconnect_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "phx_join");
        assert_eq!(frames[0].topic, "collection:a");
        assert!(connection.state().is_subscribed("collection:a", StreamEventKind::ItemListed));
    }
}
