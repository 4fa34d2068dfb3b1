//! Cluster-wide topic fan-out over redis pub/sub. Every node runs one
//! subscriber connection; local sessions register interest in topics and
//! get envelopes over flume channels. Per-topic publish order is preserved
//! by redis, so it is preserved here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Frame, ServerEvent};
use crate::store::{RedisStore, Result};

/// The self-describing unit that travels over a topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    /// socket that must not receive this envelope (canvas relay excludes
    /// the drawer's own socket)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_socket: Option<String>,
}

impl Envelope {
    pub fn from_event(event: &ServerEvent) -> Self {
        let (event, payload) = event.parts();
        Self {
            event,
            payload,
            except_socket: None,
        }
    }

    pub fn from_event_except(event: &ServerEvent, socket_ref: &str) -> Self {
        let mut envelope = Self::from_event(event);
        envelope.except_socket = Some(socket_ref.to_owned());
        envelope
    }

    pub fn to_frame(&self, topic: &str) -> Frame {
        Frame {
            topic: topic.to_owned(),
            event: self.event.clone(),
            payload: self.payload.clone(),
            reference: None,
        }
    }
}

struct LocalSub {
    id: u64,
    tx: flume::Sender<Envelope>,
}

type Registry = Arc<Mutex<HashMap<String, Vec<LocalSub>>>>;

enum SubCmd {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Clone)]
pub struct Bus {
    redis: RedisStore,
    registry: Registry,
    cmd_tx: flume::Sender<SubCmd>,
    next_id: Arc<AtomicU64>,
}

impl Bus {
    pub fn new(redis: RedisStore) -> Self {
        let registry: Registry = Arc::default();
        let (cmd_tx, cmd_rx) = flume::unbounded();

        let bus = Self {
            redis: redis.clone(),
            registry: registry.clone(),
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        tokio::spawn(run_subscriber(redis, registry, cmd_rx));
        bus
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        self.redis.publish(topic, &payload).await
    }

    /// Register local interest in a topic. Dropping the subscription
    /// unregisters it; the redis subscription ends with the last one.
    pub fn subscribe(&self, topic: &str) -> TopicSubscription {
        let (tx, rx) = flume::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let fresh_topic = {
            let mut registry = self.registry.lock().unwrap();
            let subs = registry.entry(topic.to_owned()).or_default();
            let fresh = subs.is_empty();
            subs.push(LocalSub { id, tx });
            fresh
        };

        if fresh_topic {
            let _ = self.cmd_tx.send(SubCmd::Subscribe(topic.to_owned()));
        }

        TopicSubscription {
            registry: self.registry.clone(),
            cmd_tx: self.cmd_tx.clone(),
            topic: topic.to_owned(),
            id,
            rx,
        }
    }
}

pub struct TopicSubscription {
    registry: Registry,
    cmd_tx: flume::Sender<SubCmd>,
    topic: String,
    id: u64,
    pub rx: flume::Receiver<Envelope>,
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        let emptied = {
            let mut registry = self.registry.lock().unwrap();
            if let Some(subs) = registry.get_mut(&self.topic) {
                subs.retain(|sub| sub.id != self.id);
                if subs.is_empty() {
                    registry.remove(&self.topic);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if emptied {
            let _ = self.cmd_tx.send(SubCmd::Unsubscribe(self.topic.clone()));
        }
    }
}

async fn run_subscriber(redis: RedisStore, registry: Registry, cmd_rx: flume::Receiver<SubCmd>) {
    let client = redis.client();

    loop {
        let pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                log::warn!("bus subscriber could not connect: {}", err);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let (mut sink, stream) = pubsub.split();
        let mut stream = Box::pin(stream);

        // after a reconnect, pick the current interest set back up
        let topics: Vec<String> = registry.lock().unwrap().keys().cloned().collect();
        for topic in topics {
            if let Err(err) = sink.subscribe(&topic).await {
                log::warn!("bus re-subscribe to {} failed: {}", topic, err);
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv_async() => match cmd {
                    Ok(SubCmd::Subscribe(topic)) => {
                        if let Err(err) = sink.subscribe(&topic).await {
                            log::warn!("bus subscribe to {} failed: {}", topic, err);
                        }
                    }
                    Ok(SubCmd::Unsubscribe(topic)) => {
                        if let Err(err) = sink.unsubscribe(&topic).await {
                            log::debug!("bus unsubscribe from {} failed: {}", topic, err);
                        }
                    }
                    Err(_) => return,
                },

                msg = stream.next() => match msg {
                    Some(msg) => dispatch(&registry, &msg),
                    // connection lost, reconnect
                    None => break,
                },
            }
        }

        log::warn!("bus subscriber connection lost, reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn dispatch(registry: &Registry, msg: &redis::Msg) {
    let topic = msg.get_channel_name();
    let envelope: Envelope = match msg.get_payload::<String>() {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("undecodable envelope on {}: {}", topic, err);
                return;
            }
        },
        Err(_) => return,
    };

    let registry = registry.lock().unwrap();
    if let Some(subs) = registry.get(topic) {
        for sub in subs {
            let _ = sub.tx.send(envelope.clone());
        }
    }
}

/// Topic of a room's broadcast channel.
pub fn room_topic(room_id: &str) -> String { format!("room:{}", room_id) }

/// Topic reaching all sockets of one user, on any node.
pub fn user_topic(user_id: &str) -> String { format!("user:{}", user_id) }
