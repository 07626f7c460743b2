//! Message Bus Adapter (C3): publish/subscribe on named topics, envelope is
//! a generic CloudEvents-shaped event with a typed payload (spec.md §6).
//!
//! Topics are competing-consumer queues: every worker in a stage's pool
//! subscribes to the same topic and each published message is delivered to
//! exactly one of them, matching the "independently-scaled, stateless
//! worker pool" model of spec.md §5.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::Error;

/// Well-known topic names and helpers (spec.md §6).
pub mod topics {
    /// Freshly ingested, not-yet-split activity.
    pub const RAW_ACTIVITY: &str = "raw-activity";
    /// Same shape as `raw-activity`, mobile-sync variant.
    pub const MOBILE_ACTIVITY: &str = "mobile-activity";
    /// Pre-enrichment, per-pipeline event.
    pub const PIPELINE_ACTIVITY: &str = "pipeline-activity";
    /// Fully enriched event, ready for routing.
    pub const ENRICHED_ACTIVITY: &str = "enriched-activity";

    /// Builds the per-destination upload topic name.
    pub fn upload(destination: &str) -> String {
        format!("upload-{destination}")
    }
}

/// A CloudEvents-shaped envelope (spec.md §6): `specversion`, `id`,
/// `source`, `type`, `datacontenttype`, `data`, plus the key attributes the
/// bus topics table calls out (`pipeline_execution_id`, `destination`,
/// `repost_type`, ...), carried as a flat string map since they vary per
/// topic.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    /// CloudEvents spec version, always `"1.0"`.
    pub specversion: String,
    /// Unique id for this envelope (a uuid).
    pub id: String,
    /// Logical source URL of the producing stage.
    pub source: String,
    /// Reverse-DNS event type, e.g. `com.fitglue.pipeline-activity`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Always `"application/json"`.
    pub datacontenttype: String,
    /// Key attributes named in the bus topics table (spec.md §6), e.g.
    /// `pipeline_execution_id`, `destination`, `repost_type`.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// The JSON-encoded payload.
    pub data: serde_json::Value,
}

impl Envelope {
    /// Builds a new envelope around an already-serialized payload.
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Envelope {
            specversion: "1.0".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            datacontenttype: "application/json".to_string(),
            attributes: HashMap::new(),
            data,
        }
    }

    /// Attaches a key attribute, returning `self` for chaining.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Publishes and subscribes to named topics carrying [`Envelope`]s.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `envelope` to `topic`.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), Error>;

    /// Returns a [`Subscription`] competing with every other subscriber of
    /// `topic` for each published envelope.
    async fn subscribe(&self, topic: &str) -> Subscription;
}

/// A handle to receive envelopes published to one topic.
pub struct Subscription {
    receiver: flume::Receiver<Envelope>,
}

impl Subscription {
    /// Awaits the next envelope, or `None` if every sender has been dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv_async().await.ok()
    }
}

/// An in-memory [`MessageBus`] used by tests and single-process
/// deployments. Topics are created lazily on first publish or subscribe;
/// the sender and receiver halves of a topic's channel are kept in
/// separate registries so either side can be requested first.
#[derive(Default)]
pub struct InMemoryMessageBus {
    senders: Arc<RwLock<HashMap<String, flume::Sender<Envelope>>>>,
    receivers: Arc<RwLock<HashMap<String, flume::Receiver<Envelope>>>>,
}

impl InMemoryMessageBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, topic: &str) -> flume::Sender<Envelope> {
        if let Some(sender) = self.senders.read().await.get(topic) {
            return sender.clone();
        }
        self.create_channel(topic).await;
        self.senders.read().await.get(topic).expect("channel just created").clone()
    }

    async fn create_channel(&self, topic: &str) {
        let mut senders = self.senders.write().await;
        if senders.contains_key(topic) {
            return;
        }
        let (sender, receiver) = flume::unbounded();
        let _ = senders.insert(topic.to_string(), sender);
        let _ = self.receivers.write().await.insert(topic.to_string(), receiver);
    }
}

#[async_trait::async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), Error> {
        let sender = self.sender(topic).await;
        sender.send_async(envelope).await.map_err(|err| Error::Transient {
            uri: topic.to_string(),
            message: err.to_string(),
        })
    }

    async fn subscribe(&self, topic: &str) -> Subscription {
        if let Some(receiver) = self.receivers.read().await.get(topic) {
            return Subscription { receiver: receiver.clone() };
        }
        self.create_channel(topic).await;
        let receiver = self.receivers.read().await.get(topic).expect("channel just created").clone();
        Subscription { receiver }
    }
}

/// Serializes `data` and publishes it to `topic` under `source`/`type`,
/// returning the generated envelope id.
pub async fn publish<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: &str,
    source: &str,
    event_type: &str,
    data: &T,
    attributes: HashMap<String, String>,
) -> Result<String, Error> {
    let value = serde_json::to_value(data).map_err(|err| Error::Corrupt {
        uri: topic.to_string(),
        message: err.to_string(),
    })?;
    let mut envelope = Envelope::new(source, event_type, value);
    envelope.attributes = attributes;
    let id = envelope.id.clone();
    bus.publish(topic, envelope).await?;
    Ok(id)
}

/// Decodes an envelope's payload into `T`.
pub fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, Error> {
    serde_json::from_value(envelope.data.clone()).map_err(|err| Error::Corrupt {
        uri: envelope.id.clone(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_round_trips() {
        let bus = InMemoryMessageBus::new();
        let mut subscription = bus.subscribe(topics::PIPELINE_ACTIVITY).await;

        let mut attrs = HashMap::new();
        let _ = attrs.insert("pipeline_execution_id".to_string(), "exec-1".to_string());
        let _ = publish(
            &bus,
            topics::PIPELINE_ACTIVITY,
            "fitglue://splitter",
            "com.fitglue.pipeline-activity",
            &serde_json::json!({"pipeline_id": "p1"}),
            attrs,
        )
        .await
        .unwrap();

        let envelope = subscription.recv().await.expect("envelope delivered");
        assert_eq!(envelope.attributes.get("pipeline_execution_id").unwrap(), "exec-1");
        assert_eq!(envelope.data["pipeline_id"], serde_json::json!("p1"));
    }

    #[tokio::test]
    async fn competing_subscribers_each_receive_distinct_messages() {
        let bus = InMemoryMessageBus::new();
        let mut sub_a = bus.subscribe(topics::RAW_ACTIVITY).await;
        let mut sub_b = bus.subscribe(topics::RAW_ACTIVITY).await;

        for i in 0..2 {
            let _ = publish(
                &bus,
                topics::RAW_ACTIVITY,
                "fitglue://ingest",
                "com.fitglue.raw-activity",
                &serde_json::json!({"i": i}),
                HashMap::new(),
            )
            .await
            .unwrap();
        }

        let first = sub_a.recv().await.unwrap();
        let second = sub_b.recv().await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn upload_topic_is_destination_prefixed() {
        assert_eq!(topics::upload("strava"), "upload-strava");
    }
}
