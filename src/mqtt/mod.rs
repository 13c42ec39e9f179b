pub mod client;

use tokio::sync::mpsc;
use tracing::warn;

/// An inbound publish.
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Work handed to a running [`client::MqttClient`].
#[derive(Debug)]
pub enum MqttRequest {
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Subscribe(String),
    Unsubscribe(String),
}

/// Publish/subscribe surface the device code talks to. Publishes are
/// fire-and-forget.
pub trait Transport: Send + Sync {
    fn subscribe(&self, topic: &str);
    fn unsubscribe(&self, topic: &str);
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool);
}

#[derive(Clone)]
pub struct MqttHandle {
    tx: mpsc::Sender<MqttRequest>,
}

impl MqttHandle {
    pub fn new(tx: mpsc::Sender<MqttRequest>) -> Self {
        Self { tx }
    }

    fn send(&self, request: MqttRequest) {
        if let Err(e) = self.tx.try_send(request) {
            warn!("Dropping MQTT request: {}", e);
        }
    }
}

impl Transport for MqttHandle {
    fn subscribe(&self, topic: &str) {
        self.send(MqttRequest::Subscribe(topic.to_string()));
    }

    fn unsubscribe(&self, topic: &str) {
        self.send(MqttRequest::Unsubscribe(topic.to_string()));
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        self.send(MqttRequest::Publish {
            topic: topic.to_string(),
            payload,
            retain,
        });
    }
}
