use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{MqttMessage, MqttRequest};
use crate::config::MqttConfig;

/// Requests held locally while rumqttc's own queue is full.
const MAX_PENDING: usize = 1000;

pub struct MqttClient {
    name: &'static str,
    client: AsyncClient,
    eventloop: EventLoop,
    /// Retained messages republished on every (re)connect.
    birth: Vec<(String, Vec<u8>)>,
}

impl MqttClient {
    pub fn new(
        name: &'static str,
        config: &MqttConfig,
        last_will: Option<LastWill>,
        birth: Vec<(String, Vec<u8>)>,
    ) -> Self {
        let mut mqttopts = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        mqttopts.set_keep_alive(Duration::from_secs(30));
        mqttopts.set_max_packet_size(1 << 20, 1 << 20);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttopts.set_credentials(user, pass);
        }
        if config.tls {
            mqttopts.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        if let Some(lwt) = last_will {
            mqttopts.set_last_will(lwt);
        }

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            name,
            client,
            eventloop,
            birth,
        }
    }

    /// Run the MQTT event loop. Subscriptions requested through `requests`
    /// are remembered and restored after every reconnect; incoming publishes
    /// are forwarded through `inbound_tx`.
    ///
    /// Requests are handed to rumqttc without waiting on its queue, so the
    /// event loop keeps being polled while a backlog builds up before the
    /// broker connection is established.
    pub async fn run(
        self,
        inbound_tx: mpsc::Sender<MqttMessage>,
        mut requests: mpsc::Receiver<MqttRequest>,
    ) {
        let MqttClient {
            name,
            client,
            mut eventloop,
            birth,
        } = self;
        let mut subscriptions: BTreeSet<String> = BTreeSet::new();
        let mut pending: VecDeque<MqttRequest> = VecDeque::new();

        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("[{}] Connected to MQTT broker", name);

                            // birth messages and resubscriptions go ahead of the backlog
                            let replay: Vec<MqttRequest> = birth
                                .iter()
                                .map(|(topic, payload)| MqttRequest::Publish {
                                    topic: topic.clone(),
                                    payload: payload.clone(),
                                    retain: true,
                                })
                                .chain(subscriptions.iter().cloned().map(MqttRequest::Subscribe))
                                .collect();
                            for request in replay.into_iter().rev() {
                                pending.push_front(request);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let msg = MqttMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if inbound_tx.send(msg).await.is_err() {
                                warn!("[{}] Inbound channel closed", name);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("[{}] MQTT connection error: {}. Reconnecting...", name, e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(request) = requests.recv(), if pending.len() < MAX_PENDING => {
                    match request {
                        MqttRequest::Subscribe(topic) => {
                            subscriptions.insert(topic.clone());
                            pending.push_back(MqttRequest::Subscribe(topic));
                        }
                        MqttRequest::Unsubscribe(topic) => {
                            if subscriptions.remove(&topic) {
                                pending.push_back(MqttRequest::Unsubscribe(topic));
                            }
                        }
                        publish => pending.push_back(publish),
                    }
                }
            }
            flush(name, &client, &mut pending);
        }
    }
}

/// Move queued requests into rumqttc until its queue is full; the rest wait
/// for the next turn of the event loop.
fn flush(name: &str, client: &AsyncClient, pending: &mut VecDeque<MqttRequest>) {
    while let Some(request) = pending.front() {
        let sent = match request {
            MqttRequest::Publish {
                topic,
                payload,
                retain,
            } => client.try_publish(topic.clone(), QoS::AtLeastOnce, *retain, payload.clone()),
            MqttRequest::Subscribe(topic) => client.try_subscribe(topic.clone(), QoS::AtLeastOnce),
            MqttRequest::Unsubscribe(topic) => client.try_unsubscribe(topic.clone()),
        };
        if sent.is_err() {
            break;
        }
        if let Some(request) = pending.pop_front() {
            debug!("[{}] Queued request for {}", name, request_topic(&request));
        }
    }
}

fn request_topic(request: &MqttRequest) -> &str {
    match request {
        MqttRequest::Publish { topic, .. }
        | MqttRequest::Subscribe(topic)
        | MqttRequest::Unsubscribe(topic) => topic,
    }
}
