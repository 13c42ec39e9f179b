mod config;
mod connector;
mod devices;
mod ecoflow;
mod error;
mod homie;
mod message_logger;
mod mqtt;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{LastWill, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use devices::{Device, DeviceContext, HomieContext};
use message_logger::{LogMode, MessageLogger};
use mqtt::client::MqttClient;
use mqtt::{MqttHandle, MqttMessage, MqttRequest, Transport};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting ecoflow-to-homie bridge (ecoflow={}:{}, homie={}, devices={})",
        config.ecoflow.mqtt.broker_host,
        config.ecoflow.mqtt.broker_port,
        config
            .homie
            .as_ref()
            .map_or("disabled".to_string(), |h| format!(
                "{}:{}",
                h.mqtt.broker_host, h.mqtt.broker_port
            )),
        config.devices.len(),
    );

    for device in &config.devices {
        info!(
            "  Device: {} ({}) type {:?}, {} table entries",
            device.name,
            device.serial,
            device.device_type,
            device.properties.len(),
        );
    }

    let logger = match config.raw_log.mode {
        LogMode::None => None,
        mode => match MessageLogger::new(mode, &config.raw_log.folder) {
            Ok(logger) => Some(Arc::new(logger)),
            Err(e) => {
                warn!("Raw message logging disabled: {}", e);
                None
            }
        },
    };

    // Vendor cloud broker
    let (vendor_in_tx, mut vendor_in_rx) = mpsc::channel::<MqttMessage>(100);
    let (vendor_req_tx, vendor_req_rx) = mpsc::channel::<MqttRequest>(500);
    let vendor_client = MqttClient::new("ecoflow", &config.ecoflow.mqtt, None, Vec::new());
    let vendor_handle = tokio::spawn(async move {
        vendor_client.run(vendor_in_tx, vendor_req_rx).await;
    });
    let vendor: Arc<dyn Transport> = Arc::new(MqttHandle::new(vendor_req_tx));

    // Homie broker (optional). Devices publish through the request channel
    // before the client exists; it drains the queue once connected.
    let (homie_in_tx, mut homie_in_rx) = mpsc::channel::<MqttMessage>(100);
    let (homie_req_tx, homie_req_rx) = mpsc::channel::<MqttRequest>(2000);
    let homie_prefix = config.homie.as_ref().map(|h| h.topic_prefix.clone());

    let ctx = DeviceContext {
        user_id: config.ecoflow.user_id.clone(),
        transport: vendor,
        homie: homie_prefix.as_ref().map(|prefix| HomieContext {
            prefix: prefix.clone(),
            transport: Arc::new(MqttHandle::new(homie_req_tx)),
        }),
        logger,
    };

    let devices: Vec<Arc<dyn Device>> = config
        .devices
        .iter()
        .map(|d| devices::create(d, &ctx))
        .collect();

    let homie_handle = config.homie.as_ref().map(|homie| {
        let state_topics: Vec<String> = devices
            .iter()
            .filter_map(|d| d.core().homie().map(|h| h.state_topic()))
            .collect();
        // a connection carries a single will
        let last_will = state_topics
            .first()
            .map(|topic| LastWill::new(topic, "lost", QoS::AtLeastOnce, true));
        let birth = state_topics
            .into_iter()
            .map(|topic| (topic, b"ready".to_vec()))
            .collect();

        let client = MqttClient::new("homie", &homie.mqtt, last_will, birth);
        let inbound = homie_in_tx.clone();
        tokio::spawn(async move {
            client.run(inbound, homie_req_rx).await;
        })
    });

    // Routing tables: vendor topic -> devices, homie device id -> device
    let mut devices_by_topic: HashMap<String, Vec<Arc<dyn Device>>> = HashMap::new();
    let mut devices_by_homie_id: HashMap<String, Arc<dyn Device>> = HashMap::new();
    for device in &devices {
        for topic in device.core().endpoint.topics() {
            devices_by_topic
                .entry(topic.to_string())
                .or_default()
                .push(device.clone());
        }
        if let Some(homie) = device.core().homie() {
            devices_by_homie_id.insert(homie.id().to_string(), device.clone());
        }
    }

    for device in &devices {
        device.start();
        devices::spawn_watchdog(device, config.heartbeat_timeout);
    }

    // Main loop: route vendor messages and Homie set requests + handle shutdown
    loop {
        tokio::select! {
            Some(msg) = vendor_in_rx.recv() => {
                match devices_by_topic.get(&msg.topic) {
                    Some(targets) => {
                        for device in targets {
                            if let Err(e) = device.on_message(&msg.topic, &msg.payload) {
                                warn!("Dropping message on {}: {}", msg.topic, e);
                            }
                        }
                    }
                    None => debug!("No device subscribed to {}", msg.topic),
                }
            }
            Some(msg) = homie_in_rx.recv() => {
                let Some(prefix) = &homie_prefix else { continue };
                match homie::parse_set_topic(&msg.topic, prefix) {
                    Some(request) => match devices_by_homie_id.get(request.device_id) {
                        Some(device) => {
                            debug!(
                                "Set request for {}/{}/{}",
                                request.device_id, request.node_id, request.property_id
                            );
                            let payload = String::from_utf8_lossy(&msg.payload);
                            device.on_set_request(request.property_id, &payload);
                        }
                        None => warn!("Unknown device in set topic: {}", request.device_id),
                    },
                    None => debug!("Ignoring homie message on {}", msg.topic),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    for device in &devices {
        device.stop();
    }
    // give the clients a moment to flush the final $state messages
    tokio::time::sleep(Duration::from_millis(500)).await;
    vendor_handle.abort();
    if let Some(handle) = homie_handle {
        handle.abort();
    }
    info!("ecoflow-to-homie bridge stopped");
}
