pub mod delta_max;
pub mod powerstream;
pub mod smart_plug;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, DeviceType};
use crate::connector::{Connector, FieldRef, PropertySink, PropertyValue};
use crate::ecoflow::envelope::{self, DecodedRecord, RecordPayload};
use crate::ecoflow::schema::{DecodedField, PayloadSchema, SchemaRegistry, Value};
use crate::error::DecodeError;
use crate::homie::HomieDevice;
use crate::message_logger::{LogEntry, MessageLogger};
use crate::mqtt::Transport;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Topics of one device, derived from its serial and the account's user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub serial: String,
    pub telemetry: String,
    pub set: String,
    pub set_reply: String,
    pub get: String,
    pub get_reply: String,
}

enum Route {
    Decode(Option<&'static str>),
    LogOnly(&'static str),
}

impl DeviceEndpoint {
    pub fn new(serial: &str, user_id: &str) -> Self {
        let thing = format!("/app/{user_id}/{serial}/thing/property");
        Self {
            serial: serial.to_string(),
            telemetry: format!("/app/device/property/{serial}"),
            set: format!("{thing}/set"),
            set_reply: format!("{thing}/set_reply"),
            get: format!("{thing}/get"),
            get_reply: format!("{thing}/get_reply"),
        }
    }

    pub fn topics(&self) -> [&str; 5] {
        [
            &self.telemetry,
            &self.set,
            &self.set_reply,
            &self.get,
            &self.get_reply,
        ]
    }

    fn route(&self, topic: &str) -> Option<Route> {
        if topic == self.telemetry {
            Some(Route::Decode(None))
        } else if topic == self.set {
            Some(Route::Decode(Some("SET")))
        } else if topic == self.get_reply {
            Some(Route::Decode(Some("GET REPLY")))
        } else if topic == self.set_reply {
            Some(Route::LogOnly("SET REPLY"))
        } else if topic == self.get {
            Some(Route::LogOnly("GET"))
        } else {
            None
        }
    }
}

pub struct HomieContext {
    pub prefix: String,
    pub transport: Arc<dyn Transport>,
}

/// Collaborators shared by every device of the process.
pub struct DeviceContext {
    pub user_id: String,
    pub transport: Arc<dyn Transport>,
    pub homie: Option<HomieContext>,
    pub logger: Option<Arc<MessageLogger>>,
}

/// State and plumbing common to all device families. Handlers registered on a
/// device's dispatcher receive this as their context.
pub struct DeviceCore {
    pub endpoint: DeviceEndpoint,
    pub name: String,
    pub registry: SchemaRegistry,
    pub connector: Connector,
    transport: Arc<dyn Transport>,
    logger: Option<Arc<MessageLogger>>,
    homie: Option<Arc<HomieDevice>>,
    last_heartbeat: Mutex<Option<Instant>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DeviceCore {
    /// `model` lists the schemas whose nodes and fields make up the published
    /// device; their derived sums are wired into the connector.
    pub fn new(
        config: &DeviceConfig,
        ctx: &DeviceContext,
        registry: SchemaRegistry,
        model: &[Arc<PayloadSchema>],
    ) -> Self {
        let homie = ctx.homie.as_ref().map(|homie| {
            Arc::new(HomieDevice::new(
                &homie.prefix,
                &config.serial.to_lowercase(),
                &config.name,
                model,
                homie.transport.clone(),
            ))
        });
        let derived = model
            .iter()
            .flat_map(|schema| schema.derived.iter().cloned())
            .collect();
        let sink = homie.clone().map(|h| h as Arc<dyn PropertySink>);

        Self {
            endpoint: DeviceEndpoint::new(&config.serial, &ctx.user_id),
            name: config.name.clone(),
            registry,
            connector: Connector::new(&config.serial, derived, sink),
            transport: ctx.transport.clone(),
            logger: ctx.logger.clone(),
            homie,
            last_heartbeat: Mutex::new(None),
            watchdog: Mutex::new(None),
        }
    }

    pub fn homie(&self) -> Option<&Arc<HomieDevice>> {
        self.homie.as_ref()
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        self.transport.publish(topic, payload, false);
    }

    /// Encode `value` into the single-field `schema` and send it as a set
    /// command on the device's set topic.
    pub fn send_set(&self, schema: &PayloadSchema, field: &str, value: i64, cmd_id: u32, cmd_func: u32) {
        let pdata = schema.encode(&[(field, Value::Int(value))]);
        info!(
            "{} set {} = {} (cmd_func {} cmd_id {})",
            self.endpoint.serial, field, value, cmd_func, cmd_id
        );
        let message = envelope::build(pdata, cmd_id, cmd_func, &self.endpoint.serial);
        self.publish(&self.endpoint.set, message);
    }

    pub fn mark_heartbeat(&self) {
        *lock(&self.last_heartbeat) = Some(Instant::now());
    }

    pub fn heartbeat_overdue(&self, timeout: Duration) -> bool {
        match *lock(&self.last_heartbeat) {
            Some(seen) => seen.elapsed() > timeout,
            None => true,
        }
    }

    fn log(&self, prefix: Option<&str>, record: Option<&DecodedRecord>, handled: bool, raw: &[u8]) {
        let Some(logger) = &self.logger else {
            return;
        };
        let entry = LogEntry {
            prefix,
            record,
            handled,
            raw,
        };
        if let Err(e) = logger.log(entry) {
            warn!("{}: failed to write raw log: {}", self.endpoint.serial, e);
        }
    }
}

/// Normalize decoded heartbeat fields and push them into the connector.
pub fn publish_fields(connector: &Connector, fields: &[DecodedField]) {
    for field in fields {
        let Some(raw) = PropertyValue::from_wire(&field.value) else {
            continue;
        };
        let rule = field.descriptor.rule();
        let (value, display) = rule.apply(raw);
        let unit = Some(rule.unit.as_str()).filter(|u| !u.is_empty());
        connector.update(FieldRef::Descriptor(&field.descriptor), value, unit, display);
    }
}

/// Parse a Homie set payload. Booleans map to 0/1.
pub fn parse_set_value(raw: &str) -> Option<f64> {
    match raw.trim() {
        "true" | "on" => Some(1.0),
        "false" | "off" => Some(0.0),
        other => other.parse::<f64>().ok().filter(|v| v.is_finite()),
    }
}

pub trait Device: Send + Sync {
    fn core(&self) -> &DeviceCore;

    /// Run the family's handlers for one record; returns whether any accepted it.
    fn dispatch(&self, record: &DecodedRecord) -> bool;

    /// A `/set` request from Homie, already routed to this device.
    fn on_set_request(&self, property_id: &str, payload: &str);

    fn request_data(&self) {
        let core = self.core();
        debug!("{} requesting data", core.endpoint.serial);
        core.publish(&core.endpoint.get, envelope::build_data_request());
    }

    fn on_message(&self, topic: &str, payload: &[u8]) -> Result<(), DecodeError> {
        let core = self.core();
        let serial = &core.endpoint.serial;
        let prefix = match core.endpoint.route(topic) {
            Some(Route::Decode(prefix)) => prefix,
            Some(Route::LogOnly(prefix)) => {
                core.log(Some(prefix), None, false, payload);
                return Ok(());
            }
            None => {
                error!("{} message for unhandled topic arrived {}", serial, topic);
                return Ok(());
            }
        };

        let decoded = envelope::decode(payload, serial, &core.registry, |record| {
            let handled = match &record.payload {
                RecordPayload::Status(status) => {
                    core.connector.update_status(*status);
                    true
                }
                _ => self.dispatch(&record),
            };
            if !handled {
                info!(
                    "{} no handler registered for cmd_func {} cmd {}",
                    serial,
                    record.cmd_func.map_or("-".to_string(), |f| f.to_string()),
                    record.cmd
                );
            }
            core.log(prefix, Some(&record), handled, payload);
        });
        if let Err(e) = decoded {
            error!("{} failed to decode message on {}: {}", serial, topic, e);
            core.log(Some("ERROR"), None, false, payload);
            return Err(e);
        }
        Ok(())
    }

    /// Subscribe the device topics, publish the Homie description and ask for
    /// a first snapshot.
    fn start(&self) {
        let core = self.core();
        for topic in core.endpoint.topics() {
            core.transport.subscribe(topic);
        }
        if let Some(homie) = &core.homie {
            homie.start();
        }
        info!("{} ({}) started", core.name, core.endpoint.serial);
        self.request_data();
    }

    fn stop(&self) {
        let core = self.core();
        if let Some(handle) = lock(&core.watchdog).take() {
            handle.abort();
        }
        for topic in core.endpoint.topics() {
            core.transport.unsubscribe(topic);
        }
        if let Some(homie) = &core.homie {
            homie.stop();
        }
        info!("{} ({}) stopped", core.name, core.endpoint.serial);
    }
}

pub fn create(config: &DeviceConfig, ctx: &DeviceContext) -> Arc<dyn Device> {
    match config.device_type {
        DeviceType::Powerstream => Arc::new(powerstream::Powerstream::new(config, ctx)),
        DeviceType::SmartPlug => Arc::new(smart_plug::SmartPlug::new(config, ctx)),
        DeviceType::DeltaMax => Arc::new(delta_max::DeltaMax::new(config, ctx)),
    }
}

/// Re-request data whenever the device has been silent for `timeout`. The
/// task is owned by the device and aborted by [`Device::stop`].
pub fn spawn_watchdog(device: &Arc<dyn Device>, timeout: Duration) {
    let weak: Weak<dyn Device> = Arc::downgrade(device);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        // first tick completes immediately; start() already requested data
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(device) = weak.upgrade() else {
                break;
            };
            if device.core().heartbeat_overdue(timeout) {
                info!(
                    "{} no heartbeat within {}s, requesting data",
                    device.core().endpoint.serial,
                    timeout.as_secs()
                );
                device.request_data();
            }
        }
    });
    if let Some(previous) = lock(&device.core().watchdog).replace(handle) {
        previous.abort();
    }
}
