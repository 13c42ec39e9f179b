use tracing::{debug, error};

use super::{Device, DeviceContext, DeviceCore, parse_set_value, publish_fields};
use crate::config::DeviceConfig;
use crate::ecoflow::dispatch::Dispatcher;
use crate::ecoflow::envelope::{Command, DecodedRecord};
use crate::ecoflow::schema::SchemaRegistry;
use crate::ecoflow::{PLUG_MAX_WATTS_LIMIT, cmd_func, cmd_id, schemas};

const MAX_BRIGHTNESS: i64 = 1023;

pub struct SmartPlug {
    core: DeviceCore,
    dispatcher: Dispatcher<DeviceCore>,
}

impl SmartPlug {
    pub fn new(config: &DeviceConfig, ctx: &DeviceContext) -> Self {
        let heartbeat = schemas::plug_heartbeat();
        let mut registry = SchemaRegistry::default();
        registry.register(
            cmd_func::SMART_PLUG,
            &[cmd_id::PLUG_HEARTBEAT, cmd_id::HEARTBEAT_REPLY],
            &heartbeat,
        );

        let core = DeviceCore::new(config, ctx, registry, &[heartbeat]);
        let mut dispatcher = Dispatcher::new(cmd_func::SMART_PLUG);
        dispatcher.on(
            &[Command::Id(cmd_id::PLUG_HEARTBEAT), Command::Id(cmd_id::HEARTBEAT_REPLY)],
            None,
            |core: &DeviceCore, record: &DecodedRecord| {
                core.mark_heartbeat();
                if let Some(fields) = record.fields() {
                    publish_fields(&core.connector, fields);
                }
            },
        );

        Self { core, dispatcher }
    }
}

impl Device for SmartPlug {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn dispatch(&self, record: &DecodedRecord) -> bool {
        self.dispatcher.dispatch(&self.core, record)
    }

    fn on_set_request(&self, property_id: &str, payload: &str) {
        let serial = &self.core.endpoint.serial;
        debug!("{} received set-request for {} with value: {}", serial, property_id, payload);
        let Some(value) = parse_set_value(payload) else {
            error!("{} invalid value for {}: {}", serial, property_id, payload);
            return;
        };
        let value = value.round() as i64;
        let (schema, field, value, cmd) = match property_id {
            "switch" => {
                if !(0..=1).contains(&value) {
                    error!("{} invalid switch value: {}", serial, payload);
                    return;
                }
                (schemas::plug_switch_pack(), "plugSwitch", value, cmd_id::SET_PLUG_SWITCH)
            }
            "brightness" => (
                schemas::brightness_pack(),
                "brightness",
                value.clamp(0, MAX_BRIGHTNESS),
                cmd_id::SET_PLUG_BRIGHTNESS,
            ),
            "max-watts" => (
                schemas::max_watts_pack(),
                "maxWatts",
                value.clamp(0, PLUG_MAX_WATTS_LIMIT),
                cmd_id::SET_MAX_WATTS,
            ),
            other => {
                error!("{} unhandled set_request for {}", serial, other);
                return;
            }
        };
        self.core
            .send_set(&schema, field, value, cmd, cmd_func::SMART_PLUG);
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::config::DeviceType;
    use crate::devices::testing::{Harness, device_config};
    use crate::ecoflow::envelope::{Header, HeaderMessage};
    use crate::ecoflow::schema::{Value, find};

    const TELEMETRY: &str = "/app/device/property/HW52PLUG";
    const SET: &str = "/app/1234567/HW52PLUG/thing/property/set";

    fn plug(harness: &Harness) -> SmartPlug {
        SmartPlug::new(&device_config("HW52PLUG", DeviceType::SmartPlug), &harness.ctx)
    }

    fn last_set(harness: &Harness) -> Header {
        let raw = harness.vendor.published_to(SET).pop().expect("no set command sent");
        HeaderMessage::decode(raw.as_slice()).unwrap().header.remove(0)
    }

    #[test]
    fn test_heartbeat() {
        let harness = Harness::new();
        let device = plug(&harness);
        let pdata = schemas::plug_heartbeat().encode(&[
            ("watts", Value::Int(456)),
            ("current", Value::Int(2500)),
            ("switch", Value::Bool(true)),
            ("maxWatts", Value::Int(1800)),
        ]);
        let raw = HeaderMessage {
            header: vec![Header {
                cmd_func: cmd_func::SMART_PLUG as i32,
                cmd_id: cmd_id::PLUG_HEARTBEAT as i32,
                pdata,
                ..Default::default()
            }],
        }
        .encode_to_vec();
        device.on_message(TELEMETRY, &raw).unwrap();

        let text = |suffix: &str| harness.homie.last_text(&format!("homie/hw52plug/plug/{suffix}"));
        assert_eq!(text("watts").as_deref(), Some("45.6"));
        assert_eq!(text("current").as_deref(), Some("2.5"));
        assert_eq!(text("switch").as_deref(), Some("true"));
        assert_eq!(text("max-watts").as_deref(), Some("1800"));
    }

    #[test]
    fn test_switch_accepts_only_on_off() {
        let harness = Harness::new();
        let device = plug(&harness);
        device.on_set_request("switch", "2");
        assert!(harness.vendor.published_to(SET).is_empty());

        device.on_set_request("switch", "true");
        let header = last_set(&harness);
        assert_eq!(header.cmd_func, cmd_func::SMART_PLUG as i32);
        assert_eq!(header.cmd_id, cmd_id::SET_PLUG_SWITCH as i32);
        let fields = schemas::plug_switch_pack().decode(&header.pdata).unwrap();
        assert_eq!(find(&fields, "plugSwitch"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_brightness_and_max_watts_are_clamped() {
        let harness = Harness::new();
        let device = plug(&harness);

        device.on_set_request("brightness", "5000");
        let header = last_set(&harness);
        let fields = schemas::brightness_pack().decode(&header.pdata).unwrap();
        assert_eq!(find(&fields, "brightness"), Some(&Value::Int(1023)));

        device.on_set_request("max-watts", "3000");
        let header = last_set(&harness);
        assert_eq!(header.cmd_id, cmd_id::SET_MAX_WATTS as i32);
        let fields = schemas::max_watts_pack().decode(&header.pdata).unwrap();
        assert_eq!(find(&fields, "maxWatts"), Some(&Value::Int(2500)));
    }
}
