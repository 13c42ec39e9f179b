//! Powerstream micro-inverter: binary heartbeats, daily energy reports and
//! the settings that can be changed from Homie.

use std::sync::Arc;

use tracing::{debug, error};

use super::{Device, DeviceContext, DeviceCore, parse_set_value, publish_fields};
use crate::config::DeviceConfig;
use crate::connector::{FieldRef, PropertyValue};
use crate::ecoflow::dispatch::Dispatcher;
use crate::ecoflow::envelope::{Command, DecodedRecord};
use crate::ecoflow::schema::{PayloadSchema, SchemaRegistry, Value, find};
use crate::ecoflow::{cmd_func, cmd_id, schemas};

const DEFAULT_RATED_POWER: f64 = 800.0;
/// Hourly energy counters come in blocks of one day.
const HOURS_PER_BLOCK: usize = 24;
const BLOCK_TOTAL: usize = 0;
const BLOCK_FROM_BATTERY: usize = 3;

pub struct Powerstream {
    core: DeviceCore,
    dispatcher: Dispatcher<DeviceCore>,
}

impl Powerstream {
    pub fn new(config: &DeviceConfig, ctx: &DeviceContext) -> Self {
        let heartbeat = schemas::inverter_heartbeat();
        let totals = schemas::energy_totals();

        let mut registry = SchemaRegistry::default();
        registry.register(
            cmd_func::POWERSTREAM,
            &[cmd_id::HEARTBEAT, cmd_id::HEARTBEAT_REPLY],
            &heartbeat,
        );
        registry.register(
            cmd_func::POWERSTREAM,
            &[cmd_id::SET_PERMANENT_WATTS],
            &schemas::set_value(),
        );
        registry.register(cmd_func::APP, &[cmd_id::APP_SET_VALUE], &schemas::set_value());
        registry.register(
            cmd_func::REPORTS,
            &[cmd_id::ENERGY_TOTAL_REPORT],
            &schemas::energy_total_report(),
        );

        let core = DeviceCore::new(config, ctx, registry, &[heartbeat, totals.clone()]);

        let mut dispatcher = Dispatcher::new(cmd_func::POWERSTREAM);
        dispatcher.on(
            &[Command::Id(cmd_id::HEARTBEAT), Command::Id(cmd_id::HEARTBEAT_REPLY)],
            None,
            handle_heartbeat,
        );
        dispatcher.on(
            &[Command::Id(cmd_id::ENERGY_TOTAL_REPORT)],
            Some(cmd_func::REPORTS),
            move |core, record| handle_energy_total_report(core, &totals, record),
        );

        Self { core, dispatcher }
    }

    fn send(&self, schema: Arc<PayloadSchema>, field: &str, value: i64, cmd_id: u32) {
        self.core
            .send_set(&schema, field, value, cmd_id, cmd_func::POWERSTREAM);
    }

    fn set_output_power(&self, watts: f64) {
        let rated = self
            .core
            .connector
            .get_f64("ratedPower", DEFAULT_RATED_POWER)
            .max(0.0);
        let limit = (rated * 10.0).round() as i64;
        let value = ((watts * 10.0).round() as i64).clamp(0, limit);
        self.send(
            schemas::permanent_watts_pack(),
            "permanentWatts",
            value,
            cmd_id::SET_PERMANENT_WATTS,
        );
    }

    fn set_bat_lower(&self, limit: f64) {
        let value = (limit.round() as i64).clamp(0, 30);
        self.send(schemas::bat_lower_pack(), "lowerLimit", value, cmd_id::SET_BAT_LOWER);
    }

    fn set_bat_upper(&self, limit: f64) {
        let value = (limit.round() as i64).clamp(50, 100);
        self.send(schemas::bat_upper_pack(), "upperLimit", value, cmd_id::SET_BAT_UPPER);
    }

    fn set_brightness(&self, brightness: f64) {
        let value = (brightness.round() as i64).clamp(0, 100);
        self.send(schemas::brightness_pack(), "brightness", value, cmd_id::SET_BRIGHTNESS);
    }

    fn set_supply_priority(&self, priority: f64) {
        if !(0.0..=1.0).contains(&priority) {
            error!(
                "{} invalid supply priority: {}",
                self.core.endpoint.serial, priority
            );
            return;
        }
        self.send(
            schemas::set_value(),
            "value",
            priority.round() as i64,
            cmd_id::SET_SUPPLY_PRIORITY,
        );
    }
}

impl Device for Powerstream {
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
        match property_id {
            "permanent-watts" => self.set_output_power(value),
            "upper-limit" => self.set_bat_upper(value),
            "lower-limit" => self.set_bat_lower(value),
            "inv-brightness" => self.set_brightness(value),
            "supply-priority" => self.set_supply_priority(value),
            other => error!("{} unhandled set_request for {}", serial, other),
        }
    }
}

fn handle_heartbeat(core: &DeviceCore, record: &DecodedRecord) {
    core.mark_heartbeat();
    if let Some(fields) = record.fields() {
        publish_fields(&core.connector, fields);
    }
}

fn handle_energy_total_report(core: &DeviceCore, totals: &PayloadSchema, record: &DecodedRecord) {
    let Some(fields) = record.fields() else {
        return;
    };
    let Some(Value::List(watth)) = find(fields, "watthItem").and_then(|item| item.get("watth"))
    else {
        debug!("{} energy report without hourly values", core.endpoint.serial);
        return;
    };

    let mut sums = vec![0i64; watth.len().div_ceil(HOURS_PER_BLOCK).max(BLOCK_FROM_BATTERY + 1)];
    for (hour, value) in watth.iter().enumerate() {
        sums[hour / HOURS_PER_BLOCK] += value.as_i64().unwrap_or(0);
    }

    let total = sums[BLOCK_TOTAL];
    let from_battery = sums[BLOCK_FROM_BATTERY];
    update_if_changed(core, totals, "todayTotal", total);
    update_if_changed(core, totals, "todayFromBattery", from_battery);
    update_if_changed(core, totals, "todayFromSolar", total - from_battery);
}

fn update_if_changed(core: &DeviceCore, totals: &PayloadSchema, name: &str, value: i64) {
    let value = PropertyValue::Integer(value);
    if core.connector.get(name).as_ref() == Some(&value) {
        return;
    }
    if let Some(descriptor) = totals.field(name) {
        core.connector
            .update(FieldRef::Descriptor(descriptor), value, Some("Wh"), None);
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;
    use crate::config::DeviceType;
    use crate::devices::testing::{Harness, device_config};
    use crate::ecoflow::envelope::{Header, HeaderMessage};
    use crate::ecoflow::schema::{DecodedField, FieldKind};
    use crate::message_logger::{LogMode, MessageLogger};

    const SERIAL: &str = "HW51TEST";
    const TELEMETRY: &str = "/app/device/property/HW51TEST";
    const SET: &str = "/app/1234567/HW51TEST/thing/property/set";

    fn powerstream(harness: &Harness) -> Powerstream {
        Powerstream::new(&device_config(SERIAL, DeviceType::Powerstream), &harness.ctx)
    }

    fn header(cmd_func: u32, cmd_id: u32, pdata: Vec<u8>) -> Header {
        Header {
            cmd_func: cmd_func as i32,
            cmd_id: cmd_id as i32,
            data_len: pdata.len() as i32,
            pdata,
            device_sn: SERIAL.to_string(),
            ..Default::default()
        }
    }

    fn envelope(headers: Vec<Header>) -> Vec<u8> {
        HeaderMessage { header: headers }.encode_to_vec()
    }

    fn heartbeat(values: &[(&str, Value)]) -> Vec<u8> {
        let pdata = schemas::inverter_heartbeat().encode(values);
        envelope(vec![header(cmd_func::POWERSTREAM, cmd_id::HEARTBEAT, pdata)])
    }

    /// Decode the last set command sent to the device.
    fn last_set(harness: &Harness, schema: Arc<PayloadSchema>, field: &str) -> (Header, Option<Value>) {
        let raw = harness.vendor.published_to(SET).pop().expect("no set command sent");
        let mut message = HeaderMessage::decode(raw.as_slice()).unwrap();
        let header = message.header.remove(0);
        let fields = schema.decode(&header.pdata).unwrap();
        let value = find(&fields, field).cloned();
        (header, value)
    }

    #[test]
    fn test_heartbeat_publishes_normalized_fields_and_pv_total() {
        let harness = Harness::new();
        let device = powerstream(&harness);
        device
            .on_message(
                TELEMETRY,
                &heartbeat(&[
                    ("pv1InputWatts", Value::Int(1234)),
                    ("pv2InputWatts", Value::Int(100)),
                    ("batSoc", Value::Int(87)),
                    ("invFreq", Value::Int(500)),
                ]),
            )
            .unwrap();

        let text = |suffix: &str| harness.homie.last_text(&format!("homie/hw51test/{suffix}"));
        assert_eq!(text("pv1/pv1-input-watts").as_deref(), Some("123.4"));
        assert_eq!(text("pv2/pv2-input-watts").as_deref(), Some("10"));
        assert_eq!(text("pv/pv-input-watts").as_deref(), Some("133.4"));
        assert_eq!(text("battery/bat-soc").as_deref(), Some("87"));
        assert_eq!(text("inverter/inv-freq").as_deref(), Some("50"));
        assert!(!device.core().heartbeat_overdue(std::time::Duration::from_secs(120)));
    }

    #[test]
    fn test_unregistered_record_is_unhandled() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new();
        harness.ctx.logger = Some(Arc::new(
            MessageLogger::new(LogMode::Unhandled, dir.path()).unwrap(),
        ));
        let device = powerstream(&harness);

        let pdata = schemas::inverter_heartbeat().encode(&[("batSoc", Value::Int(55))]);
        let raw = envelope(vec![
            header(cmd_func::POWERSTREAM, cmd_id::HEARTBEAT, pdata),
            header(cmd_func::POWERSTREAM, 99, vec![0x08, 0x01]),
        ]);
        device.on_message(TELEMETRY, &raw).unwrap();

        assert_eq!(
            harness.homie.last_text("homie/hw51test/battery/bat-soc").as_deref(),
            Some("55")
        );
        assert!(!dir.path().join("20-1.RAW").exists());
        let logged = std::fs::read_to_string(dir.path().join("20-99.RAW")).unwrap();
        assert!(logged.contains("0801"));
    }

    #[test]
    fn test_records_before_a_truncated_payload_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new();
        harness.ctx.logger = Some(Arc::new(
            MessageLogger::new(LogMode::All, dir.path()).unwrap(),
        ));
        let device = powerstream(&harness);

        let pdata = schemas::inverter_heartbeat().encode(&[("batSoc", Value::Int(55))]);
        let raw = envelope(vec![
            header(cmd_func::POWERSTREAM, cmd_id::HEARTBEAT, pdata),
            header(cmd_func::POWERSTREAM, cmd_id::HEARTBEAT_REPLY, vec![0x0a, 0x05, 0x01]),
        ]);
        assert!(device.on_message(TELEMETRY, &raw).is_err());

        assert_eq!(
            harness.homie.last_text("homie/hw51test/battery/bat-soc").as_deref(),
            Some("55")
        );
        assert!(dir.path().join("20-1.RAW").exists());
        assert!(dir.path().join("ERROR_binary.RAW").exists());
    }

    #[test]
    fn test_permanent_watts_clamps_to_rated_power() {
        let harness = Harness::new();
        let device = powerstream(&harness);

        device.on_set_request("permanent-watts", "900");
        let (header, value) = last_set(&harness, schemas::permanent_watts_pack(), "permanentWatts");
        assert_eq!(value, Some(Value::Int(8000)));
        assert_eq!(header.cmd_func, cmd_func::POWERSTREAM as i32);
        assert_eq!(header.cmd_id, cmd_id::SET_PERMANENT_WATTS as i32);
        assert_eq!(header.device_sn, SERIAL);
        assert_eq!(header.need_ack, 1);

        device.on_set_request("permanent-watts", "-5");
        let (_, value) = last_set(&harness, schemas::permanent_watts_pack(), "permanentWatts");
        assert_eq!(value, Some(Value::Int(0)));

        device.on_set_request("permanent-watts", "123.4");
        let (_, value) = last_set(&harness, schemas::permanent_watts_pack(), "permanentWatts");
        assert_eq!(value, Some(Value::Int(1234)));
    }

    #[test]
    fn test_permanent_watts_uses_reported_rated_power() {
        let harness = Harness::new();
        let device = powerstream(&harness);
        device
            .on_message(TELEMETRY, &heartbeat(&[("ratedPower", Value::Int(6000))]))
            .unwrap();

        device.on_set_request("permanent-watts", "900");
        let (_, value) = last_set(&harness, schemas::permanent_watts_pack(), "permanentWatts");
        assert_eq!(value, Some(Value::Int(6000)));
    }

    #[test]
    fn test_battery_limits_are_clamped() {
        let harness = Harness::new();
        let device = powerstream(&harness);

        device.on_set_request("upper-limit", "10");
        let (header, value) = last_set(&harness, schemas::bat_upper_pack(), "upperLimit");
        assert_eq!(value, Some(Value::Int(50)));
        assert_eq!(header.cmd_id, cmd_id::SET_BAT_UPPER as i32);

        device.on_set_request("upper-limit", "150");
        let (_, value) = last_set(&harness, schemas::bat_upper_pack(), "upperLimit");
        assert_eq!(value, Some(Value::Int(100)));

        device.on_set_request("lower-limit", "45");
        let (header, value) = last_set(&harness, schemas::bat_lower_pack(), "lowerLimit");
        assert_eq!(value, Some(Value::Int(30)));
        assert_eq!(header.cmd_id, cmd_id::SET_BAT_LOWER as i32);

        device.on_set_request("inv-brightness", "250");
        let (_, value) = last_set(&harness, schemas::brightness_pack(), "brightness");
        assert_eq!(value, Some(Value::Int(100)));
    }

    #[test]
    fn test_invalid_requests_are_not_sent() {
        let harness = Harness::new();
        let device = powerstream(&harness);

        device.on_set_request("supply-priority", "2");
        device.on_set_request("upper-limit", "high");
        device.on_set_request("rated-power", "500");
        assert!(harness.vendor.published_to(SET).is_empty());

        device.on_set_request("supply-priority", "1");
        let (header, value) = last_set(&harness, schemas::set_value(), "value");
        assert_eq!(value, Some(Value::Int(1)));
        assert_eq!(header.cmd_id, cmd_id::SET_SUPPLY_PRIORITY as i32);
    }

    #[test]
    fn test_energy_report_sums_blocks() {
        let harness = Harness::new();
        let device = powerstream(&harness);

        let mut watth = vec![Value::Int(0); HOURS_PER_BLOCK * 6];
        for hour in 0..HOURS_PER_BLOCK {
            watth[hour] = Value::Int(10);
            watth[3 * HOURS_PER_BLOCK + hour] = Value::Int(2);
        }
        let report = schemas::energy_total_report();
        let item = match &report.field("watthItem").unwrap().kind {
            FieldKind::Message(item) => item.clone(),
            _ => unreachable!(),
        };
        let member = |name: &str, value| DecodedField {
            descriptor: item.field(name).unwrap().clone(),
            value,
        };
        let pdata = report.encode(&[
            ("watthType", Value::Int(1)),
            (
                "watthItem",
                Value::Message(vec![
                    member("watthType", Value::Int(1)),
                    member("watth", Value::List(watth)),
                ]),
            ),
        ]);
        let raw = envelope(vec![header(
            cmd_func::REPORTS,
            cmd_id::ENERGY_TOTAL_REPORT,
            pdata,
        )]);

        device.on_message(TELEMETRY, &raw).unwrap();
        let text = |suffix: &str| harness.homie.last_text(&format!("homie/hw51test/energy/{suffix}"));
        assert_eq!(text("today-total").as_deref(), Some("240"));
        assert_eq!(text("today-from-battery").as_deref(), Some("48"));
        assert_eq!(text("today-from-solar").as_deref(), Some("192"));

        // unchanged totals are not republished
        device.on_message(TELEMETRY, &raw).unwrap();
        assert_eq!(
            harness.homie.published_to("homie/hw51test/energy/today-total").len(),
            1
        );
    }
}
