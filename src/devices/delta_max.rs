//! Delta Max power station. Speaks JSON only; which quotas get published, and
//! how, is read from the device's field table in the devices file.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Value as Json, json};
use tracing::{debug, warn};

use super::{Device, DeviceContext, DeviceCore};
use crate::config::{DeviceConfig, PropertyConfig};
use crate::connector::{Connector, FieldRef, PropertyValue};
use crate::ecoflow::cmd_func;
use crate::ecoflow::dispatch::Dispatcher;
use crate::ecoflow::envelope::{self, Command, DecodedRecord, RecordPayload};
use crate::ecoflow::schema::{
    FieldDescriptor, FieldKind, NodeSpec, PayloadSchema, SchemaRegistry, property_id,
};
use crate::ecoflow::units::{self, Converter};

pub struct DeltaMax {
    core: DeviceCore,
    dispatcher: Dispatcher<DeviceCore>,
}

impl DeltaMax {
    pub fn new(config: &DeviceConfig, ctx: &DeviceContext) -> Self {
        let table = table_schema(&config.properties);
        let core = DeviceCore::new(config, ctx, SchemaRegistry::default(), &[table.clone()]);

        let mut dispatcher = Dispatcher::new(cmd_func::DEFAULT);
        dispatcher.on(
            &[
                Command::Id(0),
                Command::Named("latestQuotas".to_string()),
                Command::Named("params".to_string()),
            ],
            None,
            move |core: &DeviceCore, record: &DecodedRecord| {
                if let RecordPayload::Json(message) = &record.payload {
                    handle_quotas(&core.connector, &table, message);
                }
            },
        );
        dispatcher.on_unhandled(|core: &DeviceCore, record: &DecodedRecord| {
            debug!("{} ignoring {:?} message", core.endpoint.serial, record.cmd);
        });
        // any reply proves the station is online
        dispatcher.on_all(|core: &DeviceCore, _: &DecodedRecord| core.mark_heartbeat());

        Self { core, dispatcher }
    }
}

impl Device for DeltaMax {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn dispatch(&self, record: &DecodedRecord) -> bool {
        self.dispatcher.dispatch(&self.core, record)
    }

    fn on_set_request(&self, property_id: &str, payload: &str) {
        warn!(
            "{} has no settable properties, ignoring {} = {}",
            self.core.endpoint.serial, property_id, payload
        );
    }

    fn request_data(&self) {
        let core = self.core();
        let message = json!({
            "from": "Android",
            "id": envelope::generate_seq().to_string(),
            "moduleType": 0,
            "operateType": "latestQuotas",
            "params": {},
            "version": "1.0",
        });
        debug!("{} requesting latest quotas", core.endpoint.serial);
        core.publish(&core.endpoint.get, message.to_string().into_bytes());
    }
}

/// Turn the configured field table into a schema so the Homie description and
/// the normalization overrides come from one place.
fn table_schema(properties: &HashMap<String, PropertyConfig>) -> Arc<PayloadSchema> {
    let sorted: BTreeMap<&String, &PropertyConfig> = properties.iter().collect();
    let mut fields = Vec::with_capacity(sorted.len());
    let mut nodes: Vec<NodeSpec> = Vec::new();

    for (tag, (name, config)) in (1u32..).zip(sorted) {
        let node_name = config
            .node
            .clone()
            .or_else(|| name.split_once('.').map(|(node, _)| node.to_string()))
            .unwrap_or_else(|| "device".to_string());
        let node = property_id(&node_name);
        if !nodes.iter().any(|n| n.id == node) {
            nodes.push(NodeSpec::new(&node, &node_name));
        }

        let mut descriptor = FieldDescriptor::new(tag, name, FieldKind::Int).node(&node);
        if let Some(unit) = &config.unit {
            descriptor = descriptor.unit(unit);
        }
        if let Some(divisor) = config.divisor {
            descriptor = descriptor.divisor(divisor);
        }
        if let Some(display) = &config.name {
            descriptor = descriptor.display_name(display);
            descriptor.id = Some(property_id(display));
        }
        match config.converter.as_deref() {
            Some("minutes") => descriptor.converter = Some(Converter::MinutesToClock),
            Some(other) => warn!("unknown converter {} for {}", other, name),
            None => {}
        }
        fields.push(descriptor);
    }

    Arc::new(PayloadSchema::new("DeltaMaxQuotas", fields).with_nodes(nodes))
}

/// Push every non-null quota of a `params` or `latestQuotas` message into the
/// connector. Quotas missing from the table are stored but not published.
fn handle_quotas(connector: &Connector, table: &PayloadSchema, message: &Json) {
    let data = message
        .get("params")
        .or_else(|| message.get("data").and_then(|data| data.get("quotaMap")));
    let Some(Json::Object(data)) = data else {
        debug!("message without quota data");
        return;
    };

    for (name, raw) in data {
        let Some(raw) = PropertyValue::from_json(raw) else {
            continue;
        };
        match table.field(name) {
            Some(descriptor) => {
                let rule = descriptor.rule();
                let (value, display) = rule.apply(raw);
                let unit = Some(rule.unit.as_str()).filter(|u| !u.is_empty());
                connector.update(FieldRef::Descriptor(descriptor), value, unit, display);
            }
            None => {
                let rule = units::resolve(name);
                let (value, display) = rule.apply(raw);
                let unit = Some(rule.unit.as_str()).filter(|u| !u.is_empty());
                connector.update(FieldRef::Internal(name), value, unit, display);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceType;
    use crate::connector::PropertySink;
    use crate::connector::tests::RecordingSink;
    use crate::devices::testing::{Harness, device_config};

    fn properties() -> HashMap<String, PropertyConfig> {
        serde_json::from_str(
            r#"{
                "pd.remainTime": {"converter": "minutes", "node": "pd", "name": "remainTime"},
                "bmsMaster.vol": {"divisor": 1000, "unit": "V", "node": "bmsMaster", "name": "vol"},
                "bmsMaster.soc": {"unit": "%", "node": "bmsMaster", "name": "soc"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_table_schema() {
        let schema = table_schema(&properties());
        let ids: Vec<&str> = schema.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["bms-master", "pd"]);
        assert_eq!(schema.nodes[0].name, "bmsMaster");
        let vol = schema.field("bmsMaster.vol").unwrap();
        assert!(vol.is_float());
        assert_eq!(vol.property_id(), "vol");
        assert_eq!(vol.rule().unit, "V");
    }

    #[test]
    fn test_minutes_display_keeps_raw_value() {
        let sink = Arc::new(RecordingSink::default());
        let connector = Connector::new("R331TEST", vec![], Some(sink.clone() as Arc<dyn PropertySink>));
        let table = table_schema(&properties());

        handle_quotas(
            &connector,
            &table,
            &json!({"params": {"pd.remainTime": 125, "bmsMaster.vol": 52000, "pd.carWatts": 345, "ems.x": null}}),
        );

        assert_eq!(connector.get("pd.remainTime"), Some(PropertyValue::Integer(125)));
        let remain = sink.last("pd.remainTime").unwrap();
        assert_eq!(remain.display.as_deref(), Some("02:05"));
        assert_eq!(remain.value, PropertyValue::Integer(125));

        let vol = sink.last("bmsMaster.vol").unwrap();
        assert_eq!(vol.value, PropertyValue::Float(52.0));
        assert_eq!(vol.unit.as_deref(), Some("V"));

        // not in the table: stored, normalized by name, never published
        assert_eq!(connector.get("pd.carWatts"), Some(PropertyValue::Float(34.5)));
        assert!(sink.last("pd.carWatts").is_none());
        assert!(connector.get("ems.x").is_none());
    }

    #[test]
    fn test_latest_quotas_reply_is_published() {
        let harness = Harness::new();
        let mut config = device_config("R331TEST", DeviceType::DeltaMax);
        config.properties = properties();
        let device = DeltaMax::new(&config, &harness.ctx);

        let reply = json!({
            "operateType": "latestQuotas",
            "data": {"quotaMap": {"bmsMaster.soc": 81, "pd.remainTime": 61}}
        });
        device
            .on_message(
                "/app/1234567/R331TEST/thing/property/get_reply",
                reply.to_string().as_bytes(),
            )
            .unwrap();

        assert_eq!(
            harness.homie.last_text("homie/r331test/bms-master/soc").as_deref(),
            Some("81")
        );
        assert_eq!(
            harness.homie.last_text("homie/r331test/pd/remain-time").as_deref(),
            Some("61")
        );
        assert!(!device.core().heartbeat_overdue(std::time::Duration::from_secs(120)));
    }

    #[test]
    fn test_request_data_asks_for_latest_quotas() {
        let harness = Harness::new();
        let device = DeltaMax::new(&device_config("R331TEST", DeviceType::DeltaMax), &harness.ctx);
        device.request_data();

        let sent = harness
            .vendor
            .published_to("/app/1234567/R331TEST/thing/property/get")
            .pop()
            .unwrap();
        let message: Json = serde_json::from_slice(&sent).unwrap();
        assert_eq!(message["operateType"], "latestQuotas");
        assert_eq!(message["from"], "Android");
    }
}
