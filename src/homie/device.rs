use std::sync::Arc;

use tracing::{debug, error, info};

use super::State;
use crate::connector::{PropertySink, PropertyUpdate};
use crate::ecoflow::schema::{FieldDescriptor, FieldKind, NodeSpec, PayloadSchema, property_id};
use crate::mqtt::Transport;

struct Property {
    id: String,
    name: String,
    datatype: &'static str,
    unit: String,
    settable: bool,
}

struct Node {
    spec: NodeSpec,
    properties: Vec<Property>,
}

/// One device in the Homie v4 topic tree, built from the payload schemas'
/// node and field metadata.
pub struct HomieDevice {
    prefix: String,
    id: String,
    name: String,
    nodes: Vec<Node>,
    transport: Arc<dyn Transport>,
}

fn datatype(descriptor: &FieldDescriptor) -> &'static str {
    match descriptor.kind {
        FieldKind::Bool => "boolean",
        FieldKind::Text => "string",
        _ if descriptor.is_float() => "float",
        _ => "integer",
    }
}

impl HomieDevice {
    pub fn new(
        prefix: &str,
        id: &str,
        name: &str,
        model: &[Arc<PayloadSchema>],
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mut nodes: Vec<Node> = Vec::new();
        for spec in model.iter().flat_map(|schema| schema.nodes.iter()) {
            if !nodes.iter().any(|n| n.spec.id == spec.id) {
                nodes.push(Node {
                    spec: spec.clone(),
                    properties: Vec::new(),
                });
            }
        }

        let mut add = |node_id: &str, property: Property| {
            match nodes.iter_mut().find(|n| n.spec.id == node_id) {
                Some(node) => {
                    if !node.properties.iter().any(|p| p.id == property.id) {
                        node.properties.push(property);
                    }
                }
                None => error!(
                    "node {} does not exist, property {} will not be mapped to homie",
                    node_id, property.id
                ),
            }
        };

        for schema in model {
            for field in &schema.fields {
                let Some(node_id) = &field.node else {
                    continue;
                };
                add(
                    node_id,
                    Property {
                        id: field.property_id(),
                        name: field.display_name.clone().unwrap_or_else(|| field.name.clone()),
                        datatype: datatype(field),
                        unit: field.rule().unit,
                        settable: field.settable,
                    },
                );
            }
            for derived in &schema.derived {
                add(
                    &derived.node,
                    Property {
                        id: property_id(&derived.name),
                        name: derived
                            .display_name
                            .clone()
                            .unwrap_or_else(|| derived.name.clone()),
                        datatype: "float",
                        unit: derived.unit.clone(),
                        settable: false,
                    },
                );
            }
        }

        Self {
            prefix: prefix.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            nodes,
            transport,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.id, suffix)
    }

    pub fn state_topic(&self) -> String {
        self.topic("$state")
    }

    fn publish(&self, suffix: &str, value: &str) {
        self.transport
            .publish(&self.topic(suffix), value.as_bytes().to_vec(), true);
    }

    fn set_state(&self, state: State) {
        self.publish("$state", state.as_str());
    }

    fn set_topics(&self) -> impl Iterator<Item = String> + '_ {
        self.nodes.iter().flat_map(move |node| {
            node.properties
                .iter()
                .filter(|p| p.settable)
                .map(move |p| self.topic(&format!("{}/{}/set", node.spec.id, p.id)))
        })
    }

    /// Publish the device description and subscribe to settable properties.
    pub fn start(&self) {
        self.publish("$homie", "4.0");
        self.publish("$name", &self.name);
        self.set_state(State::Init);

        let node_ids: Vec<&str> = self.nodes.iter().map(|n| n.spec.id.as_str()).collect();
        self.publish("$nodes", &node_ids.join(","));

        for node in &self.nodes {
            let id = &node.spec.id;
            self.publish(&format!("{id}/$name"), &node.spec.name);
            self.publish(&format!("{id}/$type"), &node.spec.node_type);
            let property_ids: Vec<&str> = node.properties.iter().map(|p| p.id.as_str()).collect();
            self.publish(&format!("{id}/$properties"), &property_ids.join(","));

            for property in &node.properties {
                let base = format!("{id}/{}", property.id);
                self.publish(&format!("{base}/$name"), &property.name);
                self.publish(&format!("{base}/$datatype"), property.datatype);
                if !property.unit.is_empty() {
                    self.publish(&format!("{base}/$unit"), &property.unit);
                }
                self.publish(
                    &format!("{base}/$settable"),
                    if property.settable { "true" } else { "false" },
                );
                debug!("property {} has been added to node {}", property.id, id);
            }
        }

        for topic in self.set_topics() {
            self.transport.subscribe(&topic);
        }

        self.set_state(State::Ready);
        info!("homie device {} published ({} nodes)", self.id, self.nodes.len());
    }

    pub fn stop(&self) {
        for topic in self.set_topics() {
            self.transport.unsubscribe(&topic);
        }
        self.set_state(State::Disconnected);
    }
}

impl PropertySink for HomieDevice {
    fn update(&self, update: PropertyUpdate) {
        let Some(node) = self.nodes.iter().find(|n| n.spec.id == update.node) else {
            debug!("{}: no node {} for {}", self.id, update.node, update.name);
            return;
        };
        if !node.properties.iter().any(|p| p.id == update.id) {
            debug!("{}: no property {}/{}", self.id, update.node, update.id);
            return;
        }
        debug!("{}: {}/{} = {}", self.id, update.node, update.id, update.formatted());
        self.transport.publish(
            &self.topic(&format!("{}/{}", update.node, update.id)),
            update.value.to_string().into_bytes(),
            node.spec.retain,
        );
    }

    fn update_status(&self, status: i64) {
        self.set_state(if status == 1 { State::Ready } else { State::Lost });
    }
}
