//! Per-device property store: keeps the last value of every decoded field,
//! recomputes derived sums and forwards published fields to the property sink.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value as Json;
use tracing::debug;

use crate::ecoflow::schema::{DerivedFieldSpec, FieldDescriptor, Value, property_id};

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(v) => Some(*v as f64),
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Boolean(b) => Some(*b as i64 as f64),
            PropertyValue::Text(_) => None,
        }
    }

    /// Scalar wire values only; lists, nested messages and bytes have no
    /// property representation.
    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(PropertyValue::Integer(*v)),
            Value::Float(v) => Some(PropertyValue::Float(*v)),
            Value::Bool(b) => Some(PropertyValue::Boolean(*b)),
            Value::Text(s) => Some(PropertyValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::Bool(b) => Some(PropertyValue::Boolean(*b)),
            Json::Number(n) => n
                .as_i64()
                .map(PropertyValue::Integer)
                .or_else(|| n.as_f64().map(PropertyValue::Float)),
            Json::String(s) => Some(PropertyValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Boolean(b) => write!(f, "{b}"),
            PropertyValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub name: String,
    pub id: String,
    pub node: String,
    pub value: PropertyValue,
    /// Human-readable extras; sinks publish `value` and use these for logs.
    pub unit: Option<String>,
    pub display: Option<String>,
    pub settable: bool,
}

impl PropertyUpdate {
    /// "02:05", "34.5 W"
    pub fn formatted(&self) -> String {
        format_value(&self.value, self.unit.as_deref(), self.display.as_deref())
    }
}

fn format_value(value: &PropertyValue, unit: Option<&str>, shown: Option<&str>) -> String {
    let text = shown.map_or_else(|| value.to_string(), str::to_string);
    match unit {
        Some(unit) if !unit.is_empty() => format!("{text} {unit}"),
        _ => text,
    }
}

/// Receives published property values (the Homie device in production).
pub trait PropertySink: Send + Sync {
    fn update(&self, update: PropertyUpdate);
    fn update_status(&self, status: i64);
}

/// What an update refers to. `Internal` values are stored (and feed derived
/// sums) but never published.
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    Descriptor(&'a FieldDescriptor),
    Internal(&'a str),
}

impl FieldRef<'_> {
    fn name(&self) -> &str {
        match self {
            FieldRef::Descriptor(descriptor) => &descriptor.name,
            FieldRef::Internal(name) => name,
        }
    }
}

#[derive(Default)]
struct State {
    values: HashMap<String, PropertyValue>,
    units: HashMap<String, String>,
}

pub struct Connector {
    serial: String,
    derived: Vec<DerivedFieldSpec>,
    state: Mutex<State>,
    sink: Option<Arc<dyn PropertySink>>,
}

impl Connector {
    pub fn new(
        serial: &str,
        derived: Vec<DerivedFieldSpec>,
        sink: Option<Arc<dyn PropertySink>>,
    ) -> Self {
        Self {
            serial: serial.to_string(),
            derived,
            state: Mutex::new(State::default()),
            sink,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store a field value, recompute every sum depending on it and publish.
    pub fn update(
        &self,
        field: FieldRef<'_>,
        value: PropertyValue,
        unit: Option<&str>,
        display_value: Option<String>,
    ) {
        let name = field.name();
        let text = format_value(&value, unit, display_value.as_deref());
        debug!("{} update {}: {}", self.serial, name, text);

        let mut outgoing = Vec::new();
        {
            let mut state = self.state();
            state.values.insert(name.to_string(), value.clone());
            if let Some(unit) = unit {
                state.units.insert(name.to_string(), unit.to_string());
            }
            for spec in self.derived.iter().filter(|spec| spec.sources.iter().any(|src| src == name)) {
                outgoing.push(recompute(&mut state, spec));
            }
        }

        if let FieldRef::Descriptor(descriptor) = field {
            if let Some(node) = &descriptor.node {
                outgoing.push(PropertyUpdate {
                    name: name.to_string(),
                    id: descriptor.property_id(),
                    node: node.clone(),
                    value,
                    unit: unit.map(str::to_string),
                    display: display_value,
                    settable: descriptor.settable,
                });
            }
        }

        if let Some(sink) = &self.sink {
            for update in outgoing {
                sink.update(update);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<PropertyValue> {
        self.state().values.get(name).cloned()
    }

    pub fn get_f64(&self, name: &str, default: f64) -> f64 {
        self.get(name)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    pub fn update_status(&self, status: i64) {
        debug!("{} status {}", self.serial, status);
        if let Some(sink) = &self.sink {
            sink.update_status(status);
        }
    }
}

/// Sum of the currently known sources; unseen sources count as zero. The unit
/// comes from the first source that has one.
fn recompute(state: &mut State, spec: &DerivedFieldSpec) -> PropertyUpdate {
    let mut sum = 0.0;
    let mut unit: Option<String> = None;
    for source in &spec.sources {
        let Some(value) = state.values.get(source).and_then(PropertyValue::as_f64) else {
            continue;
        };
        sum += value;
        if unit.is_none() {
            unit = state.units.get(source).filter(|u| !u.is_empty()).cloned();
        }
    }
    let value = PropertyValue::Float((sum * 10.0).round() / 10.0);
    let unit = unit.unwrap_or_else(|| spec.unit.clone());

    state.values.insert(spec.name.clone(), value.clone());
    state.units.insert(spec.name.clone(), unit.clone());

    PropertyUpdate {
        name: spec.name.clone(),
        id: property_id(&spec.name),
        node: spec.node.clone(),
        value,
        unit: Some(unit),
        display: None,
        settable: false,
    }
}
