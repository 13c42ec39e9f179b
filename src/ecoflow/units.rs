use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use crate::connector::PropertyValue;

/// Fields whose unit can't be read off the name.
const PERCENT_FIELDS: &[&str] = &["batSoc", "lowerLimit", "upperLimit"];

static RULES: LazyLock<Mutex<HashMap<String, NormalizationRule>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Converter {
    #[default]
    None,
    /// Raw value is a number of minutes, displayed as "HH:MM".
    MinutesToClock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationRule {
    pub unit: String,
    pub divisor: u32,
    pub converter: Converter,
}

impl Default for NormalizationRule {
    fn default() -> Self {
        Self {
            unit: String::new(),
            divisor: 1,
            converter: Converter::None,
        }
    }
}

impl NormalizationRule {
    /// Replace the name-derived unit/divisor with statically declared ones.
    pub fn with_overrides(mut self, unit: Option<&str>, divisor: Option<u32>) -> Self {
        if let Some(unit) = unit {
            self.unit = unit.to_string();
        }
        if let Some(divisor) = divisor {
            self.divisor = divisor.max(1);
        }
        self
    }

    /// Scale a raw value and produce the optional display string.
    /// The returned value is what gets stored; the display string is cosmetic.
    pub fn apply(&self, raw: PropertyValue) -> (PropertyValue, Option<String>) {
        let value = match (&raw, self.divisor) {
            (_, 0 | 1) => raw,
            (PropertyValue::Integer(v), d) => PropertyValue::Float(*v as f64 / d as f64),
            (PropertyValue::Float(v), d) => PropertyValue::Float(v / d as f64),
            _ => raw,
        };
        let display = match self.converter {
            Converter::MinutesToClock => value.as_f64().map(|m| minutes_to_clock(m as i64)),
            Converter::None => None,
        };
        (value, display)
    }
}

/// Look up (and memoize) the normalization rule for a field name.
pub fn resolve(field_name: &str) -> NormalizationRule {
    let mut rules = match RULES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    rules
        .entry(field_name.to_string())
        .or_insert_with(|| detect(field_name))
        .clone()
}

fn detect(field_name: &str) -> NormalizationRule {
    // "bmsMaster.f32ShowSoc" style names carry a sub-device prefix
    let param = field_name
        .rsplit_once('.')
        .map(|(_, param)| param)
        .unwrap_or(field_name);

    let rule = |unit: &str, divisor| NormalizationRule {
        unit: unit.to_string(),
        divisor,
        converter: Converter::None,
    };

    match split_words(param).last().map(String::as_str) {
        Some("watts" | "power") => rule("W", 10),
        Some("cur") => rule("A", 10),
        Some("temp") => rule("°C", 10),
        // not verified on every device family
        Some("volt") => rule("V", 10),
        Some("brightness") => rule("%", 10),
        Some("time") => NormalizationRule {
            converter: Converter::MinutesToClock,
            ..Default::default()
        },
        _ if PERCENT_FIELDS.contains(&param) => rule("%", 1),
        _ => NormalizationRule::default(),
    }
}

/// "pv1InputWatts" → ["pv1", "input", "watts"]
fn split_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    for c in name.chars() {
        if c.is_ascii_uppercase() && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub fn minutes_to_clock(minutes: i64) -> String {
    format!("{:02}:{:02}", minutes.div_euclid(60), minutes.rem_euclid(60))
}
