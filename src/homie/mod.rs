pub mod device;

pub use device::HomieDevice;

/// Homie device state, published under `$state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Disconnected,
    Lost,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Init => "init",
            State::Ready => "ready",
            State::Disconnected => "disconnected",
            State::Lost => "lost",
        }
    }
}

/// A `/set` request addressed to one property.
#[derive(Debug, PartialEq, Eq)]
pub struct SetRequest<'a> {
    pub device_id: &'a str,
    pub node_id: &'a str,
    pub property_id: &'a str,
}

/// Parse `{prefix}/{device}/{node}/{property}/set`.
pub fn parse_set_topic<'a>(topic: &'a str, prefix: &str) -> Option<SetRequest<'a>> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let rest = rest.strip_suffix("/set")?;
    let mut parts = rest.split('/');
    let (device_id, node_id, property_id) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || [device_id, node_id, property_id].iter().any(|p| p.is_empty()) {
        return None;
    }
    Some(SetRequest {
        device_id,
        node_id,
        property_id,
    })
}
