//! Inbound envelope decoding and outbound envelope framing.

use prost::Message;
use rand::Rng;
use serde_json::Value as Json;
use tracing::debug;

use super::schema::{DecodedField, SchemaRegistry};
use super::{DEFAULT_DEST, DEFAULT_SRC};
use crate::error::DecodeError;

#[derive(Clone, PartialEq, Message)]
pub struct Header {
    #[prost(bytes = "vec", tag = "1")]
    pub pdata: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub src: i32,
    #[prost(int32, tag = "3")]
    pub dest: i32,
    #[prost(int32, tag = "4")]
    pub d_src: i32,
    #[prost(int32, tag = "5")]
    pub d_dest: i32,
    #[prost(int32, tag = "6")]
    pub enc_type: i32,
    #[prost(int32, tag = "7")]
    pub check_type: i32,
    #[prost(int32, tag = "8")]
    pub cmd_func: i32,
    #[prost(int32, tag = "9")]
    pub cmd_id: i32,
    #[prost(int32, tag = "10")]
    pub data_len: i32,
    #[prost(int32, tag = "11")]
    pub need_ack: i32,
    #[prost(int32, tag = "12")]
    pub is_ack: i32,
    #[prost(int32, tag = "14")]
    pub seq: i32,
    #[prost(int32, tag = "15")]
    pub product_id: i32,
    #[prost(int32, tag = "16")]
    pub version: i32,
    #[prost(int32, tag = "17")]
    pub payload_ver: i32,
    #[prost(int32, tag = "18")]
    pub time_snap: i32,
    #[prost(int32, tag = "19")]
    pub is_rw_cmd: i32,
    #[prost(int32, tag = "20")]
    pub is_queue: i32,
    #[prost(int32, tag = "21")]
    pub ack_type: i32,
    #[prost(string, tag = "22")]
    pub code: String,
    #[prost(string, tag = "23")]
    pub from: String,
    #[prost(string, tag = "24")]
    pub module_sn: String,
    #[prost(string, tag = "25")]
    pub device_sn: String,
}

/// Binary container: one publish may carry several headers.
#[derive(Clone, PartialEq, Message)]
pub struct HeaderMessage {
    #[prost(message, repeated, tag = "1")]
    pub header: Vec<Header>,
}

/// Command identifier of a record. JSON messages may name their command
/// instead of numbering it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Id(u32),
    Named(String),
    Unknown,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Id(id) => write!(f, "{id}"),
            Command::Named(name) => f.write_str(name),
            Command::Unknown => f.write_str("?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    /// Payload decoded with a registered schema.
    Decoded(Vec<DecodedField>),
    /// No schema registered for this record.
    Raw(Vec<u8>),
    Json(Json),
    /// Connectivity status rather than a field update.
    Status(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub cmd_func: Option<u32>,
    pub cmd: Command,
    pub payload: RecordPayload,
    /// Binary routing metadata; `None` for JSON records.
    pub header: Option<Header>,
}

impl DecodedRecord {
    pub fn fields(&self) -> Option<&[DecodedField]> {
        match &self.payload {
            RecordPayload::Decoded(fields) => Some(fields),
            _ => None,
        }
    }
}

/// Split a raw publish into records addressed to `serial` and hand each one
/// to `on_record` in order.
///
/// JSON is tried first; anything that is not a UTF-8 JSON object is parsed as
/// a binary [`HeaderMessage`]. Records routed to another device are dropped.
/// A payload that fails its schema stops decoding there; records before it
/// have already been delivered.
pub fn decode<F>(
    raw: &[u8],
    serial: &str,
    registry: &SchemaRegistry,
    mut on_record: F,
) -> Result<(), DecodeError>
where
    F: FnMut(DecodedRecord),
{
    let json = std::str::from_utf8(raw)
        .ok()
        .and_then(|text| serde_json::from_str::<Json>(text).ok())
        .filter(Json::is_object);
    if let Some(json) = json {
        if let Some(record) = decode_json(json, serial) {
            on_record(record);
        }
        return Ok(());
    }

    let message = HeaderMessage::decode(raw)?;
    for header in message.header {
        if !header.device_sn.is_empty() && header.device_sn != serial {
            debug!(
                "{} dropping record for {} (cmd_func {} cmd_id {})",
                serial, header.device_sn, header.cmd_func, header.cmd_id
            );
            continue;
        }
        let cmd_func = header.cmd_func as u32;
        let cmd_id = header.cmd_id as u32;
        let payload = match registry.lookup(cmd_func, cmd_id) {
            Some(schema) => {
                debug!(
                    "{} decoder {} found for cmd_func {} cmd_id {}",
                    serial, schema.name, cmd_func, cmd_id
                );
                RecordPayload::Decoded(schema.decode(&header.pdata)?)
            }
            None => RecordPayload::Raw(header.pdata.clone()),
        };
        on_record(DecodedRecord {
            cmd_func: Some(cmd_func),
            cmd: Command::Id(cmd_id),
            payload,
            header: Some(header),
        });
    }
    Ok(())
}

fn decode_json(json: Json, serial: &str) -> Option<DecodedRecord> {
    let routed_to = ["sn", "deviceSn"]
        .iter()
        .find_map(|key| json.get(key).and_then(Json::as_str));
    if let Some(target) = routed_to {
        if !target.is_empty() && target != serial {
            debug!("{} dropping JSON message for {}", serial, target);
            return None;
        }
    }

    let cmd_func = json
        .get("cmdFunc")
        .and_then(Json::as_u64)
        .map(|f| f as u32);

    let status = json
        .get("params")
        .and_then(|params| params.get("status"))
        .and_then(Json::as_i64);
    if let Some(status) = status {
        return Some(DecodedRecord {
            cmd_func,
            cmd: Command::Named("status".to_string()),
            payload: RecordPayload::Status(status),
            header: None,
        });
    }

    let cmd = if let Some(id) = json.get("cmdId").and_then(Json::as_u64) {
        Command::Id(id as u32)
    } else if let Some(operate) = json.get("operateType").and_then(Json::as_str) {
        Command::Named(operate.to_string())
    } else if json.get("params").is_some() {
        Command::Named("params".to_string())
    } else {
        Command::Unknown
    };

    Some(DecodedRecord {
        cmd_func,
        cmd,
        payload: RecordPayload::Json(json),
        header: None,
    })
}

/// Sequence numbers only need to be unique enough to match replies.
pub fn generate_seq() -> i32 {
    rand::thread_rng().gen_range(100_000..=999_999_999)
}

/// Frame an app-originated command for `device_sn`.
pub fn build(pdata: Vec<u8>, cmd_id: u32, cmd_func: u32, device_sn: &str) -> Vec<u8> {
    let header = Header {
        data_len: pdata.len() as i32,
        pdata,
        src: DEFAULT_SRC,
        dest: DEFAULT_DEST,
        cmd_func: cmd_func as i32,
        cmd_id: cmd_id as i32,
        need_ack: 1,
        seq: generate_seq(),
        device_sn: device_sn.to_string(),
        ..Default::default()
    };
    HeaderMessage {
        header: vec![header],
    }
    .encode_to_vec()
}

/// Ask the device to publish its full state.
pub fn build_data_request() -> Vec<u8> {
    let header = Header {
        from: "Android".to_string(),
        seq: generate_seq(),
        ..Default::default()
    };
    HeaderMessage {
        header: vec![header],
    }
    .encode_to_vec()
}
