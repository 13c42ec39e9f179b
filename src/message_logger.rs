//! Writes the latest raw message of each kind into a folder, one `.RAW` file
//! per (function, command) pair.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use serde_json::{Map, Value as Json, json};

use crate::ecoflow::envelope::{DecodedRecord, RecordPayload};
use crate::ecoflow::schema::{DecodedField, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    None,
    Unhandled,
    All,
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(LogMode::None),
            "unhandled" => Ok(LogMode::Unhandled),
            "all" => Ok(LogMode::All),
            other => Err(format!("unknown raw log mode '{other}'")),
        }
    }
}

pub struct LogEntry<'a> {
    /// Topic label; prefixes the file name and heads the file.
    pub prefix: Option<&'a str>,
    /// `None` when the payload could not be decoded at all.
    pub record: Option<&'a DecodedRecord>,
    pub handled: bool,
    pub raw: &'a [u8],
}

pub struct MessageLogger {
    mode: LogMode,
    folder: PathBuf,
}

impl MessageLogger {
    /// The folder must exist; `.RAW` files left from earlier runs are removed.
    pub fn new(mode: LogMode, folder: impl Into<PathBuf>) -> io::Result<Self> {
        let folder = folder.into();
        if !folder.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("logging folder {} does not exist", folder.display()),
            ));
        }
        let logger = Self { mode, folder };
        logger.delete_old_files()?;
        Ok(logger)
    }

    fn delete_old_files(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.folder)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "RAW") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn log(&self, entry: LogEntry<'_>) -> io::Result<()> {
        if self.mode == LogMode::None || (self.mode == LogMode::Unhandled && entry.handled) {
            return Ok(());
        }

        let mut file_name = match entry.record {
            None => "binary.RAW".to_string(),
            Some(record) => match (&record.payload, record.header.as_ref()) {
                (_, Some(header)) => format!("{}-{}.RAW", header.cmd_func, header.cmd_id),
                (RecordPayload::Json(json), None) => {
                    match (json.get("cmdFunc"), json.get("cmdId")) {
                        (Some(func), Some(id)) => format!("{func}-{id}.RAW"),
                        _ => "json.RAW".to_string(),
                    }
                }
                _ => "json.RAW".to_string(),
            },
        };
        if let Some(prefix) = entry.prefix {
            file_name = format!("{}_{}", prefix.replace(' ', "_"), file_name);
        }

        let mut contents = String::new();
        if let Some(prefix) = entry.prefix {
            contents.push_str(&format!("{prefix}:\n"));
        }
        contents.push_str(&format!("RAW: {}\n", hex::encode(entry.raw)));
        let rendered = match entry.record {
            Some(record) => record_to_json(record),
            None => json!({ "raw": hex::encode(entry.raw) }),
        };
        contents.push_str(&serde_json::to_string_pretty(&rendered).unwrap_or_default());
        contents.push('\n');

        fs::write(self.folder.join(file_name), contents)
    }
}

fn record_to_json(record: &DecodedRecord) -> Json {
    let mut out = match &record.header {
        Some(header) => json!({
            "src": header.src,
            "dest": header.dest,
            "cmdFunc": header.cmd_func,
            "cmdId": header.cmd_id,
            "dataLen": header.data_len,
            "needAck": header.need_ack,
            "seq": header.seq,
            "from": header.from,
            "deviceSn": header.device_sn,
        }),
        None => Json::Object(Map::new()),
    };
    let pdata = match &record.payload {
        RecordPayload::Decoded(fields) => fields_to_json(fields),
        RecordPayload::Raw(bytes) => Json::String(hex::encode(bytes)),
        RecordPayload::Json(json) => return json.clone(),
        RecordPayload::Status(status) => json!({ "status": status }),
    };
    if let Json::Object(map) = &mut out {
        map.insert("pdata".to_string(), pdata);
    }
    out
}

fn fields_to_json(fields: &[DecodedField]) -> Json {
    Json::Object(
        fields
            .iter()
            .map(|f| (f.descriptor.name.clone(), value_to_json(&f.value)))
            .collect(),
    )
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Int(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Bool(b) => json!(b),
        Value::Text(s) => json!(s),
        Value::Bytes(b) => json!(hex::encode(b)),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Message(fields) => fields_to_json(fields),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ecoflow::envelope::{Command, Header};
    use crate::ecoflow::schema::{FieldDescriptor, FieldKind};

    fn binary_record() -> DecodedRecord {
        DecodedRecord {
            cmd_func: Some(20),
            cmd: Command::Id(1),
            payload: RecordPayload::Decoded(vec![DecodedField {
                descriptor: Arc::new(FieldDescriptor::new(31, "batSoc", FieldKind::UInt)),
                value: Value::Int(55),
            }]),
            header: Some(Header {
                cmd_func: 20,
                cmd_id: 1,
                device_sn: "HW51TEST".into(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_old_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20-1.RAW"), "old").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();

        MessageLogger::new(LogMode::All, dir.path()).unwrap();
        assert!(!dir.path().join("20-1.RAW").exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_missing_folder() {
        assert!(MessageLogger::new(LogMode::All, "/nonexistent/raw-folder").is_err());
    }

    #[test]
    fn test_binary_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MessageLogger::new(LogMode::All, dir.path()).unwrap();
        let record = binary_record();
        logger
            .log(LogEntry {
                prefix: Some("GET REPLY"),
                record: Some(&record),
                handled: true,
                raw: &[0x0a, 0x00],
            })
            .unwrap();

        let contents = fs::read_to_string(dir.path().join("GET_REPLY_20-1.RAW")).unwrap();
        assert!(contents.starts_with("GET REPLY:\nRAW: 0a00\n"));
        assert!(contents.contains("\"batSoc\": 55"));
        assert!(contents.contains("\"deviceSn\": \"HW51TEST\""));
    }

    #[test]
    fn test_unhandled_mode_skips_handled() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MessageLogger::new(LogMode::Unhandled, dir.path()).unwrap();
        let record = binary_record();
        let entry = |handled| LogEntry {
            prefix: None,
            record: Some(&record),
            handled,
            raw: &[],
        };
        logger.log(entry(true)).unwrap();
        assert!(!dir.path().join("20-1.RAW").exists());
        logger.log(entry(false)).unwrap();
        assert!(dir.path().join("20-1.RAW").exists());
    }

    #[test]
    fn test_undecodable_payload() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MessageLogger::new(LogMode::All, dir.path()).unwrap();
        logger
            .log(LogEntry {
                prefix: Some("ERROR"),
                record: None,
                handled: false,
                raw: &[0xff],
            })
            .unwrap();
        let contents = fs::read_to_string(dir.path().join("ERROR_binary.RAW")).unwrap();
        assert!(contents.starts_with("ERROR:\nRAW: ff\n"));
    }

    #[test]
    fn test_json_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MessageLogger::new(LogMode::All, dir.path()).unwrap();
        let record = DecodedRecord {
            cmd_func: Some(2),
            cmd: Command::Id(1),
            payload: RecordPayload::Json(json!({"cmdFunc": 2, "cmdId": 1})),
            header: None,
        };
        logger
            .log(LogEntry {
                prefix: None,
                record: Some(&record),
                handled: true,
                raw: b"{}",
            })
            .unwrap();
        assert!(dir.path().join("2-1.RAW").exists());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("unhandled".parse::<LogMode>(), Ok(LogMode::Unhandled));
        assert!("verbose".parse::<LogMode>().is_err());
    }
}
