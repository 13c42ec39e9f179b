use thiserror::Error;

/// Failure to turn an inbound payload into records.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid envelope: {0}")]
    Envelope(#[from] prost::DecodeError),

    #[error("payload field {tag} truncated")]
    Truncated { tag: u32 },

    #[error("payload field {tag} uses unsupported wire type {wire_type}")]
    WireType { tag: u32, wire_type: u8 },

    #[error("payload field {tag}: {source}")]
    Field {
        tag: u32,
        #[source]
        source: prost::DecodeError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingEnv(&'static str),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("device {serial}: unsupported type '{device_type}'")]
    UnknownDeviceType { serial: String, device_type: String },

    #[error("{0}")]
    Invalid(String),
}
