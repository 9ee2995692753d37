//! Collected records.
//!
//! A [`Record`] is one named unit of diagnostic data. Producers build it with
//! the `with_*` methods and hand it over by value; there are no setters, so a
//! record cannot change once it has been sent or written.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Application name written into every record header.
pub const APPLICATION: &str = "dbcollect";

/// Free-form annotations attached to a record.
pub type Metadata = BTreeMap<String, Value>;

/// Outcome of collecting one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Collected successfully
    Ok,
    /// Command ran but returned a nonzero exit code
    Failed,
    /// Command exceeded its wall-clock limit
    Timeout,
    /// Command could not be started or the source could not be read
    Error,
    /// Collection was disabled for this item
    Skipped,
    /// The source does not exist on this host
    Nonexistent,
}

impl Status {
    /// Whether the status denotes a problem worth reporting to the operator.
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failed | Status::Timeout | Status::Error)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Failed => write!(f, "FAILED"),
            Status::Timeout => write!(f, "TIMEOUT"),
            Status::Error => write!(f, "ERROR"),
            Status::Skipped => write!(f, "SKIPPED"),
            Status::Nonexistent => write!(f, "NONEXISTENT"),
        }
    }
}

/// One named unit of collected data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    name: String,
    status: Status,
    created: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(skip)]
    payload: Vec<u8>,
}

impl Record {
    /// Create an empty record with the given archive-relative name.
    pub fn new(name: impl Into<String>, status: Status) -> Self {
        Self {
            name: name.into(),
            status,
            created: timestamp(),
            metadata: Metadata::new(),
            payload: Vec::new(),
        }
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Attach one metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach several metadata entries.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn created(&self) -> &str {
        &self.created
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Split the payload off, leaving a header-only record.
    pub fn into_parts(self) -> (Record, Vec<u8>) {
        let Record {
            name,
            status,
            created,
            metadata,
            payload,
        } = self;
        (
            Record {
                name,
                status,
                created,
                metadata,
                payload: Vec::new(),
            },
            payload,
        )
    }

    /// Inverse of [`Record::into_parts`].
    pub fn from_parts(header: Record, payload: Vec<u8>) -> Self {
        Self { payload, ..header }
    }

    /// Render the record as JSON header plus raw payload.
    ///
    /// The header is pretty printed JSON; when a payload is present it follows
    /// after a single newline, unmodified.
    pub fn to_jsonp(&self) -> Vec<u8> {
        let mut header = serde_json::Map::new();
        header.insert("application".into(), APPLICATION.into());
        header.insert("version".into(), env!("CARGO_PKG_VERSION").into());
        header.insert("name".into(), self.name.clone().into());
        header.insert("status".into(), self.status.to_string().into());
        header.insert("timestamp".into(), self.created.clone().into());
        for (key, value) in &self.metadata {
            header.insert(key.clone(), value.clone());
        }

        let mut out = serde_json::to_vec_pretty(&Value::Object(header))
            .unwrap_or_else(|_| b"{}".to_vec());
        if !self.payload.is_empty() {
            out.push(b'\n');
            out.extend_from_slice(&self.payload);
        }
        out
    }
}

/// Local timestamp in the minute resolution used by record headers.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M").to_string()
}
