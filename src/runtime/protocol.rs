// src/runtime/protocol.rs
//! Message protocol between a supervisor and its execution unit
//!
//! Every message is tagged by a `cmd` field. In-process units exchange the
//! typed enums directly; `to_line`/`from_line` give the newline-delimited
//! JSON form used to bridge units that speak the protocol as text.
//!
//! ```text
//! supervisor ── run ─────────────▶ unit
//!            ◀─ ready ──────────── (after construction)
//!            ◀─ meshData* ──────── (intermediate results, any number)
//!            ◀─ complete | error ─ (exactly one per run)
//! ```

use crate::utils::errors::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use ulid::Ulid;

/// Generic configuration bag applied to a parser by key
pub type SettingsBag = Map<String, Value>;

/// Identity of one job, used in logs and completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Ulid);

impl JobId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logging switches forwarded into the unit with every run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingFlags {
    pub enabled: bool,
    pub debug: bool,
}

impl LoggingFlags {
    pub fn new(enabled: bool, debug: bool) -> Self {
        Self { enabled, debug }
    }
}

/// Input section of a run command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    /// Raw bytes handed to the parser
    pub input: Bytes,
    /// Resource the unit fetches into `input` before parsing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Opaque parser options
    pub options: Option<Value>,
}

/// Body of a `run` command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub params: SettingsBag,
    #[serde(default)]
    pub logging: LoggingFlags,
    #[serde(default)]
    pub materials: SettingsBag,
    pub data: JobData,
}

/// Command sent from a supervisor to its unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum UnitCommand {
    /// Configure the parser and parse one input
    Run(RunRequest),
    /// Leave the run loop
    Exit,
}

/// Data section of an intermediate result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Structured description (names, counts, layouts)
    #[serde(default)]
    pub meta: Value,
    /// Binary buffers (vertices, normals, pixels)
    #[serde(default)]
    pub buffers: Vec<Bytes>,
}

impl Payload {
    pub fn new(meta: Value) -> Self {
        Self {
            meta,
            buffers: Vec::new(),
        }
    }

    pub fn with_buffer(mut self, buffer: impl Into<Bytes>) -> Self {
        self.buffers.push(buffer.into());
        self
    }
}

/// Message sent from a unit back to its supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum UnitMessage {
    MeshData { data: Payload },
    MaterialData { data: Payload },
    ImageData { data: Payload },
    Complete {
        #[serde(default)]
        data: Option<Value>,
    },
    Error { msg: String },
    /// Construction finished, buffered work may be sent
    Ready,
    /// Construction failed, the unit never entered its run loop
    BuildFailed { msg: String },
    /// Any tag this side does not understand
    #[serde(other)]
    Unknown,
}

impl UnitMessage {
    /// Protocol tag, for logs
    pub fn cmd(&self) -> &'static str {
        match self {
            Self::MeshData { .. } => "meshData",
            Self::MaterialData { .. } => "materialData",
            Self::ImageData { .. } => "imageData",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Ready => "ready",
            Self::BuildFailed { .. } => "buildFailed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this message carries an intermediate result
    pub fn is_intermediate(&self) -> bool {
        matches!(
            self,
            Self::MeshData { .. } | Self::MaterialData { .. } | Self::ImageData { .. }
        )
    }

    /// Serialize to JSON line (with newline)
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

impl UnitCommand {
    /// Serialize to JSON line (with newline)
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// A unit message tagged with the unit that produced it
#[derive(Debug, Clone)]
pub struct UnitEnvelope {
    pub unit_id: usize,
    /// Incremented every time a supervisor builds a new unit
    pub generation: u64,
    pub message: UnitMessage,
}

/// How a job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Delivered to `on_complete` exactly once per accepted job
#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    /// The terminal message as received (`complete` or `error`)
    pub message: UnitMessage,
}

impl Completion {
    /// Parse result carried by a successful completion
    pub fn data(&self) -> Option<&Value> {
        match &self.message {
            UnitMessage::Complete { data } => data.as_ref(),
            _ => None,
        }
    }
}
