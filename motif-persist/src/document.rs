//! Export document types and their encodings.
//!
//! A basic export carries the graph only; a full export adds the runtime
//! state (active node, history, store contents). Both carry a crc32c checksum
//! of the graph.

use crate::error::PersistError;
use motif_core::{EdgeKind, TransitionStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const BASIC_FORMAT: &str = "motif/basic";
pub const FULL_FORMAT: &str = "motif/full";
pub const SCHEMA_VERSION: u32 = 1;

/// A node as written to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// An edge as written to a document. `config` holds the expression source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    pub kind: EdgeKind,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub unidirectional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// Nodes and edges, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

impl GraphRecord {
    /// crc32c of the JSON encoding, as 8 hex digits.
    pub fn checksum(&self) -> Result<String, PersistError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:08x}", crc32c::crc32c(&bytes)))
    }
}

/// Graph-only export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicExport {
    pub format: String,
    pub schema_version: u32,
    #[serde(flatten)]
    pub graph: GraphRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BasicExport {
    pub fn verify(&self) -> Result<(), PersistError> {
        verify_header(BASIC_FORMAT, &self.format, self.schema_version)?;
        verify_checksum(&self.graph, self.checksum.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentRecord {
    pub node_id: String,
    pub status: TransitionStatus,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub node_id: String,
    #[serde(default)]
    pub input: Value,
}

/// Runtime state of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentRecord>,
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    /// Store contents keyed by node id.
    #[serde(default)]
    pub stores: BTreeMap<String, Value>,
}

/// Graph plus runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullExport {
    pub format: String,
    pub schema_version: u32,
    #[serde(flatten)]
    pub graph: GraphRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub state: StateRecord,
}

impl FullExport {
    pub fn verify(&self) -> Result<(), PersistError> {
        verify_header(FULL_FORMAT, &self.format, self.schema_version)?;
        verify_checksum(&self.graph, self.checksum.as_deref())
    }
}

fn verify_header(expected: &str, format: &str, schema_version: u32) -> Result<(), PersistError> {
    if format != expected {
        return Err(PersistError::UnsupportedFormat {
            expected: expected.to_string(),
            found: format.to_string(),
        });
    }
    if schema_version != SCHEMA_VERSION {
        return Err(PersistError::UnsupportedVersion(schema_version));
    }
    Ok(())
}

fn verify_checksum(graph: &GraphRecord, checksum: Option<&str>) -> Result<(), PersistError> {
    let Some(expected) = checksum else {
        return Ok(());
    };
    let actual = graph.checksum()?;
    if actual != expected {
        return Err(PersistError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Text encoding of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Yaml,
}

impl Encoding {
    /// `.yaml` / `.yml` files are YAML, everything else JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Encoding::Yaml,
            _ => Encoding::Json,
        }
    }

    pub fn encode<T: Serialize>(&self, doc: &T) -> Result<String, PersistError> {
        match self {
            Encoding::Json => Ok(serde_json::to_string_pretty(doc)?),
            Encoding::Yaml => Ok(serde_yaml::to_string(doc)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, PersistError> {
        match self {
            Encoding::Json => Ok(serde_json::from_str(text)?),
            Encoding::Yaml => Ok(serde_yaml::from_str(text)?),
        }
    }
}

pub fn to_json<T: Serialize>(doc: &T) -> Result<String, PersistError> {
    Encoding::Json.encode(doc)
}

pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, PersistError> {
    Encoding::Json.decode(text)
}

pub fn to_yaml<T: Serialize>(doc: &T) -> Result<String, PersistError> {
    Encoding::Yaml.encode(doc)
}

pub fn from_yaml<T: DeserializeOwned>(text: &str) -> Result<T, PersistError> {
    Encoding::Yaml.decode(text)
}

/// Reads a document, choosing the encoding from the file extension.
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, PersistError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    Encoding::from_path(path).decode(&text)
}

/// Writes a document, choosing the encoding from the file extension.
pub fn save<T: Serialize>(doc: &T, path: impl AsRef<Path>) -> Result<(), PersistError> {
    let path = path.as_ref();
    let text = Encoding::from_path(path).encode(doc)?;
    fs::write(path, text)?;
    tracing::debug!("Wrote document to {}", path.display());
    Ok(())
}
