use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Recipient name for messages handled by the engine itself
/// (create_agent / remove_agent / stop).
pub const ENGINE_RECIPIENT: &str = "hash";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parsing {context}: {message}")]
    InvalidJson { context: String, message: String },
    #[error("manifest must name exactly one initializer, got {0}")]
    InitializerCount(usize),
    #[error("cannot load '{0}': unknown guest language")]
    UnknownLanguage(String),
    #[error("unsupported init file '{0}'")]
    UnsupportedInitializer(String),
    #[error("'{0}' cannot be loaded as a behavior")]
    UnsupportedBehavior(String),
    #[error("'{0}' requires the embedded interpreter, which is disabled for this run")]
    InterpreterDisabled(String),
}

// ---------------------------------------------------------------------------
// Manifest

/// The immutable bundle consumed by one simulation run: base global
/// properties, dataset descriptors, exactly one initializer, and the
/// behavior sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub properties_src: String,
    #[serde(default)]
    pub datasets: Vec<DatasetDescriptor>,
    pub initializers: Vec<SourceDescriptor>,
    #[serde(default)]
    pub behaviors: Vec<SourceDescriptor>,
}

impl Manifest {
    /// The single initializer descriptor. Zero or more than one is a fatal
    /// configuration error, surfaced before any run starts.
    pub fn initializer(&self) -> Result<&SourceDescriptor, ConfigError> {
        if self.initializers.len() != 1 {
            return Err(ConfigError::InitializerCount(self.initializers.len()));
        }
        Ok(&self.initializers[0])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    /// Stable content-addressing key, unique across versions of a dataset.
    #[serde(default)]
    pub storage_key: String,
    /// Display name; behaviors look datasets up by shortname.
    pub shortname: String,
    pub format: DatasetFormat,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub in_place_data: Option<String>,
}

impl DatasetDescriptor {
    /// Storage key, falling back to a content digest for in-place data
    /// shipped without one.
    pub fn effective_storage_key(&self) -> String {
        if !self.storage_key.is_empty() {
            return self.storage_key.clone();
        }
        match &self.in_place_data {
            Some(data) => content_key(data.as_bytes()),
            None => self.shortname.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Json,
    Csv,
}

/// An initializer or behavior source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub filename: String,
    pub source_text: String,
    #[serde(default)]
    pub guest_language: Option<GuestLanguage>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SourceDescriptor {
    /// Explicit guest language, or the one implied by the file extension.
    pub fn language(&self) -> Result<GuestLanguage, ConfigError> {
        if let Some(lang) = self.guest_language {
            return Ok(lang);
        }
        GuestLanguage::from_filename(&self.filename)
            .ok_or_else(|| ConfigError::UnknownLanguage(self.filename.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestLanguage {
    /// Dynamic scripting: parsed at load, evaluated in a fresh scope per call.
    Script,
    /// Embedded interpreter: persistent per-file namespace in a shared runtime.
    Interp,
    /// Compiled into the native kernel; not parsed at this layer.
    Native,
    /// Literal JSON agent array (initializers only).
    Json,
}

impl GuestLanguage {
    pub fn from_filename(filename: &str) -> Option<Self> {
        match filename.rsplit('.').next() {
            Some("script") => Some(Self::Script),
            Some("interp") => Some(Self::Interp),
            Some("rs") => Some(Self::Native),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Parsing,
    Running,
}

/// A normalized guest-code or kernel failure attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub phase: Phase,
    pub message: String,
    /// The file (or pseudo-file, e.g. "globals.json") the failure belongs to.
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.phase {
            Phase::Parsing => "parsing",
            Phase::Running => "running",
        };
        match (self.line, self.column) {
            (Some(line), Some(col)) => {
                write!(f, "{} {} at {}:{}: {}", phase, self.context, line, col, self.message)
            }
            (Some(line), None) => {
                write!(f, "{} {} at {}: {}", phase, self.context, line, self.message)
            }
            _ => write!(f, "{} {}: {}", phase, self.context, self.message),
        }
    }
}

/// Parse a JSON source string, mapping failures to a parsing diagnostic for
/// the named context. An empty source parses as an empty object.
pub fn parse_json_src(src: &str, context: &str) -> Result<Value, ConfigError> {
    if src.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(src).map_err(|err| ConfigError::InvalidJson {
        context: context.to_string(),
        message: err.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Agent-state helpers

/// One agent's state is a JSON object. Engine-significant fields are
/// `agent_id`, `behaviors` (filenames) and `messages`.
pub fn agent_id(agent: &Value) -> Option<&str> {
    agent.get("agent_id").and_then(Value::as_str)
}

pub fn agent_behaviors(agent: &Value) -> Vec<String> {
    agent
        .get("behaviors")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn agent_messages(agent: &Value) -> Vec<Value> {
    agent
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Whether a message `to` field addresses the engine. Accepts a single name
/// or an array of names, case-insensitively.
pub fn is_engine_recipient(to: &Value) -> bool {
    match to {
        Value::String(name) => name.eq_ignore_ascii_case(ENGINE_RECIPIENT),
        Value::Array(names) => names.iter().any(|name| {
            name.as_str()
                .map(|n| n.eq_ignore_ascii_case(ENGINE_RECIPIENT))
                .unwrap_or(false)
        }),
        _ => false,
    }
}

/// Whether a message is an engine-addressed message of the given kind.
pub fn is_engine_message(msg: &Value, kind: &str) -> bool {
    let kind_matches = msg
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t == kind)
        .unwrap_or(false);
    kind_matches && msg.get("to").map(is_engine_recipient).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Property overrides

/// Apply a sparse set of dotted-path overrides onto a properties object.
/// Intermediate objects are created as needed; non-object intermediates are
/// replaced.
pub fn apply_overrides(properties: &mut Value, fields: &serde_json::Map<String, Value>) {
    for (path, value) in fields {
        set_dotted(properties, path, value.clone());
    }
}

fn set_dotted(target: &mut Value, path: &str, value: Value) {
    let mut cursor = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let map = cursor.as_object_mut().expect("cursor coerced to object");
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

// ---------------------------------------------------------------------------
// Content digests

pub fn content_key(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
