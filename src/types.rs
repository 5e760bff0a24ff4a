//! Core types shared by sources, players and the pipeline.

use crate::time::Time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// --- Topics & Messages ---

/// A named stream of homogeneous messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub name: String,
    pub schema_name: String,
}

impl Topic {
    pub fn new(name: impl Into<String>, schema_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_name: schema_name.into(),
        }
    }
}

/// A single timestamped message on a topic.
///
/// The payload is shared: cloning an event never copies the message body,
/// and consumers only ever get read access to it.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEvent {
    pub topic: String,
    pub schema_name: String,
    pub receive_time: Time,
    pub publish_time: Option<Time>,
    pub message: Arc<Value>,
    pub size_in_bytes: usize,
}

impl MessageEvent {
    /// Create an event, measuring the payload by its JSON encoding.
    pub fn new(
        topic: impl Into<String>,
        schema_name: impl Into<String>,
        receive_time: Time,
        message: Value,
    ) -> Self {
        let size_in_bytes = encoded_len(&message);
        Self {
            topic: topic.into(),
            schema_name: schema_name.into(),
            receive_time,
            publish_time: None,
            message: Arc::new(message),
            size_in_bytes,
        }
    }

    pub fn with_publish_time(mut self, publish_time: Time) -> Self {
        self.publish_time = Some(publish_time);
        self
    }

    /// Override the measured size (sources that know their on-disk size).
    pub fn with_size(mut self, size_in_bytes: usize) -> Self {
        self.size_in_bytes = size_in_bytes;
        self
    }
}

/// Length of the compact JSON encoding of a value.
pub(crate) fn encoded_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

// --- Subscriptions ---

/// How much of a topic a subscriber needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreloadType {
    /// Only messages near the current playback time.
    #[default]
    Partial,
    /// Every in-range message, eventually (preloaded into blocks).
    Full,
}

/// One subscriber's request for one topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub topic: String,
    /// Top-level fields to read. `None` means all fields.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub preload_type: PreloadType,
}

impl SubscribePayload {
    pub fn partial(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            fields: None,
            preload_type: PreloadType::Partial,
        }
    }

    pub fn full(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            fields: None,
            preload_type: PreloadType::Full,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Unique identifier for a pipeline subscriber.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

// --- Datatypes ---

/// JSON kind of a message field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl FieldKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldKind::Null,
            Value::Bool(_) => FieldKind::Bool,
            Value::Number(_) => FieldKind::Number,
            Value::String(_) => FieldKind::String,
            Value::Array(_) => FieldKind::Array,
            Value::Object(_) => FieldKind::Object,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub kind: FieldKind,
}

/// Structure of a schema, as far as the core needs to know it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDefinition {
    pub fields: Vec<FieldDefinition>,
}

impl MessageDefinition {
    /// Infer a definition from a sample message's top-level fields.
    pub fn infer(sample: &Value) -> Self {
        let fields = match sample {
            Value::Object(map) => map
                .iter()
                .map(|(name, value)| FieldDefinition {
                    name: name.clone(),
                    kind: FieldKind::of(value),
                })
                .collect(),
            _ => Vec::new(),
        };
        Self { fields }
    }
}

/// Schema name to definition.
pub type Datatypes = BTreeMap<String, MessageDefinition>;

/// Per-topic message statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub message_count: u64,
    pub first_message_time: Option<Time>,
    pub last_message_time: Option<Time>,
}

impl TopicStats {
    pub fn record(&mut self, time: Time) {
        self.message_count += 1;
        self.first_message_time = Some(self.first_message_time.map_or(time, |t| t.min(time)));
        self.last_message_time = Some(self.last_message_time.map_or(time, |t| t.max(time)));
    }
}

/// Free-form key/value metadata attached to a log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub entries: BTreeMap<String, String>,
}

// --- Progress ---

/// A sub-range of the log expressed in fractions of its duration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub start: f64,
    pub end: f64,
}

impl Range {
    pub fn contains(&self, other: &Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One preloaded block of the log, per topic, in receive-time order.
#[derive(Clone, Debug, Default)]
pub struct MessageBlock {
    pub messages_by_topic: HashMap<String, Arc<[MessageEvent]>>,
    pub size_in_bytes: usize,
}

/// Cache memory usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub cache_bytes: usize,
    pub ceiling_bytes: usize,
}

/// How much of the log has been loaded.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    pub fully_loaded_fraction_ranges: Vec<Range>,
    /// Read-only view of preloaded blocks for full-preload topics.
    pub message_cache: Option<Arc<[Option<Arc<MessageBlock>>]>>,
    pub memory_info: Option<MemoryInfo>,
}

impl Progress {
    /// Whether every range in `earlier` is still covered by `self`.
    pub fn covers(&self, earlier: &Progress) -> bool {
        earlier.fully_loaded_fraction_ranges.iter().all(|old| {
            self.fully_loaded_fraction_ranges
                .iter()
                .any(|new| new.contains(old))
        })
    }
}

// --- Player State ---

/// Whether a player is usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerPresence {
    NotPresent,
    Initializing,
    Reconnecting,
    Present,
    Error,
}

/// Optional player operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerCapability {
    Advertise,
    Assets,
    CallServices,
    SetParameters,
    PlaybackControl,
    SetSpeed,
}

impl fmt::Display for PlayerCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerCapability::Advertise => "advertise",
            PlayerCapability::Assets => "assets",
            PlayerCapability::CallServices => "callServices",
            PlayerCapability::SetParameters => "setParameters",
            PlayerCapability::PlaybackControl => "playbackControl",
            PlayerCapability::SetSpeed => "setSpeed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Error,
    Warn,
    Info,
}

/// Remediation offered alongside an alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    Retry,
    Reconnect,
    Reset,
}

/// A user-visible problem report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerAlert {
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default)]
    pub tip: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
}

impl PlayerAlert {
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_severity(AlertSeverity::Error, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::with_severity(AlertSeverity::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::with_severity(AlertSeverity::Info, message)
    }

    fn with_severity(severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            tip: None,
            error: None,
            actions: Vec::new(),
        }
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_action(mut self, action: AlertAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// Identity of one player instance. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u64);

static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);

impl PlayerId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        PlayerId(NEXT_PLAYER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlayerId({})", self.0)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data available once a source is initialized.
#[derive(Clone, Debug)]
pub struct ActiveData {
    /// Messages delivered with this state, in receive-time order.
    pub messages: Arc<[MessageEvent]>,
    pub total_bytes_received: u64,
    pub current_time: Time,
    pub start_time: Time,
    pub end_time: Time,
    pub is_playing: bool,
    pub speed: f64,
    /// Bumped on every seek; consumers reset derived state when it changes.
    pub last_seek_time: u64,
    pub topics: Arc<[Topic]>,
    pub topic_stats: Arc<BTreeMap<String, TopicStats>>,
    pub datatypes: Arc<Datatypes>,
}

/// Snapshot of a player, emitted to its listener.
#[derive(Clone, Debug)]
pub struct PlayerState {
    pub presence: PlayerPresence,
    pub capabilities: Vec<PlayerCapability>,
    pub player_id: PlayerId,
    pub name: Option<String>,
    pub progress: Progress,
    pub alerts: Vec<PlayerAlert>,
    pub active_data: Option<ActiveData>,
}

impl PlayerState {
    /// State reported when no player is attached.
    pub fn not_present() -> Self {
        Self {
            presence: PlayerPresence::NotPresent,
            capabilities: Vec::new(),
            player_id: PlayerId(0),
            name: None,
            progress: Progress::default(),
            alerts: Vec::new(),
            active_data: None,
        }
    }

    pub fn has_capability(&self, capability: PlayerCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn current_time(&self) -> Option<Time> {
        self.active_data.as_ref().map(|d| d.current_time)
    }

    pub fn is_playing(&self) -> bool {
        self.active_data.as_ref().is_some_and(|d| d.is_playing)
    }
}

// --- Actions ---

/// Topic a consumer intends to publish on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseOptions {
    pub topic: String,
    pub schema_name: String,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishPayload {
    pub topic: String,
    pub message: Value,
}

/// Dashboard-wide variables forwarded to the player.
pub type GlobalVariables = BTreeMap<String, Value>;

/// A fetched asset (mesh, image, URDF...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Asset {
    pub uri: String,
    pub data: Vec<u8>,
    pub media_type: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct FetchAssetOptions {
    /// Base used to resolve relative URIs.
    pub reference_url: Option<String>,
}
