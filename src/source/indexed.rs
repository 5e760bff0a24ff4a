//! Random-access source over a memory-mapped log file.
//!
//! The file is scanned once at initialization into a [`LogIndex`]; cursors
//! then decode records lazily straight from the mapping. The on-disk
//! layout is supplied by a [`LogFormat`].

use super::cancel::CancellationToken;
use super::index::{IndexEntry, LogIndex};
use super::projection::project_event;
use super::types::{
    BackfillArgs, Initialization, IterableSource, IteratorStep, MessageIterator,
    MessageIteratorArgs, TopicSelection,
};
use crate::error::{PlayerError, Result};
use crate::time::Time;
use crate::types::{
    Datatypes, MessageDefinition, MessageEvent, PlayerAlert, Topic, TopicStats,
};
use memmap2::Mmap;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One item found while scanning a log.
#[derive(Clone, Debug)]
pub enum ScanItem {
    Record {
        offset: u64,
        len: u32,
        time: Time,
        topic: String,
        schema_name: String,
    },
    /// A record that could not be parsed; it is skipped.
    Malformed { offset: u64, reason: String },
}

/// Result of scanning a whole log.
#[derive(Clone, Debug, Default)]
pub struct ScanReport {
    pub items: Vec<ScanItem>,
    /// Offset of an incomplete trailing record, if any.
    pub truncated_at: Option<u64>,
}

/// On-disk layout of a log file.
pub trait LogFormat: Send + Sync + 'static {
    /// Short format id (also the file extension).
    fn id(&self) -> &'static str;

    /// Locate every record. Fails only if the file is structurally unusable
    /// (wrong magic, unsupported version).
    fn scan(&self, bytes: &[u8]) -> Result<ScanReport>;

    /// Decode the record at `entry`.
    fn decode(&self, bytes: &[u8], entry: &IndexEntry, topic: &str) -> Result<MessageEvent>;
}

/// Bytes of an opened log.
enum LogBytes {
    Mapped(Mmap),
    Empty,
}

impl Deref for LogBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            LogBytes::Mapped(mmap) => &mmap[..],
            LogBytes::Empty => &[],
        }
    }
}

/// Everything shared between a source and its cursors.
struct Opened<F> {
    bytes: LogBytes,
    index: LogIndex,
    format: Arc<F>,
}

/// Source reading a file through a [`LogFormat`].
pub struct IndexedSource<F: LogFormat> {
    path: PathBuf,
    format: Arc<F>,
    opened: Option<Arc<Opened<F>>>,
}

impl<F: LogFormat> IndexedSource<F> {
    pub fn new(path: impl AsRef<Path>, format: F) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format: Arc::new(format),
            opened: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn opened(&self) -> Result<&Arc<Opened<F>>> {
        self.opened.as_ref().ok_or(PlayerError::NotInitialized)
    }

    fn map_file(&self) -> Result<LogBytes> {
        let file = File::open(&self.path).map_err(|e| {
            PlayerError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let len = file
            .metadata()
            .map_err(|e| PlayerError::SourceUnavailable(format!("{}: {}", self.path.display(), e)))?
            .len();
        if len == 0 {
            return Ok(LogBytes::Empty);
        }
        // SAFETY: the mapping is read-only; logs are not modified while open.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            PlayerError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(LogBytes::Mapped(mmap))
    }
}

impl<F: LogFormat> IterableSource for IndexedSource<F> {
    fn initialize(&mut self) -> Result<Initialization> {
        let bytes = self.map_file()?;
        let report = self.format.scan(&bytes)?;

        let mut index = LogIndex::new();
        let mut schemas: BTreeMap<String, String> = BTreeMap::new();
        let mut topic_stats: BTreeMap<String, TopicStats> = BTreeMap::new();
        let mut malformed = Vec::new();

        for item in &report.items {
            match item {
                ScanItem::Record {
                    offset,
                    len,
                    time,
                    topic,
                    schema_name,
                } => {
                    index.add(*time, topic, *offset, *len);
                    schemas
                        .entry(topic.clone())
                        .or_insert_with(|| schema_name.clone());
                    topic_stats.entry(topic.clone()).or_default().record(*time);
                }
                ScanItem::Malformed { offset, reason } => {
                    debug!(offset, reason = %reason, "Skipping malformed record");
                    malformed.push(*offset);
                }
            }
        }
        index.finish();

        let mut alerts = Vec::new();
        if !malformed.is_empty() {
            warn!(
                path = %self.path.display(),
                count = malformed.len(),
                "Log contains records that could not be decoded"
            );
            alerts.push(
                PlayerAlert::warn(format!(
                    "{} record(s) could not be decoded and were skipped",
                    malformed.len()
                ))
                .with_tip(format!("First bad record at byte offset {}", malformed[0])),
            );
        }
        if let Some(offset) = report.truncated_at {
            warn!(path = %self.path.display(), offset, "Log ends with a truncated record");
            alerts.push(PlayerAlert::warn(format!(
                "Log is truncated at byte offset {offset}"
            )));
        }

        // Infer each schema from its first decodable message.
        let mut datatypes = Datatypes::new();
        for (topic, schema) in &schemas {
            if datatypes.contains_key(schema) {
                continue;
            }
            let Some(topic_id) = index.topic_id(topic) else {
                continue;
            };
            let sample = index
                .at_or_before(topic_id, Time::MAX)
                .last()
                .and_then(|pos| index.entry(pos))
                .and_then(|entry| self.format.decode(&bytes, entry, topic).ok());
            let definition = sample
                .map(|m| MessageDefinition::infer(&m.message))
                .unwrap_or_default();
            datatypes.insert(schema.clone(), definition);
        }

        let start = index.start_time().unwrap_or(Time::ZERO);
        let end = index.end_time().unwrap_or(Time::ZERO);
        info!(
            path = %self.path.display(),
            format = self.format.id(),
            records = index.len(),
            topics = schemas.len(),
            %start,
            %end,
            "Indexed log"
        );

        self.opened = Some(Arc::new(Opened {
            bytes,
            index,
            format: Arc::clone(&self.format),
        }));

        Ok(Initialization {
            name: self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            topics: schemas
                .into_iter()
                .map(|(name, schema)| Topic::new(name, schema))
                .collect(),
            datatypes,
            start,
            end,
            topic_stats,
            metadata: Vec::new(),
            alerts,
        })
    }

    fn message_iterator(&self, args: MessageIteratorArgs) -> Result<Box<dyn MessageIterator>> {
        let opened = Arc::clone(self.opened()?);
        let selected = selected_topics(&opened.index, &args.topics);
        let pos = args
            .start
            .map_or(0, |start| opened.index.first_at_or_after(start));
        Ok(Box::new(IndexedIterator {
            opened,
            selected,
            pos,
            end: args.end,
        }))
    }

    fn backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageEvent>> {
        let opened = self.opened()?;
        let index = &opened.index;
        let mut found = Vec::new();

        for (topic, fields) in args.topics.iter() {
            cancel.check()?;
            let Some(topic_id) = index.topic_id(topic) else {
                continue;
            };
            // Walk back past undecodable records to the latest good one.
            for pos in index.at_or_before(topic_id, args.time) {
                let Some(entry) = index.entry(pos) else {
                    break;
                };
                match opened.format.decode(&opened.bytes, entry, topic) {
                    Ok(message) => {
                        found.push(project_event(message, fields));
                        break;
                    }
                    Err(e) => {
                        debug!(topic, offset = entry.offset, error = %e, "Backfill skipping bad record");
                    }
                }
            }
        }

        found.sort_by_key(|m| m.receive_time);
        Ok(found)
    }

    fn terminate(&mut self) {
        self.opened = None;
    }
}

/// Topic id to field selection, for topics present in the index.
fn selected_topics(
    index: &LogIndex,
    selection: &TopicSelection,
) -> HashMap<u32, Option<Vec<String>>> {
    selection
        .iter()
        .filter_map(|(topic, fields)| {
            index
                .topic_id(topic)
                .map(|id| (id, fields.map(<[String]>::to_vec)))
        })
        .collect()
}

struct IndexedIterator<F> {
    opened: Arc<Opened<F>>,
    selected: HashMap<u32, Option<Vec<String>>>,
    pos: usize,
    end: Option<Time>,
}

impl<F: LogFormat> MessageIterator for IndexedIterator<F> {
    fn next(&mut self, cancel: &CancellationToken) -> IteratorStep {
        loop {
            if cancel.is_cancelled() {
                return IteratorStep::Cancelled;
            }
            let Some(entry) = self.opened.index.entry(self.pos).copied() else {
                return IteratorStep::Done;
            };
            if self.end.is_some_and(|end| entry.time > end) {
                return IteratorStep::Done;
            }
            self.pos += 1;

            let Some(fields) = self.selected.get(&entry.topic) else {
                continue;
            };
            let topic = self.opened.index.topic_name(entry.topic);
            return match self.opened.format.decode(&self.opened.bytes, &entry, topic) {
                Ok(message) => IteratorStep::Message(project_event(message, fields.as_deref())),
                Err(e) => {
                    warn!(topic, offset = entry.offset, error = %e, "Failed to decode record");
                    IteratorStep::Alert {
                        key: format!("decode:{topic}"),
                        alert: PlayerAlert::warn(format!(
                            "Failed to decode a message on {topic}"
                        ))
                        .with_error(e),
                    }
                }
            };
        }
    }
}
