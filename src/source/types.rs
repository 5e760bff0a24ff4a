//! The contract every log or connection adapter implements.

use super::cancel::CancellationToken;
use crate::error::{PlayerError, Result};
use crate::time::Time;
use crate::types::{
    Datatypes, MessageEvent, Metadata, PlayerAlert, SubscribePayload, Topic, TopicStats,
};
use std::collections::BTreeMap;

/// What a source reports once opened.
#[derive(Clone, Debug, Default)]
pub struct Initialization {
    pub name: Option<String>,
    pub topics: Vec<Topic>,
    pub datatypes: Datatypes,
    pub start: Time,
    pub end: Time,
    pub topic_stats: BTreeMap<String, TopicStats>,
    pub metadata: Vec<Metadata>,
    /// Non-fatal problems found while opening (e.g. skipped records).
    pub alerts: Vec<PlayerAlert>,
}

/// Topics to read, each with an optional field list (`None` = all fields).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicSelection(BTreeMap<String, Option<Vec<String>>>);

impl TopicSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-merged payloads (one per topic).
    pub fn from_payloads(payloads: &[SubscribePayload]) -> Self {
        let mut selection = Self::new();
        for payload in payloads {
            selection.insert(payload.topic.clone(), payload.fields.clone());
        }
        selection
    }

    /// Select every field of the given topics.
    pub fn all_fields<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selection = Self::new();
        for topic in topics {
            selection.insert(topic.into(), None);
        }
        selection
    }

    pub fn insert(&mut self, topic: String, fields: Option<Vec<String>>) {
        self.0.insert(topic, fields);
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.0.contains_key(topic)
    }

    /// Field list for a selected topic. `None` if the topic is not selected.
    pub fn fields(&self, topic: &str) -> Option<Option<&[String]>> {
        self.0.get(topic).map(|f| f.as_deref())
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&[String]>)> {
        self.0.iter().map(|(t, f)| (t.as_str(), f.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Topics in `self` whose selection differs from (or is absent in) `other`.
    pub fn difference(&self, other: &TopicSelection) -> TopicSelection {
        let mut diff = TopicSelection::new();
        for (topic, fields) in &self.0 {
            if other.0.get(topic) != Some(fields) {
                diff.insert(topic.clone(), fields.clone());
            }
        }
        diff
    }
}

/// Arguments for [`IterableSource::message_iterator`].
#[derive(Clone, Debug, Default)]
pub struct MessageIteratorArgs {
    pub topics: TopicSelection,
    /// Inclusive lower bound; `None` = start of log.
    pub start: Option<Time>,
    /// Inclusive upper bound; `None` = end of log.
    pub end: Option<Time>,
}

/// Arguments for [`IterableSource::backfill_messages`].
#[derive(Clone, Debug)]
pub struct BackfillArgs {
    pub topics: TopicSelection,
    pub time: Time,
}

/// One pull from a [`MessageIterator`].
#[derive(Debug)]
pub enum IteratorStep {
    Message(MessageEvent),
    /// A recoverable problem (e.g. one undecodable record). Iteration continues.
    Alert { key: String, alert: PlayerAlert },
    /// The source has produced everything up to this time.
    Stamp(Time),
    /// No more messages in range.
    Done,
    /// The token was cancelled; nothing further will be produced.
    Cancelled,
    /// The source is structurally broken; iteration cannot continue.
    Failed(PlayerError),
}

/// Pull-based, time-ordered message cursor.
pub trait MessageIterator: Send {
    /// Produce the next step. Must return [`IteratorStep::Cancelled`] promptly
    /// once `cancel` is set, without yielding further messages.
    fn next(&mut self, cancel: &CancellationToken) -> IteratorStep;
}

/// Adapter over one recorded log or connection.
///
/// All methods are called from a single task; a source never sees two
/// iterator pulls at once.
pub trait IterableSource: Send {
    /// Open the source and describe its contents.
    fn initialize(&mut self) -> Result<Initialization>;

    /// Start a new cursor over `[start, end]` for the selected topics.
    /// May be called any number of times.
    fn message_iterator(&self, args: MessageIteratorArgs) -> Result<Box<dyn MessageIterator>>;

    /// Latest message at or before `args.time` for each selected topic.
    fn backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageEvent>>;

    /// Release any resources. Further calls are not expected.
    fn terminate(&mut self) {}
}
