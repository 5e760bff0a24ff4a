//! In-memory source over a list of messages.

use super::cancel::CancellationToken;
use super::index::LogIndex;
use super::projection::project_event;
use super::types::{
    BackfillArgs, Initialization, IterableSource, IteratorStep, MessageIterator,
    MessageIteratorArgs, TopicSelection,
};
use crate::error::Result;
use crate::time::Time;
use crate::types::{Datatypes, MessageDefinition, MessageEvent, Metadata, Topic, TopicStats};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A source backed by messages already in memory.
///
/// Useful for captured live sessions, generated data and tests.
pub struct MemorySource {
    name: String,
    messages: Arc<Vec<MessageEvent>>,
    index: Arc<LogIndex>,
    bounds: Option<(Time, Time)>,
    metadata: Vec<Metadata>,
}

impl MemorySource {
    /// Create a source; messages are sorted by receive time (stable).
    pub fn new(mut messages: Vec<MessageEvent>) -> Self {
        messages.sort_by_key(|m| m.receive_time);
        let mut index = LogIndex::new();
        for (pos, message) in messages.iter().enumerate() {
            index.add(
                message.receive_time,
                &message.topic,
                pos as u64,
                message.size_in_bytes as u32,
            );
        }
        index.finish();
        Self {
            name: "memory".to_string(),
            messages: Arc::new(messages),
            index: Arc::new(index),
            bounds: None,
            metadata: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Report explicit log bounds instead of the first/last message times.
    pub fn with_bounds(mut self, start: Time, end: Time) -> Self {
        self.bounds = Some((start.min(end), start.max(end)));
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl IterableSource for MemorySource {
    fn initialize(&mut self) -> Result<Initialization> {
        let mut topics: BTreeMap<String, String> = BTreeMap::new();
        let mut datatypes = Datatypes::new();
        let mut topic_stats: BTreeMap<String, TopicStats> = BTreeMap::new();

        for message in self.messages.iter() {
            topics
                .entry(message.topic.clone())
                .or_insert_with(|| message.schema_name.clone());
            datatypes
                .entry(message.schema_name.clone())
                .or_insert_with(|| MessageDefinition::infer(&message.message));
            topic_stats
                .entry(message.topic.clone())
                .or_default()
                .record(message.receive_time);
        }

        let (start, end) = self.bounds.unwrap_or_else(|| {
            (
                self.index.start_time().unwrap_or(Time::ZERO),
                self.index.end_time().unwrap_or(Time::ZERO),
            )
        });

        Ok(Initialization {
            name: Some(self.name.clone()),
            topics: topics
                .into_iter()
                .map(|(name, schema)| Topic::new(name, schema))
                .collect(),
            datatypes,
            start,
            end,
            topic_stats,
            metadata: self.metadata.clone(),
            alerts: Vec::new(),
        })
    }

    fn message_iterator(&self, args: MessageIteratorArgs) -> Result<Box<dyn MessageIterator>> {
        let pos = args
            .start
            .map_or(0, |start| self.index.first_at_or_after(start));
        Ok(Box::new(MemoryIterator {
            messages: Arc::clone(&self.messages),
            selection: args.topics,
            pos,
            end: args.end,
        }))
    }

    fn backfill_messages(
        &self,
        args: BackfillArgs,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageEvent>> {
        let mut found = Vec::new();
        for (topic, fields) in args.topics.iter() {
            cancel.check()?;
            let Some(id) = self.index.topic_id(topic) else {
                continue;
            };
            if let Some(pos) = self.index.at_or_before(id, args.time).next() {
                found.push(project_event(self.messages[pos].clone(), fields));
            }
        }
        found.sort_by_key(|m| m.receive_time);
        Ok(found)
    }
}

struct MemoryIterator {
    messages: Arc<Vec<MessageEvent>>,
    selection: TopicSelection,
    pos: usize,
    end: Option<Time>,
}

impl MessageIterator for MemoryIterator {
    fn next(&mut self, cancel: &CancellationToken) -> IteratorStep {
        loop {
            if cancel.is_cancelled() {
                return IteratorStep::Cancelled;
            }
            let Some(message) = self.messages.get(self.pos) else {
                return IteratorStep::Done;
            };
            if self.end.is_some_and(|end| message.receive_time > end) {
                return IteratorStep::Done;
            }
            self.pos += 1;
            if let Some(fields) = self.selection.fields(&message.topic) {
                return IteratorStep::Message(project_event(message.clone(), fields));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> MemorySource {
        let mut messages = Vec::new();
        for i in 0..10u32 {
            messages.push(MessageEvent::new("/a", "A", Time::new(i, 0), json!({"i": i, "x": 0})));
            messages.push(MessageEvent::new("/b", "B", Time::new(i, 500_000_000), json!({"i": i})));
        }
        MemorySource::new(messages)
    }

    fn drain(iter: &mut dyn MessageIterator) -> Vec<MessageEvent> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while let IteratorStep::Message(m) = iter.next(&cancel) {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_initialize() {
        let mut source = source();
        let init = source.initialize().unwrap();
        assert_eq!(init.topics.len(), 2);
        assert_eq!(init.start, Time::new(0, 0));
        assert_eq!(init.end, Time::new(9, 500_000_000));
        assert_eq!(init.topic_stats["/a"].message_count, 10);
        assert!(init.datatypes.contains_key("A"));
    }

    #[test]
    fn test_iterator_range_and_topics() {
        let mut source = source();
        source.initialize().unwrap();
        let mut iter = source
            .message_iterator(MessageIteratorArgs {
                topics: TopicSelection::all_fields(["/a"]),
                start: Some(Time::new(3, 0)),
                end: Some(Time::new(5, 0)),
            })
            .unwrap();
        let times: Vec<Time> = drain(iter.as_mut()).iter().map(|m| m.receive_time).collect();
        assert_eq!(times, vec![Time::new(3, 0), Time::new(4, 0), Time::new(5, 0)]);
    }

    #[test]
    fn test_iterator_projects_fields() {
        let source = source();
        let mut selection = TopicSelection::new();
        selection.insert("/a".into(), Some(vec!["i".into()]));
        let mut iter = source
            .message_iterator(MessageIteratorArgs {
                topics: selection,
                ..Default::default()
            })
            .unwrap();
        let first = drain(iter.as_mut()).remove(0);
        assert_eq!(*first.message, json!({"i": 0}));
    }

    #[test]
    fn test_iterator_cancelled() {
        let source = source();
        let mut iter = source
            .message_iterator(MessageIteratorArgs {
                topics: TopicSelection::all_fields(["/a", "/b"]),
                ..Default::default()
            })
            .unwrap();
        let cancel = CancellationToken::new();
        assert!(matches!(iter.next(&cancel), IteratorStep::Message(_)));
        cancel.cancel();
        assert!(matches!(iter.next(&cancel), IteratorStep::Cancelled));
    }

    #[test]
    fn test_backfill() {
        let source = source();
        let found = source
            .backfill_messages(
                BackfillArgs {
                    topics: TopicSelection::all_fields(["/a", "/b", "/missing"]),
                    time: Time::new(4, 200_000_000),
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].topic, "/b");
        assert_eq!(found[0].receive_time, Time::new(3, 500_000_000));
        assert_eq!(found[1].topic, "/a");
        assert_eq!(found[1].receive_time, Time::new(4, 0));
    }
}
