//! Time index over the records of a log.

use crate::time::Time;
use std::collections::HashMap;

/// Location of one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub time: Time,
    /// Interned topic id (see [`LogIndex::topic_name`]).
    pub topic: u32,
    /// Byte offset (or position, for in-memory logs) of the record.
    pub offset: u64,
    /// Record length in bytes.
    pub len: u32,
}

/// Index mapping receive times to record locations.
///
/// Built once while scanning, then sealed with [`LogIndex::finish`] and
/// shared read-only between cursors.
#[derive(Debug, Default)]
pub struct LogIndex {
    /// All records, time-ordered after `finish`.
    entries: Vec<IndexEntry>,

    /// Topic id to name.
    topics: Vec<String>,

    /// Topic name to id.
    topic_ids: HashMap<String, u32>,

    /// Topic id to positions in `entries`, time-ordered.
    by_topic: Vec<Vec<usize>>,
}

impl LogIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. Records may arrive out of time order.
    pub fn add(&mut self, time: Time, topic: &str, offset: u64, len: u32) {
        let topic = self.intern(topic);
        self.entries.push(IndexEntry {
            time,
            topic,
            offset,
            len,
        });
    }

    fn intern(&mut self, topic: &str) -> u32 {
        if let Some(&id) = self.topic_ids.get(topic) {
            return id;
        }
        let id = self.topics.len() as u32;
        self.topics.push(topic.to_string());
        self.topic_ids.insert(topic.to_string(), id);
        id
    }

    /// Sort by time (stable, so equal times keep file order) and build the
    /// per-topic index.
    pub fn finish(&mut self) {
        self.entries.sort_by_key(|e| e.time);
        self.by_topic = vec![Vec::new(); self.topics.len()];
        for (pos, entry) in self.entries.iter().enumerate() {
            self.by_topic[entry.topic as usize].push(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, pos: usize) -> Option<&IndexEntry> {
        self.entries.get(pos)
    }

    pub fn topic_id(&self, name: &str) -> Option<u32> {
        self.topic_ids.get(name).copied()
    }

    pub fn topic_name(&self, id: u32) -> &str {
        &self.topics[id as usize]
    }

    pub fn start_time(&self) -> Option<Time> {
        self.entries.first().map(|e| e.time)
    }

    pub fn end_time(&self) -> Option<Time> {
        self.entries.last().map(|e| e.time)
    }

    /// Position of the first record with `time >= t`.
    pub fn first_at_or_after(&self, t: Time) -> usize {
        self.entries.partition_point(|e| e.time < t)
    }

    /// Positions of a topic's records at or before `t`, latest first.
    pub fn at_or_before(&self, topic: u32, t: Time) -> impl Iterator<Item = usize> + '_ {
        let positions: &[usize] = self
            .by_topic
            .get(topic as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let end = positions.partition_point(|&pos| self.entries[pos].time <= t);
        positions[..end].iter().rev().copied()
    }

    /// Number of records on a topic.
    pub fn topic_count(&self, topic: u32) -> usize {
        self.by_topic.get(topic as usize).map_or(0, Vec::len)
    }
}
