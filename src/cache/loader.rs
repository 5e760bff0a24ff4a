//! Fills the block cache for full-preload topics and reports progress.

use super::block_cache::BlockCache;
use crate::error::PlayerError;
use crate::source::{
    CancellationToken, IterableSource, IteratorStep, MessageIteratorArgs, TopicSelection,
};
use crate::time::Time;
use crate::types::{MessageEvent, Progress, Range};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Outcome of one [`BlockLoader::pump`].
#[derive(Debug)]
pub enum LoadStep {
    /// A block was read and inserted.
    Loaded(usize),
    /// Nothing to do until demand or position changes.
    Idle,
    /// The token was cancelled mid-block; nothing was inserted.
    Cancelled,
    Failed(PlayerError),
}

/// Loads one block per pump, starting at the playback position and
/// wrapping around to the start of the log.
///
/// Progress is the set of blocks that have been completely loaded at least
/// once for the current topic set. Eviction does not shrink it; changing
/// the topic set resets it.
pub struct BlockLoader {
    /// Full-preload topics with their field selections.
    topics: TopicSelection,

    /// Blocks loaded at least once for `topics`.
    loaded_once: Vec<bool>,

    /// Block position at which loading stopped for memory pressure.
    stalled_at: Option<usize>,
}

impl BlockLoader {
    pub fn new(block_count: usize) -> Self {
        Self {
            topics: TopicSelection::new(),
            loaded_once: vec![false; block_count],
            stalled_at: None,
        }
    }

    pub fn topics(&self) -> &TopicSelection {
        &self.topics
    }

    /// Replace the full-preload topic set. Topics that are dropped, or whose
    /// fields change, are removed from the cache. Any change resets progress.
    pub fn set_topics(&mut self, topics: TopicSelection, cache: &mut BlockCache) {
        if topics == self.topics {
            return;
        }
        for (topic, fields) in self.topics.iter() {
            if topics.fields(topic) != Some(fields) {
                debug!(topic, "Dropping cached blocks for topic");
                cache.drop_topic(topic);
            }
        }
        self.topics = topics;
        self.loaded_once.iter_mut().for_each(|b| *b = false);
        self.stalled_at = None;
    }

    /// Load the next missing block, if any.
    pub fn pump(
        &mut self,
        source: &dyn IterableSource,
        cache: &mut BlockCache,
        position: Time,
        cancel: &CancellationToken,
    ) -> LoadStep {
        if self.topics.is_empty() {
            return LoadStep::Idle;
        }
        let current = cache.block_index(position);
        match self.stalled_at {
            Some(block) if block == current => return LoadStep::Idle,
            Some(_) => self.stalled_at = None,
            None => {}
        }

        let Some(block) = self.next_missing(cache, current) else {
            return LoadStep::Idle;
        };

        let (start, end) = cache.block_range(block);
        let mut iter = match source.message_iterator(MessageIteratorArgs {
            topics: self.topics.clone(),
            start: Some(start),
            end: Some(end),
        }) {
            Ok(iter) => iter,
            Err(e) => return LoadStep::Failed(e),
        };

        let mut by_topic: HashMap<String, Vec<MessageEvent>> = HashMap::new();
        loop {
            match iter.next(cancel) {
                IteratorStep::Message(message) => {
                    by_topic.entry(message.topic.clone()).or_default().push(message);
                }
                IteratorStep::Alert { key, .. } => {
                    trace!(block, key = %key, "Skipping undecodable record while preloading");
                }
                IteratorStep::Stamp(_) => {}
                IteratorStep::Done => break,
                IteratorStep::Cancelled => return LoadStep::Cancelled,
                IteratorStep::Failed(e) => return LoadStep::Failed(e),
            }
        }

        for topic in self.topics.topics() {
            let messages = by_topic.remove(topic).unwrap_or_default();
            cache.insert(block, topic, messages);
        }
        self.loaded_once[block] = true;

        let evicted = cache.evict_to_ceiling();
        if cache.over_ceiling() || (!evicted.is_empty() && !cache.is_protected(block)) {
            warn!(
                block,
                bytes = cache.total_bytes(),
                "Block cache is full, pausing preload until playback moves"
            );
            self.stalled_at = Some(current);
        }

        trace!(block, "Loaded block");
        LoadStep::Loaded(block)
    }

    /// First block at or after `current` (wrapping) lacking a topic. Blocks
    /// found complete along the way count as loaded.
    fn next_missing(&mut self, cache: &BlockCache, current: usize) -> Option<usize> {
        let count = cache.block_count();
        for block in (current..count).chain(0..current) {
            let complete = self.topics.topics().all(|topic| cache.has_topic(block, topic));
            if complete {
                self.loaded_once[block] = true;
            } else {
                return Some(block);
            }
        }
        None
    }

    /// Whether every block has been loaded at least once.
    pub fn is_complete(&self) -> bool {
        !self.topics.is_empty() && self.loaded_once.iter().all(|b| *b)
    }

    /// Current progress. Message cache is attached only when there are
    /// full-preload topics.
    pub fn progress(&self, cache: &mut BlockCache) -> Progress {
        if self.topics.is_empty() {
            return Progress {
                fully_loaded_fraction_ranges: Vec::new(),
                message_cache: None,
                memory_info: Some(cache.memory_info()),
            };
        }

        let count = self.loaded_once.len().max(1) as f64;
        let mut ranges: Vec<Range> = Vec::new();
        for (block, _) in self.loaded_once.iter().enumerate().filter(|(_, b)| **b) {
            let start = block as f64 / count;
            let end = (block + 1) as f64 / count;
            match ranges.last_mut() {
                Some(last) if last.end >= start => last.end = end,
                _ => ranges.push(Range { start, end }),
            }
        }

        Progress {
            fully_loaded_fraction_ranges: ranges,
            message_cache: Some(cache.snapshot()),
            memory_info: Some(cache.memory_info()),
        }
    }
}
