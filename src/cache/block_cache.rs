//! Fixed-duration blocks of decoded messages under a memory ceiling.

use crate::time::Time;
use crate::types::{MemoryInfo, MessageBlock, MessageEvent};
use lru::LruCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Shared read-only view of every block (`None` = not loaded).
pub type BlockSnapshot = Arc<[Option<Arc<MessageBlock>>]>;

/// Most blocks a cache is cut into. Logs spanning longer than
/// `MAX_BLOCKS * block_duration` get proportionally wider blocks.
pub const MAX_BLOCKS: u64 = 10_000;

/// Result of looking up the latest message on a topic in the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    /// The latest message at or before the requested time.
    Hit(MessageEvent),
    /// Every block back to the start is loaded and holds no such message.
    Absent,
    /// The answer depends on a block that is not loaded.
    Miss,
}

/// Decode-once storage of log blocks.
///
/// The log `[start, end]` is cut into `block_duration`-wide blocks. Each
/// block holds messages per topic; a topic is filled at most once per block
/// and later fills for the same topic are ignored. Blocks are evicted least
/// recently visited first, but never from the protected window around the
/// playback position.
pub struct BlockCache {
    start: Time,
    block_nanos: u64,
    block_count: usize,
    ceiling_bytes: usize,

    /// Loaded blocks keyed by index, most recently visited first.
    blocks: LruCache<usize, Arc<MessageBlock>>,

    /// Sum of `size_in_bytes` over loaded blocks.
    total_bytes: usize,

    /// Inclusive block range that must not be evicted.
    protected: Option<(usize, usize)>,

    /// Cached snapshot; invalidated on every mutation.
    snapshot: Option<BlockSnapshot>,
}

impl BlockCache {
    /// Create an empty cache over `[start, end]`.
    pub fn new(start: Time, end: Time, block_duration: Duration, ceiling_bytes: usize) -> Self {
        let span = end.as_nanos().saturating_sub(start.as_nanos());
        let requested = u64::try_from(block_duration.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        let block_nanos = requested.max(span / MAX_BLOCKS + 1);
        if block_nanos > requested {
            debug!(
                span_secs = span / 1_000_000_000,
                block_millis = block_nanos / 1_000_000,
                "Widening blocks for a long log"
            );
        }
        let block_count = usize::try_from(span / block_nanos + 1).unwrap_or(usize::MAX);

        Self {
            start,
            block_nanos,
            block_count,
            ceiling_bytes,
            blocks: LruCache::unbounded(),
            total_bytes: 0,
            protected: None,
            snapshot: None,
        }
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Width of one block, after any widening.
    pub fn block_duration(&self) -> Duration {
        Duration::from_nanos(self.block_nanos)
    }

    /// Index of the block containing `t` (clamped to the log).
    pub fn block_index(&self, t: Time) -> usize {
        let offset = t.as_nanos().saturating_sub(self.start.as_nanos());
        let index = usize::try_from(offset / self.block_nanos).unwrap_or(usize::MAX);
        index.min(self.block_count - 1)
    }

    /// Inclusive time range covered by block `index`.
    pub fn block_range(&self, index: usize) -> (Time, Time) {
        let first = self
            .start
            .as_nanos()
            .saturating_add((index as u64).saturating_mul(self.block_nanos));
        let last = first.saturating_add(self.block_nanos - 1);
        (Time::from_nanos(first), Time::from_nanos(last))
    }

    /// Protect blocks overlapping `[position, position + read_ahead]`.
    pub fn set_window(&mut self, position: Time, read_ahead: Duration) {
        let first = self.block_index(position);
        let last = self.block_index(position.saturating_add(read_ahead));
        self.protected = Some((first, last));
    }

    pub fn is_protected(&self, index: usize) -> bool {
        self.protected
            .is_some_and(|(first, last)| (first..=last).contains(&index))
    }

    /// Whether block `index` holds `topic`.
    pub fn has_topic(&self, index: usize, topic: &str) -> bool {
        self.blocks
            .peek(&index)
            .is_some_and(|block| block.messages_by_topic.contains_key(topic))
    }

    /// Get a block, marking it as recently visited.
    pub fn get(&mut self, index: usize) -> Option<Arc<MessageBlock>> {
        self.blocks.get(&index).cloned()
    }

    /// Fill `topic` in block `index`. Ignored if the block already holds the
    /// topic. Returns whether anything changed.
    pub fn insert(&mut self, index: usize, topic: &str, messages: Vec<MessageEvent>) -> bool {
        if index >= self.block_count || self.has_topic(index, topic) {
            return false;
        }

        let added: usize = messages.iter().map(|m| m.size_in_bytes).sum();
        let mut block = self.blocks.pop(&index).unwrap_or_default();
        {
            let block = Arc::make_mut(&mut block);
            block
                .messages_by_topic
                .insert(topic.to_string(), messages.into());
            block.size_in_bytes += added;
        }
        self.blocks.put(index, block);
        self.total_bytes += added;
        self.snapshot = None;

        trace!(block = index, topic, bytes = added, "Filled block");
        true
    }

    /// Evict least recently visited unprotected blocks until under the
    /// ceiling. Returns the evicted block indices.
    pub fn evict_to_ceiling(&mut self) -> Vec<usize> {
        let mut evicted = Vec::new();
        while self.total_bytes > self.ceiling_bytes {
            let victim = self
                .blocks
                .iter()
                .rev()
                .map(|(index, _)| *index)
                .find(|index| !self.is_protected(*index));
            let Some(index) = victim else {
                break;
            };
            if let Some(block) = self.blocks.pop(&index) {
                self.total_bytes -= block.size_in_bytes;
                evicted.push(index);
            }
        }

        if !evicted.is_empty() {
            self.snapshot = None;
            debug!(
                evicted = evicted.len(),
                bytes = self.total_bytes,
                ceiling = self.ceiling_bytes,
                "Evicted blocks"
            );
        }
        evicted
    }

    /// Whether usage exceeds the ceiling.
    pub fn over_ceiling(&self) -> bool {
        self.total_bytes > self.ceiling_bytes
    }

    /// Remove `topic` from every block.
    pub fn drop_topic(&mut self, topic: &str) {
        let mut emptied = Vec::new();
        let indices: Vec<usize> = self.blocks.iter().map(|(index, _)| *index).collect();
        for index in indices {
            let Some(block) = self.blocks.peek_mut(&index) else {
                continue;
            };
            let block = Arc::make_mut(block);
            let removed = block
                .messages_by_topic
                .remove(topic)
                .map_or(0, |msgs| msgs.iter().map(|m| m.size_in_bytes).sum::<usize>());
            block.size_in_bytes -= removed;
            self.total_bytes -= removed;
            if block.messages_by_topic.is_empty() {
                emptied.push(index);
            }
        }
        for index in emptied {
            self.blocks.pop(&index);
        }
        self.snapshot = None;
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.total_bytes = 0;
        self.snapshot = None;
    }

    /// Latest cached message on `topic` at or before `t`.
    pub fn lookup_latest(&self, topic: &str, t: Time) -> CacheLookup {
        let mut index = self.block_index(t);
        loop {
            let Some(messages) = self
                .blocks
                .peek(&index)
                .and_then(|block| block.messages_by_topic.get(topic))
            else {
                return CacheLookup::Miss;
            };
            if let Some(found) = messages.iter().rev().find(|m| m.receive_time <= t) {
                return CacheLookup::Hit(found.clone());
            }
            if index == 0 {
                return CacheLookup::Absent;
            }
            index -= 1;
        }
    }

    /// Read-only view of all blocks.
    pub fn snapshot(&mut self) -> BlockSnapshot {
        if let Some(snapshot) = &self.snapshot {
            return Arc::clone(snapshot);
        }
        let snapshot: BlockSnapshot = (0..self.block_count)
            .map(|index| self.blocks.peek(&index).cloned())
            .collect();
        self.snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            cache_bytes: self.total_bytes,
            ceiling_bytes: self.ceiling_bytes,
        }
    }

    /// Number of loaded blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
