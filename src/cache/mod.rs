//! Preloaded message blocks.
//!
//! [`BlockCache`] stores decoded blocks under a memory ceiling and
//! [`BlockLoader`] fills it for full-preload topics, one block at a time,
//! in between playback ticks.

pub mod block_cache;
pub mod loader;

pub use block_cache::{BlockCache, BlockSnapshot, CacheLookup, MAX_BLOCKS};
pub use loader::{BlockLoader, LoadStep};
