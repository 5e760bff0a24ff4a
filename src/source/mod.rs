//! Message sources.
//!
//! A source adapts one recorded log (or captured session) to a pull-based,
//! time-ordered cursor with random seeks and latest-before backfill:
//! - `types`: the [`IterableSource`] / [`MessageIterator`] contract
//! - `memory`: in-memory messages
//! - `indexed`: memory-mapped files scanned into a time index
//! - `jsonl`, `framed`: on-disk layouts for `indexed`
//! - `registry`: format id to factory

pub mod cancel;
pub mod framed;
pub mod index;
pub mod indexed;
pub mod jsonl;
pub mod memory;
pub mod projection;
pub mod registry;
pub mod types;

pub use cancel::CancellationToken;
pub use framed::{open_framed, FramedFormat, FramedLogWriter};
pub use index::{IndexEntry, LogIndex};
pub use indexed::{IndexedSource, LogFormat, ScanItem, ScanReport};
pub use jsonl::{open_jsonl, JsonLinesFormat};
pub use memory::MemorySource;
pub use projection::{project_event, project_fields};
pub use registry::{SourceDescriptor, SourceFactory, SourceRegistry};
pub use types::{
    BackfillArgs, Initialization, IterableSource, IteratorStep, MessageIterator,
    MessageIteratorArgs, TopicSelection,
};
