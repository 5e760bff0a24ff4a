//! # Tapedeck
//!
//! Seekable, cancellable playback of robotics telemetry logs and live
//! connections, fanned out to many independently subscribing consumers.
//!
//! ## Core Concepts
//!
//! - **Sources**: adapters turning a log into a lazy, time-ordered,
//!   cancellable message cursor with latest-before backfill
//! - **Block cache**: decode-once preload of whole topics under a memory
//!   ceiling, reported as load progress
//! - **Players**: play/pause/seek/speed state machines emitting state
//!   snapshots at a bounded rate
//! - **Pipeline**: merges subscriptions, splits batches per subscriber and
//!   gates playback on consumer pause frames
//!
//! ## Example
//!
//! ```ignore
//! use tapedeck::{IterablePlayer, MessagePipeline, PlayerConfig, SourceRegistry, SubscribePayload};
//!
//! let source = SourceRegistry::with_builtin().open_path("drive.tlog")?;
//! let player = IterablePlayer::new(source, PlayerConfig::default())?;
//!
//! let pipeline = MessagePipeline::new();
//! let panel = pipeline.add_subscriber();
//! pipeline.set_subscriptions(panel, vec![SubscribePayload::full("/odom")]);
//! pipeline.set_player(std::sync::Arc::new(player));
//! pipeline.start_playback();
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod player;
pub mod source;
pub mod subscriptions;
pub mod time;
pub mod types;

// Re-exports
pub use cache::{BlockCache, BlockLoader};
pub use config::PlayerConfig;
pub use error::{PlayerError, Result};
pub use pipeline::{AssetResolver, FrameConsumer, MessagePipeline, PauseFrame, PauseFrameRegistry};
pub use player::{
    Clock, FrameBarrier, FrameGate, IterablePlayer, LiveConnection, LiveEvent, LivePlayer,
    LiveSession, LoopbackConnection, LoopbackServer, ManualClock, PlaybackCore, Player,
    PlayerListener, SystemClock,
};
pub use source::{
    CancellationToken, FramedLogWriter, IterableSource, MemorySource, MessageIterator,
    SourceRegistry, TopicSelection,
};
pub use subscriptions::{merge_subscriptions, SubscriberIndex};
pub use time::Time;
pub use types::{
    MessageEvent, PlayerAlert, PlayerCapability, PlayerPresence, PlayerState, PreloadType,
    Progress, SubscribePayload, SubscriberId, Topic,
};
