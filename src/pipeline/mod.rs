//! # Message pipeline
//!
//! The pipeline sits between one player and any number of consumers. It
//! merges consumer subscriptions into the player's demand, splits each
//! emitted batch per subscriber, proxies user actions with capability
//! checks and turns consumer pause frames into the gate the player waits on.
//!
//! ```ignore
//! let pipeline = MessagePipeline::new();
//! let panel = pipeline.add_subscriber();
//! pipeline.set_subscriptions(panel, vec![SubscribePayload::partial("/odom")]);
//! pipeline.set_player(Arc::new(IterablePlayer::new(source, config)?));
//! pipeline.start_playback();
//! ```

mod assets;
mod pause_frame;
#[allow(clippy::module_inception)]
mod pipeline;

pub use assets::{media_type_for, resolve_uri, AssetFetcher, AssetResolver};
pub use pause_frame::{PauseFrame, PauseFrameRegistry};
pub use pipeline::{FrameConsumer, MessagePipeline};
