//! # Players
//!
//! A player turns a source into a stream of [`PlayerState`] snapshots and
//! accepts user actions.
//!
//! - [`PlaybackCore`]: synchronous state machine over an `IterableSource`
//!   (initialize, play, pause, seek, speed, backfill, preload).
//! - [`IterablePlayer`]: runs a core on its own thread behind the
//!   [`Player`] trait, with synchronous cancellation of superseded work and
//!   pause-frame gating.
//! - [`LivePlayer`]: streams from a [`LiveConnection`] and reconnects on loss.
//!
//! [`PlayerState`]: crate::types::PlayerState

mod alerts;
mod clock;
mod core;
mod driver;
mod live;
mod traits;

pub use self::alerts::AlertManager;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::core::{PlaybackCore, PlaybackStatus, StepOutcome, Wait};
pub use self::driver::IterablePlayer;
pub use self::live::{
    LiveConnection, LiveEvent, LivePlayer, LiveSession, LoopbackConnection, LoopbackServer,
    ServiceHandler,
};
pub use self::traits::{FrameBarrier, FrameGate, Player, PlayerListener};
