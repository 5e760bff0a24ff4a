//! The player contract seen by the pipeline.

use crate::error::{PlayerError, Result};
use crate::time::Time;
use crate::types::{
    AdvertiseOptions, Asset, GlobalVariables, Metadata, PlayerCapability, PlayerState,
    PublishPayload, SubscribePayload,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Something a consumer holds to stop the player advancing past a frame.
pub trait FrameBarrier: Send + Sync {
    fn is_released(&self) -> bool;

    /// Block until released or `timeout` passes. Returns whether released.
    fn wait_timeout(&self, timeout: Duration) -> bool;
}

/// Returned by a listener for each emitted state. The player does not
/// advance playback until the gate is released.
#[derive(Clone, Default)]
pub struct FrameGate(Option<Arc<dyn FrameBarrier>>);

impl FrameGate {
    /// A gate that never holds.
    pub fn open() -> Self {
        Self(None)
    }

    pub fn new(barrier: Arc<dyn FrameBarrier>) -> Self {
        Self(Some(barrier))
    }

    pub fn is_released(&self) -> bool {
        self.0.as_ref().map_or(true, |b| b.is_released())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.0.as_ref().map_or(true, |b| b.wait_timeout(timeout))
    }
}

impl fmt::Debug for FrameGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGate")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Receives every state a player emits.
///
/// Called on the player's own thread, one state at a time. Implementations
/// may call back into the player.
pub trait PlayerListener: Send + Sync {
    fn on_state(&self, state: PlayerState) -> FrameGate;
}

impl<F> PlayerListener for F
where
    F: Fn(PlayerState) -> FrameGate + Send + Sync,
{
    fn on_state(&self, state: PlayerState) -> FrameGate {
        self(state)
    }
}

/// A source of player states and the target of user actions.
///
/// Actions a player cannot perform are absent from [`Player::capabilities`]
/// and fail with [`PlayerError::CapabilityUnsupported`]. Playback controls
/// are no-ops on players without them.
pub trait Player: Send + Sync {
    /// Attach the listener. Initialization starts once a listener is set.
    fn set_listener(&self, listener: Arc<dyn PlayerListener>);

    fn capabilities(&self) -> Vec<PlayerCapability>;

    /// Replace the merged demand.
    fn set_subscriptions(&self, subscriptions: Vec<SubscribePayload>);

    fn set_publishers(&self, _publishers: Vec<AdvertiseOptions>) -> Result<()> {
        Err(PlayerError::CapabilityUnsupported(PlayerCapability::Advertise))
    }

    fn set_parameter(&self, _key: &str, _value: Value) -> Result<()> {
        Err(PlayerError::CapabilityUnsupported(
            PlayerCapability::SetParameters,
        ))
    }

    fn publish(&self, _payload: PublishPayload) -> Result<()> {
        Err(PlayerError::CapabilityUnsupported(PlayerCapability::Advertise))
    }

    fn call_service(&self, _service: &str, _request: Value) -> Result<Value> {
        Err(PlayerError::CapabilityUnsupported(
            PlayerCapability::CallServices,
        ))
    }

    /// Serve an asset. `None` means the player does not handle this URI.
    fn fetch_asset(&self, _uri: &str) -> Option<Result<Asset>> {
        None
    }

    fn start_playback(&self) {}

    fn pause_playback(&self) {}

    fn seek_playback(&self, _time: Time) {}

    /// Play and stop at `time`.
    fn play_until(&self, _time: Time) {}

    fn set_playback_speed(&self, _speed: f64) -> Result<()> {
        Ok(())
    }

    fn set_global_variables(&self, _variables: GlobalVariables) {}

    fn metadata(&self) -> Vec<Metadata> {
        Vec::new()
    }

    /// Re-run a failed initialization or connection.
    fn retry(&self) {}

    /// Stop and release everything. Idempotent.
    fn close(&self);
}
