//! The message pipeline: one player, many subscribers.

use super::assets::AssetResolver;
use super::pause_frame::{PauseFrame, PauseFrameRegistry};
use crate::error::{PlayerError, Result};
use crate::player::{FrameGate, Player, PlayerListener};
use crate::subscriptions::{merge_subscriptions, SubscriberIndex};
use crate::time::Time;
use crate::types::{
    AdvertiseOptions, Asset, FetchAssetOptions, GlobalVariables, MessageEvent, Metadata,
    PlayerCapability, PlayerState, PublishPayload, SubscribePayload, SubscriberId,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

/// Receives each frame synchronously while the player waits, so it can take
/// pause frames that hold up the next advance.
pub trait FrameConsumer: Send + Sync {
    fn on_frame(&self, state: &PlayerState, messages: &[MessageEvent], frames: &PauseFrameRegistry);
}

impl<F> FrameConsumer for F
where
    F: Fn(&PlayerState, &[MessageEvent], &PauseFrameRegistry) + Send + Sync,
{
    fn on_frame(&self, state: &PlayerState, messages: &[MessageEvent], frames: &PauseFrameRegistry) {
        self(state, messages, frames)
    }
}

/// The latest state and its per-subscriber split.
struct Frame {
    state: Arc<PlayerState>,
    buckets: HashMap<SubscriberId, Arc<[MessageEvent]>>,
}

impl Frame {
    fn empty() -> Self {
        Self {
            state: Arc::new(PlayerState::not_present()),
            buckets: HashMap::new(),
        }
    }
}

struct Demand {
    subscriptions: HashMap<SubscriberId, Vec<SubscribePayload>>,
    merged: Vec<SubscribePayload>,
    index: SubscriberIndex,
}

struct Inner {
    player: RwLock<Option<Arc<dyn Player>>>,
    /// Bumped on every player change; states from older players are ignored.
    player_generation: AtomicU64,
    demand: RwLock<Demand>,
    publishers: RwLock<HashMap<SubscriberId, Vec<AdvertiseOptions>>>,
    consumers: RwLock<BTreeMap<SubscriberId, Arc<dyn FrameConsumer>>>,
    frame: RwLock<Frame>,
    pause_frames: PauseFrameRegistry,
    assets: AssetResolver,
    next_subscriber: AtomicU64,
}

impl Inner {
    fn player(&self) -> Option<Arc<dyn Player>> {
        self.player.read().clone()
    }

    fn merged_publishers(&self) -> Vec<AdvertiseOptions> {
        let mut by_topic = BTreeMap::new();
        for options in self.publishers.read().values().flatten() {
            by_topic
                .entry(options.topic.clone())
                .or_insert_with(|| options.clone());
        }
        by_topic.into_values().collect()
    }

    fn on_state(&self, generation: u64, state: PlayerState) -> FrameGate {
        let state = Arc::new(state);
        {
            let mut frame = self.frame.write();
            if self.player_generation.load(Ordering::SeqCst) != generation {
                trace!(player_id = %state.player_id, "Ignoring state from a replaced player");
                return FrameGate::open();
            }
            let messages: &[MessageEvent] = match state.active_data.as_ref() {
                Some(data) => &data.messages[..],
                None => &[],
            };
            let demand = self.demand.read();
            let buckets = demand
                .index
                .bucket(messages, demand.subscriptions.keys());
            *frame = Frame {
                state: Arc::clone(&state),
                buckets,
            };
        }

        // Consumers run without pipeline locks held; they may call back in.
        let consumers: Vec<(SubscriberId, Arc<dyn FrameConsumer>)> = self
            .consumers
            .read()
            .iter()
            .map(|(id, consumer)| (*id, Arc::clone(consumer)))
            .collect();
        for (id, consumer) in consumers {
            let messages = self
                .frame
                .read()
                .buckets
                .get(&id)
                .cloned()
                .unwrap_or_else(|| Arc::from(Vec::new()));
            consumer.on_frame(&state, &messages, &self.pause_frames);
        }

        self.pause_frames.gate()
    }
}

/// Forwards one player's states to the pipeline.
struct PipelineListener {
    inner: Weak<Inner>,
    generation: u64,
}

impl PlayerListener for PipelineListener {
    fn on_state(&self, state: PlayerState) -> FrameGate {
        match self.inner.upgrade() {
            Some(inner) => inner.on_state(self.generation, state),
            None => FrameGate::open(),
        }
    }
}

/// Sole contact point between consumers and the active player.
///
/// Cloning gives another handle to the same pipeline.
#[derive(Clone)]
pub struct MessagePipeline {
    inner: Arc<Inner>,
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self::with_assets(AssetResolver::new())
    }

    pub fn with_assets(assets: AssetResolver) -> Self {
        Self {
            inner: Arc::new(Inner {
                player: RwLock::new(None),
                player_generation: AtomicU64::new(0),
                demand: RwLock::new(Demand {
                    subscriptions: HashMap::new(),
                    merged: Vec::new(),
                    index: SubscriberIndex::default(),
                }),
                publishers: RwLock::new(HashMap::new()),
                consumers: RwLock::new(BTreeMap::new()),
                frame: RwLock::new(Frame::empty()),
                pause_frames: PauseFrameRegistry::new(),
                assets,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    // --- Player ---

    /// Replace the active player. The previous one is closed; the new one
    /// receives the current demand and publishers before its listener.
    pub fn set_player(&self, player: Arc<dyn Player>) {
        let generation = {
            let mut frame = self.inner.frame.write();
            let generation = self.inner.player_generation.fetch_add(1, Ordering::SeqCst) + 1;
            *frame = Frame::empty();
            generation
        };
        let previous = self.inner.player.write().replace(Arc::clone(&player));
        if let Some(previous) = previous {
            previous.close();
        }
        info!(generation, "Player attached");

        let merged = self.inner.demand.read().merged.clone();
        player.set_subscriptions(merged);
        let publishers = self.inner.merged_publishers();
        if !publishers.is_empty() {
            if let Err(e) = player.set_publishers(publishers) {
                debug!(error = %e, "New player does not accept publishers");
            }
        }
        player.set_listener(Arc::new(PipelineListener {
            inner: Arc::downgrade(&self.inner),
            generation,
        }));
    }

    /// Detach and close the active player.
    pub fn clear_player(&self) {
        {
            let mut frame = self.inner.frame.write();
            self.inner.player_generation.fetch_add(1, Ordering::SeqCst);
            *frame = Frame::empty();
        }
        if let Some(player) = self.inner.player.write().take() {
            player.close();
        }
    }

    /// Latest state of the active player.
    pub fn player_state(&self) -> Arc<PlayerState> {
        Arc::clone(&self.inner.frame.read().state)
    }

    /// Messages of the latest frame that `id` subscribed to.
    pub fn messages_for_subscriber(&self, id: SubscriberId) -> Arc<[MessageEvent]> {
        self.inner
            .frame
            .read()
            .buckets
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    // --- Subscribers ---

    pub fn add_subscriber(&self) -> SubscriberId {
        SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed))
    }

    /// Remove a subscriber, vacating its demand, publishers and consumer.
    pub fn remove_subscriber(&self, id: SubscriberId) {
        self.inner.consumers.write().remove(&id);
        let publishers_changed = self.inner.publishers.write().remove(&id).is_some();
        self.set_subscriptions(id, Vec::new());
        if publishers_changed {
            if let Err(e) = self.push_publishers() {
                debug!(subscriber = ?id, error = %e, "Player does not accept publishers");
            }
        }
    }

    /// Receive every frame for `id` synchronously.
    pub fn set_frame_consumer(&self, id: SubscriberId, consumer: Arc<dyn FrameConsumer>) {
        self.inner.consumers.write().insert(id, consumer);
    }

    /// Replace `id`'s subscriptions and push the re-merged demand to the
    /// player if it changed.
    pub fn set_subscriptions(&self, id: SubscriberId, payloads: Vec<SubscribePayload>) {
        let merged = {
            let mut demand = self.inner.demand.write();
            if payloads.is_empty() {
                demand.subscriptions.remove(&id);
            } else {
                demand.subscriptions.insert(id, payloads);
            }
            demand.index = SubscriberIndex::build(&demand.subscriptions);
            let merged = merge_subscriptions(&demand.subscriptions);
            if merged == demand.merged {
                return;
            }
            demand.merged = merged.clone();
            merged
        };
        debug!(topics = merged.len(), "Merged subscriptions changed");
        if let Some(player) = self.inner.player() {
            player.set_subscriptions(merged);
        }
    }

    /// Current merged demand.
    pub fn subscriptions(&self) -> Vec<SubscribePayload> {
        self.inner.demand.read().merged.clone()
    }

    // --- Actions ---

    fn require(&self, capability: PlayerCapability) -> Result<Arc<dyn Player>> {
        match self.inner.player() {
            Some(player) if player.capabilities().contains(&capability) => Ok(player),
            _ => Err(PlayerError::CapabilityUnsupported(capability)),
        }
    }

    /// Replace `id`'s advertised topics.
    pub fn set_publishers(&self, id: SubscriberId, publishers: Vec<AdvertiseOptions>) -> Result<()> {
        if publishers.is_empty() {
            self.inner.publishers.write().remove(&id);
        } else {
            self.inner.publishers.write().insert(id, publishers);
        }
        self.push_publishers()
    }

    fn push_publishers(&self) -> Result<()> {
        match self.inner.player() {
            Some(_) => {
                let player = self.require(PlayerCapability::Advertise)?;
                player.set_publishers(self.inner.merged_publishers())
            }
            None => Ok(()),
        }
    }

    pub fn publish(&self, payload: PublishPayload) -> Result<()> {
        self.require(PlayerCapability::Advertise)?.publish(payload)
    }

    pub fn set_parameter(&self, key: &str, value: Value) -> Result<()> {
        self.require(PlayerCapability::SetParameters)?
            .set_parameter(key, value)
    }

    pub fn call_service(&self, service: &str, request: Value) -> Result<Value> {
        self.require(PlayerCapability::CallServices)?
            .call_service(service, request)
    }

    /// Fetch an asset through the player or a registered scheme fetcher.
    pub fn fetch_asset(&self, uri: &str, options: &FetchAssetOptions) -> Result<Asset> {
        let player = self.inner.player();
        self.inner.assets.fetch(player.as_deref(), uri, options)
    }

    pub fn assets(&self) -> &AssetResolver {
        &self.inner.assets
    }

    /// Hold up the player's next advance until the frame is released.
    pub fn pause_frame(&self, name: impl Into<String>) -> PauseFrame {
        self.inner.pause_frames.pause_frame(name)
    }

    pub fn pause_frames(&self) -> &PauseFrameRegistry {
        &self.inner.pause_frames
    }

    // --- Playback pass-throughs (no-ops without the capability) ---

    fn with_playback(&self, capability: PlayerCapability, f: impl FnOnce(&dyn Player)) {
        if let Ok(player) = self.require(capability) {
            f(player.as_ref());
        }
    }

    pub fn start_playback(&self) {
        self.with_playback(PlayerCapability::PlaybackControl, |p| p.start_playback());
    }

    pub fn pause_playback(&self) {
        self.with_playback(PlayerCapability::PlaybackControl, |p| p.pause_playback());
    }

    pub fn seek_playback(&self, time: Time) {
        self.with_playback(PlayerCapability::PlaybackControl, |p| p.seek_playback(time));
    }

    pub fn play_until(&self, time: Time) {
        self.with_playback(PlayerCapability::PlaybackControl, |p| p.play_until(time));
    }

    pub fn set_playback_speed(&self, speed: f64) -> Result<()> {
        match self.require(PlayerCapability::SetSpeed) {
            Ok(player) => player.set_playback_speed(speed),
            Err(_) => Ok(()),
        }
    }

    pub fn set_global_variables(&self, variables: GlobalVariables) {
        if let Some(player) = self.inner.player() {
            player.set_global_variables(variables);
        }
    }

    pub fn metadata(&self) -> Vec<Metadata> {
        self.inner
            .player()
            .map(|player| player.metadata())
            .unwrap_or_default()
    }

    /// Re-run a failed player (the alert's retry action).
    pub fn retry(&self) {
        if let Some(player) = self.inner.player() {
            player.retry();
        }
    }

    /// Close the active player. The pipeline stays usable.
    pub fn close(&self) {
        self.clear_player();
    }
}

impl Default for MessagePipeline {
    fn default() -> Self {
        Self::new()
    }
}
