//! Synchronous playback state machine.
//!
//! [`PlaybackCore`] owns one source, its block cache and the playback
//! cursor. It never spawns or sleeps: a driver feeds it control operations
//! and calls [`PlaybackCore::step`] when the returned [`Wait`] elapses.
//! Every long read takes the [`CancellationToken`] of the operation that
//! triggered it; a cancelled read returns [`PlayerError::Cancelled`] and
//! leaves the core as it was before the read.

use super::alerts::AlertManager;
use super::clock::Clock;
use crate::cache::{BlockCache, BlockLoader, CacheLookup, LoadStep};
use crate::config::{validate_speed, PlayerConfig};
use crate::error::{PlayerError, Result};
use crate::source::{
    BackfillArgs, CancellationToken, Initialization, IterableSource, IteratorStep,
    MessageIterator, MessageIteratorArgs, TopicSelection,
};
use crate::time::Time;
use crate::types::{
    ActiveData, AlertAction, Datatypes, MessageEvent, Metadata, PlayerAlert, PlayerCapability,
    PlayerId, PlayerPresence, PlayerState, PreloadType, Progress, SubscribePayload, Topic,
    TopicStats,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Alert key for fatal player errors.
const PLAYER_ALERT: &str = "player";

/// Alert key for preload failures.
const PRELOAD_ALERT: &str = "preload";

/// Lifecycle of a [`PlaybackCore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackStatus {
    Uninitialized,
    Initializing,
    Idle,
    Playing,
    Seeking,
    Errored,
    Closed,
}

/// When the driver should call [`PlaybackCore::step`] next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// After this long (zero = as soon as commands are drained).
    Tick(Duration),
    /// Only after the next command.
    Idle,
}

/// Result of one [`PlaybackCore::step`].
#[derive(Debug)]
pub struct StepOutcome {
    pub state: Option<PlayerState>,
    pub wait: Wait,
}

/// Everything known once the source is initialized.
struct Loaded {
    name: Option<String>,
    start: Time,
    end: Time,
    topics: Arc<[Topic]>,
    topic_stats: Arc<BTreeMap<String, TopicStats>>,
    datatypes: Arc<Datatypes>,
    metadata: Vec<Metadata>,
    cache: BlockCache,
    loader: BlockLoader,
}

/// Playback read position. Everything at or before `current_time` has been
/// delivered; `peeked` is the first message after it.
struct Cursor {
    iter: Box<dyn MessageIterator>,
    peeked: Option<MessageEvent>,
    done: bool,
}

/// The playback state machine behind an iterable player.
pub struct PlaybackCore {
    id: PlayerId,
    config: PlayerConfig,
    clock: Arc<dyn Clock>,
    source: Box<dyn IterableSource>,
    status: PlaybackStatus,
    loaded: Option<Loaded>,

    /// Merged demand.
    subscriptions: Vec<SubscribePayload>,
    /// Topics read by the cursor and backfill.
    selection: TopicSelection,

    current_time: Time,
    speed: f64,
    until: Option<Time>,

    /// Seek target whose backfill has not completed.
    pending_seek: Option<Time>,
    /// Whether to play once the pending seek completes.
    resume_after_seek: bool,
    /// Newly subscribed topics awaiting backfill at `current_time`.
    pending_backfill: Option<TopicSelection>,

    /// Seek epoch; bumped whenever delivery restarts at an earlier time.
    last_seek_time: u64,
    cursor: Option<Cursor>,

    /// Messages for the next emitted state.
    pending: Vec<MessageEvent>,
    last_tick: Option<Instant>,
    last_emit: Option<Instant>,
    dirty: bool,

    alerts: AlertManager,
    total_bytes_received: u64,
}

impl PlaybackCore {
    pub fn new(source: Box<dyn IterableSource>, config: PlayerConfig, clock: Arc<dyn Clock>) -> Self {
        let speed = config.default_speed;
        Self {
            id: PlayerId::next(),
            config,
            clock,
            source,
            status: PlaybackStatus::Uninitialized,
            loaded: None,
            subscriptions: Vec::new(),
            selection: TopicSelection::new(),
            current_time: Time::ZERO,
            speed,
            until: None,
            pending_seek: None,
            resume_after_seek: false,
            pending_backfill: None,
            last_seek_time: 0,
            cursor: None,
            pending: Vec::new(),
            last_tick: None,
            last_emit: None,
            dirty: true,
            alerts: AlertManager::new(),
            total_bytes_received: 0,
        }
    }

    /// Capabilities of every iterable player.
    pub fn capabilities() -> Vec<PlayerCapability> {
        vec![PlayerCapability::PlaybackControl, PlayerCapability::SetSpeed]
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn current_time(&self) -> Time {
        self.current_time
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Log bounds, once initialized.
    pub fn bounds(&self) -> Option<(Time, Time)> {
        self.loaded.as_ref().map(|l| (l.start, l.end))
    }

    pub fn metadata(&self) -> Vec<Metadata> {
        self.loaded
            .as_ref()
            .map(|l| l.metadata.clone())
            .unwrap_or_default()
    }

    pub fn subscriptions(&self) -> &[SubscribePayload] {
        &self.subscriptions
    }

    // --- Lifecycle ---

    /// Open the source. On failure the core is `Errored` with an error
    /// alert (offering retry when the failure is retryable).
    pub fn initialize(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.status {
            PlaybackStatus::Closed => return Err(PlayerError::Closed),
            PlaybackStatus::Uninitialized | PlaybackStatus::Errored => {}
            _ => return Ok(()),
        }

        self.status = PlaybackStatus::Initializing;
        self.dirty = true;
        info!(player_id = %self.id, "Initializing source");

        match self.source.initialize() {
            Ok(init) => {
                self.on_initialized(init);
                self.complete_backfill(cancel).or_else(ignore_cancelled)?;
                if !self.config.start_paused {
                    self.start(cancel)?;
                }
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn on_initialized(&mut self, init: Initialization) {
        self.alerts.clear(PLAYER_ALERT);
        self.alerts.clear_prefix("source:");
        for (i, alert) in init.alerts.into_iter().enumerate() {
            self.alerts.set(format!("source:{i}"), alert);
        }

        let (start, end) = (init.start, init.end.max(init.start));
        let cache = BlockCache::new(
            start,
            end,
            self.config.block_duration,
            self.config.cache_ceiling_bytes,
        );
        let loader = BlockLoader::new(cache.block_count());

        info!(
            player_id = %self.id,
            name = init.name.as_deref().unwrap_or(""),
            topics = init.topics.len(),
            %start,
            %end,
            "Source initialized"
        );

        self.current_time = self.current_time.clamp(start, end);
        self.loaded = Some(Loaded {
            name: init.name,
            start,
            end,
            topics: init.topics.into(),
            topic_stats: Arc::new(init.topic_stats),
            datatypes: Arc::new(init.datatypes),
            metadata: init.metadata,
            cache,
            loader,
        });
        self.status = PlaybackStatus::Idle;
        self.cursor = None;
        self.dirty = true;

        // Re-read every subscribed topic from scratch.
        self.selection = TopicSelection::new();
        self.apply_subscriptions();
    }

    /// Enter `Errored` with an alert describing `e`.
    fn fail(&mut self, e: &PlayerError) {
        error!(player_id = %self.id, error = %e, "Player failed");
        let mut alert = PlayerAlert::error(match self.loaded {
            Some(_) => "Playback stopped because the source failed",
            None => "Failed to open the data source",
        })
        .with_error(e);
        if e.is_retryable() {
            alert = alert.with_action(AlertAction::Retry);
        }
        self.alerts.set(PLAYER_ALERT, alert);
        self.status = PlaybackStatus::Errored;
        self.cursor = None;
        self.last_tick = None;
        self.until = None;
        self.dirty = true;
    }

    /// Re-open after a failure and resume from the current time.
    pub fn retry(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.status != PlaybackStatus::Errored {
            return Ok(());
        }
        info!(player_id = %self.id, "Retrying");
        self.alerts.clear(PLAYER_ALERT);
        if self.loaded.is_none() {
            return self.initialize(cancel);
        }
        self.status = PlaybackStatus::Idle;
        self.seek(self.current_time, cancel)
    }

    /// Release the source and cache. Idempotent.
    pub fn close(&mut self) {
        if self.status == PlaybackStatus::Closed {
            return;
        }
        self.source.terminate();
        self.loaded = None;
        self.cursor = None;
        self.pending.clear();
        self.pending_seek = None;
        self.pending_backfill = None;
        self.status = PlaybackStatus::Closed;
        info!(player_id = %self.id, "Player closed");
    }

    fn require_loaded(&self) -> Result<&Loaded> {
        match self.status {
            PlaybackStatus::Closed => Err(PlayerError::Closed),
            _ => self.loaded.as_ref().ok_or(PlayerError::NotInitialized),
        }
    }

    // --- Playback control ---

    pub fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        let (start, end) = {
            let loaded = self.require_loaded()?;
            (loaded.start, loaded.end)
        };
        match self.status {
            PlaybackStatus::Idle => {}
            PlaybackStatus::Seeking => {
                self.resume_after_seek = true;
                return Ok(());
            }
            _ => return Ok(()),
        }

        if self.current_time >= end && self.until.is_none() {
            debug!(player_id = %self.id, "Restarting from the beginning");
            self.seek(start, cancel)?;
            if self.status == PlaybackStatus::Seeking {
                self.resume_after_seek = true;
                return Ok(());
            }
        }

        info!(player_id = %self.id, time = %self.current_time, speed = self.speed, "Playback started");
        self.status = PlaybackStatus::Playing;
        self.last_tick = Some(self.clock.now());
        self.dirty = true;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.require_loaded()?;
        match self.status {
            PlaybackStatus::Playing => {
                info!(player_id = %self.id, time = %self.current_time, "Playback paused");
                self.status = PlaybackStatus::Idle;
            }
            PlaybackStatus::Seeking => self.resume_after_seek = false,
            _ => {}
        }
        self.until = None;
        self.last_tick = None;
        self.dirty = true;
        Ok(())
    }

    /// Move to `time` (clamped to the log), backfill every subscribed topic
    /// and resume the previous mode.
    ///
    /// If `cancel` fires during backfill, the core stays `Seeking` and the
    /// next [`step`](Self::step) retries with a fresh token.
    pub fn seek(&mut self, time: Time, cancel: &CancellationToken) -> Result<()> {
        let (start, end) = {
            let loaded = self.require_loaded()?;
            (loaded.start, loaded.end)
        };
        let resume = match self.status {
            PlaybackStatus::Idle => false,
            PlaybackStatus::Playing => true,
            PlaybackStatus::Seeking => self.resume_after_seek,
            _ => return Ok(()),
        };

        let time = time.clamp(start, end);
        debug!(player_id = %self.id, %time, resume, "Seeking");

        self.status = PlaybackStatus::Seeking;
        self.resume_after_seek = resume;
        self.pending_seek = Some(time);
        self.pending_backfill = None;
        self.pending.clear();
        self.cursor = None;
        self.current_time = time;
        self.last_tick = None;
        if self.until.is_some_and(|until| until <= time) {
            self.until = None;
        }
        self.dirty = true;

        self.complete_seek(cancel).or_else(ignore_cancelled)
    }

    fn complete_seek(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(time) = self.pending_seek else {
            return Ok(());
        };
        let found = match self.backfill(time, &self.selection, cancel) {
            Ok(found) => found,
            Err(PlayerError::Cancelled) => return Err(PlayerError::Cancelled),
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        self.pending_seek = None;
        self.last_seek_time += 1;
        self.pending = found;
        self.cursor = None;
        self.dirty = true;
        if self.resume_after_seek {
            self.status = PlaybackStatus::Playing;
            self.last_tick = Some(self.clock.now());
        } else {
            self.status = PlaybackStatus::Idle;
        }
        debug!(
            player_id = %self.id,
            %time,
            backfilled = self.pending.len(),
            epoch = self.last_seek_time,
            "Seek complete"
        );
        Ok(())
    }

    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        if self.status == PlaybackStatus::Closed {
            return Err(PlayerError::Closed);
        }
        validate_speed(speed)?;
        debug!(player_id = %self.id, speed, "Playback speed changed");
        self.speed = speed;
        self.dirty = true;
        Ok(())
    }

    /// Play from the current time and stop at `time` (clamped to the log).
    pub fn play_until(&mut self, time: Time, cancel: &CancellationToken) -> Result<()> {
        let (start, end) = {
            let loaded = self.require_loaded()?;
            (loaded.start, loaded.end)
        };
        let time = time.clamp(start, end);
        if time <= self.current_time {
            return Ok(());
        }
        self.until = Some(time);
        self.start(cancel)
    }

    // --- Subscriptions ---

    /// Replace the merged demand. Newly wanted topics are backfilled at the
    /// current time.
    pub fn set_subscriptions(
        &mut self,
        subscriptions: Vec<SubscribePayload>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.status {
            PlaybackStatus::Uninitialized | PlaybackStatus::Initializing => {
                return Err(PlayerError::NotInitialized)
            }
            PlaybackStatus::Closed => return Err(PlayerError::Closed),
            _ => {}
        }
        self.subscriptions = subscriptions;
        self.apply_subscriptions();
        self.complete_backfill(cancel).or_else(ignore_cancelled)
    }

    fn apply_subscriptions(&mut self) {
        let selection = TopicSelection::from_payloads(&self.subscriptions);
        let full: Vec<SubscribePayload> = self
            .subscriptions
            .iter()
            .filter(|p| p.preload_type == PreloadType::Full)
            .cloned()
            .collect();
        if let Some(Loaded { cache, loader, .. }) = self.loaded.as_mut() {
            loader.set_topics(TopicSelection::from_payloads(&full), cache);
        }

        if selection == self.selection {
            return;
        }
        let added = selection.difference(&self.selection);
        self.selection = selection;
        self.pending.retain(|m| self.selection.contains(&m.topic));
        self.cursor = None;
        self.dirty = true;

        if !added.is_empty() {
            let mut waiting = self.pending_backfill.take().unwrap_or_default();
            for (topic, fields) in added.iter() {
                waiting.insert(topic.to_string(), fields.map(<[String]>::to_vec));
            }
            self.pending_backfill = Some(waiting);
        }
    }

    fn complete_backfill(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !matches!(self.status, PlaybackStatus::Idle | PlaybackStatus::Playing) {
            return Ok(());
        }
        let Some(topics) = self.pending_backfill.take() else {
            return Ok(());
        };
        // Drop topics unsubscribed in the meantime.
        let mut wanted = TopicSelection::new();
        for (topic, fields) in topics.iter() {
            if self.selection.fields(topic) == Some(fields) {
                wanted.insert(topic.to_string(), fields.map(<[String]>::to_vec));
            }
        }

        match self.backfill(self.current_time, &wanted, cancel) {
            Ok(found) => {
                if !found.is_empty() {
                    self.last_seek_time += 1;
                    self.pending.extend(found);
                    self.pending.sort_by_key(|m| m.receive_time);
                    self.dirty = true;
                }
                Ok(())
            }
            Err(PlayerError::Cancelled) => {
                self.pending_backfill = Some(topics);
                Err(PlayerError::Cancelled)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Latest message at or before `time` for each topic in `topics`,
    /// served from the block cache where it can answer.
    fn backfill(
        &self,
        time: Time,
        topics: &TopicSelection,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageEvent>> {
        let loaded = self.require_loaded()?;
        let mut found = Vec::new();
        let mut misses = TopicSelection::new();

        for (topic, fields) in topics.iter() {
            if loaded.loader.topics().fields(topic) == Some(fields) {
                match loaded.cache.lookup_latest(topic, time) {
                    CacheLookup::Hit(message) => {
                        found.push(message);
                        continue;
                    }
                    CacheLookup::Absent => continue,
                    CacheLookup::Miss => {}
                }
            }
            misses.insert(topic.to_string(), fields.map(<[String]>::to_vec));
        }

        if !misses.is_empty() {
            found.extend(self.source.backfill_messages(
                BackfillArgs {
                    topics: misses,
                    time,
                },
                cancel,
            )?);
        }
        found.sort_by_key(|m| m.receive_time);
        Ok(found)
    }

    // --- Playback ---

    /// Advance the state machine by one unit of work.
    pub fn step(&mut self, cancel: &CancellationToken) -> StepOutcome {
        let result = match self.status {
            PlaybackStatus::Seeking => self.complete_seek(cancel),
            PlaybackStatus::Playing => self.complete_backfill(cancel).and_then(|_| self.tick(cancel)),
            PlaybackStatus::Idle => self.complete_backfill(cancel),
            _ => {
                return StepOutcome {
                    state: self.take_state(false),
                    wait: Wait::Idle,
                }
            }
        };
        match result {
            Ok(()) => {}
            Err(PlayerError::Cancelled) => {
                return StepOutcome {
                    state: None,
                    wait: Wait::Tick(Duration::ZERO),
                }
            }
            Err(e) => {
                if self.status != PlaybackStatus::Errored {
                    self.fail(&e);
                }
            }
        }

        let mut preloading = false;
        if matches!(self.status, PlaybackStatus::Idle | PlaybackStatus::Playing) {
            match self.pump_loader(cancel) {
                LoadStep::Loaded(_) => {
                    preloading = true;
                    self.dirty = true;
                }
                LoadStep::Idle => {}
                LoadStep::Cancelled => {
                    return StepOutcome {
                        state: None,
                        wait: Wait::Tick(Duration::ZERO),
                    }
                }
                LoadStep::Failed(e) => {
                    warn!(player_id = %self.id, error = %e, "Preloading failed");
                    if self.alerts.set(
                        PRELOAD_ALERT,
                        PlayerAlert::warn("Failed to preload messages").with_error(&e),
                    ) {
                        self.dirty = true;
                    }
                }
            }
        }

        let playing = self.status == PlaybackStatus::Playing;
        let state = self.take_state(!playing);
        let wait = match self.status {
            PlaybackStatus::Playing => Wait::Tick(self.config.target_tick_interval),
            PlaybackStatus::Seeking => Wait::Tick(Duration::ZERO),
            PlaybackStatus::Idle if preloading => Wait::Tick(Duration::ZERO),
            PlaybackStatus::Idle if self.dirty => Wait::Tick(self.emit_backoff()),
            _ => Wait::Idle,
        };
        StepOutcome { state, wait }
    }

    /// Read one batch covering the wall-clock time since the last tick.
    fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        let (end, now) = (self.require_loaded()?.end, self.clock.now());
        let elapsed = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last))
            .min(self.config.max_tick_span);
        let advance = Duration::try_from_secs_f64(elapsed.as_secs_f64() * self.speed)
            .unwrap_or(Duration::MAX);

        let mut target = self.current_time.saturating_add(advance).min(end);
        if let Some(until) = self.until {
            target = target.min(until);
        }

        let batch = self.read_until(target, cancel)?;
        self.last_tick = Some(now);
        self.current_time = target;
        self.pending.extend(batch);
        self.dirty = true;

        let reached_until = self.until.is_some_and(|until| target >= until);
        if target >= end || reached_until {
            info!(player_id = %self.id, time = %target, "Playback reached its end point");
            self.status = PlaybackStatus::Idle;
            self.until = None;
            self.last_tick = None;
        }
        Ok(())
    }

    /// Every selected message in `(current_time, target]`, in order.
    fn read_until(&mut self, target: Time, cancel: &CancellationToken) -> Result<Vec<MessageEvent>> {
        if self.selection.is_empty() {
            return Ok(Vec::new());
        }
        if self.cursor.is_none() {
            let iter = self.source.message_iterator(MessageIteratorArgs {
                topics: self.selection.clone(),
                start: Some(self.current_time.next()),
                end: None,
            })?;
            self.cursor = Some(Cursor {
                iter,
                peeked: None,
                done: false,
            });
        }

        let mut batch = Vec::new();
        let mut alerts = Vec::new();
        let outcome = {
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(batch);
            };
            loop {
                if let Some(message) = cursor.peeked.take() {
                    if message.receive_time > target {
                        cursor.peeked = Some(message);
                        break Ok(());
                    }
                    batch.push(message);
                    continue;
                }
                if cursor.done {
                    break Ok(());
                }
                match cursor.iter.next(cancel) {
                    IteratorStep::Message(message) => cursor.peeked = Some(message),
                    IteratorStep::Alert { key, alert } => alerts.push((key, alert)),
                    IteratorStep::Stamp(_) => {}
                    IteratorStep::Done => cursor.done = true,
                    IteratorStep::Cancelled => break Err(PlayerError::Cancelled),
                    IteratorStep::Failed(e) => break Err(e),
                }
            }
        };

        for (key, alert) in alerts {
            if self.alerts.set(key, alert) {
                self.dirty = true;
            }
        }
        if let Err(e) = outcome {
            self.cursor = None;
            return Err(e);
        }
        Ok(batch)
    }

    fn pump_loader(&mut self, cancel: &CancellationToken) -> LoadStep {
        let Some(Loaded { cache, loader, .. }) = self.loaded.as_mut() else {
            return LoadStep::Idle;
        };
        cache.set_window(self.current_time, self.config.read_ahead);
        let step = loader.pump(self.source.as_ref(), cache, self.current_time, cancel);
        if matches!(step, LoadStep::Loaded(_)) && loader.is_complete() {
            info!(player_id = %self.id, blocks = cache.block_count(), "Preload complete");
        }
        if matches!(step, LoadStep::Loaded(_)) && self.alerts.clear(PRELOAD_ALERT) {
            self.dirty = true;
        }
        step
    }

    // --- Emission ---

    /// Take the pending state now, if anything changed.
    pub fn emit(&mut self) -> Option<PlayerState> {
        self.take_state(false)
    }

    /// Return an emitted state that was never delivered. Its messages go
    /// back in front of the pending batch.
    pub fn requeue(&mut self, state: PlayerState) {
        if let Some(data) = state.active_data {
            let mut messages: Vec<MessageEvent> = data.messages.iter().cloned().collect();
            self.total_bytes_received = self
                .total_bytes_received
                .saturating_sub(messages.iter().map(|m| m.size_in_bytes as u64).sum::<u64>());
            messages.append(&mut self.pending);
            self.pending = messages;
        }
        self.dirty = true;
    }

    /// Remaining time before a rate-limited state may be emitted.
    fn emit_backoff(&self) -> Duration {
        let since = self
            .last_emit
            .map_or(self.config.state_emit_interval, |last| {
                self.clock.now().saturating_duration_since(last)
            });
        self.config.state_emit_interval.saturating_sub(since)
    }

    fn take_state(&mut self, rate_limited: bool) -> Option<PlayerState> {
        if !self.dirty && self.pending.is_empty() {
            return None;
        }
        if rate_limited && self.pending.is_empty() && !self.emit_backoff().is_zero() {
            return None;
        }
        self.dirty = false;
        self.last_emit = Some(self.clock.now());
        let messages = std::mem::take(&mut self.pending);
        Some(self.build_state(messages))
    }

    fn build_state(&mut self, messages: Vec<MessageEvent>) -> PlayerState {
        self.total_bytes_received += messages.iter().map(|m| m.size_in_bytes as u64).sum::<u64>();

        let presence = match self.status {
            PlaybackStatus::Uninitialized | PlaybackStatus::Initializing => {
                PlayerPresence::Initializing
            }
            PlaybackStatus::Errored => PlayerPresence::Error,
            PlaybackStatus::Closed => PlayerPresence::NotPresent,
            _ => PlayerPresence::Present,
        };

        let mut progress = Progress::default();
        let mut name = None;
        let mut active_data = None;
        if let Some(loaded) = self.loaded.as_mut() {
            progress = loaded.loader.progress(&mut loaded.cache);
            name = loaded.name.clone();
            active_data = Some(ActiveData {
                messages: messages.into(),
                total_bytes_received: self.total_bytes_received,
                current_time: self.current_time,
                start_time: loaded.start,
                end_time: loaded.end,
                is_playing: self.status == PlaybackStatus::Playing,
                speed: self.speed,
                last_seek_time: self.last_seek_time,
                topics: Arc::clone(&loaded.topics),
                topic_stats: Arc::clone(&loaded.topic_stats),
                datatypes: Arc::clone(&loaded.datatypes),
            });
        }

        PlayerState {
            presence,
            capabilities: Self::capabilities(),
            player_id: self.id,
            name,
            progress,
            alerts: self.alerts.alerts(),
            active_data,
        }
    }
}

/// Treat a cancelled read as success: the work stays pending and is
/// retried by the next step.
fn ignore_cancelled(e: PlayerError) -> Result<()> {
    match e {
        PlayerError::Cancelled => Ok(()),
        e => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::clock::ManualClock;
    use crate::source::MemorySource;
    use crate::types::Range;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_source() -> MemorySource {
        let mut messages = Vec::new();
        for i in 0..=20u32 {
            let t = Time::new(i / 2, (i % 2) * 500_000_000);
            messages.push(MessageEvent::new("/a", "A", t, json!({"i": i, "x": 1})));
        }
        for i in 0..=10u32 {
            messages.push(MessageEvent::new("/b", "B", Time::new(i, 250_000_000), json!({"i": i})));
        }
        MemorySource::new(messages).with_bounds(Time::ZERO, Time::new(10, 0))
    }

    fn core_with(source: impl IterableSource + 'static) -> (PlaybackCore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let core = PlaybackCore::new(Box::new(source), PlayerConfig::default(), clock.clone());
        (core, clock)
    }

    fn ready_core(subscriptions: Vec<SubscribePayload>) -> (PlaybackCore, Arc<ManualClock>) {
        let (mut core, clock) = core_with(sample_source());
        let cancel = CancellationToken::new();
        core.initialize(&cancel).unwrap();
        core.set_subscriptions(subscriptions, &cancel).unwrap();
        core.emit();
        (core, clock)
    }

    /// Step until idle with a 16ms manual tick, collecting every message.
    fn play_through(core: &mut PlaybackCore, clock: &ManualClock) -> Vec<PlayerState> {
        let cancel = CancellationToken::new();
        let mut states = Vec::new();
        for _ in 0..10_000 {
            clock.advance(Duration::from_millis(16));
            let outcome = core.step(&cancel);
            states.extend(outcome.state);
            if core.status() != PlaybackStatus::Playing {
                break;
            }
        }
        states
    }

    fn messages(states: &[PlayerState]) -> Vec<MessageEvent> {
        states
            .iter()
            .filter_map(|s| s.active_data.as_ref())
            .flat_map(|d| d.messages.iter().cloned())
            .collect()
    }

    #[test]
    fn test_initialize() {
        let (mut core, _clock) = core_with(sample_source());
        assert_eq!(core.status(), PlaybackStatus::Uninitialized);
        core.initialize(&CancellationToken::new()).unwrap();
        assert_eq!(core.status(), PlaybackStatus::Idle);
        assert_eq!(core.bounds(), Some((Time::ZERO, Time::new(10, 0))));

        let state = core.emit().unwrap();
        assert_eq!(state.presence, PlayerPresence::Present);
        let data = state.active_data.unwrap();
        assert_eq!(data.current_time, Time::ZERO);
        assert_eq!(data.topics.len(), 2);
        assert!(!data.is_playing);
    }

    #[test]
    fn test_subscribe_before_initialize_fails() {
        let (mut core, _clock) = core_with(sample_source());
        let result = core.set_subscriptions(vec![SubscribePayload::partial("/a")], &CancellationToken::new());
        assert!(matches!(result, Err(PlayerError::NotInitialized)));
    }

    #[test]
    fn test_play_to_end_delivers_everything_once() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        core.start(&CancellationToken::new()).unwrap();
        let states = play_through(&mut core, &clock);

        assert_eq!(core.status(), PlaybackStatus::Idle);
        assert_eq!(core.current_time(), Time::new(10, 0));
        // The message at exactly t=0 came from the subscription backfill.
        let delivered = messages(&states);
        assert_eq!(delivered.len(), 20);
        assert!(delivered
            .windows(2)
            .all(|w| w[0].receive_time < w[1].receive_time));

        let times: Vec<Time> = states
            .iter()
            .filter_map(|s| s.current_time())
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(!states.last().unwrap().is_playing());
    }

    #[test]
    fn test_tick_is_bounded() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        let cancel = CancellationToken::new();
        core.start(&cancel).unwrap();
        clock.advance(Duration::from_secs(5));
        core.step(&cancel);
        assert_eq!(core.current_time(), Time::new(0, 300_000_000));
    }

    #[test]
    fn test_speed_scales_advance() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        let cancel = CancellationToken::new();
        core.set_speed(2.0).unwrap();
        core.start(&cancel).unwrap();
        for _ in 0..10 {
            clock.advance(Duration::from_millis(100));
            core.step(&cancel);
        }
        assert_eq!(core.current_time(), Time::new(2, 0));
        assert!(core.set_speed(0.0).is_err());
    }

    #[test]
    fn test_huge_speed_jumps_to_end() {
        for speed in [1e20, f64::MAX] {
            let (mut core, clock) = ready_core(vec![SubscribePayload::partial("/a")]);
            let cancel = CancellationToken::new();
            core.set_speed(speed).unwrap();
            core.start(&cancel).unwrap();
            clock.advance(Duration::from_millis(300));
            let state = core.step(&cancel).state.unwrap();
            assert_eq!(core.status(), PlaybackStatus::Idle);
            assert_eq!(core.current_time(), Time::new(10, 0));
            assert_eq!(state.active_data.unwrap().messages.len(), 20);
        }
    }

    #[test]
    fn test_seek_backfills_then_continues() {
        let (mut core, clock) = ready_core(vec![
            SubscribePayload::partial("/a"),
            SubscribePayload::partial("/b"),
        ]);
        let cancel = CancellationToken::new();
        core.seek(Time::new(4, 100_000_000), &cancel).unwrap();
        assert_eq!(core.status(), PlaybackStatus::Idle);

        let state = core.emit().unwrap();
        let data = state.active_data.unwrap();
        assert_eq!(data.last_seek_time, 2);
        let backfill: Vec<(&str, Time)> = data
            .messages
            .iter()
            .map(|m| (m.topic.as_str(), m.receive_time))
            .collect();
        assert_eq!(
            backfill,
            vec![("/b", Time::new(3, 250_000_000)), ("/a", Time::new(4, 0))]
        );

        core.start(&cancel).unwrap();
        clock.advance(Duration::from_millis(200));
        let outcome = core.step(&cancel);
        let next: Vec<Time> = outcome
            .state
            .unwrap()
            .active_data
            .unwrap()
            .messages
            .iter()
            .map(|m| m.receive_time)
            .collect();
        assert_eq!(next, vec![Time::new(4, 250_000_000)]);
    }

    #[test]
    fn test_seek_clamps() {
        let (mut core, _clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        core.seek(Time::new(99, 0), &CancellationToken::new()).unwrap();
        assert_eq!(core.current_time(), Time::new(10, 0));
    }

    #[test]
    fn test_cancelled_seek_completes_on_step() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        core.start(&CancellationToken::new()).unwrap();
        core.seek(Time::new(5, 0), &cancelled).unwrap();
        assert_eq!(core.status(), PlaybackStatus::Seeking);
        assert!(core.emit().unwrap().active_data.unwrap().messages.is_empty());

        clock.advance(Duration::from_millis(16));
        let outcome = core.step(&CancellationToken::new());
        assert_eq!(core.status(), PlaybackStatus::Playing);
        let data = outcome.state.unwrap().active_data.unwrap();
        assert_eq!(data.messages[0].receive_time, Time::new(5, 0));
    }

    #[test]
    fn test_pause_during_seek_does_not_resume() {
        let (mut core, _clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        core.start(&CancellationToken::new()).unwrap();
        core.seek(Time::new(5, 0), &cancelled).unwrap();
        core.pause().unwrap();
        core.step(&CancellationToken::new());
        assert_eq!(core.status(), PlaybackStatus::Idle);
    }

    #[test]
    fn test_play_until() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        core.play_until(Time::new(2, 0), &CancellationToken::new()).unwrap();
        let states = play_through(&mut core, &clock);
        assert_eq!(core.status(), PlaybackStatus::Idle);
        assert_eq!(core.current_time(), Time::new(2, 0));
        let last = messages(&states).last().unwrap().receive_time;
        assert_eq!(last, Time::new(2, 0));
    }

    #[test]
    fn test_new_topic_is_backfilled() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        let cancel = CancellationToken::new();
        core.start(&cancel).unwrap();
        for _ in 0..10 {
            clock.advance(Duration::from_millis(100));
            core.step(&cancel);
        }
        assert_eq!(core.current_time(), Time::new(1, 0));
        core.emit();

        core.set_subscriptions(
            vec![
                SubscribePayload::partial("/a"),
                SubscribePayload::partial("/b"),
            ],
            &cancel,
        )
        .unwrap();
        let data = core.emit().unwrap().active_data.unwrap();
        assert_eq!(data.messages.len(), 1);
        assert_eq!(data.messages[0].topic, "/b");
        assert_eq!(data.messages[0].receive_time, Time::new(0, 250_000_000));
    }

    #[test]
    fn test_field_projection_applies() {
        let (mut core, _clock) =
            ready_core(vec![SubscribePayload::partial("/a").with_fields(["i"])]);
        core.seek(Time::new(1, 0), &CancellationToken::new()).unwrap();
        let data = core.emit().unwrap().active_data.unwrap();
        assert_eq!(*data.messages[0].message, json!({"i": 2}));
    }

    #[test]
    fn test_full_topics_preload_while_idle() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::full("/a")]);
        let cancel = CancellationToken::new();
        let mut last = Progress::default();
        for _ in 0..50 {
            clock.advance(Duration::from_millis(100));
            let outcome = core.step(&cancel);
            if let Some(state) = outcome.state {
                assert!(state.progress.covers(&last));
                last = state.progress;
            }
            if outcome.wait == Wait::Idle {
                break;
            }
        }
        assert_eq!(
            last.fully_loaded_fraction_ranges,
            vec![Range { start: 0.0, end: 1.0 }]
        );
        assert!(last.message_cache.is_some());
    }

    #[test]
    fn test_sparse_long_log_keeps_block_count_bounded() {
        let source = MemorySource::new(vec![
            MessageEvent::new("/a", "A", Time::ZERO, json!({"i": 0})),
            MessageEvent::new("/a", "A", Time::new(4_000_000_000, 0), json!({"i": 1})),
        ]);
        let (mut core, clock) = core_with(source);
        let cancel = CancellationToken::new();
        core.initialize(&cancel).unwrap();
        core.set_subscriptions(vec![SubscribePayload::full("/a")], &cancel).unwrap();

        clock.advance(Duration::from_millis(100));
        let state = core.step(&cancel).state.unwrap();
        let blocks = state.progress.message_cache.unwrap();
        assert!(blocks.len() as u64 <= crate::cache::MAX_BLOCKS);
        assert!(blocks[0].is_some());

        core.seek(Time::new(4_000_000_000, 0), &cancel).unwrap();
        let data = core.emit().unwrap().active_data.unwrap();
        assert_eq!(*data.messages[0].message, json!({"i": 1}));
    }

    #[test]
    fn test_backfill_served_from_cache() {
        let (mut core, clock) = ready_core(vec![SubscribePayload::full("/a")]);
        let cancel = CancellationToken::new();
        for _ in 0..50 {
            clock.advance(Duration::from_millis(100));
            if core.step(&cancel).wait == Wait::Idle {
                break;
            }
        }
        core.seek(Time::new(7, 600_000_000), &cancel).unwrap();
        let data = core.emit().unwrap().active_data.unwrap();
        assert_eq!(data.messages.len(), 1);
        assert_eq!(data.messages[0].receive_time, Time::new(7, 500_000_000));
    }

    struct FlakySource {
        inner: MemorySource,
        failures: Arc<AtomicUsize>,
    }

    impl IterableSource for FlakySource {
        fn initialize(&mut self) -> Result<Initialization> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PlayerError::SourceUnavailable("connection refused".into()));
            }
            self.inner.initialize()
        }

        fn message_iterator(&self, args: MessageIteratorArgs) -> Result<Box<dyn MessageIterator>> {
            self.inner.message_iterator(args)
        }

        fn backfill_messages(
            &self,
            args: BackfillArgs,
            cancel: &CancellationToken,
        ) -> Result<Vec<MessageEvent>> {
            self.inner.backfill_messages(args, cancel)
        }
    }

    #[test]
    fn test_unavailable_source_offers_retry() {
        let (mut core, _clock) = core_with(FlakySource {
            inner: sample_source(),
            failures: Arc::new(AtomicUsize::new(1)),
        });
        let cancel = CancellationToken::new();
        assert!(core.initialize(&cancel).is_err());
        assert_eq!(core.status(), PlaybackStatus::Errored);

        let state = core.emit().unwrap();
        assert_eq!(state.presence, PlayerPresence::Error);
        assert!(state.alerts[0].actions.contains(&AlertAction::Retry));

        // Demand set while errored is applied once the retry succeeds.
        core.set_subscriptions(vec![SubscribePayload::partial("/a")], &cancel)
            .unwrap();
        core.retry(&cancel).unwrap();
        assert_eq!(core.status(), PlaybackStatus::Idle);
        let state = core.emit().unwrap();
        assert!(state.alerts.is_empty());
        assert_eq!(state.active_data.unwrap().messages.len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut core, _clock) = ready_core(vec![SubscribePayload::partial("/a")]);
        core.close();
        core.close();
        assert_eq!(core.status(), PlaybackStatus::Closed);
        assert!(matches!(core.pause(), Err(PlayerError::Closed)));
        assert!(core.step(&CancellationToken::new()).state.is_none());
    }
}
