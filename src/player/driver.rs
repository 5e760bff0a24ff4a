//! Threaded driver for [`PlaybackCore`].
//!
//! The driver thread owns the core exclusively (moved in via
//! `thread::spawn`). Control calls arrive over a crossbeam channel; the
//! thread drains them, runs one core step, delivers the resulting state and
//! sleeps until the next tick or command.
//!
//! Superseding operations (pause, seek, play-until, retry, close) bump a
//! shared generation and cancel the in-flight token before returning, while
//! holding the delivery lock. A state is only delivered if its token is
//! still live, so once such a call returns, nothing produced by the
//! operation it superseded can reach the listener.

use super::clock::{Clock, SystemClock};
use super::core::{PlaybackCore, PlaybackStatus, Wait};
use super::traits::{FrameGate, Player, PlayerListener};
use crate::config::{validate_speed, PlayerConfig};
use crate::error::Result;
use crate::source::{CancellationToken, IterableSource};
use crate::time::Time;
use crate::types::{Metadata, PlayerCapability, PlayerId, PlayerState, SubscribePayload};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace, warn};

enum Command {
    SetListener(Arc<dyn PlayerListener>),
    SetSubscriptions(Vec<SubscribePayload>),
    Start,
    Pause,
    Seek(Time),
    PlayUntil(Time),
    SetSpeed(f64),
    Retry,
    Close,
}

/// A command stamped with the generation current when it was sent.
struct Envelope {
    generation: u64,
    command: Command,
}

/// The live operation: its generation and cancellation token.
struct OpSlot {
    generation: u64,
    token: CancellationToken,
}

/// State shared between the handle and the driver thread.
struct Shared {
    /// Held while delivering a state and while superseding. Reentrant so a
    /// listener may call back into the player from `on_state`.
    delivery: ReentrantMutex<()>,
    slot: Mutex<OpSlot>,
    metadata: RwLock<Vec<Metadata>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            delivery: ReentrantMutex::new(()),
            slot: Mutex::new(OpSlot {
                generation: 0,
                token: CancellationToken::new(),
            }),
            metadata: RwLock::new(Vec::new()),
        }
    }

    /// Cancel the live operation and start a new generation.
    fn supersede(&self) -> u64 {
        let _delivery = self.delivery.lock();
        let mut slot = self.slot.lock();
        slot.token.cancel();
        slot.token = CancellationToken::new();
        slot.generation += 1;
        slot.generation
    }

    fn current(&self) -> (u64, CancellationToken) {
        let slot = self.slot.lock();
        (slot.generation, slot.token.clone())
    }

    /// Token for work on behalf of `generation`; already cancelled if a
    /// newer generation exists.
    fn token_for(&self, generation: u64) -> CancellationToken {
        let slot = self.slot.lock();
        if slot.generation == generation {
            slot.token.clone()
        } else {
            let stale = CancellationToken::new();
            stale.cancel();
            stale
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Runs on the player thread.
struct Driver {
    core: PlaybackCore,
    config: PlayerConfig,
    shared: Arc<Shared>,
    rx: Receiver<Envelope>,
    listener: Option<Arc<dyn PlayerListener>>,

    /// Demand received before initialization finished.
    pending_subscriptions: Option<Vec<SubscribePayload>>,

    /// Unreleased frames from delivered states.
    gates: Vec<FrameGate>,
    gated_since: Option<Instant>,

    /// Newest generation whose command has been handled.
    applied: u64,
}

impl Driver {
    fn run(mut self) {
        let player_id = self.core.id();
        debug!(%player_id, "Player thread started");

        loop {
            if let Flow::Exit = self.drain() {
                break;
            }

            if self.listener.is_none() {
                match self.rx.recv() {
                    Ok(envelope) => {
                        if let Flow::Exit = self.handle(envelope) {
                            break;
                        }
                        continue;
                    }
                    Err(_) => break,
                }
            }

            // A held frame, or a superseding command still in flight, blocks
            // advancing; keep serving commands meanwhile.
            let (generation, token) = self.shared.current();
            if generation != self.applied {
                match self.wait(Some(self.config.gate_poll_interval)) {
                    Flow::Exit => break,
                    Flow::Continue => continue,
                }
            }
            if self.is_gated() {
                // Wakes on release; queued commands are drained at the top.
                if let Some(gate) = self.gates.first() {
                    gate.wait_timeout(self.config.gate_poll_interval);
                }
                continue;
            }

            let outcome = self.core.step(&token);
            if let Some(state) = outcome.state {
                self.deliver(state, &token);
            }

            let flow = match outcome.wait {
                Wait::Tick(delay) if delay.is_zero() => Flow::Continue,
                Wait::Tick(delay) => self.wait(Some(delay)),
                Wait::Idle => self.wait(None),
            };
            if let Flow::Exit = flow {
                break;
            }
        }

        self.core.close();
        debug!(%player_id, "Player thread stopped");
    }

    /// Handle every queued command without blocking.
    fn drain(&mut self) -> Flow {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if let Flow::Exit = self.handle(envelope) {
                        return Flow::Exit;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => return Flow::Exit,
            }
        }
    }

    /// Block for a command (at most `timeout`) and handle it.
    fn wait(&mut self, timeout: Option<std::time::Duration>) -> Flow {
        let received = match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(envelope) => self.handle(envelope),
            Err(RecvTimeoutError::Timeout) => Flow::Continue,
            Err(RecvTimeoutError::Disconnected) => Flow::Exit,
        }
    }

    fn handle(&mut self, envelope: Envelope) -> Flow {
        self.applied = self.applied.max(envelope.generation);
        let token = self.shared.token_for(envelope.generation);

        let result = match envelope.command {
            Command::SetListener(listener) => {
                self.listener = Some(listener);
                self.initialize(&token);
                Ok(())
            }
            Command::SetSubscriptions(subscriptions) => match self.core.status() {
                PlaybackStatus::Uninitialized | PlaybackStatus::Initializing => {
                    self.pending_subscriptions = Some(subscriptions);
                    Ok(())
                }
                _ => self.core.set_subscriptions(subscriptions, &token),
            },
            Command::Start => self.core.start(&token),
            Command::Pause => self.core.pause(),
            Command::Seek(time) => self.core.seek(time, &token),
            Command::PlayUntil(time) => self.core.play_until(time, &token),
            Command::SetSpeed(speed) => self.core.set_speed(speed),
            Command::Retry => {
                let result = self.core.retry(&token);
                self.after_initialize(&token);
                result
            }
            Command::Close => {
                self.core.close();
                self.gates.clear();
                return Flow::Exit;
            }
        };
        if let Err(e) = result {
            debug!(player_id = %self.core.id(), error = %e, "Player command failed");
        }

        if let Some(state) = self.core.emit() {
            self.deliver(state, &token);
        }
        Flow::Continue
    }

    fn initialize(&mut self, token: &CancellationToken) {
        if self.core.status() != PlaybackStatus::Uninitialized {
            return;
        }
        // Announce the initializing state before the (possibly slow) open.
        if let Some(state) = self.core.emit() {
            self.deliver(state, token);
        }
        // Failures are reported through the emitted state.
        let _ = self.core.initialize(token);
        self.after_initialize(token);
    }

    fn after_initialize(&mut self, token: &CancellationToken) {
        *self.shared.metadata.write() = self.core.metadata();
        if matches!(
            self.core.status(),
            PlaybackStatus::Uninitialized | PlaybackStatus::Initializing
        ) {
            return;
        }
        if let Some(subscriptions) = self.pending_subscriptions.take() {
            if let Err(e) = self.core.set_subscriptions(subscriptions, token) {
                debug!(player_id = %self.core.id(), error = %e, "Deferred subscriptions failed");
            }
        }
    }

    /// Deliver `state` unless `token` has been superseded, in which case its
    /// messages are returned to the core.
    fn deliver(&mut self, state: PlayerState, token: &CancellationToken) {
        let Some(listener) = self.listener.clone() else {
            self.core.requeue(state);
            return;
        };

        let gate = {
            let _delivery = self.shared.delivery.lock();
            if token.is_cancelled() {
                trace!(player_id = %self.core.id(), "Holding back superseded state");
                None
            } else {
                Some(listener.on_state(state.clone()))
            }
        };

        match gate {
            None => self.core.requeue(state),
            Some(gate) if !gate.is_released() => {
                if self.gates.is_empty() {
                    self.gated_since = Some(Instant::now());
                }
                self.gates.push(gate);
            }
            Some(_) => {}
        }
    }

    /// Whether a delivered frame is still held.
    fn is_gated(&mut self) -> bool {
        self.gates.retain(|gate| !gate.is_released());
        if self.gates.is_empty() {
            self.gated_since = None;
            return false;
        }
        if let (Some(timeout), Some(since)) = (self.config.pause_frame_timeout, self.gated_since) {
            if since.elapsed() >= timeout {
                warn!(
                    player_id = %self.core.id(),
                    held = self.gates.len(),
                    ?timeout,
                    "Pause frame not released in time, advancing anyway"
                );
                self.gates.clear();
                self.gated_since = None;
                return false;
            }
        }
        true
    }
}

/// A [`Player`] playing an [`IterableSource`] on its own thread.
pub struct IterablePlayer {
    id: PlayerId,
    shared: Arc<Shared>,
    tx: Sender<Envelope>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl IterablePlayer {
    /// Spawn a player using the system clock.
    pub fn new(source: Box<dyn IterableSource>, config: PlayerConfig) -> Result<Self> {
        Self::with_clock(source, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        source: Box<dyn IterableSource>,
        config: PlayerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let core = PlaybackCore::new(source, config.clone(), clock);
        let id = core.id();
        let shared = Arc::new(Shared::new());

        // Unbounded: listeners may send commands from the player thread
        // itself, which must never block on its own queue.
        let (tx, rx) = unbounded();
        let driver = Driver {
            core,
            config,
            shared: Arc::clone(&shared),
            rx,
            listener: None,
            pending_subscriptions: None,
            gates: Vec::new(),
            gated_since: None,
            applied: 0,
        };
        let thread = thread::Builder::new()
            .name(format!("player-{id}"))
            .spawn(move || driver.run())?;

        Ok(Self {
            id,
            shared,
            tx,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    fn send(&self, generation: u64, command: Command) {
        if self.tx.send(Envelope { generation, command }).is_err() {
            debug!(player_id = %self.id, "Player thread has exited");
        }
    }

    fn send_current(&self, command: Command) {
        let (generation, _) = self.shared.current();
        self.send(generation, command);
    }

    fn send_superseding(&self, command: Command) {
        let generation = self.shared.supersede();
        self.send(generation, command);
    }
}

impl Player for IterablePlayer {
    fn set_listener(&self, listener: Arc<dyn PlayerListener>) {
        self.send_current(Command::SetListener(listener));
    }

    fn capabilities(&self) -> Vec<PlayerCapability> {
        PlaybackCore::capabilities()
    }

    fn set_subscriptions(&self, subscriptions: Vec<SubscribePayload>) {
        self.send_current(Command::SetSubscriptions(subscriptions));
    }

    fn start_playback(&self) {
        self.send_current(Command::Start);
    }

    fn pause_playback(&self) {
        self.send_superseding(Command::Pause);
    }

    fn seek_playback(&self, time: Time) {
        self.send_superseding(Command::Seek(time));
    }

    fn play_until(&self, time: Time) {
        self.send_superseding(Command::PlayUntil(time));
    }

    fn set_playback_speed(&self, speed: f64) -> Result<()> {
        validate_speed(speed)?;
        self.send_current(Command::SetSpeed(speed));
        Ok(())
    }

    fn metadata(&self) -> Vec<Metadata> {
        self.shared.metadata.read().clone()
    }

    fn retry(&self) {
        self.send_superseding(Command::Retry);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send_superseding(Command::Close);

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        // Closing from a listener callback runs on the player thread itself.
        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            warn!(player_id = %self.id, "Player thread panicked");
        }
    }
}

impl Drop for IterablePlayer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PauseFrameRegistry;
    use crate::player::traits::FrameBarrier;
    use crate::source::MemorySource;
    use crate::types::{MessageEvent, PlayerPresence};
    use crossbeam_channel::Receiver;
    use serde_json::json;
    use std::time::Duration;

    fn source(seconds: u32) -> Box<dyn IterableSource> {
        let messages = (0..seconds * 10)
            .map(|i| {
                MessageEvent::new(
                    "/a",
                    "A",
                    Time::new(i / 10, (i % 10) * 100_000_000),
                    json!({"i": i}),
                )
            })
            .collect();
        Box::new(MemorySource::new(messages).with_bounds(Time::ZERO, Time::new(seconds, 0)))
    }

    fn listen(player: &IterablePlayer) -> Receiver<PlayerState> {
        let (tx, rx) = unbounded();
        player.set_listener(Arc::new(move |state: PlayerState| {
            let _ = tx.send(state);
            FrameGate::open()
        }));
        rx
    }

    fn wait_for(
        rx: &Receiver<PlayerState>,
        pred: impl Fn(&PlayerState) -> bool,
    ) -> Vec<PlayerState> {
        let mut seen = Vec::new();
        while let Ok(state) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = pred(&state);
            seen.push(state);
            if done {
                return seen;
            }
        }
        panic!("condition not reached; saw {} states", seen.len());
    }

    #[test]
    fn test_initializes_once_listened() {
        let player = IterablePlayer::new(source(2), PlayerConfig::default()).unwrap();
        let rx = listen(&player);
        let states = wait_for(&rx, |s| s.presence == PlayerPresence::Present);
        assert_eq!(states[0].presence, PlayerPresence::Initializing);
        assert_eq!(states.last().unwrap().player_id, player.id());
        player.close();
    }

    #[test]
    fn test_plays_to_end_in_order() {
        let config = PlayerConfig {
            default_speed: 20.0,
            max_tick_span: Duration::from_millis(50),
            ..Default::default()
        };
        let player = IterablePlayer::new(source(3), config).unwrap();
        player.set_subscriptions(vec![SubscribePayload::partial("/a")]);
        let rx = listen(&player);
        wait_for(&rx, |s| s.presence == PlayerPresence::Present);
        player.start_playback();

        let states = wait_for(&rx, |s| {
            s.active_data
                .as_ref()
                .is_some_and(|d| !d.is_playing && d.current_time == Time::new(3, 0))
        });
        let times: Vec<Time> = states
            .iter()
            .filter_map(|s| s.active_data.as_ref())
            .flat_map(|d| d.messages.iter().map(|m| m.receive_time))
            .collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(times.last(), Some(&Time::new(2, 900_000_000)));
        player.close();
    }

    #[test]
    fn test_pause_stops_advancing() {
        let player = IterablePlayer::new(source(600), PlayerConfig::default()).unwrap();
        player.set_subscriptions(vec![SubscribePayload::partial("/a")]);
        let rx = listen(&player);
        wait_for(&rx, |s| s.presence == PlayerPresence::Present);
        player.start_playback();
        wait_for(&rx, |s| s.is_playing());

        player.pause_playback();
        // Anything already queued was delivered before the pause returned.
        rx.try_iter().for_each(drop);
        thread::sleep(Duration::from_millis(100));
        let after: Vec<PlayerState> = rx.try_iter().collect();
        let mut paused_at = None;
        for state in after.iter().filter_map(|s| s.active_data.as_ref()) {
            assert!(!state.is_playing);
            let at = *paused_at.get_or_insert(state.current_time);
            assert_eq!(state.current_time, at);
        }
        player.close();
    }

    #[test]
    fn test_rapid_seeks_settle_on_last() {
        let player = IterablePlayer::new(source(60), PlayerConfig::default()).unwrap();
        player.set_subscriptions(vec![SubscribePayload::partial("/a")]);
        let rx = listen(&player);
        wait_for(&rx, |s| s.presence == PlayerPresence::Present);

        player.seek_playback(Time::new(10, 0));
        player.seek_playback(Time::new(20, 0));
        player.seek_playback(Time::new(30, 0));

        let states = wait_for(&rx, |s| s.current_time() == Some(Time::new(30, 0)));
        let last = states.last().unwrap().active_data.clone().unwrap();
        assert_eq!(last.messages.last().unwrap().receive_time, Time::new(30, 0));
        thread::sleep(Duration::from_millis(50));
        for state in rx.try_iter() {
            assert_eq!(state.current_time(), Some(Time::new(30, 0)));
        }
        player.close();
    }

    struct Hold(AtomicBool);

    impl FrameBarrier for Hold {
        fn is_released(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn wait_timeout(&self, timeout: Duration) -> bool {
            thread::sleep(timeout);
            self.is_released()
        }
    }

    #[test]
    fn test_release_wakes_held_player() {
        let config = PlayerConfig {
            gate_poll_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let player = IterablePlayer::new(source(600), config).unwrap();
        player.set_subscriptions(vec![SubscribePayload::partial("/a")]);

        let registry = PauseFrameRegistry::new();
        let taken = Arc::new(AtomicBool::new(false));
        let (frames_tx, frames_rx) = unbounded();
        let (tx, rx) = unbounded();
        {
            let registry = registry.clone();
            let taken = Arc::clone(&taken);
            player.set_listener(Arc::new(move |state: PlayerState| {
                let hold = state.is_playing() && !taken.swap(true, Ordering::SeqCst);
                let _ = tx.send(state);
                if hold {
                    let _ = frames_tx.send(registry.pause_frame("render"));
                }
                registry.gate()
            }));
        }
        wait_for(&rx, |s| s.presence == PlayerPresence::Present);
        player.start_playback();

        let frame = frames_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(50));
        let held_at = rx.try_iter().last().and_then(|s| s.current_time());
        let released = Instant::now();
        frame.release();
        wait_for(&rx, |s| s.current_time() > held_at);
        assert!(released.elapsed() < Duration::from_secs(2));
        player.close();
    }

    #[test]
    fn test_held_frame_stalls_playback() {
        let player = IterablePlayer::new(source(600), PlayerConfig::default()).unwrap();
        player.set_subscriptions(vec![SubscribePayload::partial("/a")]);

        let hold = Arc::new(Hold(AtomicBool::new(false)));
        let (tx, rx) = unbounded();
        let barrier = Arc::clone(&hold);
        player.set_listener(Arc::new(move |state: PlayerState| {
            let playing = state.is_playing();
            let _ = tx.send(state);
            if playing {
                FrameGate::new(barrier.clone())
            } else {
                FrameGate::open()
            }
        }));
        wait_for(&rx, |s| s.presence == PlayerPresence::Present);
        player.start_playback();
        wait_for(&rx, |s| s.is_playing());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(rx.try_iter().count(), 0);

        hold.0.store(true, Ordering::SeqCst);
        wait_for(&rx, |s| s.is_playing());
        player.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let player = IterablePlayer::new(source(1), PlayerConfig::default()).unwrap();
        player.close();
        player.close();
        player.start_playback();
        assert!(player.set_playback_speed(-1.0).is_err());
    }
}
