//! Player over a live connection.
//!
//! A [`LivePlayer`] keeps one [`LiveConnection`] open on its own thread,
//! forwards subscribed messages to the listener as they arrive and
//! reconnects on loss. There is no timeline to control: playback operations
//! are no-ops. Publishing, services, parameters and assets go straight to
//! the connection from the calling thread.

use super::alerts::AlertManager;
use super::traits::{FrameGate, Player, PlayerListener};
use crate::config::PlayerConfig;
use crate::error::{PlayerError, Result};
use crate::source::{project_event, TopicSelection};
use crate::time::Time;
use crate::types::{
    ActiveData, AdvertiseOptions, AlertAction, Asset, Datatypes, MessageEvent, PlayerAlert,
    PlayerCapability, PlayerId, PlayerPresence, PlayerState, Progress, PublishPayload,
    SubscribePayload, Topic, TopicStats,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const CONNECTION_ALERT: &str = "connection";
const OVERFLOW_ALERT: &str = "overflow";

// --- Connection contract ---

/// What a connection reports once established.
#[derive(Clone, Debug, Default)]
pub struct LiveSession {
    pub name: Option<String>,
    pub topics: Vec<Topic>,
    pub datatypes: Datatypes,
    pub capabilities: Vec<PlayerCapability>,
    /// URI schemes the connection serves assets for (e.g. `package`).
    pub asset_schemes: Vec<String>,
}

/// Something that happened on an open connection.
#[derive(Clone, Debug)]
pub enum LiveEvent {
    Message(MessageEvent),
    /// The advertised topic set changed; topics may appear at any time.
    TopicsChanged {
        topics: Vec<Topic>,
        datatypes: Datatypes,
    },
    Disconnected(String),
}

/// A live data connection (robot bridge, websocket, ...).
///
/// Called from one thread at a time. `connect` may be called again after a
/// disconnect.
pub trait LiveConnection: Send {
    /// Establish the connection. Retryable errors trigger reconnection.
    fn connect(&mut self) -> Result<LiveSession>;

    /// Next event, waiting at most `timeout`. Errors mean the connection is
    /// gone.
    fn poll(&mut self, timeout: Duration) -> Result<Option<LiveEvent>>;

    /// Replace the remote subscription set.
    fn subscribe(&mut self, subscriptions: &[SubscribePayload]) -> Result<()>;

    fn advertise(&mut self, publishers: &[AdvertiseOptions]) -> Result<()>;

    fn publish(&mut self, payload: &PublishPayload) -> Result<()>;

    fn call_service(&mut self, service: &str, request: &Value) -> Result<Value>;

    fn set_parameter(&mut self, key: &str, value: &Value) -> Result<()>;

    fn fetch_asset(&mut self, uri: &str) -> Result<Asset> {
        Err(PlayerError::AssetNotFound(uri.to_string()))
    }

    fn close(&mut self) {}
}

// --- Player ---

enum Command {
    SetListener(Arc<dyn PlayerListener>),
    SetSubscriptions(Vec<SubscribePayload>),
    Retry,
    Close,
}

enum Link {
    /// Waiting for the next connection attempt.
    Down { next_attempt: Instant },
    Connected,
    /// Non-retryable failure; waits for an explicit retry.
    Failed,
}

/// State read by action calls on other threads.
struct LiveShared {
    connected: AtomicBool,
    capabilities: RwLock<Vec<PlayerCapability>>,
    asset_schemes: RwLock<Vec<String>>,
    publishers: Mutex<Vec<AdvertiseOptions>>,
}

type SharedConnection = Arc<Mutex<Box<dyn LiveConnection>>>;

struct LiveDriver {
    id: PlayerId,
    config: PlayerConfig,
    connection: SharedConnection,
    shared: Arc<LiveShared>,
    rx: Receiver<Command>,
    listener: Option<Arc<dyn PlayerListener>>,

    link: Link,
    attempts: u32,
    ever_connected: bool,

    name: Option<String>,
    topics: Arc<[Topic]>,
    datatypes: Arc<Datatypes>,
    topic_stats: BTreeMap<String, TopicStats>,

    subscriptions: Vec<SubscribePayload>,
    selection: TopicSelection,

    pending: VecDeque<MessageEvent>,
    dropped: u64,
    /// Newest receive time handed to the listener.
    last_delivered: Option<Time>,
    /// Bumped when a late message would go backwards in time.
    epoch: u64,
    start_time: Option<Time>,
    current_time: Time,
    total_bytes_received: u64,

    alerts: AlertManager,
    dirty: bool,
    last_emit: Option<Instant>,
    gates: Vec<FrameGate>,
    gated_since: Option<Instant>,
}

impl LiveDriver {
    fn run(mut self) {
        debug!(player_id = %self.id, "Live player thread started");
        'outer: loop {
            loop {
                match self.rx.try_recv() {
                    Ok(command) => {
                        if !self.handle(command) {
                            break 'outer;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            if self.listener.is_none() {
                match self.rx.recv() {
                    Ok(command) => {
                        if self.handle(command) {
                            continue;
                        }
                        break;
                    }
                    Err(_) => break,
                }
            }

            match self.link {
                Link::Down { next_attempt } if Instant::now() >= next_attempt => self.connect(),
                Link::Connected => self.poll_events(),
                _ => {}
            }

            if !self.is_gated() {
                if let Some(state) = self.take_state() {
                    self.deliver(state);
                }
            }

            match self.rx.recv_timeout(self.config.target_tick_interval) {
                Ok(command) => {
                    if !self.handle(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        self.connection.lock().close();
        info!(player_id = %self.id, "Live player closed");
    }

    /// Returns false once the player should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::SetListener(listener) => {
                self.listener = Some(listener);
                self.dirty = true;
            }
            Command::SetSubscriptions(subscriptions) => {
                self.selection = TopicSelection::from_payloads(&subscriptions);
                self.subscriptions = subscriptions;
                // Drop buffered messages nobody wants anymore.
                let selection = &self.selection;
                self.pending.retain(|m| selection.contains(&m.topic));
                if let Link::Connected = self.link {
                    let result = self.connection.lock().subscribe(&self.subscriptions);
                    if let Err(e) = result {
                        warn!(player_id = %self.id, error = %e, "Failed to update remote subscriptions");
                    }
                }
            }
            Command::Retry => {
                if !matches!(self.link, Link::Connected) {
                    self.link = Link::Down {
                        next_attempt: Instant::now(),
                    };
                }
            }
            Command::Close => return false,
        }
        true
    }

    fn connect(&mut self) {
        self.attempts += 1;
        self.dirty = true;
        let result = self.connection.lock().connect();
        match result {
            Ok(session) => {
                info!(
                    player_id = %self.id,
                    topics = session.topics.len(),
                    attempt = self.attempts,
                    "Live connection established"
                );
                self.ever_connected = true;
                self.link = Link::Connected;
                self.alerts.clear(CONNECTION_ALERT);
                self.name = session.name;
                self.topics = session.topics.into();
                self.datatypes = Arc::new(session.datatypes);
                *self.shared.capabilities.write() = session.capabilities;
                *self.shared.asset_schemes.write() = session.asset_schemes;
                self.shared.connected.store(true, Ordering::SeqCst);
                self.restore_remote_state();
            }
            Err(e) if e.is_retryable() => {
                debug!(player_id = %self.id, error = %e, attempt = self.attempts, "Live connection attempt failed");
                self.mark_down(e.to_string());
            }
            Err(e) => {
                error!(player_id = %self.id, error = %e, "Live connection failed");
                self.link = Link::Failed;
                self.alerts.set(
                    CONNECTION_ALERT,
                    PlayerAlert::error("Failed to connect")
                        .with_error(&e)
                        .with_action(AlertAction::Retry),
                );
            }
        }
    }

    /// Re-send subscriptions and advertisements after (re)connecting.
    fn restore_remote_state(&mut self) {
        let publishers = self.shared.publishers.lock().clone();
        let mut connection = self.connection.lock();
        if let Err(e) = connection.subscribe(&self.subscriptions) {
            warn!(player_id = %self.id, error = %e, "Failed to restore subscriptions");
        }
        if !publishers.is_empty() {
            if let Err(e) = connection.advertise(&publishers) {
                warn!(player_id = %self.id, error = %e, "Failed to restore publishers");
            }
        }
    }

    fn mark_down(&mut self, reason: String) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.link = Link::Down {
            next_attempt: Instant::now() + self.config.reconnect_interval,
        };
        self.alerts.set(
            CONNECTION_ALERT,
            PlayerAlert::warn("Connection lost, reconnecting")
                .with_error(reason)
                .with_action(AlertAction::Reconnect),
        );
        self.dirty = true;
    }

    fn poll_events(&mut self) {
        for _ in 0..self.config.live_buffer_limit {
            let polled = self.connection.lock().poll(Duration::ZERO);
            match polled {
                Ok(Some(LiveEvent::Message(message))) => self.on_message(message),
                Ok(Some(LiveEvent::TopicsChanged { topics, datatypes })) => {
                    debug!(player_id = %self.id, topics = topics.len(), "Live topics changed");
                    self.topics = topics.into();
                    let mut merged = (*self.datatypes).clone();
                    merged.extend(datatypes);
                    self.datatypes = Arc::new(merged);
                    self.dirty = true;
                }
                Ok(Some(LiveEvent::Disconnected(reason))) => {
                    warn!(player_id = %self.id, %reason, "Live connection lost");
                    self.mark_down(reason);
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(player_id = %self.id, error = %e, "Live connection failed");
                    self.mark_down(e.to_string());
                    return;
                }
            }
        }
    }

    fn on_message(&mut self, message: MessageEvent) {
        let Some(fields) = self.selection.fields(&message.topic) else {
            trace!(player_id = %self.id, topic = %message.topic, "Dropping unsubscribed message");
            return;
        };
        let message = project_event(message, fields);

        let time = message.receive_time;
        self.start_time.get_or_insert(time);
        self.current_time = self.current_time.max(time);
        self.topic_stats
            .entry(message.topic.clone())
            .or_default()
            .record(time);

        self.pending.push_back(message);
        if self.pending.len() > self.config.live_buffer_limit {
            self.pending.pop_front();
            self.dropped += 1;
        }
    }

    fn take_state(&mut self) -> Option<PlayerState> {
        if self.dropped > 0 {
            warn!(player_id = %self.id, dropped = self.dropped, "Live buffer overflowed");
            self.alerts.set(
                OVERFLOW_ALERT,
                PlayerAlert::warn("Messages arrived faster than they could be delivered")
                    .with_tip("Subscribe to fewer topics"),
            );
            self.dropped = 0;
            self.dirty = true;
        }
        if self.pending.is_empty() {
            if !self.dirty {
                return None;
            }
            let recent = self
                .last_emit
                .is_some_and(|last| last.elapsed() < self.config.state_emit_interval);
            if recent {
                return None;
            }
        }
        self.dirty = false;
        self.last_emit = Some(Instant::now());

        let mut messages: Vec<MessageEvent> = self.pending.drain(..).collect();
        messages.sort_by_key(|m| m.receive_time);
        if let (Some(first), Some(last)) = (messages.first(), self.last_delivered) {
            if first.receive_time < last {
                debug!(
                    player_id = %self.id,
                    time = %first.receive_time,
                    last = %last,
                    "Late live message, starting a new epoch"
                );
                self.epoch += 1;
            }
        }
        if let Some(newest) = messages.last() {
            self.last_delivered = Some(newest.receive_time);
        }
        self.total_bytes_received += messages.iter().map(|m| m.size_in_bytes as u64).sum::<u64>();

        let presence = match self.link {
            Link::Connected => PlayerPresence::Present,
            Link::Failed => PlayerPresence::Error,
            Link::Down { .. } if self.attempts == 0 => PlayerPresence::Initializing,
            Link::Down { .. } => PlayerPresence::Reconnecting,
        };
        let active_data = self.ever_connected.then(|| {
            let start = self.start_time.unwrap_or(self.current_time);
            ActiveData {
                messages: messages.into(),
                total_bytes_received: self.total_bytes_received,
                current_time: self.current_time,
                start_time: start,
                end_time: self.current_time,
                is_playing: true,
                speed: 1.0,
                last_seek_time: self.epoch,
                topics: Arc::clone(&self.topics),
                topic_stats: Arc::new(self.topic_stats.clone()),
                datatypes: Arc::clone(&self.datatypes),
            }
        });

        Some(PlayerState {
            presence,
            capabilities: self.shared.capabilities.read().clone(),
            player_id: self.id,
            name: self.name.clone(),
            progress: Progress::default(),
            alerts: self.alerts.alerts(),
            active_data,
        })
    }

    fn deliver(&mut self, state: PlayerState) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let gate = listener.on_state(state);
        if !gate.is_released() {
            if self.gates.is_empty() {
                self.gated_since = Some(Instant::now());
            }
            self.gates.push(gate);
        }
    }

    fn is_gated(&mut self) -> bool {
        self.gates.retain(|gate| !gate.is_released());
        if self.gates.is_empty() {
            self.gated_since = None;
            return false;
        }
        if let (Some(timeout), Some(since)) = (self.config.pause_frame_timeout, self.gated_since) {
            if since.elapsed() >= timeout {
                warn!(player_id = %self.id, held = self.gates.len(), "Pause frame not released in time");
                self.gates.clear();
                self.gated_since = None;
                return false;
            }
        }
        true
    }
}

/// A [`Player`] streaming from a [`LiveConnection`].
pub struct LivePlayer {
    id: PlayerId,
    connection: SharedConnection,
    shared: Arc<LiveShared>,
    tx: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LivePlayer {
    /// Spawn the player. Connecting starts once a listener is set.
    pub fn new(connection: Box<dyn LiveConnection>, config: PlayerConfig) -> Result<Self> {
        config.validate()?;
        let id = PlayerId::next();
        let connection: SharedConnection = Arc::new(Mutex::new(connection));
        let shared = Arc::new(LiveShared {
            connected: AtomicBool::new(false),
            capabilities: RwLock::new(Vec::new()),
            asset_schemes: RwLock::new(Vec::new()),
            publishers: Mutex::new(Vec::new()),
        });
        let (tx, rx) = unbounded();

        let driver = LiveDriver {
            id,
            config,
            connection: Arc::clone(&connection),
            shared: Arc::clone(&shared),
            rx,
            listener: None,
            link: Link::Down {
                next_attempt: Instant::now(),
            },
            attempts: 0,
            ever_connected: false,
            name: None,
            topics: Arc::from(Vec::new()),
            datatypes: Arc::new(Datatypes::new()),
            topic_stats: BTreeMap::new(),
            subscriptions: Vec::new(),
            selection: TopicSelection::new(),
            pending: VecDeque::new(),
            dropped: 0,
            last_delivered: None,
            epoch: 0,
            start_time: None,
            current_time: Time::ZERO,
            total_bytes_received: 0,
            alerts: AlertManager::new(),
            dirty: true,
            last_emit: None,
            gates: Vec::new(),
            gated_since: None,
        };
        let thread = thread::Builder::new()
            .name(format!("live-player-{id}"))
            .spawn(move || driver.run())?;

        Ok(Self {
            id,
            connection,
            shared,
            tx,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!(player_id = %self.id, "Live player thread has exited");
        }
    }

    /// Fail unless the capability is offered and the link is up.
    fn require(&self, capability: PlayerCapability) -> Result<()> {
        if !self.shared.capabilities.read().contains(&capability) {
            return Err(PlayerError::CapabilityUnsupported(capability));
        }
        if !self.is_connected() {
            return Err(PlayerError::SourceUnavailable("not connected".into()));
        }
        Ok(())
    }
}

impl Player for LivePlayer {
    fn set_listener(&self, listener: Arc<dyn PlayerListener>) {
        self.send(Command::SetListener(listener));
    }

    fn capabilities(&self) -> Vec<PlayerCapability> {
        self.shared.capabilities.read().clone()
    }

    fn set_subscriptions(&self, subscriptions: Vec<SubscribePayload>) {
        self.send(Command::SetSubscriptions(subscriptions));
    }

    fn set_publishers(&self, publishers: Vec<AdvertiseOptions>) -> Result<()> {
        if !self
            .shared
            .capabilities
            .read()
            .contains(&PlayerCapability::Advertise)
        {
            return Err(PlayerError::CapabilityUnsupported(PlayerCapability::Advertise));
        }
        *self.shared.publishers.lock() = publishers.clone();
        if self.is_connected() {
            self.connection.lock().advertise(&publishers)?;
        }
        Ok(())
    }

    fn set_parameter(&self, key: &str, value: Value) -> Result<()> {
        self.require(PlayerCapability::SetParameters)?;
        self.connection.lock().set_parameter(key, &value)
    }

    fn publish(&self, payload: PublishPayload) -> Result<()> {
        self.require(PlayerCapability::Advertise)?;
        self.connection.lock().publish(&payload)
    }

    fn call_service(&self, service: &str, request: Value) -> Result<Value> {
        self.require(PlayerCapability::CallServices)?;
        self.connection.lock().call_service(service, &request)
    }

    fn fetch_asset(&self, uri: &str) -> Option<Result<Asset>> {
        if !self.capabilities().contains(&PlayerCapability::Assets) {
            return None;
        }
        let scheme = uri.split_once("://").map(|(scheme, _)| scheme)?;
        if !self.shared.asset_schemes.read().iter().any(|s| s == scheme) {
            return None;
        }
        if !self.is_connected() {
            return Some(Err(PlayerError::SourceUnavailable("not connected".into())));
        }
        Some(self.connection.lock().fetch_asset(uri))
    }

    fn retry(&self) {
        self.send(Command::Retry);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send(Command::Close);
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            warn!(player_id = %self.id, "Live player thread panicked");
        }
    }
}

impl Drop for LivePlayer {
    fn drop(&mut self) {
        self.close();
    }
}

// --- Loopback ---

/// Service handler registered on a [`LoopbackServer`].
pub type ServiceHandler = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

struct LoopbackState {
    accepting: AtomicBool,
    connects: AtomicUsize,
    session: Mutex<LiveSession>,
    subscriptions: Mutex<Vec<SubscribePayload>>,
    advertised: Mutex<Vec<AdvertiseOptions>>,
    published: Mutex<Vec<PublishPayload>>,
    parameters: Mutex<BTreeMap<String, Value>>,
    services: Mutex<HashMap<String, ServiceHandler>>,
    assets: Mutex<HashMap<String, Asset>>,
}

/// In-memory [`LiveConnection`], driven by its paired [`LoopbackServer`].
pub struct LoopbackConnection {
    state: Arc<LoopbackState>,
    events: Receiver<LiveEvent>,
    connected: bool,
}

/// Server half of a loopback pair: pushes events and records what the
/// client sent.
pub struct LoopbackServer {
    state: Arc<LoopbackState>,
    events: Sender<LiveEvent>,
}

impl LoopbackConnection {
    /// Create a connected pair. The server offers every live capability and
    /// serves `package://` assets.
    pub fn pair() -> (LoopbackConnection, LoopbackServer) {
        let (tx, rx) = unbounded();
        let state = Arc::new(LoopbackState {
            accepting: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            session: Mutex::new(LiveSession {
                name: Some("loopback".into()),
                topics: Vec::new(),
                datatypes: Datatypes::new(),
                capabilities: vec![
                    PlayerCapability::Advertise,
                    PlayerCapability::CallServices,
                    PlayerCapability::SetParameters,
                    PlayerCapability::Assets,
                ],
                asset_schemes: vec!["package".into()],
            }),
            subscriptions: Mutex::new(Vec::new()),
            advertised: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            parameters: Mutex::new(BTreeMap::new()),
            services: Mutex::new(HashMap::new()),
            assets: Mutex::new(HashMap::new()),
        });
        let connection = LoopbackConnection {
            state: Arc::clone(&state),
            events: rx,
            connected: false,
        };
        (connection, LoopbackServer { state, events: tx })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(PlayerError::SourceUnavailable("loopback not connected".into()))
        }
    }
}

impl LiveConnection for LoopbackConnection {
    fn connect(&mut self) -> Result<LiveSession> {
        if !self.state.accepting.load(Ordering::SeqCst) {
            return Err(PlayerError::SourceUnavailable(
                "loopback server refused the connection".into(),
            ));
        }
        self.connected = true;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.session.lock().clone())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<LiveEvent>> {
        self.ensure_connected()?;
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                if let LiveEvent::Disconnected(_) = event {
                    self.connected = false;
                }
                Ok(Some(event))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.connected = false;
                Ok(Some(LiveEvent::Disconnected("loopback server dropped".into())))
            }
        }
    }

    fn subscribe(&mut self, subscriptions: &[SubscribePayload]) -> Result<()> {
        self.ensure_connected()?;
        *self.state.subscriptions.lock() = subscriptions.to_vec();
        Ok(())
    }

    fn advertise(&mut self, publishers: &[AdvertiseOptions]) -> Result<()> {
        self.ensure_connected()?;
        *self.state.advertised.lock() = publishers.to_vec();
        Ok(())
    }

    fn publish(&mut self, payload: &PublishPayload) -> Result<()> {
        self.ensure_connected()?;
        let advertised = self
            .state
            .advertised
            .lock()
            .iter()
            .any(|p| p.topic == payload.topic);
        if !advertised {
            return Err(PlayerError::InvalidArgument(format!(
                "topic {} is not advertised",
                payload.topic
            )));
        }
        self.state.published.lock().push(payload.clone());
        Ok(())
    }

    fn call_service(&mut self, service: &str, request: &Value) -> Result<Value> {
        self.ensure_connected()?;
        let handler = self.state.services.lock().get(service).cloned();
        match handler {
            Some(handler) => handler(request),
            None => Err(PlayerError::Service(format!("unknown service {service}"))),
        }
    }

    fn set_parameter(&mut self, key: &str, value: &Value) -> Result<()> {
        self.ensure_connected()?;
        self.state
            .parameters
            .lock()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn fetch_asset(&mut self, uri: &str) -> Result<Asset> {
        self.ensure_connected()?;
        self.state
            .assets
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| PlayerError::AssetNotFound(uri.to_string()))
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

impl LoopbackServer {
    pub fn send_message(&self, message: MessageEvent) {
        let _ = self.events.send(LiveEvent::Message(message));
    }

    /// Replace the advertised topics, for current and future sessions.
    pub fn set_topics(&self, topics: Vec<Topic>, datatypes: Datatypes) {
        {
            let mut session = self.state.session.lock();
            session.topics = topics.clone();
            session.datatypes = datatypes.clone();
        }
        let _ = self.events.send(LiveEvent::TopicsChanged { topics, datatypes });
    }

    pub fn disconnect(&self, reason: impl Into<String>) {
        let _ = self.events.send(LiveEvent::Disconnected(reason.into()));
    }

    /// Accept or refuse future connection attempts.
    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn set_capabilities(&self, capabilities: Vec<PlayerCapability>) {
        self.state.session.lock().capabilities = capabilities;
    }

    pub fn add_service(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.state
            .services
            .lock()
            .insert(name.into(), Arc::new(handler));
    }

    pub fn add_asset(&self, asset: Asset) {
        self.state.assets.lock().insert(asset.uri.clone(), asset);
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<SubscribePayload> {
        self.state.subscriptions.lock().clone()
    }

    pub fn advertised(&self) -> Vec<AdvertiseOptions> {
        self.state.advertised.lock().clone()
    }

    pub fn published(&self) -> Vec<PublishPayload> {
        self.state.published.lock().clone()
    }

    pub fn parameter(&self, key: &str) -> Option<Value> {
        self.state.parameters.lock().get(key).cloned()
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.state.accepting.store(false, Ordering::SeqCst);
    }
}
