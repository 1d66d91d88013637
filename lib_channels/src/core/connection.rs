//! # Connection (Supervised Logical Channel)
//!
//! A [`Connection`] is one logical channel. It is a cheap, cloneable handle;
//! every clone refers to the same channel, so callers never observe a
//! different object across reconnects.
//!
//! ## Ownership
//!
//! One supervisor task per connection owns the transport's event stream and
//! the reconnect timer. The mutable fields a caller can touch synchronously
//! (`state`, attempt counter, current outbound sender) sit behind one mutex,
//! which is never held across an `.await` or while user callbacks run.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting --open--> Open --unexpected close--> ReconnectScheduled --timer--> Connecting
//!      |                                      \--policy gives up--> Exhausted
//!      \------------- explicit disconnect --> Closing --> Closed
//! ```
//!
//! The reconnect timer is a `sleep` raced against the connection's
//! `CancellationToken`; an explicit disconnect cancels the token and aborts
//! the supervisor, so a disposed connection can never resurrect itself.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::reconnect::{
    FixedInterval, ReconnectPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
};
use crate::core::transport::{CloseInfo, Connector, Frame, TransportEvent, TransportHandle};
use crate::error::{ChannelError, TransportError};
use crate::models::command::HeartbeatPing;
use crate::models::{ConnectionState, ConnectionStatus, InboundMessage};

/// Handler invoked for every inbound message.
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
type OpenHandler = Arc<dyn Fn(&Connection) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&CloseInfo) + Send + Sync>;
type ExhaustedHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// User callbacks attached at `connect` time.
///
/// Callbacks run on the connection's supervisor task, except the `on_close`
/// of an explicit disconnect, which runs on the caller. A panicking callback
/// is logged and swallowed.
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    on_open: Option<OpenHandler>,
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_close: Option<CloseHandler>,
    on_exhausted: Option<ExhaustedHandler>,
}

impl ConnectionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called every time a transport opens (initial connect and each reconnect).
    pub fn on_open(mut self, f: impl Fn(&Connection) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Installed as the first message subscriber.
    pub fn on_message(mut self, f: impl Fn(&InboundMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Called for every transport error. Does not imply a state change.
    pub fn on_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called when a transport ends, expected or not.
    pub fn on_close(mut self, f: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Called once when the reconnect policy gives up, with the attempts made.
    pub fn on_exhausted(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_exhausted = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ConnectionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandlers")
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_exhausted", &self.on_exhausted.is_some())
            .finish()
    }
}

/// Per-connection settings recognised at `connect` time.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Delay between reconnect attempts (fixed-interval policy).
    pub reconnect_interval: Duration,
    /// Bound on automatic reconnect attempts (fixed-interval policy).
    pub max_reconnect_attempts: u32,
    /// Replaces the fixed-interval policy built from the two fields above.
    pub policy: Option<Arc<dyn ReconnectPolicy>>,
    /// Send `{"type":"ping"}` this often while open.
    pub heartbeat_interval: Option<Duration>,
    /// Treat the transport as dead after this long without an inbound frame.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            policy: None,
            heartbeat_interval: None,
            inactivity_timeout: None,
        }
    }
}

impl ConnectionOptions {
    pub fn fixed(reconnect_interval: Duration, max_reconnect_attempts: u32) -> Self {
        Self {
            reconnect_interval,
            max_reconnect_attempts,
            ..Self::default()
        }
    }

    /// Uses a custom reconnect policy.
    pub fn with_policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat_interval = Some(every);
        self
    }

    pub fn with_inactivity_timeout(mut self, after: Duration) -> Self {
        self.inactivity_timeout = Some(after);
        self
    }

    fn reconnect_policy(&self) -> Arc<dyn ReconnectPolicy> {
        self.policy.clone().unwrap_or_else(|| {
            Arc::new(FixedInterval::new(self.reconnect_interval, self.max_reconnect_attempts))
        })
    }
}

/// Identifies one message subscriber on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: MessageHandler,
}

struct Core {
    state: ConnectionState,
    reconnect_attempts: u32,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

struct Shared {
    id: String,
    url: Url,
    options: ConnectionOptions,
    policy: Arc<dyn ReconnectPolicy>,
    handlers: ConnectionHandlers,
    connector: Arc<dyn Connector>,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one supervised logical channel.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("url", &self.shared.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Creates the connection, opens its first transport and starts the
    /// supervisor. Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        id: &str,
        url: Url,
        handlers: ConnectionHandlers,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let policy = options.reconnect_policy();

        let mut subscribers = Vec::new();
        if let Some(handler) = handlers.on_message.clone() {
            subscribers.push(Subscriber {
                id: SubscriptionId(0),
                handler,
            });
        }

        let TransportHandle { outbound, events } = connector.open(&url);

        let shared = Arc::new(Shared {
            id: id.to_string(),
            url,
            options,
            policy,
            handlers,
            connector,
            core: Mutex::new(Core {
                state: ConnectionState::Connecting,
                reconnect_attempts: 0,
                outbound: Some(outbound),
            }),
            state_tx,
            subscribers: Mutex::new(subscribers),
            next_subscription: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        let connection = Self { shared };
        connection.start_supervisor(events);
        connection
    }

    fn start_supervisor(&self, events: mpsc::UnboundedReceiver<TransportEvent>) {
        let task = tokio::spawn(supervise(self.clone(), events));
        *lock(&self.shared.supervisor) = Some(task);
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The URL every transport of this connection is opened against.
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.core).state
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.shared.core).reconnect_attempts
    }

    pub fn status(&self) -> ConnectionStatus {
        let core = lock(&self.shared.core);
        ConnectionStatus {
            id: self.shared.id.clone(),
            url: self.shared.url.to_string(),
            state: core.state,
            reconnect_attempts: core.reconnect_attempts,
        }
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// `true` when both handles refer to the same logical channel.
    pub fn ptr_eq(a: &Connection, b: &Connection) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// Writes a raw text frame to the current transport.
    ///
    /// Fails with [`ChannelError::SendOnNonOpenSocket`] unless the connection
    /// is `Open`. Nothing is buffered across reconnects.
    pub fn send(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        let core = lock(&self.shared.core);
        let not_open = || ChannelError::SendOnNonOpenSocket {
            id: self.shared.id.clone(),
            state: core.state,
        };

        if core.state != ConnectionState::Open {
            return Err(not_open());
        }
        let Some(outbound) = &core.outbound else {
            return Err(not_open());
        };
        outbound.send(Frame::Text(text.into())).map_err(|_| not_open())
    }

    /// Serializes `data` to JSON and writes it as a text frame.
    pub fn send_json<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), ChannelError> {
        let text = serde_json::to_string(data)?;
        self.send(text)
    }

    /// Appends a message subscriber. Existing subscribers, including the
    /// `on_message` given at connect time, keep receiving messages.
    pub fn subscribe(&self, handler: impl Fn(&InboundMessage) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.subscribers).push(Subscriber {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Removes one subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }

    /// Explicit teardown: cancels the reconnect timer, closes the transport
    /// and stops the supervisor. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut core = lock(&self.shared.core);
            if core.state == ConnectionState::Closed {
                return;
            }
            self.transition(&mut core, ConnectionState::Closing);
            self.shared.cancel.cancel();
            if let Some(outbound) = core.outbound.take() {
                let _ = outbound.send(Frame::Close);
            }
            self.transition(&mut core, ConnectionState::Closed);
        }

        if let Some(task) = lock(&self.shared.supervisor).take() {
            task.abort();
        }

        tracing::info!(channel = %self.shared.id, "Channel disconnected");
        self.fire_close(&CloseInfo::local("disconnected"));
    }

    /// Restarts an `Exhausted` connection with a fresh attempt budget.
    /// Any other state is left untouched and returned as is.
    pub(crate) fn restart(&self) -> ConnectionState {
        let events = {
            let mut core = lock(&self.shared.core);
            if core.state != ConnectionState::Exhausted {
                return core.state;
            }
            core.reconnect_attempts = 0;
            let TransportHandle { outbound, events } = self.shared.connector.open(&self.shared.url);
            core.outbound = Some(outbound);
            self.transition(&mut core, ConnectionState::Connecting);
            events
        };

        tracing::info!(channel = %self.shared.id, "Channel restarted after exhaustion");
        self.start_supervisor(events);
        ConnectionState::Connecting
    }

    // --- state machine internals ---

    fn transition(&self, core: &mut Core, next: ConnectionState) {
        if core.state == next || core.state == ConnectionState::Closed {
            return;
        }
        tracing::debug!(channel = %self.shared.id, from = %core.state, to = %next, "State change");
        core.state = next;
        self.shared.state_tx.send_replace(next);
    }

    fn mark_open(&self) -> bool {
        let mut core = lock(&self.shared.core);
        if core.state != ConnectionState::Connecting {
            return false;
        }
        core.reconnect_attempts = 0;
        self.transition(&mut core, ConnectionState::Open);
        true
    }

    /// Drops the dead transport after an unexpected close and returns the
    /// attempt count the policy should be asked about. `None` when an
    /// explicit disconnect got there first.
    fn detach_transport(&self) -> Option<u32> {
        let mut core = lock(&self.shared.core);
        if self.shared.cancel.is_cancelled() {
            return None;
        }
        core.outbound = None;
        Some(core.reconnect_attempts)
    }

    fn schedule_reconnect(&self) -> bool {
        let mut core = lock(&self.shared.core);
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        self.transition(&mut core, ConnectionState::ReconnectScheduled);
        true
    }

    fn mark_exhausted(&self) -> bool {
        let mut core = lock(&self.shared.core);
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        self.transition(&mut core, ConnectionState::Exhausted);
        true
    }

    /// Replaces the transport after the reconnect timer fired.
    fn reopen(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut core = lock(&self.shared.core);
        if self.shared.cancel.is_cancelled() {
            return None;
        }
        core.reconnect_attempts += 1;
        let TransportHandle { outbound, events } = self.shared.connector.open(&self.shared.url);
        core.outbound = Some(outbound);
        self.transition(&mut core, ConnectionState::Connecting);
        Some(events)
    }

    /// Closes the current transport without going through `Closing`; used by
    /// the inactivity watchdog, which then follows the reconnect path.
    fn drop_transport(&self) {
        let mut core = lock(&self.shared.core);
        if let Some(outbound) = core.outbound.take() {
            let _ = outbound.send(Frame::Close);
        }
    }

    fn heartbeat_ticker(&self) -> Option<Interval> {
        let every = self.shared.options.heartbeat_interval.filter(|every| !every.is_zero())?;
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    fn send_heartbeat(&self) {
        let ping = HeartbeatPing::at(chrono::Utc::now().timestamp());
        if let Err(e) = self.send_json(&ping) {
            tracing::debug!(channel = %self.shared.id, error = %e, "Heartbeat skipped");
        }
    }

    // --- callback dispatch ---

    fn guarded(&self, callback: &'static str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            tracing::error!(channel = %self.shared.id, callback, "Channel callback panicked");
        }
    }

    fn fire_open(&self) {
        if let Some(handler) = &self.shared.handlers.on_open {
            self.guarded("on_open", || handler(self));
        }
    }

    fn fire_error(&self, err: &TransportError) {
        if let Some(handler) = &self.shared.handlers.on_error {
            self.guarded("on_error", || handler(err));
        }
    }

    fn fire_close(&self, info: &CloseInfo) {
        if let Some(handler) = &self.shared.handlers.on_close {
            self.guarded("on_close", || handler(info));
        }
    }

    fn fire_exhausted(&self, attempts: u32) {
        if let Some(handler) = &self.shared.handlers.on_exhausted {
            self.guarded("on_exhausted", || handler(attempts));
        }
    }

    fn dispatch(&self, message: &InboundMessage) {
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<MessageHandler> = lock(&self.shared.subscribers)
            .iter()
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in handlers {
            self.guarded("on_message", || handler(message));
        }
    }

    /// Pumps one transport's events until it closes. `None` means the
    /// connection was cancelled.
    async fn drive(&self, events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Option<CloseInfo> {
        let mut heartbeat: Option<Interval> = None;
        let mut last_inbound = Instant::now();

        loop {
            let open = self.state() == ConnectionState::Open;
            let heartbeat_due = open && heartbeat.is_some();
            let idle_deadline = self.shared.options.inactivity_timeout.map(|after| last_inbound + after);

            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => return None,

                event = events.recv() => match event {
                    Some(TransportEvent::Open) => {
                        last_inbound = Instant::now();
                        // First ping is one full interval after the open, however long the handshake took.
                        heartbeat = self.heartbeat_ticker();
                        if self.mark_open() {
                            tracing::info!(channel = %self.shared.id, url = %self.shared.url, "Channel open");
                            self.fire_open();
                        }
                    }
                    Some(TransportEvent::Message(text)) => {
                        last_inbound = Instant::now();
                        self.dispatch(&InboundMessage::decode(text));
                    }
                    Some(TransportEvent::Error(err)) => {
                        tracing::warn!(channel = %self.shared.id, error = %err, "Transport error");
                        self.fire_error(&err);
                    }
                    Some(TransportEvent::Closed(info)) => return Some(info),
                    None => return Some(CloseInfo::abnormal("transport dropped")),
                },

                _ = tick(&mut heartbeat), if heartbeat_due => self.send_heartbeat(),

                _ = sleep_until(idle_deadline), if open && idle_deadline.is_some() => {
                    tracing::warn!(channel = %self.shared.id, "No inbound frames within inactivity timeout");
                    self.drop_transport();
                    return Some(CloseInfo::abnormal("inactivity timeout"));
                }
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// The supervisor: one per connection, for as long as it is neither
/// `Closed` nor `Exhausted`.
async fn supervise(conn: Connection, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    loop {
        let Some(close) = conn.drive(&mut events).await else {
            return;
        };
        let Some(attempts) = conn.detach_transport() else {
            return;
        };

        tracing::info!(
            channel = %conn.shared.id,
            code = ?close.code,
            reason = %close.reason,
            "Channel closed unexpectedly"
        );
        conn.fire_close(&close);

        let Some(delay) = conn.shared.policy.next_delay(attempts) else {
            if conn.mark_exhausted() {
                tracing::warn!(channel = %conn.shared.id, attempts, "Reconnect attempts exhausted");
                conn.fire_exhausted(attempts);
            }
            return;
        };

        if !conn.schedule_reconnect() {
            return;
        }
        tracing::info!(
            channel = %conn.shared.id,
            attempt = attempts + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnect scheduled"
        );

        tokio::select! {
            biased;
            _ = conn.shared.cancel.cancelled() => return,
            _ = time::sleep(delay) => {}
        }

        match conn.reopen() {
            Some(next) => events = next,
            None => return,
        }
    }
}
