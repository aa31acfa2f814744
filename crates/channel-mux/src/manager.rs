//! The multiplexer: one authenticated hub connection shared by every feature.
//!
//! [`ConnectionManager`] is a cheap `Clone` handle. Construct one at
//! application start and pass it to whatever needs channel traffic.
//!
//! State lives behind a `std::sync::Mutex` that is held only for bookkeeping:
//! it is never held across an `.await`, and user callbacks always run after
//! it has been released, so callbacks may freely call back into the manager
//! (including disposing their own registration).

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::connection::run_session;
use crate::events::{ChannelListListener, EventBus, Notice, StatusListener, invoke_isolated};
use crate::protocol::InboundMessage;
use crate::registry::{ChannelCallback, ChannelRegistry};
use crate::types::{ConnectionState, Disposer, Error};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    pub status: ConnectionState,
    /// Failed attempts since the last successful authentication.
    pub attempts: u32,
    /// Generation of the current session. Bumped by `connect()` and
    /// `disconnect()`; a task whose generation no longer matches is stale.
    pub session: u64,
    pub cancel: Option<CancellationToken>,
    pub outbound: Option<mpsc::Sender<String>>,
    pub reconnect_pending: bool,
    pub last_error: Option<String>,
    /// `None` until the hub has advertised a list.
    pub supported: Option<Vec<String>>,
    pub registry: ChannelRegistry,
    pub bus: EventBus,
    /// Listener notifications not yet delivered, oldest first.
    notices: VecDeque<Notice>,
    /// Some thread is draining `notices`.
    delivering: bool,
}

impl Inner {
    /// Set `status`, queueing a notification if it changed.
    fn transition(&mut self, status: ConnectionState) {
        if self.status == status {
            return;
        }
        tracing::debug!(from = %self.status, to = %status, session = self.session, "state change");
        self.status = status;
        let listeners = self.bus.status.snapshot();
        self.notices.push_back(Notice::Status(listeners, status));
    }
}

pub(crate) struct Shared {
    pub config: ManagerConfig,
    runtime: Handle,
    /// Parent of every session token. Cancelled when the last
    /// [`ConnectionManager`] handle is dropped.
    shutdown: CancellationToken,
    state: Mutex<Inner>,
}

impl Shared {
    pub(crate) fn new(config: ManagerConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            shutdown: CancellationToken::new(),
            state: Mutex::new(Inner {
                status: ConnectionState::Disconnected,
                attempts: 0,
                session: 0,
                cancel: None,
                outbound: None,
                reconnect_pending: false,
                last_error: None,
                supported: None,
                registry: ChannelRegistry::default(),
                bus: EventBus::default(),
                notices: VecDeque::new(),
                delivering: false,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver queued notifications in order.
    ///
    /// Only one caller drains at a time. A transition made while another
    /// thread (or a listener on this one) is draining is left in the queue for
    /// that drainer, so every listener sees transitions in the order they
    /// happened and the last one it sees matches `status()`.
    fn deliver_notices(&self) {
        {
            let mut inner = self.lock();
            if inner.delivering || inner.notices.is_empty() {
                return;
            }
            inner.delivering = true;
        }
        loop {
            let next = {
                let mut inner = self.lock();
                let next = inner.notices.pop_front();
                if next.is_none() {
                    inner.delivering = false;
                }
                next
            };
            match next {
                Some(notice) => notice.deliver(),
                None => return,
            }
        }
    }

    /// Apply `f` to the state if `session` is still current, then deliver
    /// any notification the transition `f` asked for.
    fn update<T>(
        &self,
        session: u64,
        f: impl FnOnce(&mut Inner) -> (T, Option<ConnectionState>),
    ) -> Option<T> {
        let value = {
            let mut inner = self.lock();
            if inner.session != session {
                return None;
            }
            let (value, status) = f(&mut inner);
            if let Some(status) = status {
                inner.transition(status);
            }
            value
        };
        self.deliver_notices();
        Some(value)
    }

    /// Start a new session unless one is already running.
    ///
    /// With `only_when_disconnected`, terminal states are left alone. The
    /// failed-attempt counter survives a restart during a pending reconnect;
    /// it is reset only when leaving `Disconnected` or a terminal state.
    fn start_session(self: &Arc<Self>, only_when_disconnected: bool) {
        let (session, cancel) = {
            let mut inner = self.lock();
            if inner.status.is_active() {
                tracing::debug!(status = %inner.status, "connect ignored, session already running");
                return;
            }
            if only_when_disconnected && inner.status != ConnectionState::Disconnected {
                return;
            }
            if let Some(old) = inner.cancel.take() {
                old.cancel();
            }
            inner.session += 1;
            if !inner.reconnect_pending {
                inner.attempts = 0;
                inner.last_error = None;
            }
            inner.outbound = None;
            inner.reconnect_pending = false;
            let cancel = self.shutdown.child_token();
            inner.cancel = Some(cancel.clone());
            inner.transition(ConnectionState::Connecting);
            (inner.session, cancel)
        };
        tracing::info!(url = %self.config.url, session, "connecting to hub");
        self.runtime.spawn(run_session(self.clone(), session, cancel));
        self.deliver_notices();
    }

    fn stop_session(&self) {
        {
            let mut inner = self.lock();
            inner.session += 1;
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.outbound = None;
            inner.reconnect_pending = false;
            inner.transition(ConnectionState::Disconnected);
        }
        self.deliver_notices();
    }

    // -- transitions driven by the session task ---------------------------

    pub(crate) fn transport_opened(&self, session: u64) -> bool {
        self.update(session, |_| ((), Some(ConnectionState::Connected)))
            .is_some()
    }

    pub(crate) fn authenticated(&self, session: u64, outbound: mpsc::Sender<String>) -> bool {
        self.update(session, |inner| {
            inner.attempts = 0;
            inner.last_error = None;
            inner.outbound = Some(outbound);
            ((), Some(ConnectionState::Authenticated))
        })
        .is_some()
    }

    pub(crate) fn auth_rejected(&self, session: u64, reason: &str) {
        self.update(session, |inner| {
            inner.outbound = None;
            inner.last_error = Some(format!("authentication rejected: {reason}"));
            inner.cancel = None;
            ((), Some(ConnectionState::AuthFailed))
        });
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` when the session must end (retries exhausted or stale).
    pub(crate) fn attempt_failed(&self, session: u64, error: &Error) -> Option<Duration> {
        let policy = &self.config.reconnect;
        self.update(session, |inner| {
            inner.outbound = None;
            inner.attempts = inner.attempts.saturating_add(1);
            inner.last_error = Some(error.to_string());
            let delay = policy.retry_after(inner.attempts);
            inner.reconnect_pending = delay.is_some();
            if delay.is_none() {
                inner.cancel = None;
            }
            ((delay, inner.attempts), Some(ConnectionState::Error))
        })
        .and_then(|(delay, attempts)| {
            match delay {
                Some(delay) => tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "connection attempt failed: {error}; reconnecting"
                ),
                None => tracing::error!(
                    attempts,
                    "connection failed: {error}; giving up after {attempts} attempts"
                ),
            }
            delay
        })
    }

    pub(crate) fn begin_reconnect(&self, session: u64) -> bool {
        self.update(session, |inner| {
            inner.reconnect_pending = false;
            ((), Some(ConnectionState::Connecting))
        })
        .is_some()
    }

    pub(crate) fn replace_channel_list(&self, session: u64, channels: Vec<String>) {
        let count = channels.len();
        let applied = self.update(session, |inner| {
            inner.supported = Some(channels.clone());
            let listeners = inner.bus.channel_list.snapshot();
            inner.notices.push_back(Notice::ChannelList(listeners, channels));
            ((), None)
        });
        if applied.is_some() {
            tracing::info!(count, "supported channel list updated");
        }
    }

    /// Deliver `message` to a snapshot of the callbacks registered for
    /// `channel`. Returns the number of callbacks invoked.
    pub(crate) fn fan_out(&self, session: u64, channel: &str, message: &InboundMessage) -> usize {
        let callbacks = {
            let inner = self.lock();
            if inner.session != session || inner.status != ConnectionState::Authenticated {
                return 0;
            }
            inner.registry.snapshot(channel)
        };
        if callbacks.is_empty() {
            tracing::trace!(%channel, "no subscribers for channel");
        }
        for callback in &callbacks {
            invoke_isolated(channel, || callback(message));
        }
        callbacks.len()
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Diagnostic snapshot returned by [`ConnectionManager::debug_info`].
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    pub url: String,
    pub status: ConnectionState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub transport_open: bool,
    pub reconnect_pending: bool,
    pub last_error: Option<String>,
    pub supported_channels: Option<Vec<String>>,
    pub subscriptions: BTreeMap<String, usize>,
    pub status_listeners: usize,
    pub channel_list_listeners: usize,
}

/// Cancels every session when the last handle goes away.
struct Shutdown(CancellationToken);

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Client-side hub connection multiplexer.
///
/// Maintains a single authenticated connection, tracks which channels the hub
/// advertises, and fans inbound frames out to per-channel subscribers.
/// Delivery is at most once: frames arriving while disconnected are gone.
///
/// Clones share one connection. Dropping the last clone closes it.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    _shutdown: Arc<Shutdown>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    ///
    /// Must be called from within a tokio runtime; sessions are spawned onto
    /// that runtime.
    pub fn new(config: ManagerConfig) -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let shared = Arc::new(Shared::new(config, runtime));
        let shutdown = Arc::new(Shutdown(shared.shutdown.clone()));
        Ok(Self {
            shared,
            _shutdown: shutdown,
        })
    }

    /// Open and authenticate the connection.
    ///
    /// No-op while connecting, connected or authenticated. From `AuthFailed`
    /// or an exhausted `Error` this starts over with a fresh retry budget.
    pub fn connect(&self) {
        self.shared.start_session(false);
    }

    /// Close the transport and cancel pending timers.
    ///
    /// Subscriptions and the last channel list are kept, so a later
    /// `connect()` resumes delivery to the same subscribers.
    pub fn disconnect(&self) {
        tracing::info!("disconnect requested");
        self.shared.stop_session();
    }

    /// Register `callback` for frames on `channel`.
    ///
    /// If the manager is `Disconnected` this also starts connecting. It never
    /// leaves `AuthFailed` or an exhausted `Error`; that takes an explicit
    /// [`connect`](Self::connect).
    pub fn subscribe<F>(&self, channel: impl Into<String>, callback: F) -> Disposer
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let callback: ChannelCallback = Arc::new(callback);
        let id = self.shared.lock().registry.add(&channel, callback);
        tracing::debug!(%channel, id, "subscribed");
        self.shared.start_session(true);

        let weak = Arc::downgrade(&self.shared);
        Disposer::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.lock().registry.remove(&channel, id);
                tracing::debug!(%channel, id, "unsubscribed");
            }
        })
    }

    /// True if the last advertised channel list contains `channel`.
    pub fn is_channel_supported(&self, channel: &str) -> bool {
        self.shared
            .lock()
            .supported
            .as_ref()
            .is_some_and(|list| list.iter().any(|c| c == channel))
    }

    pub fn status(&self) -> ConnectionState {
        self.shared.lock().status
    }

    pub fn supported_channels(&self) -> Vec<String> {
        self.shared.lock().supported.clone().unwrap_or_default()
    }

    pub fn debug_info(&self) -> DebugInfo {
        let inner = self.shared.lock();
        DebugInfo {
            url: self.shared.config.url.to_string(),
            status: inner.status,
            attempts: inner.attempts,
            max_attempts: self.shared.config.reconnect.max_attempts,
            transport_open: inner.outbound.is_some(),
            reconnect_pending: inner.reconnect_pending,
            last_error: inner.last_error.clone(),
            supported_channels: inner.supported.clone(),
            subscriptions: inner.registry.channel_counts(),
            status_listeners: inner.bus.status.len(),
            channel_list_listeners: inner.bus.channel_list.len(),
        }
    }

    pub fn on_status_change<F>(&self, listener: F) -> Disposer
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let listener: StatusListener = Arc::new(listener);
        let id = self.shared.lock().bus.status.add(listener);
        let weak = Arc::downgrade(&self.shared);
        Disposer::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.lock().bus.status.remove(id);
            }
        })
    }

    pub fn on_channel_list_change<F>(&self, listener: F) -> Disposer
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        let listener: ChannelListListener = Arc::new(listener);
        let id = self.shared.lock().bus.channel_list.add(listener);
        let weak = Arc::downgrade(&self.shared);
        Disposer::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.lock().bus.channel_list.remove(id);
            }
        })
    }

    /// Queue a JSON frame for the hub.
    ///
    /// Returns false without side effects when not authenticated or when the
    /// outbound queue is full.
    pub fn send(&self, message: &serde_json::Value) -> bool {
        let Some(tx) = self.shared.lock().outbound.clone() else {
            tracing::debug!("send skipped, no open transport");
            return false;
        };
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to encode outbound frame: {e}");
                return false;
            }
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.config.url.as_str())
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
