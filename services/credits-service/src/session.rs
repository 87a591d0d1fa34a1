//! Browser sessions and their identity channel.
//!
//! Every browsing context (tab or window) of one browser session shares a
//! named channel carrying exactly two events, `SIGNED_IN` and `SIGNED_OUT`,
//! plus the session's signed-in user. Receivers react by re-resolving their
//! own balance; balances never travel over the channel.

use crate::identity::UserId;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Identity change broadcast to the other contexts of a browser session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityEvent {
    /// A context signed in.
    SignedIn,
    /// A context signed out.
    SignedOut,
}

impl IdentityEvent {
    /// Parse the JSON wire form, e.g. `{"type":"SIGNED_OUT"}`.
    ///
    /// # Errors
    ///
    /// Returns error for any message shape other than the two known events.
    pub fn from_json(message: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(message)
    }

    /// JSON wire form.
    #[must_use]
    pub const fn as_json(self) -> &'static str {
        match self {
            Self::SignedIn => r#"{"type":"SIGNED_IN"}"#,
            Self::SignedOut => r#"{"type":"SIGNED_OUT"}"#,
        }
    }
}

/// Identifier of one browsing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Generate a fresh context id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a context id sent by a client.
    ///
    /// # Errors
    ///
    /// Returns error if `value` is not a UUID.
    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(value).map(Self)
    }

    /// Hyphen-free form, safe to embed in actor names.
    #[must_use]
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Event plus the context that published it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityEnvelope {
    /// Publishing context.
    pub origin: ContextId,
    /// The event.
    pub event: IdentityEvent,
}

/// Receiver half of a session's identity channel for one context.
///
/// Events published by the same context are skipped. The receiver does not
/// keep its session alive; once the session is dropped the channel closes.
#[derive(Debug)]
pub struct IdentityReceiver {
    context: ContextId,
    session: Weak<BrowsingSession>,
    rx: broadcast::Receiver<IdentityEnvelope>,
}

impl IdentityReceiver {
    /// Wait for the next event published by another context.
    ///
    /// If this receiver fell behind, the missed events are replaced by the one
    /// event matching the session's current signed-in state. Returns `None`
    /// once the channel is closed.
    pub async fn recv(&mut self) -> Option<IdentityEvent> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.context => {
                    trace!(context = %self.context, "Skipping own identity event");
                }
                Ok(envelope) => return Some(envelope.event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(context = %self.context, missed, "Identity receiver lagged, resyncing");
                    return self.session.upgrade().map(|session| session.current_event());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Context this receiver belongs to.
    #[must_use]
    pub const fn context(&self) -> ContextId {
        self.context
    }
}

/// State shared by every context of one browser session.
#[derive(Debug)]
pub struct BrowsingSession {
    name: String,
    signed_in: RwLock<Option<UserId>>,
    events: broadcast::Sender<IdentityEnvelope>,
    last_active: Mutex<Instant>,
}

impl BrowsingSession {
    /// Create a session with a channel buffering `capacity` events.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            signed_in: RwLock::new(None),
            events,
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// User the session is currently signed in as.
    #[must_use]
    pub fn signed_in_user(&self) -> Option<UserId> {
        self.signed_in.read().clone()
    }

    /// Event describing the session's current state.
    #[must_use]
    pub fn current_event(&self) -> IdentityEvent {
        if self.signed_in.read().is_some() {
            IdentityEvent::SignedIn
        } else {
            IdentityEvent::SignedOut
        }
    }

    /// Record a sign-in and notify the other contexts.
    pub fn sign_in(&self, origin: ContextId, user_id: UserId) {
        *self.signed_in.write() = Some(user_id);
        self.publish(origin, IdentityEvent::SignedIn);
    }

    /// Record a sign-out and notify the other contexts.
    pub fn sign_out(&self, origin: ContextId) {
        *self.signed_in.write() = None;
        self.publish(origin, IdentityEvent::SignedOut);
    }

    /// Broadcast an event. Returns the number of receivers it reached.
    pub fn publish(&self, origin: ContextId, event: IdentityEvent) -> usize {
        self.touch();
        let delivered = self
            .events
            .send(IdentityEnvelope { origin, event })
            .unwrap_or(0);
        debug!(session = %self.name, %origin, ?event, delivered, "Published identity event");
        delivered
    }

    /// Subscribe a context to the channel.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, context: ContextId) -> IdentityReceiver {
        self.touch();
        IdentityReceiver {
            context,
            session: Arc::downgrade(self),
            rx: self.events.subscribe(),
        }
    }

    /// Number of live receivers on the channel.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Time since the last publish or subscribe.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }
}

/// Process-wide registry of named browser-session channels.
#[derive(Debug)]
pub struct SessionHub {
    sessions: DashMap<String, Arc<BrowsingSession>>,
    capacity: usize,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new(16)
    }
}

impl SessionHub {
    /// Create a hub whose channels buffer `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity,
        }
    }

    /// Open the session named `name`, creating it on first use.
    #[must_use]
    pub fn open(&self, name: &str) -> Arc<BrowsingSession> {
        let session = self
            .sessions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BrowsingSession::new(name, self.capacity)))
            .clone();
        session.touch();
        session
    }

    /// Drop sessions nobody uses any more.
    ///
    /// A session is kept while anything besides the hub holds it, while any
    /// context is subscribed to it, or while it was active within `idle_after`.
    /// Returns the number of sessions removed.
    #[must_use]
    pub fn evict_idle(&self, idle_after: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            Arc::strong_count(session) > 1
                || session.receiver_count() > 0
                || session.idle_for() < idle_after
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Periodically evict idle sessions.
    ///
    /// The task ends on its own once the hub is dropped.
    #[must_use]
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        idle_after: Duration,
    ) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        info!(?interval, ?idle_after, "Starting session cleanup task");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let evicted = hub.evict_idle(idle_after);
                trace!(evicted, "Session sweep finished");
            }
        })
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session has been opened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
