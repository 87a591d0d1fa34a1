//! Ledger Context Agent.
//!
//! One agent per browsing context (tab or window). The agent is the single
//! source of truth for that context's identity and balance: observers
//! subscribe to a `watch` of [`ContextSnapshot`] and a broadcast of
//! [`LedgerNotice`] instead of keeping their own copies.
//!
//! Identity changes made by other contexts of the same browser session arrive
//! through the session's identity channel and trigger a re-resolve here.

use super::request_reply::{create_request_reply, send_optional_response, ResponseChannel};
use crate::error::LedgerError;
use crate::identity::{Identity, IdentityTransition, UserId};
use crate::ip::IpDiscovery;
use crate::ledger::{BalanceOrigin, Consumption, CreditBalance, CreditLedger};
use crate::session::{BrowsingSession, ContextId, IdentityEvent, IdentityReceiver};
use acton_reactive::prelude::*;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

/// Buffered notices per context before slow observers lag.
const NOTICE_CAPACITY: usize = 32;

/// Balance as currently known by a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Active identity, `None` while the anonymous IP address is unknown.
    pub identity: Option<Identity>,
    /// Actions remaining.
    pub remaining: u32,
    /// Where `remaining` came from.
    pub origin: BalanceOrigin,
    /// When the balance was last resolved or changed, `None` before the first resolve.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    fn unresolved(remaining: u32) -> Self {
        Self {
            identity: None,
            remaining,
            origin: BalanceOrigin::Fallback,
            updated_at: None,
        }
    }

    fn from_balance(balance: CreditBalance) -> Self {
        Self {
            identity: Some(balance.identity),
            remaining: balance.remaining,
            origin: balance.origin,
            updated_at: Some(Utc::now()),
        }
    }

    /// Whether the balance lives only in this context and is never persisted.
    #[must_use]
    pub const fn is_session_only(&self) -> bool {
        self.identity.is_none() && self.updated_at.is_some()
    }
}

/// Non-blocking notification for the user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerNotice {
    /// No credits left; show the upsell prompt.
    Exhausted,
    /// The balance could not be loaded; a default is shown instead.
    LookupFailed(String),
    /// A consumption could not be saved; the balance was left unchanged.
    UpdateFailed(String),
    /// The public IP address is unknown; a session-only balance is used.
    IpUnavailable,
}

impl LedgerNotice {
    fn from_error(err: &LedgerError) -> Self {
        match err {
            LedgerError::Lookup { .. } => Self::LookupFailed(err.to_string()),
            LedgerError::Update { .. } => Self::UpdateFailed(err.to_string()),
        }
    }
}

/// Observer handles returned by [`Subscribe`].
#[derive(Debug)]
pub struct ContextSubscription {
    /// Current balance, updated in place.
    pub balance: watch::Receiver<ContextSnapshot>,
    /// Notices raised after subscribing.
    pub notices: broadcast::Receiver<LedgerNotice>,
}

/// Ledger context agent state.
#[derive(Debug)]
pub struct LedgerContextAgent {
    /// This context.
    context_id: ContextId,
    /// Ledger shared by every context.
    ledger: Arc<CreditLedger>,
    /// Browser session this context belongs to.
    session: Arc<BrowsingSession>,
    /// Public IP address used as the anonymous key.
    anonymous_ip: Option<IpAddr>,
    /// Identity resolved at the last identity change.
    identity: Option<Identity>,
    /// Balance observers.
    state: Arc<watch::Sender<ContextSnapshot>>,
    /// Notice observers.
    notices: broadcast::Sender<LedgerNotice>,
    /// In-memory balance used while the anonymous IP address is unknown.
    session_only: Arc<Mutex<Option<u32>>>,
    /// Stops the identity listener when the agent stops.
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for LedgerContextAgent {
    fn default() -> Self {
        Self::new(
            ContextId::new(),
            Arc::new(CreditLedger::default()),
            Arc::new(BrowsingSession::new("default", 1)),
            None,
        )
    }
}

impl LedgerContextAgent {
    /// Create the state for a context.
    ///
    /// The initial identity follows the session: authenticated if the session
    /// is signed in, otherwise anonymous at `anonymous_ip`.
    #[must_use]
    pub fn new(
        context_id: ContextId,
        ledger: Arc<CreditLedger>,
        session: Arc<BrowsingSession>,
        anonymous_ip: Option<IpAddr>,
    ) -> Self {
        let initial = ContextSnapshot::unresolved(ledger.allowances().anonymous);
        let (state, _) = watch::channel(initial);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        let identity = Self::session_identity(&session, anonymous_ip);

        Self {
            context_id,
            ledger,
            session,
            anonymous_ip,
            identity,
            state: Arc::new(state),
            notices,
            session_only: Arc::new(Mutex::new(None)),
            shutdown_tx,
        }
    }

    /// Spawn a context agent and attach it to its session's identity channel.
    ///
    /// # Errors
    ///
    /// Returns error if agent initialization fails.
    pub async fn spawn(
        runtime: &mut ActorRuntime,
        ledger: Arc<CreditLedger>,
        session: Arc<BrowsingSession>,
        anonymous_ip: Option<IpAddr>,
    ) -> anyhow::Result<ActorHandle> {
        let context_id = ContextId::new();
        let name = format!("ledger-context-{}", context_id.simple());
        let config = ActorConfig::new(Ern::with_root(name.as_str())?, None, None)?;
        let mut builder = runtime.new_actor_with_config::<Self>(config);
        builder.model = Self::new(context_id, ledger, session, anonymous_ip);
        let receiver = builder.model.session.subscribe(context_id);
        let shutdown_rx = builder.model.shutdown_tx.subscribe();

        Self::configure_handlers(&mut builder);

        let handle = builder.start().await;
        Self::spawn_identity_listener(handle.clone(), receiver, shutdown_rx);
        info!(context = %context_id, "Ledger context started");
        Ok(handle)
    }

    /// Discover the public IP address, then spawn the context agent.
    ///
    /// A failed discovery is not fatal: the context starts without an
    /// anonymous key and uses a session-only balance.
    ///
    /// # Errors
    ///
    /// Returns error if agent initialization fails.
    pub async fn spawn_with_discovery(
        runtime: &mut ActorRuntime,
        ledger: Arc<CreditLedger>,
        session: Arc<BrowsingSession>,
        discovery: &dyn IpDiscovery,
    ) -> anyhow::Result<ActorHandle> {
        let anonymous_ip = match discovery.discover().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!(error = %e, session = %session.name(), "IP discovery failed");
                None
            }
        };
        Self::spawn(runtime, ledger, session, anonymous_ip).await
    }

    fn session_identity(session: &BrowsingSession, anonymous_ip: Option<IpAddr>) -> Option<Identity> {
        session
            .signed_in_user()
            .map(Identity::authenticated)
            .or_else(|| anonymous_ip.map(Identity::anonymous))
    }

    fn job(&self) -> ContextJob {
        ContextJob {
            context_id: self.context_id,
            ledger: Arc::clone(&self.ledger),
            session: Arc::clone(&self.session),
            identity: self.identity.clone(),
            state: Arc::clone(&self.state),
            notices: self.notices.clone(),
            session_only: Arc::clone(&self.session_only),
        }
    }

    /// Configure all message handlers using inline closures that delegate to [`ContextJob`].
    fn configure_handlers(builder: &mut ManagedActor<Idle, Self>) {
        builder
            .mutate_on::<ResolveBalance>(|agent, ctx| {
                let job = agent.model.job();
                let response_tx = ctx.message().response_tx.clone();
                Reply::pending(async move {
                    let snapshot = job.resolve().await;
                    send_optional_response(response_tx, snapshot).await;
                })
            })
            .mutate_on::<ConsumeCredit>(|agent, ctx| {
                let job = agent.model.job();
                let response_tx = ctx.message().response_tx.clone();
                Reply::pending(async move {
                    let outcome = job.consume().await;
                    send_optional_response(response_tx, outcome).await;
                })
            })
            .mutate_on::<SignIn>(|agent, ctx| {
                let msg = ctx.message();
                agent.model.identity = Some(Identity::authenticated(msg.user_id.clone()));
                let job = agent.model.job();
                let transition = IdentityTransition::SignedIn {
                    user_id: msg.user_id.clone(),
                };
                let response_tx = msg.response_tx.clone();
                Reply::pending(async move {
                    let snapshot = job.transition(transition).await;
                    send_optional_response(response_tx, snapshot).await;
                })
            })
            .mutate_on::<SignOut>(|agent, ctx| {
                let anonymous_ip = agent.model.anonymous_ip;
                agent.model.identity = anonymous_ip.map(Identity::anonymous);
                let job = agent.model.job();
                let response_tx = ctx.message().response_tx.clone();
                Reply::pending(async move {
                    let snapshot = match anonymous_ip {
                        Some(ip) => job.transition(IdentityTransition::SignedOut { ip }).await,
                        None => {
                            job.session.sign_out(job.context_id);
                            job.resolve().await
                        }
                    };
                    send_optional_response(response_tx, snapshot).await;
                })
            })
            .mutate_on::<IdentityChanged>(|agent, ctx| {
                let event = ctx.message().event;
                let anonymous_ip = agent.model.anonymous_ip;
                agent.model.identity = match event {
                    IdentityEvent::SignedIn => {
                        Self::session_identity(&agent.model.session, anonymous_ip)
                    }
                    IdentityEvent::SignedOut => anonymous_ip.map(Identity::anonymous),
                };
                debug!(context = %agent.model.context_id, ?event, "Identity changed elsewhere");
                let job = agent.model.job();
                Reply::pending(async move {
                    job.resolve().await;
                })
            })
            .act_on::<Subscribe>(|agent, ctx| {
                let subscription = ContextSubscription {
                    balance: agent.model.state.subscribe(),
                    notices: agent.model.notices.subscribe(),
                };
                let response_tx = ctx.message().response_tx.clone();
                Reply::pending(send_optional_response(response_tx, subscription))
            })
            .act_on::<GetSnapshot>(|agent, ctx| {
                let snapshot = agent.model.state.borrow().clone();
                let response_tx = ctx.message().response_tx.clone();
                Reply::pending(send_optional_response(response_tx, snapshot))
            })
            .after_stop(|agent| {
                let shutdown_tx = agent.model.shutdown_tx.clone();
                let context_id = agent.model.context_id;
                async move {
                    let _ = shutdown_tx.send(());
                    info!(context = %context_id, "Ledger context stopped");
                }
            });
    }

    /// Forward identity events from other contexts to the agent.
    ///
    /// Ends when the agent stops or the browser session is dropped. Either way
    /// the receiver is dropped and the session no longer counts it.
    fn spawn_identity_listener(
        handle: ActorHandle,
        mut receiver: IdentityReceiver,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(context = %receiver.context(), "Identity listener stopped with agent");
                        break;
                    }
                    event = receiver.recv() => match event {
                        Some(event) => {
                            handle.send(IdentityChanged { event }).await;
                        }
                        None => {
                            debug!(context = %receiver.context(), "Identity channel closed");
                            break;
                        }
                    },
                }
            }
        });
    }
}

// ============================================================================
// Ledger work performed outside the handler closures
// ============================================================================

/// Everything a handler's future needs, captured at message time.
struct ContextJob {
    context_id: ContextId,
    ledger: Arc<CreditLedger>,
    session: Arc<BrowsingSession>,
    identity: Option<Identity>,
    state: Arc<watch::Sender<ContextSnapshot>>,
    notices: broadcast::Sender<LedgerNotice>,
    session_only: Arc<Mutex<Option<u32>>>,
}

impl ContextJob {
    fn notify(&self, notice: LedgerNotice) {
        let _ = self.notices.send(notice);
    }

    /// Re-resolve the balance from storage and publish it to observers.
    async fn resolve(&self) -> ContextSnapshot {
        let snapshot = match &self.identity {
            Some(identity) => match self.ledger.resolve_balance(identity).await {
                Ok(balance) => ContextSnapshot::from_balance(balance),
                Err(e) => {
                    warn!(error = %e, context = %self.context_id, "Falling back to default balance");
                    self.notify(LedgerNotice::from_error(&e));
                    ContextSnapshot::from_balance(self.ledger.fallback_balance(identity))
                }
            },
            None => {
                self.notify(LedgerNotice::IpUnavailable);
                let remaining = *self
                    .session_only
                    .lock()
                    .get_or_insert(self.ledger.allowances().anonymous);
                ContextSnapshot {
                    updated_at: Some(Utc::now()),
                    ..ContextSnapshot::unresolved(remaining)
                }
            }
        };

        self.state.send_replace(snapshot.clone());
        snapshot
    }

    /// Consume one credit for the current identity.
    async fn consume(&self) -> Result<Consumption, LedgerError> {
        let Some(identity) = &self.identity else {
            return Ok(self.consume_session_only());
        };

        match self.ledger.consume_one(identity).await {
            Ok(consumption) => {
                self.state.send_modify(|snapshot| {
                    snapshot.identity = Some(identity.clone());
                    snapshot.remaining = consumption.remaining();
                    snapshot.origin = BalanceOrigin::Existing;
                    snapshot.updated_at = Some(Utc::now());
                });
                if !consumption.is_consumed() {
                    self.notify(LedgerNotice::Exhausted);
                }
                Ok(consumption)
            }
            Err(e) => {
                warn!(error = %e, context = %self.context_id, "Credit consumption failed");
                self.notify(LedgerNotice::from_error(&e));
                Err(e)
            }
        }
    }

    /// Decrement the in-memory balance used while the IP address is unknown.
    ///
    /// The balance outlives identity changes, so signing in and back out
    /// returns to it instead of a fresh allowance.
    fn consume_session_only(&self) -> Consumption {
        let consumption = {
            let mut slot = self.session_only.lock();
            let remaining = slot.get_or_insert(self.ledger.allowances().anonymous);
            match remaining.checked_sub(1) {
                Some(left) => {
                    *remaining = left;
                    Consumption::Consumed { remaining: left }
                }
                None => Consumption::Exhausted,
            }
        };
        self.state.send_modify(|snapshot| {
            snapshot.identity = None;
            snapshot.remaining = consumption.remaining();
            snapshot.origin = BalanceOrigin::Fallback;
            snapshot.updated_at = Some(Utc::now());
        });
        if !consumption.is_consumed() {
            self.notify(LedgerNotice::Exhausted);
        }
        consumption
    }

    /// Apply a local identity transition, then tell the other contexts.
    async fn transition(&self, transition: IdentityTransition) -> ContextSnapshot {
        let snapshot = match self.ledger.on_identity_transition(&transition).await {
            Ok(balance) => ContextSnapshot::from_balance(balance),
            Err(e) => {
                warn!(error = %e, context = %self.context_id, "Identity transition failed");
                self.notify(LedgerNotice::from_error(&e));
                ContextSnapshot::from_balance(self.ledger.fallback_balance(&transition.target()))
            }
        };
        self.state.send_replace(snapshot.clone());

        match transition {
            IdentityTransition::SignedIn { user_id } => self.session.sign_in(self.context_id, user_id),
            IdentityTransition::SignedOut { .. } => self.session.sign_out(self.context_id),
        }
        snapshot
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Re-resolve the balance of the current identity.
#[derive(Clone, Debug, Default)]
pub struct ResolveBalance {
    /// Response channel.
    pub response_tx: Option<ResponseChannel<ContextSnapshot>>,
}

impl ResolveBalance {
    /// Create a resolve request with response channel.
    #[must_use]
    pub fn with_response() -> (Self, oneshot::Receiver<ContextSnapshot>) {
        let (response_tx, rx) = create_request_reply();
        (
            Self {
                response_tx: Some(response_tx),
            },
            rx,
        )
    }
}

/// Consume one credit for the current identity.
#[derive(Clone, Debug, Default)]
pub struct ConsumeCredit {
    /// Response channel.
    pub response_tx: Option<ResponseChannel<Result<Consumption, LedgerError>>>,
}

impl ConsumeCredit {
    /// Create a consume request with response channel.
    #[must_use]
    pub fn with_response() -> (Self, oneshot::Receiver<Result<Consumption, LedgerError>>) {
        let (response_tx, rx) = create_request_reply();
        (
            Self {
                response_tx: Some(response_tx),
            },
            rx,
        )
    }
}

/// Sign this context in and notify the other contexts.
#[derive(Clone, Debug)]
pub struct SignIn {
    /// Account signing in.
    pub user_id: UserId,
    /// Response channel.
    pub response_tx: Option<ResponseChannel<ContextSnapshot>>,
}

impl SignIn {
    /// Create a sign-in request with response channel.
    #[must_use]
    pub fn with_response(user_id: UserId) -> (Self, oneshot::Receiver<ContextSnapshot>) {
        let (response_tx, rx) = create_request_reply();
        (
            Self {
                user_id,
                response_tx: Some(response_tx),
            },
            rx,
        )
    }
}

/// Sign this context out and notify the other contexts.
#[derive(Clone, Debug, Default)]
pub struct SignOut {
    /// Response channel.
    pub response_tx: Option<ResponseChannel<ContextSnapshot>>,
}

impl SignOut {
    /// Create a sign-out request with response channel.
    #[must_use]
    pub fn with_response() -> (Self, oneshot::Receiver<ContextSnapshot>) {
        let (response_tx, rx) = create_request_reply();
        (
            Self {
                response_tx: Some(response_tx),
            },
            rx,
        )
    }
}

/// Another context of the session changed identity.
#[derive(Clone, Copy, Debug)]
pub struct IdentityChanged {
    /// What happened.
    pub event: IdentityEvent,
}

/// Subscribe to balance and notice updates.
#[derive(Clone, Debug, Default)]
pub struct Subscribe {
    /// Response channel.
    pub response_tx: Option<ResponseChannel<ContextSubscription>>,
}

impl Subscribe {
    /// Create a subscribe request with response channel.
    #[must_use]
    pub fn with_response() -> (Self, oneshot::Receiver<ContextSubscription>) {
        let (response_tx, rx) = create_request_reply();
        (
            Self {
                response_tx: Some(response_tx),
            },
            rx,
        )
    }
}

/// Read the current snapshot without touching storage.
#[derive(Clone, Debug, Default)]
pub struct GetSnapshot {
    /// Response channel.
    pub response_tx: Option<ResponseChannel<ContextSnapshot>>,
}

impl GetSnapshot {
    /// Create a snapshot request with response channel.
    #[must_use]
    pub fn with_response() -> (Self, oneshot::Receiver<ContextSnapshot>) {
        let (response_tx, rx) = create_request_reply();
        (
            Self {
                response_tx: Some(response_tx),
            },
            rx,
        )
    }
}
