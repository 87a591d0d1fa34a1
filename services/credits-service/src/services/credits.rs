//! gRPC Credit Ledger Service implementation.

use crate::identity::{Identity, IdentityTransition, UserId};
use crate::ledger::{BalanceOrigin, Consumption, CreditBalance, CreditLedger};
use crate::session::{BrowsingSession, ContextId, IdentityEvent, SessionHub};
use async_stream::stream;
use credits_proto::credits::v1::{
    credit_ledger_service_server::CreditLedgerService, identity::Kind, BalanceOrigin as ProtoOrigin,
    BalanceResponse, ConsumeCreditRequest, ConsumeCreditResponse, Identity as ProtoIdentity,
    IdentityEventKind, IdentityEventMessage, ResolveBalanceRequest, SignInRequest, SignOutRequest,
    WatchIdentityRequest,
};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// gRPC Credit Ledger Service implementation.
#[derive(Debug, Clone)]
pub struct CreditsServiceImpl {
    ledger: Arc<CreditLedger>,
    sessions: Arc<SessionHub>,
}

impl CreditsServiceImpl {
    /// Create a new credit ledger service.
    #[must_use]
    pub const fn new(ledger: Arc<CreditLedger>, sessions: Arc<SessionHub>) -> Self {
        Self { ledger, sessions }
    }

    fn open_session(&self, session_id: &str) -> Result<Arc<BrowsingSession>, Status> {
        if session_id.trim().is_empty() {
            return Err(Status::invalid_argument("session_id is required"));
        }
        Ok(self.sessions.open(session_id))
    }
}

/// Parse an IP address, falling back to the caller's peer address when empty.
fn ip_or_peer(ip_address: &str, peer: Option<IpAddr>) -> Result<IpAddr, Status> {
    if ip_address.trim().is_empty() {
        return peer.ok_or_else(|| Status::invalid_argument("ip_address is required"));
    }
    ip_address
        .trim()
        .parse()
        .map_err(|_| Status::invalid_argument(format!("Invalid ip_address: {ip_address}")))
}

fn parse_user_id(user_id: String) -> Result<UserId, Status> {
    UserId::new(user_id).ok_or_else(|| Status::invalid_argument("user_id is required"))
}

fn parse_context_id(context_id: &str) -> Result<ContextId, Status> {
    ContextId::parse(context_id)
        .map_err(|e| Status::invalid_argument(format!("Invalid context_id: {e}")))
}

fn identity_from_proto(identity: Option<ProtoIdentity>, peer: Option<IpAddr>) -> Result<Identity, Status> {
    match identity.and_then(|identity| identity.kind) {
        Some(Kind::Anonymous(anonymous)) => {
            ip_or_peer(&anonymous.ip_address, peer).map(Identity::anonymous)
        }
        Some(Kind::Authenticated(authenticated)) => {
            parse_user_id(authenticated.user_id).map(Identity::authenticated)
        }
        None => Err(Status::invalid_argument("identity is required")),
    }
}

fn origin_to_proto(origin: BalanceOrigin) -> ProtoOrigin {
    match origin {
        BalanceOrigin::Existing => ProtoOrigin::Existing,
        BalanceOrigin::Seeded => ProtoOrigin::Seeded,
        BalanceOrigin::Fallback => ProtoOrigin::Fallback,
    }
}

fn balance_to_proto(balance: &CreditBalance) -> BalanceResponse {
    BalanceResponse {
        credits_remaining: balance.remaining,
        origin: i32::from(origin_to_proto(balance.origin)),
    }
}

fn event_to_proto(event: IdentityEvent) -> IdentityEventMessage {
    let kind = match event {
        IdentityEvent::SignedIn => IdentityEventKind::SignedIn,
        IdentityEvent::SignedOut => IdentityEventKind::SignedOut,
    };
    IdentityEventMessage {
        kind: i32::from(kind),
    }
}

type WatchIdentityStream = Pin<Box<dyn Stream<Item = Result<IdentityEventMessage, Status>> + Send>>;

#[tonic::async_trait]
impl CreditLedgerService for CreditsServiceImpl {
    type WatchIdentityStream = WatchIdentityStream;

    async fn resolve_balance(
        &self,
        request: Request<ResolveBalanceRequest>,
    ) -> Result<Response<BalanceResponse>, Status> {
        let peer = request.remote_addr().map(|addr| addr.ip());
        let identity = identity_from_proto(request.into_inner().identity, peer)?;

        let balance = self.ledger.resolve_balance(&identity).await?;
        debug!(%identity, remaining = balance.remaining, origin = ?balance.origin, "Resolved balance");

        Ok(Response::new(balance_to_proto(&balance)))
    }

    async fn consume_credit(
        &self,
        request: Request<ConsumeCreditRequest>,
    ) -> Result<Response<ConsumeCreditResponse>, Status> {
        let peer = request.remote_addr().map(|addr| addr.ip());
        let identity = identity_from_proto(request.into_inner().identity, peer)?;

        let response = match self.ledger.consume_one(&identity).await? {
            Consumption::Consumed { remaining } => ConsumeCreditResponse {
                consumed: true,
                credits_remaining: remaining,
            },
            Consumption::Exhausted => {
                info!(%identity, "Credits exhausted");
                ConsumeCreditResponse {
                    consumed: false,
                    credits_remaining: 0,
                }
            }
        };

        Ok(Response::new(response))
    }

    async fn sign_in(
        &self,
        request: Request<SignInRequest>,
    ) -> Result<Response<BalanceResponse>, Status> {
        let req = request.into_inner();
        let session = self.open_session(&req.session_id)?;
        let context = parse_context_id(&req.context_id)?;
        let user_id = parse_user_id(req.user_id)?;

        let transition = IdentityTransition::SignedIn {
            user_id: user_id.clone(),
        };
        let result = self.ledger.on_identity_transition(&transition).await;

        // The session is signed in even when the balance could not be stored.
        session.sign_in(context, user_id);

        let balance = result.inspect_err(|e| warn!(error = %e, "Sign-in balance failed"))?;
        Ok(Response::new(balance_to_proto(&balance)))
    }

    async fn sign_out(
        &self,
        request: Request<SignOutRequest>,
    ) -> Result<Response<BalanceResponse>, Status> {
        let peer = request.remote_addr().map(|addr| addr.ip());
        let req = request.into_inner();
        let session = self.open_session(&req.session_id)?;
        let context = parse_context_id(&req.context_id)?;
        let ip = ip_or_peer(&req.ip_address, peer)?;

        let result = self
            .ledger
            .on_identity_transition(&IdentityTransition::SignedOut { ip })
            .await;

        session.sign_out(context);

        let balance = result.inspect_err(|e| warn!(error = %e, "Sign-out balance failed"))?;
        Ok(Response::new(balance_to_proto(&balance)))
    }

    async fn watch_identity(
        &self,
        request: Request<WatchIdentityRequest>,
    ) -> Result<Response<Self::WatchIdentityStream>, Status> {
        let req = request.into_inner();
        let session = self.open_session(&req.session_id)?;
        let context = parse_context_id(&req.context_id)?;
        let mut receiver = session.subscribe(context);
        debug!(session = %session.name(), %context, "Watching identity events");

        let output_stream = stream! {
            while let Some(event) = receiver.recv().await {
                yield Ok::<_, Status>(event_to_proto(event));
            }
        };

        Ok(Response::new(Box::pin(output_stream)))
    }
}
