//! Client for the credit ledger service.

use crate::error::ClientError;
use crate::identity::{Identity, UserId};
use crate::ledger::{BalanceOrigin, Consumption};
use crate::session::{ContextId, IdentityEvent};
use credits_proto::credits::v1::{
    credit_ledger_service_client::CreditLedgerServiceClient, identity::Kind,
    AnonymousIdentity, AuthenticatedIdentity, BalanceOrigin as ProtoOrigin, BalanceResponse,
    ConsumeCreditRequest, Identity as ProtoIdentity, IdentityEventKind, IdentityEventMessage,
    ResolveBalanceRequest, SignInRequest, SignOutRequest, WatchIdentityRequest,
};
use std::net::IpAddr;
use std::pin::Pin;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Channel;

/// Balance as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBalance {
    /// Actions remaining.
    pub remaining: u32,
    /// Where the value came from.
    pub origin: BalanceOrigin,
}

/// Identity events received from [`CreditLedgerClient::watch_identity`].
pub type IdentityEventStream = Pin<Box<dyn Stream<Item = Result<IdentityEvent, ClientError>> + Send>>;

/// Client for the credit ledger service.
#[derive(Debug, Clone)]
pub struct CreditLedgerClient {
    client: CreditLedgerServiceClient<Channel>,
}

impl CreditLedgerClient {
    /// Connect to the credit ledger service.
    ///
    /// # Errors
    ///
    /// Returns error if connection fails.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let endpoint = endpoint.into();
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?
            .connect()
            .await?;

        Ok(Self {
            client: CreditLedgerServiceClient::new(channel),
        })
    }

    /// Resolve the balance for an identity.
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails.
    pub async fn resolve_balance(&mut self, identity: &Identity) -> Result<RemoteBalance, ClientError> {
        let response = self
            .client
            .resolve_balance(ResolveBalanceRequest {
                identity: Some(identity_to_proto(identity)),
            })
            .await?;

        balance_from_proto(&response.into_inner())
    }

    /// Resolve the balance of the caller's anonymous identity, keyed by the
    /// address the service sees the call coming from.
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails.
    pub async fn resolve_peer_balance(&mut self) -> Result<RemoteBalance, ClientError> {
        let response = self
            .client
            .resolve_balance(ResolveBalanceRequest {
                identity: Some(ProtoIdentity {
                    kind: Some(Kind::Anonymous(AnonymousIdentity::default())),
                }),
            })
            .await?;

        balance_from_proto(&response.into_inner())
    }

    /// Consume one credit.
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails.
    pub async fn consume_credit(&mut self, identity: &Identity) -> Result<Consumption, ClientError> {
        let response = self
            .client
            .consume_credit(ConsumeCreditRequest {
                identity: Some(identity_to_proto(identity)),
            })
            .await?
            .into_inner();

        if response.consumed {
            Ok(Consumption::Consumed {
                remaining: response.credits_remaining,
            })
        } else {
            Ok(Consumption::Exhausted)
        }
    }

    /// Sign a browsing context in.
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails.
    pub async fn sign_in(
        &mut self,
        session_id: &str,
        context: ContextId,
        user_id: &UserId,
    ) -> Result<RemoteBalance, ClientError> {
        let response = self
            .client
            .sign_in(SignInRequest {
                session_id: session_id.to_string(),
                context_id: context.to_string(),
                user_id: user_id.as_str().to_string(),
            })
            .await?;

        balance_from_proto(&response.into_inner())
    }

    /// Sign a browsing context out.
    ///
    /// With `ip` unset the service uses the caller's peer address.
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails.
    pub async fn sign_out(
        &mut self,
        session_id: &str,
        context: ContextId,
        ip: Option<IpAddr>,
    ) -> Result<RemoteBalance, ClientError> {
        let response = self
            .client
            .sign_out(SignOutRequest {
                session_id: session_id.to_string(),
                context_id: context.to_string(),
                ip_address: ip.map(|ip| ip.to_string()).unwrap_or_default(),
            })
            .await?;

        balance_from_proto(&response.into_inner())
    }

    /// Watch identity events published by other contexts of a session.
    ///
    /// # Errors
    ///
    /// Returns error if the service call fails.
    pub async fn watch_identity(
        &mut self,
        session_id: &str,
        context: ContextId,
    ) -> Result<IdentityEventStream, ClientError> {
        let stream = self
            .client
            .watch_identity(WatchIdentityRequest {
                session_id: session_id.to_string(),
                context_id: context.to_string(),
            })
            .await?
            .into_inner();

        Ok(Box::pin(stream.map(|message| event_from_proto(&message?))))
    }
}

fn identity_to_proto(identity: &Identity) -> ProtoIdentity {
    let kind = match identity {
        Identity::Anonymous { ip } => Kind::Anonymous(AnonymousIdentity {
            ip_address: ip.to_string(),
        }),
        Identity::Authenticated { user_id } => Kind::Authenticated(AuthenticatedIdentity {
            user_id: user_id.as_str().to_string(),
        }),
    };
    ProtoIdentity { kind: Some(kind) }
}

fn balance_from_proto(response: &BalanceResponse) -> Result<RemoteBalance, ClientError> {
    let origin = match ProtoOrigin::try_from(response.origin) {
        Ok(ProtoOrigin::Existing) => BalanceOrigin::Existing,
        Ok(ProtoOrigin::Seeded) => BalanceOrigin::Seeded,
        Ok(ProtoOrigin::Fallback) => BalanceOrigin::Fallback,
        Ok(ProtoOrigin::Unspecified) | Err(_) => {
            return Err(ClientError::ResponseError(format!(
                "Unknown balance origin: {}",
                response.origin
            )))
        }
    };

    Ok(RemoteBalance {
        remaining: response.credits_remaining,
        origin,
    })
}

fn event_from_proto(message: &IdentityEventMessage) -> Result<IdentityEvent, ClientError> {
    match IdentityEventKind::try_from(message.kind) {
        Ok(IdentityEventKind::SignedIn) => Ok(IdentityEvent::SignedIn),
        Ok(IdentityEventKind::SignedOut) => Ok(IdentityEvent::SignedOut),
        Ok(IdentityEventKind::Unspecified) | Err(_) => Err(ClientError::ResponseError(format!(
            "Unknown identity event: {}",
            message.kind
        ))),
    }
}
