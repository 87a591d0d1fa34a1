//! Integration tests for ledger flows over SQLite and across browsing contexts.

use acton_reactive::prelude::*;
use credits_service::agents::{
    ConsumeCredit, ContextSnapshot, ResolveBalance, SignIn, SignOut, Subscribe,
};
use credits_service::{
    BalanceOrigin, BrowsingSession, Consumption, CreditAllowances, CreditLedger,
    CreditsServiceConfig, HttpIpDiscovery, Identity, IdentityTransition, LedgerContextAgent,
    SessionHub, SignInPolicy, SqlCreditStore, UserId,
};
use figment::providers::{Format, Toml};
use figment::Figment;
use sqlx::any::AnyPoolOptions;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));

async fn sql_ledger(sign_in_policy: SignInPolicy) -> Arc<CreditLedger> {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("sqlite pool");
    let store = SqlCreditStore::new(pool);
    store.migrate().await.expect("migrate");

    Arc::new(CreditLedger::new(
        Arc::new(store),
        CreditAllowances {
            anonymous: 2,
            authenticated: 10,
            sign_in_policy,
        },
    ))
}

async fn reply<T>(rx: oneshot::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("Timeout")
        .expect("Channel closed")
}

async fn wait_for(
    balance: &mut watch::Receiver<ContextSnapshot>,
    predicate: impl FnMut(&ContextSnapshot) -> bool,
) -> ContextSnapshot {
    tokio::time::timeout(Duration::from_secs(2), balance.wait_for(predicate))
        .await
        .expect("Timeout")
        .expect("Agent stopped")
        .clone()
}

/// Anonymous seed, exhaustion, sign-in and sign-out over a real SQL table
#[tokio::test]
async fn test_anonymous_and_authenticated_key_spaces_stay_apart() {
    let ledger = sql_ledger(SignInPolicy::Reseed).await;
    let anonymous = Identity::anonymous(IP);
    let user_id = UserId::new("user-42").unwrap();

    let seeded = ledger.resolve_balance(&anonymous).await.unwrap();
    assert_eq!((seeded.remaining, seeded.origin), (2, BalanceOrigin::Seeded));
    let again = ledger.resolve_balance(&anonymous).await.unwrap();
    assert_eq!((again.remaining, again.origin), (2, BalanceOrigin::Existing));

    assert_eq!(
        ledger.consume_one(&anonymous).await.unwrap(),
        Consumption::Consumed { remaining: 1 }
    );
    assert_eq!(
        ledger.consume_one(&anonymous).await.unwrap(),
        Consumption::Consumed { remaining: 0 }
    );
    assert_eq!(ledger.consume_one(&anonymous).await.unwrap(), Consumption::Exhausted);

    let signed_in = ledger
        .on_identity_transition(&IdentityTransition::SignedIn {
            user_id: user_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(signed_in.remaining, 10);
    assert_eq!(
        ledger
            .consume_one(&Identity::authenticated(user_id))
            .await
            .unwrap(),
        Consumption::Consumed { remaining: 9 }
    );

    let signed_out = ledger
        .on_identity_transition(&IdentityTransition::SignedOut { ip: IP })
        .await
        .unwrap();
    assert_eq!(signed_out.identity, anonymous);
    assert_eq!(signed_out.remaining, 0);
}

/// Reseed ignores a used-up account balance; preserve keeps it
#[tokio::test]
async fn test_sign_in_policies() {
    for (policy, expected) in [(SignInPolicy::Reseed, 10), (SignInPolicy::Preserve, 8)] {
        let ledger = sql_ledger(policy).await;
        let user_id = UserId::new("user-7").unwrap();
        let identity = Identity::authenticated(user_id.clone());

        ledger.resolve_balance(&identity).await.unwrap();
        ledger.consume_one(&identity).await.unwrap();
        ledger.consume_one(&identity).await.unwrap();

        let balance = ledger
            .on_identity_transition(&IdentityTransition::SignedIn { user_id })
            .await
            .unwrap();
        assert_eq!(balance.remaining, expected, "{policy:?}");
    }
}

/// A sign-in in one tab re-resolves the other tab; a sign-out does too
#[tokio::test(flavor = "multi_thread")]
async fn test_identity_change_propagates_between_contexts() {
    let mut runtime = ActonApp::launch_async().await;
    let ledger = sql_ledger(SignInPolicy::Reseed).await;
    let hub = SessionHub::default();
    let session: Arc<BrowsingSession> = hub.open("browser-1");

    let tab_a = LedgerContextAgent::spawn(
        &mut runtime,
        Arc::clone(&ledger),
        Arc::clone(&session),
        Some(IP),
    )
    .await
    .expect("Should spawn tab A");
    let tab_b = LedgerContextAgent::spawn(
        &mut runtime,
        Arc::clone(&ledger),
        Arc::clone(&session),
        Some(IP),
    )
    .await
    .expect("Should spawn tab B");

    // Both tabs start on the same anonymous record
    let (request, rx) = ResolveBalance::with_response();
    tab_a.send(request).await;
    assert_eq!(reply(rx).await.remaining, 2);

    let (request, rx) = ConsumeCredit::with_response();
    tab_a.send(request).await;
    assert_eq!(reply(rx).await.unwrap(), Consumption::Consumed { remaining: 1 });

    let (request, rx) = Subscribe::with_response();
    tab_b.send(request).await;
    let mut tab_b_balance = reply(rx).await.balance;

    // Tab A signs in; tab B follows without initiating anything
    let user_id = UserId::new("user-42").unwrap();
    let (request, rx) = SignIn::with_response(user_id.clone());
    tab_a.send(request).await;
    assert_eq!(reply(rx).await.remaining, 10);

    let authenticated = Identity::authenticated(user_id);
    let snapshot = wait_for(&mut tab_b_balance, |s| s.identity.as_ref() == Some(&authenticated)).await;
    assert_eq!(snapshot.remaining, 10);
    assert_eq!(snapshot.origin, BalanceOrigin::Existing);

    // Tab A signs out; tab B re-resolves the anonymous record it never touched
    let (request, rx) = SignOut::with_response();
    tab_a.send(request).await;
    assert_eq!(reply(rx).await.remaining, 1);

    let anonymous = Identity::anonymous(IP);
    let snapshot = wait_for(&mut tab_b_balance, |s| s.identity.as_ref() == Some(&anonymous)).await;
    assert_eq!(snapshot.remaining, 1);
    assert_eq!(session.signed_in_user(), None);

    runtime.shutdown_all().await.expect("Failed to shutdown");
}

/// A context keyed by the address the configured lookup endpoint reports
#[tokio::test(flavor = "multi_thread")]
async fn test_context_uses_configured_ip_lookup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = [0_u8; 1024];
        let _ = socket.read(&mut request).await;
        let body = r#"{"ip":"198.51.100.4"}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.expect("write");
    });

    let config = CreditsServiceConfig::from_figment(Figment::new().merge(Toml::string(&format!(
        r#"
        [ip_lookup]
        url = "http://{addr}/"
        timeout_seconds = 2
        "#
    ))))
    .expect("config");
    let discovery = HttpIpDiscovery::new(&config.ip_lookup).expect("discovery");

    let mut runtime = ActonApp::launch_async().await;
    let ledger = sql_ledger(SignInPolicy::Reseed).await;
    let session = SessionHub::default().open("browser-1");
    let tab = LedgerContextAgent::spawn_with_discovery(&mut runtime, ledger, session, &discovery)
        .await
        .expect("Should spawn tab");

    let (request, rx) = ResolveBalance::with_response();
    tab.send(request).await;
    let snapshot = reply(rx).await;
    assert_eq!(snapshot.identity, Some(Identity::anonymous(IP)));
    assert_eq!(snapshot.origin, BalanceOrigin::Seeded);

    runtime.shutdown_all().await.expect("Failed to shutdown");
}
