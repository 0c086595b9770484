/*
[INPUT]:  A client wired to the mock venue
[OUTPUT]: End-to-end coverage of session lifecycle, correlation and reconnect
[POS]:    Integration tests against an in-process venue
[UPDATE]: When client-facing behavior changes
*/

mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::json;
use tokio::time::{Instant, sleep, timeout};
use tokio_test::assert_ok;
use url::Url;

use common::{MockVenue, VALID_TOKEN};
use deriv_ws_adapter::{
    BackoffConfig, DerivClient, DerivError, SessionConfig, SessionState, StaticToken, Topic,
};

fn config_for(venue: &MockVenue) -> SessionConfig {
    let endpoint = Url::parse(&venue.url()).unwrap();
    SessionConfig::new(endpoint)
        .with_request_timeout(Duration::from_secs(5))
        .with_backoff(BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 3,
        })
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_first_request_connects_lazily() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    assert_eq!(client.state(), SessionState::Disconnected);

    let reply = client.submit(json!({"ping": 1})).await.unwrap();
    assert_eq!(reply["ping"], "pong");
    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(venue.connections(), 1);
}

#[tokio::test]
async fn test_concurrent_submits_get_their_own_replies() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    client.connect().await.unwrap();

    let mut handles = Vec::new();
    for n in 0..15u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply = client
                .submit(json!({"ping": 1, "passthrough": {"n": n}}))
                .await
                .unwrap();
            (n, reply)
        }));
    }
    for handle in handles {
        let (n, reply) = handle.await.unwrap();
        assert_eq!(reply["passthrough"]["n"], n);
    }
    assert_eq!(venue.connections(), 1);
}

#[tokio::test]
async fn test_timeout_leaves_session_usable() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));

    let result = client
        .submit_with_timeout(json!({"block": 1}), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(DerivError::Timeout { .. })));

    let reply = client.submit(json!({"ping": 1})).await.unwrap();
    assert_eq!(reply["ping"], "pong");
    assert_eq!(venue.connections(), 1);
}

#[tokio::test]
async fn test_subscribers_share_one_upstream_subscription() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    let topic = Topic::ticks("R_50");

    let mut first = client.subscribe(topic.clone()).await.unwrap();
    let mut second = client.subscribe(topic.clone()).await.unwrap();
    assert_eq!(venue.subscribe_calls("ticks:R_50"), 1);

    venue.push_tick("R_50", 107.25);
    let frame = timeout(Duration::from_secs(2), first.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["tick"]["symbol"], "R_50");
    let frame = timeout(Duration::from_secs(2), second.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["tick"]["symbol"], "R_50");

    // Detaching one listener keeps the upstream subscription alive.
    client.unsubscribe(first).await.unwrap();
    assert_eq!(venue.forget_calls(), 0);
    venue.push_tick("R_50", 107.5);
    assert!(
        timeout(Duration::from_secs(2), second.recv())
            .await
            .unwrap()
            .is_some()
    );

    // The last listener tears it down with exactly one forget.
    client.unsubscribe(second).await.unwrap();
    assert_eq!(venue.forget_calls(), 1);
    assert_eq!(venue.subscribe_calls("ticks:R_50"), 1);
}

#[tokio::test]
async fn test_requests_queue_behind_authorization_in_order() {
    let venue = MockVenue::start().await;
    venue.set_auth_delay(Duration::from_millis(150));
    let client = DerivClient::with_credentials(
        config_for(&venue),
        Arc::new(StaticToken::new(VALID_TOKEN)),
    );

    let connector = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    wait_until("handshake to start", || {
        client.state() == SessionState::Authorizing
    })
    .await;

    let mut handles = Vec::new();
    for n in 1..=3u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client
                .submit(json!({"ping": 1, "passthrough": {"n": n}}))
                .await
        }));
        // Give each task time to reach the gate so queue order is the
        // submission order.
        sleep(Duration::from_millis(10)).await;
    }

    connector.await.unwrap().unwrap();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let arrivals = venue.arrivals();
    let authorize_at = arrivals
        .iter()
        .position(|frame| frame.get("authorize").is_some())
        .unwrap();
    let ping_order: Vec<u64> = arrivals
        .iter()
        .enumerate()
        .filter(|(_, frame)| frame.get("ping").is_some())
        .map(|(at, frame)| {
            assert!(at > authorize_at, "ping sent before authorize completed");
            frame["passthrough"]["n"].as_u64().unwrap()
        })
        .collect();
    assert_eq!(ping_order, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_reconnect_fails_inflight_and_replays_subscriptions() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    client.connect().await.unwrap();

    let mut ticks = client.subscribe(Topic::ticks("R_50")).await.unwrap();
    let _balance = client.subscribe(Topic::Balance).await.unwrap();

    let mut blocked = Vec::new();
    for _ in 0..3 {
        let client = client.clone();
        blocked.push(tokio::spawn(
            async move { client.submit(json!({"block": 1})).await },
        ));
    }
    wait_until("blocked requests to reach the venue", || {
        venue
            .arrivals()
            .iter()
            .filter(|frame| frame.get("block").is_some())
            .count()
            == 3
    })
    .await;

    venue.drop_connection();
    for handle in blocked {
        assert!(matches!(
            handle.await.unwrap(),
            Err(DerivError::ConnectionLost)
        ));
    }

    wait_until("subscriptions to replay", || {
        venue.subscribe_calls("ticks:R_50") == 2 && venue.subscribe_calls("balance") == 2
    })
    .await;
    wait_until("session to recover", || {
        client.state() == SessionState::Ready
    })
    .await;
    assert_eq!(venue.connections(), 2);

    // The surviving stream keeps delivering, exactly once per push.
    venue.push_tick("R_50", 200.0);
    let frame = timeout(Duration::from_secs(2), ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["tick"]["quote"], 200.0);
    assert!(timeout(Duration::from_millis(100), ticks.recv()).await.is_err());
    assert_eq!(client.latest_price("R_50").unwrap().quote, Decimal::from(200));
}

#[tokio::test]
async fn test_lazily_opened_session_still_reconnects() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));

    // No explicit connect; the first request opens the session.
    let reply = client.submit(json!({"ping": 1})).await.unwrap();
    assert_eq!(reply["ping"], "pong");

    venue.drop_connection();
    wait_until("session to recover", || {
        venue.connections() == 2 && client.state() == SessionState::Ready
    })
    .await;
    let reply = client.submit(json!({"ping": 1})).await.unwrap();
    assert_eq!(reply["ping"], "pong");
}

#[tokio::test]
async fn test_garbage_frames_do_not_kill_the_session() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    client.connect().await.unwrap();

    venue.send_raw("not json{{{");
    venue.send_raw("[1, 2, 3]");
    // Give the read loop a chance to chew on the garbage first.
    sleep(Duration::from_millis(50)).await;

    let reply = client.submit(json!({"ping": 1})).await.unwrap();
    assert_eq!(reply["ping"], "pong");
    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(venue.connections(), 1);
}

#[tokio::test]
async fn test_idle_session_sends_keepalive_pings() {
    let venue = MockVenue::start().await;
    let config = config_for(&venue).with_keepalive_interval(Duration::from_millis(100));
    let client = DerivClient::new(config);
    client.connect().await.unwrap();

    wait_until("a keepalive ping to arrive", || venue.ws_pings() >= 1).await;
    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(venue.connections(), 1);
}

#[tokio::test]
async fn test_close_is_not_blocked_by_reconnect_backoff() {
    let venue = MockVenue::start().await;
    let config = config_for(&venue).with_backoff(BackoffConfig {
        initial: Duration::from_secs(1),
        max: Duration::from_secs(1),
        multiplier: 1.0,
        jitter: 0.0,
        max_attempts: 5,
    });
    let client = DerivClient::new(config);
    client.connect().await.unwrap();

    venue.refuse_new_connections();
    venue.drop_connection();
    wait_until("the reconnect loop to start", || {
        client.state() == SessionState::Connecting
    })
    .await;

    // close() must return while the supervisor is mid-backoff.
    timeout(Duration::from_millis(300), client.close())
        .await
        .expect("close stalled behind a reconnect backoff");
    assert_eq!(client.state(), SessionState::Disconnected);

    // The sleeping supervisor wakes, sees the closed client and stands down.
    venue.allow_new_connections();
    sleep(Duration::from_millis(1300)).await;
    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(venue.connections(), 1);
}

#[tokio::test]
async fn test_balance_frames_fill_the_snapshot() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    assert!(client.latest_balance().is_none());

    let _stream = client.subscribe(Topic::Balance).await.unwrap();
    wait_until("the balance snapshot", || client.latest_balance().is_some()).await;

    let snapshot = client.latest_balance().unwrap();
    assert_eq!(snapshot.balance, Decimal::from(1000));
    assert_eq!(snapshot.currency, "USD");
}

#[tokio::test]
async fn test_rejected_credentials_fail_without_retry() {
    let venue = MockVenue::start().await;
    let client = DerivClient::with_credentials(
        config_for(&venue),
        Arc::new(StaticToken::new("wrong-token")),
    );

    let result = client.connect().await;
    match result {
        Err(DerivError::AuthRejected { code, .. }) => assert_eq!(code, "InvalidToken"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(client.state(), SessionState::Failed);
    assert!(client.state().requires_manual_reconnect());

    // No retry storm, and nothing but the handshake reached the venue.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(venue.connections(), 1);
    assert_eq!(venue.app_pings(), 0);

    let result = client.submit(json!({"ping": 1})).await;
    assert!(matches!(result, Err(DerivError::AuthRejected { .. })));
    assert_eq!(venue.app_pings(), 0);
}

#[tokio::test]
async fn test_exhausted_retry_budget_requires_manual_connect() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    client.connect().await.unwrap();

    venue.refuse_new_connections();
    venue.drop_connection();
    wait_until("retry budget to run out", || {
        client.state() == SessionState::Failed
    })
    .await;

    let result = client.submit(json!({"ping": 1})).await;
    assert!(matches!(
        result,
        Err(DerivError::ConnectionUnavailable { attempts: 3 })
    ));

    // Explicit connect is the way back.
    venue.allow_new_connections();
    client.connect().await.unwrap();
    assert_eq!(client.state(), SessionState::Ready);
    let reply = client.submit(json!({"ping": 1})).await.unwrap();
    assert_eq!(reply["ping"], "pong");
}

#[tokio::test]
async fn test_close_terminates_streams_and_disconnects() {
    let venue = MockVenue::start().await;
    let client = DerivClient::new(config_for(&venue));
    client.connect().await.unwrap();
    let mut ticks = client.subscribe(Topic::ticks("R_50")).await.unwrap();

    client.close().await;
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(ticks.recv().await.is_none());
}
