//! End-to-end refresh pipeline scenarios:
//! cache round trips, proactive no-ops, rate limiting, failure
//! classification, and the concurrent-refresh dedup guarantee.

mod common;

use common::*;
use std::time::Duration;
use tether::provider::ProviderError;
use tether::{
    ConnectionStatus, CredentialStore, EngineConfig, EngineError, ErrorKind, Provider,
    RefreshOutcome,
};

const USER: &str = "user-42";
const DRIVE: Provider = Provider::GoogleDrive;

#[tokio::test]
async fn healthy_round_trip_costs_zero_provider_calls() {
    let h = harness(EngineConfig::default());
    // Valid for 72h, well beyond the 24h lookahead
    h.credentials.put(credential(USER, DRIVE, t0() + hours(72)));

    // First call: lookahead no-op, cache populated
    let first = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap();
    match first {
        RefreshOutcome::Valid { ref token, from_cache } => {
            assert!(!from_cache);
            assert_eq!(token.access_token, format!("at-{USER}"));
        }
        other => panic!("expected Valid, got {other:?}"),
    }

    // Second call: answered from cache
    let second = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap();
    assert!(matches!(second, RefreshOutcome::Valid { from_cache: true, .. }));

    assert_eq!(h.provider.refresh_count(), 0);
    assert_eq!(h.provider.build_count(), 0);
}

#[tokio::test]
async fn expiring_token_is_refreshed_and_persisted() {
    let h = harness(EngineConfig::default());
    // Expires in 2h, inside the 24h lookahead
    h.credentials.put(credential(USER, DRIVE, t0() + hours(2)));

    let outcome = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap();
    match outcome {
        RefreshOutcome::Refreshed(token) => {
            assert_eq!(token.expires_at, t0() + hours(72));
        }
        other => panic!("expected Refreshed, got {other:?}"),
    }
    assert_eq!(h.provider.refresh_count(), 1);

    // The credential store saw the new token
    let stored = h.credentials.load(USER, DRIVE).await.unwrap().unwrap();
    assert_eq!(stored.expires_at, t0() + hours(72));

    // And the health record went healthy with a synced expiry mirror
    let health = h
        .engine
        .get_or_create_health_status(USER, DRIVE)
        .await
        .unwrap();
    assert_eq!(health.status, ConnectionStatus::Healthy);
    assert_eq!(health.token_expires_at, Some(t0() + hours(72)));
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn missing_credential_is_not_connected_and_uncounted() {
    let h = harness(EngineConfig::default());

    let err = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap_err();
    assert!(matches!(err, EngineError::NotConnected { .. }));

    // Not a failure: no attempts consumed, no failure recorded
    let report = h.engine.get_rate_limit_status(USER, DRIVE);
    assert_eq!(report.token_refresh.attempts, 0);

    let health = h
        .engine
        .get_or_create_health_status(USER, DRIVE)
        .await
        .unwrap();
    assert_eq!(health.status, ConnectionStatus::NotConnected);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn expired_refresh_token_requires_reconnection() {
    let h = harness(EngineConfig::default());
    h.credentials.put(credential(USER, DRIVE, t0() - hours(1)));
    h.provider.push_refresh_failure(ProviderError::with_status(
        "invalid_grant: refresh token has been expired or revoked",
        400,
    ));

    let err = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidRefreshToken));

    let health = h
        .engine
        .get_or_create_health_status(USER, DRIVE)
        .await
        .unwrap();
    assert_eq!(health.status, ConnectionStatus::AuthenticationRequired);
    assert!(health.requires_reconnection);
    assert_eq!(health.consecutive_failures, 1);

    // The messaging subsystem was told exactly once
    assert_eq!(h.sink.reconnection_events(), 1);
}

#[tokio::test]
async fn rate_limiter_caps_refresh_attempts() {
    let mut config = EngineConfig::default();
    config.rate_limits.token_refresh_per_window = 2;
    config.health.max_auto_retries = 100; // keep escalation out of this test
    let h = harness(config);

    h.credentials.put(credential(USER, DRIVE, t0() - hours(1)));
    // Every provider attempt fails transiently, so the token stays expired
    h.provider
        .push_refresh_failure(ProviderError::new("connection reset by peer"));
    h.provider
        .push_refresh_failure(ProviderError::new("connection reset by peer"));

    for _ in 0..2 {
        let err = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NetworkError));
    }

    // Third attempt inside the window: back-pressure, not a provider error
    let err = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap_err();
    match &err {
        EngineError::RateLimited { retry_after, .. } => {
            assert!(*retry_after > Duration::ZERO);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(h.provider.refresh_count(), 2);

    // A denial does not touch the failure counter
    let health = h
        .engine
        .get_or_create_health_status(USER, DRIVE)
        .await
        .unwrap();
    assert_eq!(health.consecutive_failures, 2);

    // After the window rolls over, attempts flow again
    h.clock.advance(Duration::from_secs(3601));
    let outcome = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
}

#[tokio::test]
async fn concurrent_refreshes_dedup_to_one_provider_call() {
    let h = harness(EngineConfig::default());
    h.credentials.put(credential(USER, DRIVE, t0() + hours(2)));
    h.provider.set_refresh_delay(Duration::from_millis(200));

    let engine_a = h.engine.clone();
    let engine_b = h.engine.clone();
    let a = tokio::spawn(async move { engine_a.ensure_valid_token(USER, DRIVE).await });
    let b = tokio::spawn(async move { engine_b.ensure_valid_token(USER, DRIVE).await });

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(h.provider.refresh_count(), 1, "exactly one provider refresh");

    let mut refreshed = 0;
    let mut already = 0;
    for outcome in [&a, &b] {
        match outcome {
            RefreshOutcome::Refreshed(_) => refreshed += 1,
            RefreshOutcome::AlreadyRefreshed(_) => already += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(refreshed, 1);
    assert_eq!(already, 1);

    // Both callers hold the same fresh token
    assert_eq!(a.token().expires_at, b.token().expires_at);
}

#[tokio::test]
async fn provider_timeout_classifies_as_transient() {
    let mut config = EngineConfig::default();
    config.refresh.provider_timeout_secs = 1;
    let h = harness(config);

    h.credentials.put(credential(USER, DRIVE, t0() - hours(1)));
    h.provider.set_refresh_delay(Duration::from_secs(5));

    let err = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ServiceUnavailable));

    let health = h
        .engine
        .get_or_create_health_status(USER, DRIVE)
        .await
        .unwrap();
    // A timeout is transient, never a reconnect condition
    assert!(!health.requires_reconnection);
    assert_eq!(health.status, ConnectionStatus::Degraded);
}

#[tokio::test]
async fn connectivity_probe_caches_and_rate_limits() {
    let mut config = EngineConfig::default();
    config.rate_limits.connectivity_test_per_window = 1;
    let h = harness(config);
    h.credentials.put(credential(USER, DRIVE, t0() + hours(72)));

    let from_cache = h.engine.check_connectivity(USER, DRIVE).await.unwrap();
    assert!(!from_cache);
    assert_eq!(h.provider.probe_count(), 1);

    // Second check is served from cache, no probe, no limiter charge
    let from_cache = h.engine.check_connectivity(USER, DRIVE).await.unwrap();
    assert!(from_cache);
    assert_eq!(h.provider.probe_count(), 1);

    // Past the success TTL but inside the window: the limiter now denies
    h.clock.advance(Duration::from_secs(301));
    let err = h.engine.check_connectivity(USER, DRIVE).await.unwrap_err();
    assert!(matches!(err, EngineError::RateLimited { .. }));
    assert_eq!(h.provider.probe_count(), 1);
}

#[tokio::test]
async fn probe_failures_are_cached_with_the_short_ttl() {
    let h = harness(EngineConfig::default());
    h.credentials.put(credential(USER, DRIVE, t0() + hours(72)));
    h.provider
        .push_probe_failure(ProviderError::with_status("backend error", 503));

    let err = h.engine.check_connectivity(USER, DRIVE).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ServiceUnavailable));
    assert_eq!(h.provider.probe_count(), 1);

    // Within the failure TTL the cached failure answers, no provider call
    let err = h.engine.check_connectivity(USER, DRIVE).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ServiceUnavailable));
    assert_eq!(h.provider.probe_count(), 1);

    // The failure TTL is short; past it the probe runs again and heals
    h.clock.advance(Duration::from_secs(21));
    let from_cache = h.engine.check_connectivity(USER, DRIVE).await.unwrap();
    assert!(!from_cache);
    assert_eq!(h.provider.probe_count(), 2);
}

#[tokio::test]
async fn credential_replacement_clears_sticky_reconnection() {
    let h = harness(EngineConfig::default());
    h.credentials.put(credential(USER, DRIVE, t0() - hours(1)));
    h.provider.push_refresh_failure(ProviderError::with_status(
        "invalid_grant: refresh token has been expired or revoked",
        400,
    ));

    h.engine.ensure_valid_token(USER, DRIVE).await.unwrap_err();

    // The user reconnects; the account subsystem stores a fresh credential
    h.credentials.put(credential(USER, DRIVE, t0() + hours(72)));
    let health = h.engine.credential_replaced(USER, DRIVE).await.unwrap();
    assert_eq!(health.status, ConnectionStatus::Healthy);
    assert!(!health.requires_reconnection);
    assert_eq!(h.sink.recovered_events(), 1);

    // And the next ensure_valid is a quiet no-op
    let outcome = h.engine.ensure_valid_token(USER, DRIVE).await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Valid { .. }));
    assert_eq!(h.provider.refresh_count(), 1);
}
