mod common;

use common::TestApp;
use identity_service::config::WindowStrategy;
use identity_service::error::IdentityError;
use identity_service::models::RateAction;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(60);

async fn five_then_reject(app: &TestApp) {
    for call in 1..=5u32 {
        let decision = app
            .identity
            .check_rate("10.0.0.1", "login", 5, WINDOW)
            .await
            .unwrap_or_else(|e| panic!("call {} rejected: {}", call, e));
        assert_eq!(decision.remaining, 5 - call);
        app.advance(1);
    }

    let sixth = app.identity.check_rate("10.0.0.1", "login", 5, WINDOW).await;
    // First call was 5s ago
    assert!(matches!(
        sixth,
        Err(IdentityError::RateLimitExceeded { retry_after: 55 })
    ));
}

#[tokio::test]
async fn test_sixth_call_rejected_then_window_slides() {
    for strategy in [WindowStrategy::BestEffort, WindowStrategy::Atomic] {
        let app = TestApp::with_strategy(strategy);
        five_then_reject(&app).await;

        // 61s after call 1: calls 1 and 2 have left the window
        app.advance(56);
        for _ in 0..2 {
            assert!(app
                .identity
                .check_rate("10.0.0.1", "login", 5, WINDOW)
                .await
                .is_ok());
        }
        assert!(app
            .identity
            .check_rate("10.0.0.1", "login", 5, WINDOW)
            .await
            .is_err());
    }
}

#[tokio::test]
async fn test_rejected_calls_do_not_extend_the_window() {
    let app = TestApp::new();
    five_then_reject(&app).await;

    for _ in 0..10 {
        let _ = app.identity.check_rate("10.0.0.1", "login", 5, WINDOW).await;
    }

    app.advance(70);
    let decision = app
        .identity
        .check_rate("10.0.0.1", "login", 5, WINDOW)
        .await
        .unwrap();
    assert_eq!(decision.remaining, 4);
}

#[tokio::test]
async fn test_reset_clears_the_window() {
    let app = TestApp::new();
    five_then_reject(&app).await;

    app.identity.reset_rate("10.0.0.1", "login").await.unwrap();
    assert!(app
        .identity
        .check_rate("10.0.0.1", "login", 5, WINDOW)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_named_policy_from_config() {
    let app = TestApp::new();
    for _ in 0..5 {
        app.identity
            .check_policy("shopper@example.com", RateAction::OtpSend)
            .await
            .unwrap();
    }
    assert!(matches!(
        app.identity
            .check_policy("shopper@example.com", RateAction::OtpSend)
            .await,
        Err(IdentityError::RateLimitExceeded { retry_after: 3600 })
    ));
}
