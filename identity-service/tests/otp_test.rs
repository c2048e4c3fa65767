mod common;

use common::TestApp;
use identity_service::error::IdentityError;
use identity_service::models::OtpPurpose;

const EMAIL: &str = "shopper@example.com";

fn wrong_code(right: &str) -> String {
    if right == "000000" {
        "111111".to_string()
    } else {
        "000000".to_string()
    }
}

#[tokio::test]
async fn test_code_verifies_exactly_once() {
    let app = TestApp::new();
    app.identity
        .generate_otp(EMAIL, OtpPurpose::EmailVerification)
        .await
        .unwrap();
    let code = app.last_code(EMAIL);

    app.identity
        .verify_otp(EMAIL, &code, OtpPurpose::EmailVerification)
        .await
        .unwrap();

    assert!(matches!(
        app.identity
            .verify_otp(EMAIL, &code, OtpPurpose::EmailVerification)
            .await,
        Err(IdentityError::OtpExpired)
    ));
}

#[tokio::test]
async fn test_three_wrong_guesses_lock_the_code() {
    let app = TestApp::new();
    app.identity
        .generate_otp(EMAIL, OtpPurpose::PasswordReset)
        .await
        .unwrap();
    let code = app.last_code(EMAIL);
    let wrong = wrong_code(&code);

    let first = app
        .identity
        .verify_otp(EMAIL, &wrong, OtpPurpose::PasswordReset)
        .await;
    assert!(matches!(first, Err(IdentityError::OtpInvalid { remaining: 2 })));

    let second = app
        .identity
        .verify_otp(EMAIL, &wrong, OtpPurpose::PasswordReset)
        .await;
    assert!(matches!(second, Err(IdentityError::OtpInvalid { remaining: 1 })));

    let third = app
        .identity
        .verify_otp(EMAIL, &wrong, OtpPurpose::PasswordReset)
        .await;
    assert!(matches!(third, Err(IdentityError::OtpLocked { .. })));

    // Even the right code is gone now
    let fourth = app
        .identity
        .verify_otp(EMAIL, &code, OtpPurpose::PasswordReset)
        .await;
    assert!(matches!(fourth, Err(IdentityError::OtpExpired)));
}

#[tokio::test]
async fn test_fresh_generate_replaces_locked_record() {
    let app = TestApp::new();
    app.identity.generate_otp(EMAIL, OtpPurpose::Login).await.unwrap();
    let wrong = wrong_code(&app.last_code(EMAIL));
    for _ in 0..3 {
        let _ = app.identity.verify_otp(EMAIL, &wrong, OtpPurpose::Login).await;
    }

    app.advance(61);
    app.identity.generate_otp(EMAIL, OtpPurpose::Login).await.unwrap();
    let code = app.last_code(EMAIL);
    app.identity
        .verify_otp(EMAIL, &code, OtpPurpose::Login)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_resend_cooldown_reports_retry_after() {
    let app = TestApp::new();
    app.identity.generate_otp(EMAIL, OtpPurpose::Login).await.unwrap();
    app.advance(20);

    let err = app
        .identity
        .generate_otp(EMAIL, OtpPurpose::Login)
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::OtpCooldown { retry_after: 40 }));

    // Cooldown is per purpose
    assert!(app
        .identity
        .generate_otp(EMAIL, OtpPurpose::EmailVerification)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_code_expires_after_ttl() {
    let app = TestApp::new();
    let expires_at = app
        .identity
        .generate_otp(EMAIL, OtpPurpose::SensitiveAction)
        .await
        .unwrap();
    let code = app.last_code(EMAIL);

    assert_eq!((expires_at - app.now()).num_seconds(), 600);
    app.advance(600);

    assert!(matches!(
        app.identity
            .verify_otp(EMAIL, &code, OtpPurpose::SensitiveAction)
            .await,
        Err(IdentityError::OtpExpired)
    ));
}

#[tokio::test]
async fn test_failed_dispatch_does_not_fail_generate() {
    let app = TestApp::new();
    app.notifier.set_failing(true);

    assert!(app.identity.generate_otp(EMAIL, OtpPurpose::Login).await.is_ok());
    let code = app.last_code(EMAIL);
    app.identity
        .verify_otp(EMAIL, &code, OtpPurpose::Login)
        .await
        .unwrap();
}
