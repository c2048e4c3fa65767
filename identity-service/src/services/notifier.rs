use async_trait::async_trait;
use std::sync::Mutex;

use crate::models::OtpPurpose;

/// Delivery channel for one-time codes (email, SMS, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_code(
        &self,
        destination: &str,
        code: &str,
        purpose: OtpPurpose,
    ) -> Result<(), anyhow::Error>;
}

/// Logs that a code was dispatched without revealing it. For local runs
/// where no delivery provider is wired in.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_code(
        &self,
        destination: &str,
        _code: &str,
        purpose: OtpPurpose,
    ) -> Result<(), anyhow::Error> {
        tracing::info!(
            destination = %mask_destination(destination),
            purpose = purpose.as_str(),
            "OTP dispatched (log notifier)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCode {
    pub destination: String,
    pub code: String,
    pub purpose: OtpPurpose,
}

/// Captures every dispatched code; can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentCode>>,
    fail: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    pub fn sent(&self) -> Vec<SentCode> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Most recent code sent to `destination`.
    pub fn last_code(&self, destination: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|s| s.destination == destination)
            .map(|s| s.code.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_code(
        &self,
        destination: &str,
        code: &str,
        purpose: OtpPurpose,
    ) -> Result<(), anyhow::Error> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentCode {
                destination: destination.to_string(),
                code: code.to_string(),
                purpose,
            });

        if *self.fail.lock().unwrap_or_else(|e| e.into_inner()) {
            anyhow::bail!("notifier unavailable");
        }
        Ok(())
    }
}

/// `jane@example.com` -> `j***@example.com`, `+15550001234` -> `***1234`.
pub(crate) fn mask_destination(destination: &str) -> String {
    match destination.split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{}***@{}", first, domain)
        }
        None => {
            let chars: Vec<char> = destination.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
            format!("***{}", tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_destination() {
        assert_eq!(mask_destination("jane@example.com"), "j***@example.com");
        assert_eq!(mask_destination("+15550001234"), "***1234");
        assert_eq!(mask_destination("12"), "***12");
    }

    #[tokio::test]
    async fn test_recording_notifier_records_even_when_failing() {
        let notifier = RecordingNotifier::new();
        notifier.set_failing(true);

        let result = notifier.send_code("a@b.c", "123456", OtpPurpose::Login).await;
        assert!(result.is_err());
        assert_eq!(notifier.last_code("a@b.c").as_deref(), Some("123456"));
    }
}
