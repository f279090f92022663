use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::channel::{AdmissionChannel, TokenId};
use super::RateKey;
use crate::config::LimiterMode;
use crate::errors::IntakeError;
use crate::observability::intake_metrics;

/// Gate placed in front of every rate-limited outbound call.
#[async_trait]
pub trait AdmissionController: Send + Sync {
    /// Block until a token for `key` is claimed or `timeout` elapses.
    /// A zero timeout still performs one immediate check.
    async fn admit_or_wait(&self, key: RateKey, timeout: Duration) -> Result<(), IntakeError>;
}

/// Admits everything immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAdmission;

#[async_trait]
impl AdmissionController for NullAdmission {
    async fn admit_or_wait(&self, _key: RateKey, _timeout: Duration) -> Result<(), IntakeError> {
        Ok(())
    }
}

/// Claims tokens dripped onto a shared [`AdmissionChannel`]. Keeps its own
/// read position per key; the channel guarantees a token is never handed to
/// two callers.
pub struct ChannelAdmission {
    channel: Arc<dyn AdmissionChannel>,
    positions: Mutex<HashMap<RateKey, TokenId>>,
    release_jitter: Duration,
}

impl ChannelAdmission {
    pub fn new(channel: Arc<dyn AdmissionChannel>, release_jitter: Duration) -> Self {
        Self {
            channel,
            positions: Mutex::new(HashMap::new()),
            release_jitter,
        }
    }

    fn position(&self, key: RateKey) -> Result<TokenId, IntakeError> {
        let positions = self
            .positions
            .lock()
            .map_err(|_| IntakeError::Channel("reader position lock poisoned".to_string()))?;
        Ok(positions.get(&key).copied().unwrap_or_default())
    }

    fn advance(&self, key: RateKey, claimed: TokenId) -> Result<(), IntakeError> {
        let mut positions = self
            .positions
            .lock()
            .map_err(|_| IntakeError::Channel("reader position lock poisoned".to_string()))?;
        let position = positions.entry(key).or_default();
        if claimed > *position {
            *position = claimed;
        }
        Ok(())
    }
}

#[async_trait]
impl AdmissionController for ChannelAdmission {
    async fn admit_or_wait(&self, key: RateKey, timeout: Duration) -> Result<(), IntakeError> {
        let after = self.position(key)?;

        let Some(token) = self.channel.claim_next(key, after, timeout).await? else {
            intake_metrics().record_admission_timeout();
            warn!(key = %key, timeout_ms = timeout.as_millis() as u64, "Admission timed out");
            return Err(IntakeError::AdmissionTimeout {
                key,
                waited: timeout,
            });
        };

        self.advance(key, token)?;
        intake_metrics().record_admission();
        debug!(key = %key, token = token.0, "Admitted");

        if !self.release_jitter.is_zero() {
            let max_ms = self.release_jitter.as_millis() as u64;
            let delay = Duration::from_millis(rand::rng().random_range(0..=max_ms));
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// Select the admission strategy once, at construction.
pub fn build_admission(
    mode: LimiterMode,
    channel: Option<Arc<dyn AdmissionChannel>>,
    release_jitter: Duration,
) -> Result<Arc<dyn AdmissionController>, IntakeError> {
    match mode {
        LimiterMode::None => Ok(Arc::new(NullAdmission)),
        LimiterMode::Dripper => {
            let channel = channel.ok_or_else(|| {
                IntakeError::Config("dripper limiter mode needs an admission channel".to_string())
            })?;
            Ok(Arc::new(ChannelAdmission::new(channel, release_jitter)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::InMemoryAdmissionChannel;
    use tokio::time::Instant;

    fn channel() -> Arc<InMemoryAdmissionChannel> {
        Arc::new(InMemoryAdmissionChannel::new(4))
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_admission_never_blocks() {
        let gate = NullAdmission;
        let start = Instant::now();
        gate.admit_or_wait(RateKey::SearchDownload, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_with_token_available() {
        let channel = channel();
        channel.append(RateKey::StatusPolling).await.unwrap();
        let gate = ChannelAdmission::new(channel.clone(), Duration::ZERO);

        let start = Instant::now();
        gate.admit_or_wait(RateKey::StatusPolling, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(Instant::now(), start);
        assert_eq!(channel.available(RateKey::StatusPolling).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_without_token_fails_fast() {
        let gate = ChannelAdmission::new(channel(), Duration::ZERO);
        let start = Instant::now();
        let err = gate
            .admit_or_wait(RateKey::StatusPolling, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::AdmissionTimeout { key: RateKey::StatusPolling, .. }));
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_dripped_token() {
        let channel = channel();
        let gate = Arc::new(ChannelAdmission::new(channel.clone(), Duration::from_millis(20)));

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.admit_or_wait(RateKey::TrackerWrites, Duration::from_secs(3))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        channel.append(RateKey::TrackerWrites).await.unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_callers_one_token() {
        let channel = channel();
        let a = Arc::new(ChannelAdmission::new(channel.clone(), Duration::ZERO));
        let b = Arc::new(ChannelAdmission::new(channel.clone(), Duration::ZERO));

        let first = {
            let a = a.clone();
            tokio::spawn(async move { a.admit_or_wait(RateKey::SearchDownload, Duration::from_secs(1)).await })
        };
        let second = {
            let b = b.clone();
            tokio::spawn(async move { b.admit_or_wait(RateKey::SearchDownload, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.append(RateKey::SearchDownload).await.unwrap();

        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(IntakeError::AdmissionTimeout { .. }))));
    }

    #[test]
    fn test_dripper_mode_requires_channel() {
        let result = build_admission(LimiterMode::Dripper, None, Duration::ZERO);
        assert!(matches!(result, Err(IntakeError::Config(_))));
        assert!(build_admission(LimiterMode::None, None, Duration::ZERO).is_ok());
    }
}
