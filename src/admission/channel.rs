use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::RateKey;
use crate::errors::IntakeError;

/// Position of a token in a key's log. Ids grow strictly per key; `TokenId(0)`
/// sits before the first token ever appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TokenId(pub u64);

/// Append-only, multi-reader token log per [`RateKey`] with competing-consumer
/// claims: a token is handed to at most one caller.
#[async_trait]
pub trait AdmissionChannel: Send + Sync {
    /// Append one token to `key`'s log.
    async fn append(&self, key: RateKey) -> Result<TokenId, IntakeError>;

    /// Claim the oldest unconsumed token with an id greater than `after`,
    /// blocking up to `wait` for one to arrive. A zero `wait` is a single
    /// non-blocking check. `Ok(None)` means the deadline passed and nothing
    /// was consumed.
    async fn claim_next(
        &self,
        key: RateKey,
        after: TokenId,
        wait: Duration,
    ) -> Result<Option<TokenId>, IntakeError>;

    /// Number of retained, still-unconsumed tokens for `key`.
    async fn available(&self, key: RateKey) -> Result<usize, IntakeError>;
}

#[derive(Debug)]
struct Entry {
    id: TokenId,
    consumed: bool,
}

#[derive(Debug)]
struct Waiter {
    after: TokenId,
    tx: oneshot::Sender<TokenId>,
}

#[derive(Debug, Default)]
struct KeyLog {
    last_id: u64,
    entries: VecDeque<Entry>,
    waiters: VecDeque<Waiter>,
}

/// Process-local channel. Newly appended tokens go straight to the
/// longest-waiting eligible waiter, so steady supply cannot starve anyone.
#[derive(Debug)]
pub struct InMemoryAdmissionChannel {
    retained: usize,
    logs: Mutex<HashMap<RateKey, KeyLog>>,
}

impl InMemoryAdmissionChannel {
    /// `retained` caps how many newest entries each key keeps; older ones are
    /// trimmed whether consumed or not.
    pub fn new(retained: usize) -> Self {
        Self {
            retained: retained.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn logs(&self) -> Result<MutexGuard<'_, HashMap<RateKey, KeyLog>>, IntakeError> {
        self.logs
            .lock()
            .map_err(|_| IntakeError::Channel("token log lock poisoned".to_string()))
    }
}

impl Default for InMemoryAdmissionChannel {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl AdmissionChannel for InMemoryAdmissionChannel {
    async fn append(&self, key: RateKey) -> Result<TokenId, IntakeError> {
        let mut logs = self.logs()?;
        let log = logs.entry(key).or_default();
        log.last_id += 1;
        let id = TokenId(log.last_id);

        let mut consumed = false;
        while let Some(pos) = log.waiters.iter().position(|w| w.after < id) {
            let Some(waiter) = log.waiters.remove(pos) else {
                break;
            };
            // A send only fails when the waiter already gave up.
            if waiter.tx.send(id).is_ok() {
                consumed = true;
                break;
            }
        }
        log.waiters.retain(|w| !w.tx.is_closed());

        log.entries.push_back(Entry { id, consumed });
        while log.entries.len() > self.retained {
            log.entries.pop_front();
        }

        trace!(key = %key, token = id.0, handed_off = consumed, "Token appended");
        Ok(id)
    }

    async fn claim_next(
        &self,
        key: RateKey,
        after: TokenId,
        wait: Duration,
    ) -> Result<Option<TokenId>, IntakeError> {
        let mut rx = {
            let mut logs = self.logs()?;
            let log = logs.entry(key).or_default();

            if let Some(entry) = log
                .entries
                .iter_mut()
                .find(|entry| !entry.consumed && entry.id > after)
            {
                entry.consumed = true;
                return Ok(Some(entry.id));
            }

            if wait.is_zero() {
                return Ok(None);
            }

            let (tx, rx) = oneshot::channel();
            log.waiters.push_back(Waiter { after, tx });
            rx
        };

        match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(id)) => Ok(Some(id)),
            Ok(Err(_)) => Err(IntakeError::Channel(format!(
                "token log for '{key}' dropped a waiter"
            ))),
            Err(_) => {
                rx.close();
                // A hand-off that raced the deadline still belongs to us.
                match rx.try_recv() {
                    Ok(id) => Ok(Some(id)),
                    Err(_) => {
                        debug!(key = %key, waited_ms = wait.as_millis() as u64, "No token before deadline");
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn available(&self, key: RateKey) -> Result<usize, IntakeError> {
        let logs = self.logs()?;
        Ok(logs
            .get(&key)
            .map(|log| log.entries.iter().filter(|e| !e.consumed).count())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_zero_wait_is_single_check() {
        let channel = InMemoryAdmissionChannel::default();
        let none = channel
            .claim_next(RateKey::StatusPolling, TokenId(0), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(none, None);

        let id = channel.append(RateKey::StatusPolling).await.unwrap();
        let claimed = channel
            .claim_next(RateKey::StatusPolling, TokenId(0), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(claimed, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_claimed_once() {
        let channel = InMemoryAdmissionChannel::new(4);
        channel.append(RateKey::TrackerWrites).await.unwrap();

        let first = channel
            .claim_next(RateKey::TrackerWrites, TokenId(0), Duration::ZERO)
            .await
            .unwrap();
        let second = channel
            .claim_next(RateKey::TrackerWrites, TokenId(0), Duration::ZERO)
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(second, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_get_distinct_tokens() {
        let channel = Arc::new(InMemoryAdmissionChannel::new(4));

        let a = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .claim_next(RateKey::SearchDownload, TokenId(0), Duration::from_secs(5))
                    .await
            })
        };
        let b = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .claim_next(RateKey::SearchDownload, TokenId(0), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.append(RateKey::SearchDownload).await.unwrap();
        channel.append(RateKey::SearchDownload).await.unwrap();

        let a = a.await.unwrap().unwrap().unwrap();
        let b = b.await.unwrap().unwrap().unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let channel = Arc::new(InMemoryAdmissionChannel::default());

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .claim_next(RateKey::StatusPolling, TokenId(0), Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .claim_next(RateKey::StatusPolling, TokenId(0), Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let id = channel.append(RateKey::StatusPolling).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Some(id));
        assert_eq!(second.await.unwrap().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_consumes_nothing() {
        let channel = InMemoryAdmissionChannel::default();
        let result = channel
            .claim_next(RateKey::StatusPolling, TokenId(0), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(result, None);

        channel.append(RateKey::StatusPolling).await.unwrap();
        assert_eq!(channel.available(RateKey::StatusPolling).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_bounds_banked_tokens() {
        let channel = InMemoryAdmissionChannel::new(2);
        for _ in 0..5 {
            channel.append(RateKey::TrackerWrites).await.unwrap();
        }
        assert_eq!(channel.available(RateKey::TrackerWrites).await.unwrap(), 2);

        let first = channel
            .claim_next(RateKey::TrackerWrites, TokenId(0), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first, Some(TokenId(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_respect_reader_position() {
        let channel = InMemoryAdmissionChannel::new(3);
        channel.append(RateKey::SearchDownload).await.unwrap();
        channel.append(RateKey::SearchDownload).await.unwrap();

        let claimed = channel
            .claim_next(RateKey::SearchDownload, TokenId(1), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(claimed, Some(TokenId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let channel = InMemoryAdmissionChannel::default();
        channel.append(RateKey::StatusPolling).await.unwrap();
        let other = channel
            .claim_next(RateKey::TrackerWrites, TokenId(0), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(other, None);
    }
}
