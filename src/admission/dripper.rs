use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::channel::AdmissionChannel;
use super::RateKey;
use crate::errors::IntakeError;
use crate::shutdown::ShutdownSignal;

/// Upper bound on emission jitter, as a fraction of a key's interval.
pub const MAX_JITTER_FRACTION: f64 = 0.05;

/// Per-key emission schedule. Owned exclusively by one [`TokenDripper`].
#[derive(Debug, Clone)]
pub struct DripSchedule {
    key: RateKey,
    interval: Duration,
    next_eligible: Instant,
}

impl DripSchedule {
    pub fn new(key: RateKey, interval: Duration, start: Instant) -> Self {
        Self {
            key,
            interval,
            next_eligible: start,
        }
    }

    pub fn key(&self) -> RateKey {
        self.key
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_eligible(&self) -> Instant {
        self.next_eligible
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_eligible
    }

    /// Next slot is measured from `now`, not from the missed slot, so a key
    /// that fell behind never bursts to catch up.
    fn reschedule(&mut self, now: Instant, jitter_fraction: f64) {
        let jitter = if jitter_fraction > 0.0 {
            self.interval
                .mul_f64(rand::rng().random_range(0.0..=jitter_fraction))
        } else {
            Duration::ZERO
        };
        let next = now + self.interval + jitter;
        if next > self.next_eligible {
            self.next_eligible = next;
        }
    }
}

/// Emits one token per eligible key per tick onto the shared channel.
pub struct TokenDripper {
    channel: Arc<dyn AdmissionChannel>,
    schedules: Vec<DripSchedule>,
    tick: Duration,
    jitter_fraction: f64,
}

impl TokenDripper {
    pub fn new(
        channel: Arc<dyn AdmissionChannel>,
        rates: Vec<(RateKey, Duration)>,
        tick: Duration,
        jitter_fraction: f64,
    ) -> Result<Self, IntakeError> {
        if tick.is_zero() {
            return Err(IntakeError::Config("dripper tick must be positive".to_string()));
        }
        if !(0.0..=MAX_JITTER_FRACTION).contains(&jitter_fraction) {
            return Err(IntakeError::Config(format!(
                "dripper jitter fraction must be within [0, {MAX_JITTER_FRACTION}], got {jitter_fraction}"
            )));
        }
        if let Some((key, _)) = rates.iter().find(|(_, interval)| interval.is_zero()) {
            return Err(IntakeError::Config(format!("rate for '{key}' has a zero interval")));
        }

        let start = Instant::now();
        let schedules = rates
            .into_iter()
            .map(|(key, interval)| DripSchedule::new(key, interval, start))
            .collect();

        Ok(Self {
            channel,
            schedules,
            tick,
            jitter_fraction,
        })
    }

    pub fn schedules(&self) -> &[DripSchedule] {
        &self.schedules
    }

    /// One pass over every key. Returns the keys that emitted a token.
    pub async fn tick(&mut self, now: Instant) -> Vec<RateKey> {
        let mut emitted = Vec::new();
        for schedule in self.schedules.iter_mut() {
            if !schedule.is_due(now) {
                continue;
            }
            match self.channel.append(schedule.key).await {
                Ok(token) => {
                    schedule.reschedule(now, self.jitter_fraction);
                    debug!(key = %schedule.key, token = token.0, "Dripped token");
                    emitted.push(schedule.key);
                }
                Err(e) => {
                    // Left due; retried on the next tick.
                    warn!(key = %schedule.key, error = %e, "Failed to append token");
                }
            }
        }
        emitted
    }

    /// Drip until shutdown is requested.
    pub async fn run(mut self, shutdown: ShutdownSignal) -> Result<(), IntakeError> {
        info!(
            keys = ?self
                .schedules
                .iter()
                .map(|s| (s.key.channel_name(), s.interval.as_secs_f64()))
                .collect::<Vec<_>>(),
            tick_ms = self.tick.as_millis() as u64,
            "Token dripper started"
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                }
                _ = shutdown.triggered() => break,
            }
        }

        info!("Token dripper stopped");
        Ok(())
    }
}
