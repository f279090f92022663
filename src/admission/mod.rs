//! Distributed admission control.
//!
//! A [`TokenDripper`] emits tokens for each [`RateKey`] onto an
//! [`AdmissionChannel`] at a fixed rate. Callers gate rate-limited work on an
//! [`AdmissionController`], which claims one token per admitted operation.

pub mod channel;
pub mod controller;
pub mod dripper;
#[cfg(feature = "database")]
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::IntakeError;

pub use channel::{AdmissionChannel, InMemoryAdmissionChannel, TokenId};
pub use controller::{build_admission, AdmissionController, ChannelAdmission, NullAdmission};
pub use dripper::{DripSchedule, TokenDripper};

/// Named rate-limited resource classes. Each key has its own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RateKey {
    #[serde(rename = "docx:status")]
    StatusPolling,
    #[serde(rename = "docx:search_download")]
    SearchDownload,
    #[serde(rename = "tasktracker:writes")]
    TrackerWrites,
}

impl RateKey {
    pub const ALL: [RateKey; 3] = [
        RateKey::StatusPolling,
        RateKey::SearchDownload,
        RateKey::TrackerWrites,
    ];

    /// Channel name shared by every process that drips or admits on this key.
    pub fn channel_name(&self) -> &'static str {
        match self {
            RateKey::StatusPolling => "docx:status",
            RateKey::SearchDownload => "docx:search_download",
            RateKey::TrackerWrites => "tasktracker:writes",
        }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel_name())
    }
}

impl FromStr for RateKey {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RateKey::ALL
            .into_iter()
            .find(|key| key.channel_name() == s.trim())
            .ok_or_else(|| IntakeError::Config(format!("unknown rate key '{}'", s.trim())))
    }
}

/// A target rate such as `10/sec` or `10/min`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSpec {
    pub tokens: f64,
    pub per: Duration,
}

impl RateSpec {
    /// Seconds between consecutive tokens.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.per.as_secs_f64() / self.tokens)
    }
}

impl FromStr for RateSpec {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| IntakeError::Config(format!("rate '{s}' must look like N/sec or N/min")))?;

        let tokens: f64 = count
            .trim()
            .parse()
            .map_err(|_| IntakeError::Config(format!("rate count '{count}' is not a number")))?;
        if !tokens.is_finite() || tokens <= 0.0 {
            return Err(IntakeError::Config(format!(
                "rate count must be positive, got '{count}'"
            )));
        }

        let per = match unit.trim() {
            "s" | "sec" | "second" => Duration::from_secs(1),
            "m" | "min" | "minute" => Duration::from_secs(60),
            other => {
                return Err(IntakeError::Config(format!(
                    "rate unit must be sec or min, got '{other}'"
                )))
            }
        };

        Ok(RateSpec { tokens, per })
    }
}

/// Parses `key=N/unit,key=N/unit` into a per-key token interval.
pub fn parse_rates(spec: &str) -> Result<Vec<(RateKey, Duration)>, IntakeError> {
    let mut out: Vec<(RateKey, Duration)> = Vec::new();
    for part in spec.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, rate) = part
            .split_once('=')
            .ok_or_else(|| IntakeError::Config(format!("rate entry '{part}' must be key=rate")))?;
        let key: RateKey = key.parse()?;
        let rate: RateSpec = rate.parse()?;
        if out.iter().any(|(existing, _)| *existing == key) {
            return Err(IntakeError::Config(format!("rate key '{key}' listed twice")));
        }
        out.push((key, rate.interval()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_default_rates() {
        let rates =
            parse_rates("docx:status=10/sec,docx:search_download=10/min,tasktracker:writes=10/sec")
                .unwrap();
        assert_eq!(rates.len(), 3);
        assert_eq!(rates[0], (RateKey::StatusPolling, Duration::from_millis(100)));
        assert_eq!(rates[1], (RateKey::SearchDownload, Duration::from_secs(6)));
        assert_eq!(rates[2], (RateKey::TrackerWrites, Duration::from_millis(100)));
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(parse_rates("docx:status=10/hour").is_err());
        assert!(parse_rates("docx:unknown=1/sec").is_err());
        assert!(parse_rates("docx:status=0/sec").is_err());
        assert!(parse_rates("docx:status").is_err());
        assert!(parse_rates("docx:status=1/sec,docx:status=2/sec").is_err());
    }

    #[test]
    fn test_rate_key_round_trips_through_name() {
        for key in RateKey::ALL {
            assert_eq!(key.channel_name().parse::<RateKey>().unwrap(), key);
        }
    }

    proptest! {
        #[test]
        fn prop_interval_matches_rate(tokens in 1u32..1000, per_minute in any::<bool>()) {
            let unit = if per_minute { "min" } else { "sec" };
            let spec: RateSpec = format!("{tokens}/{unit}").parse().unwrap();
            let per_secs = if per_minute { 60.0 } else { 1.0 };
            let expected = per_secs / tokens as f64;
            prop_assert!((spec.interval().as_secs_f64() - expected).abs() < 1e-8);
        }
    }
}
