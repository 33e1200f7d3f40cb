use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The keys a send can be counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLevel {
    Global,
    Domain,
    Sender,
    Ip,
    ApiKey,
    RecipientDomain,
}

impl RateLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLevel::Global => "global",
            RateLevel::Domain => "domain",
            RateLevel::Sender => "sender",
            RateLevel::Ip => "ip",
            RateLevel::ApiKey => "api_key",
            RateLevel::RecipientDomain => "recipient_domain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "global" => RateLevel::Global,
            "domain" => RateLevel::Domain,
            "sender" => RateLevel::Sender,
            "ip" => RateLevel::Ip,
            "api_key" => RateLevel::ApiKey,
            "recipient_domain" => RateLevel::RecipientDomain,
            _ => return None,
        })
    }
}

impl fmt::Display for RateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits for one level. Zero means no limit at that horizon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub per_hour: u64,
    #[serde(default)]
    pub per_day: u64,
}

/// A persisted hourly/daily counter pair. Stale windows are not cleared
/// eagerly; `roll` applies the reset whenever the counter is touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub hourly_count: u64,
    pub daily_count: u64,
    pub hour_start: DateTime<Utc>,
    pub day_start: DateTime<Utc>,
}

impl RateWindow {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            hourly_count: 0,
            daily_count: 0,
            hour_start: now,
            day_start: now,
        }
    }

    pub fn roll(&mut self, now: DateTime<Utc>) {
        if now - self.hour_start >= Duration::hours(1) {
            self.hourly_count = 0;
            self.hour_start = now;
        }
        if now - self.day_start >= Duration::days(1) {
            self.daily_count = 0;
            self.day_start = now;
        }
    }
}
