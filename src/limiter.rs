use crate::{
    models::{Error, RateLevel, RateLimit, RateWindow},
    store::{Kv, RATE_LIMITS},
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Limits per level. An unset level is never checked; within a set level a
/// zero horizon is unlimited. Recipient-domain limits are per destination
/// domain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub global: Option<RateLimit>,
    #[serde(default)]
    pub domain: Option<RateLimit>,
    #[serde(default)]
    pub sender: Option<RateLimit>,
    #[serde(default)]
    pub ip: Option<RateLimit>,
    #[serde(default)]
    pub api_key: Option<RateLimit>,
    #[serde(default)]
    pub recipient_domains: HashMap<String, RateLimit>,
}

/// One message's worth of keys to count. Unset fields skip their level.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateRequest<'a> {
    pub domain: Option<&'a str>,
    pub sender: Option<&'a str>,
    pub ip: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub recipient_domains: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub denied_by: Option<RateLevel>,
    pub denied_key: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            denied_by: None,
            denied_key: None,
            retry_after: None,
        }
    }

    fn deny(level: RateLevel, key: &str, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            denied_by: Some(level),
            denied_key: Some(key.to_string()),
            retry_after: Some(retry_after),
        }
    }
}

/// Multi-level counter with durable state. Decisions run under one mutex;
/// counters live in memory and are flushed to the `rate_limits` bucket
/// periodically and on stop. Expired windows are reset lazily on touch.
pub struct RateLimiter {
    config: LimiterConfig,
    counters: Mutex<HashMap<(RateLevel, String), RateWindow>>,
    kv: Arc<Kv>,
}

impl RateLimiter {
    pub fn new(kv: Arc<Kv>, config: LimiterConfig) -> Result<Self, Error> {
        let mut counters = HashMap::new();
        for entry in kv.iter(RATE_LIMITS)? {
            let (key, raw) = entry?;
            let key = String::from_utf8_lossy(&key);
            let Some((level, counter_key)) = key.split_once(':') else {
                continue;
            };
            let Some(level) = RateLevel::parse(level) else {
                debug!(key = %key, "skipping unknown rate counter level");
                continue;
            };
            let window: RateWindow = serde_json::from_slice(&raw)?;
            counters.insert((level, counter_key.to_string()), window);
        }
        if !counters.is_empty() {
            info!(counters = counters.len(), "restored rate counters");
        }

        Ok(Self {
            config,
            counters: Mutex::new(counters),
            kv,
        })
    }

    /// The ordered list of checks that apply to this request.
    fn checks(&self, request: &RateRequest) -> Vec<(RateLevel, String, RateLimit)> {
        let mut checks = Vec::new();
        if let Some(limit) = self.config.global {
            checks.push((RateLevel::Global, "global".to_string(), limit));
        }
        for (level, key, limit) in [
            (RateLevel::Domain, request.domain, self.config.domain),
            (RateLevel::Sender, request.sender, self.config.sender),
            (RateLevel::Ip, request.ip, self.config.ip),
            (RateLevel::ApiKey, request.api_key, self.config.api_key),
        ] {
            if let (Some(key), Some(limit)) = (key, limit)
                && !key.is_empty()
            {
                checks.push((level, key.to_ascii_lowercase(), limit));
            }
        }
        let mut seen = Vec::new();
        for domain in request.recipient_domains {
            let domain = domain.to_ascii_lowercase();
            if seen.contains(&domain) {
                continue;
            }
            if let Some(limit) = self.config.recipient_domains.get(&domain) {
                checks.push((RateLevel::RecipientDomain, domain.clone(), *limit));
            }
            seen.push(domain);
        }
        checks
    }

    fn evaluate(&self, request: &RateRequest, increment: bool) -> RateDecision {
        let now = Utc::now();
        let checks = self.checks(request);
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);

        for (level, key, limit) in &checks {
            let window = counters
                .entry((*level, key.clone()))
                .or_insert_with(|| RateWindow::fresh(now));
            window.roll(now);

            if limit.per_hour > 0 && window.hourly_count >= limit.per_hour {
                let window_end = window.hour_start + Duration::hours(1);
                return RateDecision::deny(*level, key, window_end - now);
            }
            if limit.per_day > 0 && window.daily_count >= limit.per_day {
                let window_end = window.day_start + Duration::days(1);
                return RateDecision::deny(*level, key, window_end - now);
            }
        }

        if increment {
            for (level, key, _) in &checks {
                if let Some(window) = counters.get_mut(&(*level, key.clone())) {
                    window.hourly_count += 1;
                    window.daily_count += 1;
                }
            }
        }

        RateDecision::allow()
    }

    /// Decide and, when every applicable check passes, count the send.
    /// A denial increments nothing.
    pub fn allow(&self, request: &RateRequest) -> RateDecision {
        self.evaluate(request, true)
    }

    /// Read-only variant of [`RateLimiter::allow`].
    pub fn check(&self, request: &RateRequest) -> RateDecision {
        self.evaluate(request, false)
    }

    /// Current counter values with the window reset applied.
    pub fn get_stats(&self, level: RateLevel, key: &str) -> Option<RateWindow> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut window = counters.get(&(level, key.to_ascii_lowercase()))?.clone();
        window.roll(Utc::now());
        Some(window)
    }

    /// Persist a snapshot of every counter.
    pub fn flush(&self) -> Result<(), Error> {
        let snapshot: Vec<((RateLevel, String), RateWindow)> = {
            let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            counters
                .iter()
                .map(|(key, window)| (key.clone(), window.clone()))
                .collect()
        };

        self.kv.update(|txn| {
            for ((level, key), window) in &snapshot {
                txn.put(
                    RATE_LIMITS,
                    format!("{level}:{key}"),
                    serde_json::to_vec(window)?,
                )?;
            }
            Ok(())
        })
    }

    /// Flush every `interval` until cancelled, then flush one last time.
    pub fn spawn_flush(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = shutdown.cancelled() => {
                        info!("persisting rate counters before shutdown");
                        if let Err(e) = limiter.flush() {
                            error!("final rate counter flush failed: {e}");
                        }
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = limiter.flush() {
                            error!("rate counter flush failed: {e}");
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn force_window(&self, level: RateLevel, key: &str, window: RateWindow) {
        self.counters
            .lock()
            .unwrap()
            .insert((level, key.to_string()), window);
    }
}
