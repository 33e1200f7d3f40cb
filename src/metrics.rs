use crate::models::RateLevel;

/// Delivery counters, injected into the processor so tests (and whatever
/// metrics backend a deployment wires up) can observe outcomes without a
/// process-wide registry.
pub trait Collector: Send + Sync {
    fn inc_sent(&self, domain: &str);
    fn inc_failed(&self, domain: &str, category: &'static str);
    fn inc_bounced(&self, domain: &str);
    fn inc_deferred(&self, domain: &str);
    fn inc_rate_limited(&self, level: RateLevel);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl Collector for NoopCollector {
    fn inc_sent(&self, _domain: &str) {}
    fn inc_failed(&self, _domain: &str, _category: &'static str) {}
    fn inc_bounced(&self, _domain: &str) {}
    fn inc_deferred(&self, _domain: &str) {}
    fn inc_rate_limited(&self, _level: RateLevel) {}
}

#[cfg(test)]
pub use capture::CapturingCollector;
