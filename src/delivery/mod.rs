//! The delivery pipeline: worker pool, retry scheduling, bounce generation
//! and dead-letter handling, plus the collaborators it drives (MX
//! resolution, the SMTP client and the domain-mode interposer).

pub mod dns;
#[cfg(test)]
pub mod mock;
pub mod router;
pub mod sender;

pub use dns::{MxHost, MxResolver, ResolveError};
pub use router::{DeliveryRouter, SimulationConfig};
pub use sender::{
    MessageSender, SendError, SenderConfig, SmtpSender, categorize, is_permanent_error,
};

use crate::{
    limiter::{RateLimiter, RateRequest},
    metrics::Collector,
    models::{DeadLetter, Message, MessageQueue, MessageStatus, RateLevel},
    system_emails::build_bounce,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{select, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay; doubles with every attempt up to an hour.
    pub interval: Duration,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub workers: usize,
    pub tick: Duration,
    pub retry: RetryConfig,
    /// Hard deadline for a single delivery attempt.
    pub attempt_timeout: Duration,
    /// Reported as Reporting-MTA in generated bounces.
    pub hostname: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            tick: Duration::from_secs(10),
            retry: RetryConfig::default(),
            attempt_timeout: Duration::from_secs(120),
            hostname: "localhost".to_string(),
        }
    }
}

/// Delay before attempt `retry_count + 1`: the retry interval doubled per
/// failed attempt, exponent capped at 12 doublings, the whole thing capped
/// at one hour.
pub fn backoff(interval: Duration, retry_count: u32) -> Duration {
    const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);
    let exponent = retry_count.saturating_sub(1).min(11);
    interval
        .checked_mul(1 << exponent)
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

/// A message that must never generate another bounce: our own synthesised
/// DSNs, anything with a null sender, and mail from daemon addresses.
pub fn is_bounce(message: &Message) -> bool {
    if message.id.ends_with("-bounce") {
        return true;
    }
    if message.from.is_empty() || message.from == "<>" {
        return true;
    }
    let local = message
        .from
        .rsplit_once('@')
        .map(|(local, _)| local)
        .unwrap_or(&message.from)
        .to_ascii_lowercase();
    local.contains("mailer-daemon") || local.contains("postmaster")
}

/// Worker pool over the durable queue. Each worker dequeues one message per
/// tick, drives it through the sender and writes the terminal (or deferred)
/// state back.
pub struct Processor {
    queue: MessageQueue,
    sender: Arc<dyn MessageSender>,
    dead_letter: Option<Arc<dyn DeadLetter>>,
    limiter: Option<Arc<RateLimiter>>,
    metrics: Arc<dyn Collector>,
    config: ProcessorConfig,
    shutdown: CancellationToken,
    stop: CancellationToken,
}

impl Processor {
    pub fn new(
        queue: MessageQueue,
        sender: Arc<dyn MessageSender>,
        dead_letter: Option<Arc<dyn DeadLetter>>,
        limiter: Option<Arc<RateLimiter>>,
        metrics: Arc<dyn Collector>,
        config: ProcessorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            sender,
            dead_letter,
            limiter,
            metrics,
            config,
            shutdown,
            stop: CancellationToken::new(),
        }
    }

    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker| {
                let processor = self.clone();
                tokio::spawn(async move { processor.worker_loop(worker).await })
            })
            .collect()
    }

    /// Stop the workers without touching the process-wide shutdown token.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn worker_loop(&self, worker: usize) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!(worker, "shutting down delivery worker");
                    return;
                }
                _ = self.stop.cancelled() => {
                    info!(worker, "stopping delivery worker");
                    return;
                }
                _ = interval.tick() => {
                    self.process_next().await;
                }
            }
        }
    }

    /// One unit of work: claim a message, deliver it, record the outcome.
    /// Returns false when the queue had nothing due.
    pub async fn process_next(&self) -> bool {
        let mut message = match self.queue.dequeue() {
            Ok(Some(message)) => message,
            Ok(None) => return false,
            Err(err) => {
                error!("failed to dequeue: {err}");
                return false;
            }
        };
        let domain = message.sender_domain().unwrap_or_default().to_string();
        debug!(id = message.id, attempt = message.retry_count + 1, "processing message");

        if let Some(limiter) = &self.limiter
            && self.defer_if_rate_limited(limiter, &mut message)
        {
            return true;
        }

        let result = match tokio::time::timeout(
            self.config.attempt_timeout,
            self.sender.send(&message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Temporary(
                "delivery attempt timed out".to_string(),
            )),
        };

        match result {
            Ok(()) => {
                message.status = MessageStatus::Delivered;
                // the message is out the door; a failed write is logged, not
                // re-sent
                if let Err(err) = self.queue.update(&mut message) {
                    error!(id = message.id, "failed to mark message delivered: {err}");
                }
                self.metrics.inc_sent(&domain);
                info!(id = message.id, "message delivered");
            }
            Err(err) => self.handle_failure(message, &domain, err),
        }
        true
    }

    /// Recipient-domain (and sender-side) limits are enforced here, at
    /// delivery time, so fanout counts per destination. A denial parks the
    /// message until the window reopens without consuming a retry.
    fn defer_if_rate_limited(&self, limiter: &RateLimiter, message: &mut Message) -> bool {
        let recipient_domains: Vec<String> = message
            .to
            .iter()
            .filter_map(|recipient| {
                recipient
                    .rsplit_once('@')
                    .map(|(_, domain)| domain.to_ascii_lowercase())
            })
            .collect();

        let domain = message.sender_domain().unwrap_or_default();
        let request = RateRequest {
            domain: (!domain.is_empty()).then_some(domain),
            sender: (!message.from.is_empty()).then_some(message.from.as_str()),
            ip: (!message.client_ip.is_empty()).then_some(message.client_ip.as_str()),
            api_key: (!message.auth_user.is_empty()).then_some(message.auth_user.as_str()),
            recipient_domains: &recipient_domains,
        };

        let decision = limiter.allow(&request);
        if decision.allowed {
            return false;
        }

        let level = decision.denied_by.unwrap_or(RateLevel::Global);
        self.metrics.inc_rate_limited(level);
        let wait = decision
            .retry_after
            .unwrap_or_else(|| chrono::Duration::hours(1));
        info!(id = message.id, level = %level, "rate limited, deferring delivery");

        message.status = MessageStatus::Deferred;
        message.next_retry_at = Some(Utc::now() + wait);
        message.last_error = format!(
            "rate limited at level {level} ({})",
            decision.denied_key.unwrap_or_default()
        );
        if let Err(err) = self.queue.update(message) {
            error!(id = message.id, "failed to defer rate limited message: {err}");
        }
        true
    }

    fn handle_failure(&self, mut message: Message, domain: &str, err: SendError) {
        message.retry_count += 1;
        message.last_error = err.to_string();

        if err.is_temporary() && message.retry_count < self.config.retry.max_retries {
            let delay = backoff(self.config.retry.interval, message.retry_count);
            message.status = MessageStatus::Deferred;
            message.next_retry_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::hours(1)),
            );
            info!(
                id = message.id,
                attempt = message.retry_count,
                "delivery failed, retrying in {delay:?}: {err}"
            );
            if let Err(update_err) = self.queue.update(&mut message) {
                error!(id = message.id, "failed to defer message: {update_err}");
            }
            self.metrics.inc_deferred(domain);
            return;
        }

        warn!(id = message.id, "delivery failed terminally: {err}");
        message.status = MessageStatus::Failed;
        self.metrics
            .inc_failed(domain, categorize(&message.last_error));

        if !is_bounce(&message) {
            let bounce = build_bounce(&message, &err, &self.config.hostname);
            match self.queue.enqueue(&bounce) {
                Ok(()) => self.metrics.inc_bounced(domain),
                Err(enqueue_err) => {
                    error!(id = message.id, "failed to enqueue bounce: {enqueue_err}");
                }
            }
        }

        match &self.dead_letter {
            Some(dead_letter) => {
                // move_to_dead_letter writes the record itself
                if let Err(move_err) = dead_letter.move_to_dead_letter(&mut message) {
                    error!(id = message.id, "failed to move message to dead letters: {move_err}");
                }
            }
            None => {
                if let Err(delete_err) = self.queue.delete(&message.id) {
                    error!(id = message.id, "failed to delete failed message: {delete_err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        delivery::mock::ScriptedSender,
        limiter::LimiterConfig,
        metrics::CapturingCollector,
        models::{MessageFilter, RateLimit},
        test::{sample_message, scratch_queue},
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Harness {
        _dir: tempfile::TempDir,
        queue: MessageQueue,
        sender: Arc<ScriptedSender>,
        metrics: Arc<CapturingCollector>,
        processor: Processor,
    }

    fn harness(results: Vec<Result<(), SendError>>) -> Harness {
        harness_with(results, RetryConfig::default(), None)
    }

    fn harness_with(
        results: Vec<Result<(), SendError>>,
        retry: RetryConfig,
        limits: Option<LimiterConfig>,
    ) -> Harness {
        let (dir, queue) = scratch_queue();
        let sender = ScriptedSender::with_results(results);
        let metrics = Arc::new(CapturingCollector::default());
        let limiter = limits.map(|config| {
            Arc::new(RateLimiter::new(queue_kv(&queue), config).unwrap())
        });
        let processor = Processor::new(
            queue.clone(),
            sender.clone(),
            Some(Arc::new(queue.clone())),
            limiter,
            metrics.clone(),
            ProcessorConfig {
                retry,
                hostname: "mta.example".to_string(),
                ..Default::default()
            },
            CancellationToken::new(),
        );
        Harness {
            _dir: dir,
            queue,
            sender,
            metrics,
            processor,
        }
    }

    fn queue_kv(queue: &MessageQueue) -> Arc<crate::store::Kv> {
        queue.kv_handle()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let interval = Duration::from_secs(10);
        assert_eq!(backoff(interval, 1), Duration::from_secs(10));
        assert_eq!(backoff(interval, 2), Duration::from_secs(20));
        assert_eq!(backoff(interval, 3), Duration::from_secs(40));
        // the hour ceiling kicks in
        assert_eq!(backoff(interval, 10), Duration::from_secs(3600));
        // the exponent stops growing at 12 doublings
        assert_eq!(
            backoff(Duration::from_millis(1), 13),
            backoff(Duration::from_millis(1), 40)
        );
        assert_eq!(
            backoff(Duration::from_millis(1), 13),
            Duration::from_millis(1 << 11)
        );
        // an enormous interval saturates instead of overflowing
        assert_eq!(backoff(Duration::from_secs(u64::MAX / 2), 12), Duration::from_secs(3600));
    }

    #[test]
    fn bounce_predicate() {
        let mut message = sample_message("a@x.com", &["b@y.com"]);
        assert!(!is_bounce(&message));

        message.id = format!("{}-bounce", message.id);
        assert!(is_bounce(&message));

        let mut message = sample_message("", &["b@y.com"]);
        assert!(is_bounce(&message));
        message.from = "<>".to_string();
        assert!(is_bounce(&message));

        assert!(is_bounce(&sample_message("MAILER-DAEMON@x.com", &["b@y.com"])));
        assert!(is_bounce(&sample_message("postmaster@x.com", &["b@y.com"])));
        // only the local part counts
        assert!(!is_bounce(&sample_message("user@postmaster-tools.com", &["b@y.com"])));
    }

    #[tokio::test]
    async fn happy_path_delivers() {
        let h = harness(vec![Ok(())]);
        let message = sample_message("a@x.com", &["b@y.com"]);
        h.queue.enqueue(&message).unwrap();

        assert!(h.processor.process_next().await);

        let delivered = h.queue.get(&message.id).unwrap().unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);
        assert!(h.queue.dequeue().unwrap().is_none(), "no index entry remains");

        let stats = h.queue.stats().unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.total, 1);
        assert_eq!(h.metrics.sent(), 1);

        // nothing left to do
        assert!(!h.processor.process_next().await);
    }

    #[tokio::test]
    async fn transient_failure_defers_then_delivers() {
        let h = harness_with(
            vec![
                Err(SendError::Temporary("451 greylisted".to_string())),
                Ok(()),
            ],
            RetryConfig {
                interval: Duration::from_millis(10),
                max_retries: 3,
            },
            None,
        );
        let message = sample_message("a@x.com", &["b@y.com"]);
        h.queue.enqueue(&message).unwrap();

        h.processor.process_next().await;

        let deferred = h.queue.get(&message.id).unwrap().unwrap();
        assert_eq!(deferred.status, MessageStatus::Deferred);
        assert_eq!(deferred.retry_count, 1);
        assert_eq!(deferred.last_error, "451 greylisted");
        let wait = deferred.next_retry_at.unwrap() - deferred.updated_at;
        assert!(wait >= chrono::Duration::zero() && wait <= chrono::Duration::seconds(1));

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.processor.process_next().await;

        let delivered = h.queue.get(&message.id).unwrap().unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);
        assert_eq!(h.sender.call_count(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_bounces_and_dead_letters() {
        let h = harness(vec![Err(SendError::Permanent(
            "550 user unknown".to_string(),
        ))]);
        let message = sample_message("a@x.com", &["b@y.com"]);
        h.queue.enqueue(&message).unwrap();

        h.processor.process_next().await;

        let failed = h.queue.get_dead_letter(&message.id).unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(failed.last_error.contains("550"));

        // the synthesised DSN is back in the main queue
        let bounce = h.queue.dequeue().unwrap().unwrap();
        assert_eq!(bounce.id, format!("{}-bounce", message.id));
        assert_eq!(bounce.from, "");
        assert_eq!(bounce.to, vec!["a@x.com".to_string()]);
        let body = String::from_utf8_lossy(&bounce.data);
        assert!(body.contains("multipart/report"));
        assert!(body.contains("Final-Recipient: rfc822; b@y.com"));

        assert_eq!(h.metrics.failed(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_never_defer_again() {
        let h = harness_with(
            vec![
                Err(SendError::Temporary("451 busy".to_string())),
                Err(SendError::Temporary("451 busy".to_string())),
            ],
            RetryConfig {
                interval: Duration::from_millis(1),
                max_retries: 2,
            },
            None,
        );
        let message = sample_message("a@x.com", &["b@y.com"]);
        h.queue.enqueue(&message).unwrap();

        h.processor.process_next().await;
        assert_eq!(
            h.queue.get(&message.id).unwrap().unwrap().status,
            MessageStatus::Deferred
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.processor.process_next().await;

        // retry budget exhausted: failed, not deferred
        let failed = h.queue.get(&message.id).unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        assert!(h.queue.get_dead_letter(&message.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn bounces_do_not_bounce() {
        let h = harness(vec![
            Err(SendError::Permanent("550 user unknown".to_string())),
            Err(SendError::Permanent("550 user unknown".to_string())),
        ]);
        let message = sample_message("a@x.com", &["b@y.com"]);
        h.queue.enqueue(&message).unwrap();

        // original fails, generating one bounce
        h.processor.process_next().await;
        // the bounce itself fails permanently too
        h.processor.process_next().await;

        // no third message was synthesised
        let all = h.queue.list(&MessageFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(h.queue.dequeue().unwrap().is_none());
    }

    #[tokio::test]
    async fn without_dead_letter_support_failed_messages_are_deleted() {
        let (_dir, queue) = scratch_queue();
        let sender = ScriptedSender::with_results(vec![Err(SendError::Permanent(
            "550 no".to_string(),
        ))]);
        let processor = Processor::new(
            queue.clone(),
            sender,
            None,
            None,
            Arc::new(CapturingCollector::default()),
            ProcessorConfig::default(),
            CancellationToken::new(),
        );

        let message = sample_message("a@x.com", &["b@y.com"]);
        queue.enqueue(&message).unwrap();
        processor.process_next().await;

        assert!(queue.get(&message.id).unwrap().is_none());
        assert!(queue.list_dead_letter(10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn recipient_domain_rate_limit_defers_the_second_message() {
        let h = harness_with(
            vec![Ok(()), Ok(())],
            RetryConfig::default(),
            Some(LimiterConfig {
                recipient_domains: HashMap::from([(
                    "gmail.com".to_string(),
                    RateLimit {
                        per_hour: 1,
                        per_day: 5,
                    },
                )]),
                ..Default::default()
            }),
        );

        let first = sample_message("a@x.com", &["user1@gmail.com"]);
        let second = sample_message("a@x.com", &["user2@gmail.com"]);
        h.queue.enqueue(&first).unwrap();
        h.queue.enqueue(&second).unwrap();

        h.processor.process_next().await;
        h.processor.process_next().await;

        // exactly one send reached the network
        assert_eq!(h.sender.call_count(), 1);
        assert_eq!(
            h.queue.get(&first.id).unwrap().unwrap().status,
            MessageStatus::Delivered
        );
        let limited = h.queue.get(&second.id).unwrap().unwrap();
        assert_eq!(limited.status, MessageStatus::Deferred);
        assert_eq!(limited.retry_count, 0, "a denial does not consume a retry");
        assert!(limited.last_error.contains("rate limited"));
        assert_eq!(h.metrics.rate_limited(), 1);
    }

    #[tokio::test]
    async fn sandboxed_domains_count_as_delivered() {
        let (_dir, queue) = scratch_queue();
        let network = ScriptedSender::always_ok();
        let sandbox = crate::models::SandboxRepository::new(queue.kv_handle());
        let router = Arc::new(DeliveryRouter::new(
            Arc::new(crate::models::DomainRegistry::new(HashMap::from([(
                "sandbox.com".to_string(),
                crate::models::DomainPolicy {
                    mode: crate::models::DeliveryMode::Sandbox,
                    ..Default::default()
                },
            )]))),
            sandbox.clone(),
            network.clone(),
            SimulationConfig::default(),
        ));
        let processor = Processor::new(
            queue.clone(),
            router,
            Some(Arc::new(queue.clone())),
            None,
            Arc::new(CapturingCollector::default()),
            ProcessorConfig::default(),
            CancellationToken::new(),
        );

        let message = sample_message("s@sandbox.com", &["anyone@example.com"]);
        queue.enqueue(&message).unwrap();
        processor.process_next().await;

        // captured, never sent, and the pipeline treats it as delivered
        assert_eq!(network.call_count(), 0);
        let records = sandbox.list(10, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mode, crate::models::DeliveryMode::Sandbox);
        assert_eq!(
            queue.get(&message.id).unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    struct SleepySender;

    #[async_trait]
    impl MessageSender for SleepySender {
        async fn send(&self, _message: &Message) -> Result<(), SendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_attempts_hit_the_deadline() {
        let (_dir, queue) = scratch_queue();
        let processor = Processor::new(
            queue.clone(),
            Arc::new(SleepySender),
            Some(Arc::new(queue.clone())),
            None,
            Arc::new(CapturingCollector::default()),
            ProcessorConfig {
                attempt_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            CancellationToken::new(),
        );

        let message = sample_message("a@x.com", &["b@y.com"]);
        queue.enqueue(&message).unwrap();
        processor.process_next().await;

        let deferred = queue.get(&message.id).unwrap().unwrap();
        assert_eq!(deferred.status, MessageStatus::Deferred);
        assert!(deferred.last_error.contains("timed out"));
    }

    #[tokio::test]
    async fn dead_letter_retry_flows_back_through_the_pipeline() {
        let h = harness(vec![
            Err(SendError::Permanent("550 user unknown".to_string())),
            Ok(()),
            Ok(()),
        ]);
        let message = sample_message("a@x.com", &["b@y.com"]);
        h.queue.enqueue(&message).unwrap();
        h.processor.process_next().await;
        assert!(h.queue.get_dead_letter(&message.id).unwrap().is_some());

        h.queue.retry_dead_letter(&message.id).unwrap();
        let retried = h.queue.get(&message.id).unwrap().unwrap();
        assert_eq!(retried.status, MessageStatus::Pending);
        assert_eq!(retried.retry_count, 0);
        assert_eq!(retried.last_error, "");

        // drain the queue: the retried original and the bounce both deliver
        while h.processor.process_next().await {}
        assert_eq!(
            h.queue.get(&message.id).unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_drain_the_queue_and_stop() {
        let (_dir, queue) = scratch_queue();
        let sender = ScriptedSender::always_ok();
        let shutdown = CancellationToken::new();
        let processor = Arc::new(Processor::new(
            queue.clone(),
            sender,
            Some(Arc::new(queue.clone())),
            None,
            Arc::new(CapturingCollector::default()),
            ProcessorConfig {
                workers: 2,
                tick: Duration::from_millis(10),
                ..Default::default()
            },
            shutdown,
        ));

        let mut ids = Vec::new();
        for _ in 0..5 {
            let message = sample_message("a@x.com", &["b@y.com"]);
            queue.enqueue(&message).unwrap();
            ids.push(message.id);
        }

        let handles = processor.spawn();
        tokio::time::sleep(Duration::from_millis(300)).await;
        processor.stop();
        for handle in handles {
            handle.await.unwrap();
        }

        for id in ids {
            assert_eq!(
                queue.get(&id).unwrap().unwrap().status,
                MessageStatus::Delivered
            );
        }
    }
}
