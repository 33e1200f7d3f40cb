use crate::models::{self, MessageQueue};
use std::{error::Error, time::Duration};
use tokio::{select, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run `task` immediately and then every `period` until cancelled. Failures
/// are logged, the loop keeps going.
pub fn run_periodically<F, E, Fut>(
    task: F,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    E: Error,
    Fut: Future<Output = Result<(), E>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            select!(
                _ = cancel.cancelled() => {
                    info!("periodic task cancelled");
                    return;
                },
                _ = interval.tick() => {
                    if let Err(e) = task().await {
                        error!("periodic task failed: {e}");
                    }
                }
            )
        }
    })
}

#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Delivered messages older than this are removed; zero disables the
    /// sweep.
    pub delivered_max_age: chrono::Duration,
    pub delivered_interval: Duration,
    /// Dead letters older than this are removed; zero disables the age
    /// pass.
    pub dead_letter_max_age: chrono::Duration,
    /// FIFO cap on the dead letter queue; zero means uncapped.
    pub dead_letter_max_count: usize,
    pub dead_letter_interval: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            delivered_max_age: chrono::Duration::days(7),
            delivered_interval: Duration::from_secs(60 * 60),
            dead_letter_max_age: chrono::Duration::days(30),
            dead_letter_max_count: 10_000,
            dead_letter_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Background retention: one sweep for delivered messages, one for the dead
/// letter queue, each on its own interval and each run once right away.
pub struct Cleaner {
    queue: MessageQueue,
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(queue: MessageQueue, config: CleanerConfig) -> Self {
        Self { queue, config }
    }

    pub fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if !self.config.delivered_interval.is_zero()
            && self.config.delivered_max_age > chrono::Duration::zero()
        {
            let queue = self.queue.clone();
            let max_age = self.config.delivered_max_age;
            handles.push(run_periodically(
                move || Self::sweep_delivered(queue.clone(), max_age),
                self.config.delivered_interval,
                cancel.clone(),
            ));
        }

        if !self.config.dead_letter_interval.is_zero() {
            let queue = self.queue.clone();
            let max_age = self.config.dead_letter_max_age;
            let max_count = self.config.dead_letter_max_count;
            handles.push(run_periodically(
                move || Self::sweep_dead_letter(queue.clone(), max_age, max_count),
                self.config.dead_letter_interval,
                cancel.clone(),
            ));
        }

        handles
    }

    async fn sweep_delivered(
        queue: MessageQueue,
        max_age: chrono::Duration,
    ) -> Result<(), models::Error> {
        let removed = queue.cleanup_delivered(max_age)?;
        if removed > 0 {
            info!(removed, "removed delivered messages past retention");
        }
        Ok(())
    }

    async fn sweep_dead_letter(
        queue: MessageQueue,
        max_age: chrono::Duration,
        max_count: usize,
    ) -> Result<(), models::Error> {
        let removed = queue.cleanup_dead_letter(max_age, max_count)?;
        if removed > 0 {
            info!(removed, "removed expired dead letters");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        models::{DeadLetter, MessageStatus, sort_key},
        store::MESSAGES,
        test::{sample_message, scratch_queue},
    };
    use chrono::Utc;

    #[tokio::test]
    async fn delivered_sweep_runs_immediately() {
        let (_dir, queue) = scratch_queue();
        let mut message = sample_message("a@x.com", &["b@y.com"]);
        queue.enqueue(&message).unwrap();
        queue.dequeue().unwrap();
        message.status = MessageStatus::Delivered;
        queue.update(&mut message).unwrap();
        message.updated_at = Utc::now() - chrono::Duration::hours(2);
        queue
            .kv_handle()
            .update(|txn| txn.put(MESSAGES, &message.id, serde_json::to_vec(&message).unwrap()))
            .unwrap();

        let cancel = CancellationToken::new();
        let handles = Cleaner::new(
            queue.clone(),
            CleanerConfig {
                delivered_max_age: chrono::Duration::hours(1),
                delivered_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
        .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(queue.get(&message.id).unwrap().is_none());

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn dead_letter_sweep_enforces_the_cap() {
        let (_dir, queue) = scratch_queue();
        for _ in 0..4 {
            let mut message = sample_message("a@x.com", &["b@y.com"]);
            queue.enqueue(&message).unwrap();
            queue.dequeue().unwrap();
            queue.move_to_dead_letter(&mut message).unwrap();
        }

        let cancel = CancellationToken::new();
        let handles = Cleaner::new(
            queue.clone(),
            CleanerConfig {
                delivered_max_age: chrono::Duration::zero(),
                dead_letter_max_age: chrono::Duration::days(1),
                dead_letter_max_count: 1,
                dead_letter_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
        .spawn(cancel.clone());
        assert_eq!(handles.len(), 1, "the delivered sweep is disabled");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.list_dead_letter(10, 0).unwrap().len(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn zero_intervals_spawn_nothing() {
        let (_dir, queue) = scratch_queue();
        let handles = Cleaner::new(
            queue,
            CleanerConfig {
                delivered_interval: Duration::ZERO,
                dead_letter_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .spawn(CancellationToken::new());
        assert!(handles.is_empty());
    }

    #[test]
    fn sort_key_helper_is_shared_with_the_indexes() {
        // the cleaner relies on index keys ordering by time
        let earlier = sort_key(&(Utc::now() - chrono::Duration::seconds(1)), "a");
        let later = sort_key(&Utc::now(), "a");
        assert!(earlier < later);
    }
}
