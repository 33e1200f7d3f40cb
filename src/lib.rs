use crate::{
    delivery::{
        DeliveryRouter, MxResolver, Processor, ProcessorConfig, SenderConfig, SmtpSender,
    },
    dkim::DkimCatalog,
    limiter::RateLimiter,
    metrics::{Collector, NoopCollector},
    models::{DeadLetter, DomainRegistry, SandboxRepository},
    periodically::Cleaner,
    store::Kv,
};
use std::{sync::Arc, time::Duration};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod config;
pub mod delivery;
pub mod dkim;
pub mod limiter;
pub mod metrics;
pub mod models;
pub mod periodically;
pub mod store;
pub mod system_emails;


pub use config::Config;
pub use models::{Message, MessageFilter, MessageQueue, MessageStatus, QueueStats};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Handles to the running pipeline. The queue stays usable for producers
/// (and management surfaces) while the workers run.
pub struct Pipeline {
    pub queue: MessageQueue,
    processor: Arc<Processor>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Drain: the processor stops claiming work first, then every background
    /// task gets up to 30 seconds to finish.
    pub async fn shutdown(self) {
        self.processor.stop();
        let drain = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(30), drain)
            .await
            .is_err()
        {
            warn!("shutdown drain timed out");
        }
    }
}

/// Open the store and start the full delivery pipeline: recovery sweep,
/// rate limiter (with persistence), processor workers and retention
/// cleaner. The caller owns the shutdown token.
pub async fn run(
    config: Config,
    resolver: MxResolver,
    shutdown: CancellationToken,
) -> anyhow::Result<Pipeline> {
    run_with_collector(config, resolver, Arc::new(NoopCollector), shutdown).await
}

pub async fn run_with_collector(
    config: Config,
    resolver: MxResolver,
    metrics: Arc<dyn Collector>,
    shutdown: CancellationToken,
) -> anyhow::Result<Pipeline> {
    let kv = Arc::new(Kv::open(&config.data_dir)?);
    let queue = MessageQueue::new(kv.clone());

    let recovered = queue.recover_interrupted()?;
    if recovered > 0 {
        info!(recovered, "requeued messages interrupted by the previous shutdown");
    }

    let registry = Arc::new(DomainRegistry::new(config.domains.clone()));
    let dkim = Arc::new(DkimCatalog::from_registry(&registry, &config.dkim_selector)?);

    let sender = Arc::new(SmtpSender::new(
        resolver,
        dkim,
        SenderConfig {
            helo_hostname: config.hostname.clone(),
            smtp_port: config.smtp_port,
            timeout: config.smtp_timeout,
        },
    ));
    let router = Arc::new(DeliveryRouter::new(
        registry,
        SandboxRepository::new(kv.clone()),
        sender,
        config.simulation,
    ));

    let limiter = Arc::new(RateLimiter::new(kv, config.limits.clone())?);
    let mut handles = vec![limiter.spawn_flush(config.limiter_flush_interval, shutdown.clone())];

    let dead_letter: Option<Arc<dyn DeadLetter>> = config
        .dead_letter_enabled
        .then(|| Arc::new(queue.clone()) as Arc<dyn DeadLetter>);

    let processor = Arc::new(Processor::new(
        queue.clone(),
        router,
        dead_letter,
        Some(limiter),
        metrics,
        ProcessorConfig {
            workers: config.workers,
            tick: config.tick,
            retry: config.retry.clone(),
            attempt_timeout: config.attempt_timeout,
            hostname: config.hostname.clone(),
        },
        shutdown.clone(),
    ));
    handles.extend(processor.spawn());
    handles.extend(Cleaner::new(queue.clone(), config.cleaner.clone()).spawn(shutdown));

    Ok(Pipeline {
        queue,
        processor,
        handles,
    })
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
