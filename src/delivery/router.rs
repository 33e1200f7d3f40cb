use crate::{
    delivery::sender::{MessageSender, SendError},
    models::{DeliveryMode, DomainRegistry, Message, SandboxRecord, SandboxRepository},
};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

/// Optional SMTP error simulation for sandboxed domains.
#[derive(Debug, Clone, Copy)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub probability: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.05,
        }
    }
}

const SIMULATED_ERRORS: [&str; 4] = [
    "550 User not found",
    "451 Temporary failure",
    "452 Insufficient storage",
    "421 Service not available",
];

/// Interposer between the processor and the network: routes each send
/// through the sender domain's delivery mode. The processor sees one
/// ordinary `send` either way.
pub struct DeliveryRouter {
    domains: Arc<DomainRegistry>,
    sandbox: SandboxRepository,
    network: Arc<dyn MessageSender>,
    simulation: SimulationConfig,
}

impl DeliveryRouter {
    pub fn new(
        domains: Arc<DomainRegistry>,
        sandbox: SandboxRepository,
        network: Arc<dyn MessageSender>,
        simulation: SimulationConfig,
    ) -> Self {
        Self {
            domains,
            sandbox,
            network,
            simulation,
        }
    }

    /// Keep the message out of the network entirely. With simulation on,
    /// some captures report a made-up SMTP error instead of success.
    fn capture(&self, message: &Message, domain: &str) -> Result<(), SendError> {
        let mut record = SandboxRecord::capture(
            message,
            domain,
            DeliveryMode::Sandbox,
            message.to.clone(),
            None,
        );

        let simulated = if self.simulation.enabled
            && rand::rng().random_range(0.0..1.0) < self.simulation.probability
        {
            let error = SIMULATED_ERRORS[rand::rng().random_range(0..SIMULATED_ERRORS.len())];
            record.simulated_error = Some(error.to_string());
            Some(error)
        } else {
            None
        };

        self.sandbox.store(&record).map_err(store_failure)?;
        debug!(id = message.id, domain, "captured message in sandbox");

        match simulated {
            // 4xx simulations are transient, everything else is final
            Some(error) if error.starts_with('4') => {
                Err(SendError::Temporary(error.to_string()))
            }
            Some(error) => Err(SendError::Permanent(error.to_string())),
            None => Ok(()),
        }
    }

    async fn redirect(
        &self,
        message: &Message,
        domain: &str,
        redirect_to: &[String],
    ) -> Result<(), SendError> {
        let record = SandboxRecord::capture(
            message,
            domain,
            DeliveryMode::Redirect,
            redirect_to.to_vec(),
            Some(message.to.clone()),
        );
        self.sandbox.store(&record).map_err(store_failure)?;

        let mut copy = message.clone();
        copy.to = redirect_to.to_vec();
        debug!(id = message.id, domain, "redirecting recipients");
        self.network.send(&copy).await
    }

    async fn bcc(&self, message: &Message, domain: &str, bcc: &[String]) -> Result<(), SendError> {
        let mut combined = message.to.clone();
        combined.extend(bcc.iter().cloned());
        let record = SandboxRecord::capture(
            message,
            domain,
            DeliveryMode::Bcc,
            combined,
            Some(message.to.clone()),
        );
        self.sandbox.store(&record).map_err(store_failure)?;

        self.network.send(message).await?;

        // the primary recipients already have the message, a failing copy
        // must not fail the send
        let mut copy = message.clone();
        copy.id = format!("{}-bcc", message.id);
        copy.to = bcc.to_vec();
        if let Err(err) = self.network.send(&copy).await {
            warn!(id = copy.id, domain, "BCC copy failed: {err}");
        }
        Ok(())
    }
}

fn store_failure(err: crate::models::Error) -> SendError {
    SendError::Temporary(format!("could not store sandbox record: {err}"))
}

#[async_trait]
impl MessageSender for DeliveryRouter {
    async fn send(&self, message: &Message) -> Result<(), SendError> {
        let domain = message
            .sender_domain()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let policy = self.domains.policy(&domain);

        match policy.mode {
            DeliveryMode::Production => self.network.send(message).await,
            DeliveryMode::Sandbox => self.capture(message, &domain),
            DeliveryMode::Redirect if policy.redirect_to.is_empty() => {
                self.capture(message, &domain)
            }
            DeliveryMode::Redirect => self.redirect(message, &domain, &policy.redirect_to).await,
            DeliveryMode::Bcc if policy.bcc.is_empty() => self.network.send(message).await,
            DeliveryMode::Bcc => self.bcc(message, &domain, &policy.bcc).await,
        }
    }
}
