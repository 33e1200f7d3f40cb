use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};

/// What happens to mail sent from a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Deliver to the recipients' MX hosts.
    #[default]
    Production,
    /// Capture the message, never touch the network.
    Sandbox,
    /// Replace the recipients with a configured list before delivering.
    Redirect,
    /// Deliver normally and send a copy to a configured list.
    Bcc,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Production => "production",
            DeliveryMode::Sandbox => "sandbox",
            DeliveryMode::Redirect => "redirect",
            DeliveryMode::Bcc => "bcc",
        }
    }
}

/// Per-domain delivery policy, loaded from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainPolicy {
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default)]
    pub redirect_to: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// PKCS#8 DER key used to DKIM-sign mail from this domain.
    #[serde(default)]
    pub dkim_key_file: Option<PathBuf>,
}

/// Lookup table over the configured sender domains. Unknown domains are
/// production.
#[derive(Debug, Default, Clone)]
pub struct DomainRegistry {
    domains: HashMap<String, DomainPolicy>,
}

impl DomainRegistry {
    pub fn new(domains: HashMap<String, DomainPolicy>) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|(domain, policy)| (domain.to_ascii_lowercase(), policy))
                .collect(),
        }
    }

    pub fn policy(&self, domain: &str) -> DomainPolicy {
        self.domains
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn mode(&self, domain: &str) -> DeliveryMode {
        self.policy(domain).mode
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DomainPolicy)> {
        self.domains
            .iter()
            .map(|(domain, policy)| (domain.as_str(), policy))
    }
}
