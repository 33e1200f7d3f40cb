#[cfg(not(test))]
use hickory_resolver::{
    Resolver, config::ResolverConfig, name_server::TokioConnectionProvider,
};
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use crate::delivery::mock;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("DNS lookup failed: {0}")]
    Dns(#[from] hickory_resolver::ResolveError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub host: String,
    pub priority: u16,
}

struct CacheEntry {
    records: Vec<MxHost>,
    expires_at: Instant,
}

/// MX lookups with a TTL cache. Domains without MX records fall back to a
/// synthetic `{host: domain, priority: 0}` record which is deliberately not
/// cached.
pub struct MxResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) resolver: mock::Resolver,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl MxResolver {
    #[cfg(not(test))]
    pub fn new(ttl: Duration) -> Self {
        let mut options = hickory_resolver::config::ResolverOpts::default();
        options.attempts = 4;

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .with_options(options)
            .build(),
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    #[cfg(test)]
    pub fn mock(resolver: mock::Resolver, ttl: Duration) -> Self {
        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Mail exchangers for `domain`, sorted by ascending priority.
    pub async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxHost>, ResolveError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(&domain)
                && Instant::now() < entry.expires_at
            {
                return Ok(entry.records.clone());
            }
        }

        // queries that end with a '.' are fully qualified and cheaper
        let records = match self.resolver.mx_lookup(format!("{domain}.")).await {
            Ok(lookup) => {
                let mut records: Vec<MxHost> = lookup
                    .iter()
                    .map(|mx| MxHost {
                        host: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                        priority: mx.preference(),
                    })
                    .collect();
                records.sort_by_key(|record| record.priority);
                records
            }
            Err(err) if err.is_no_records_found() => Vec::new(),
            Err(err) => return Err(ResolveError::Dns(err)),
        };

        if records.is_empty() {
            debug!(domain, "no MX records, falling back to the A record");
            return Ok(vec![MxHost {
                host: domain,
                priority: 0,
            }]);
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            domain,
            CacheEntry {
                records: records.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(records)
    }
}
