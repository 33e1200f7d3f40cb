use crate::{delivery::dns::MxResolver, dkim::DkimCatalog, models::Message};
use async_trait::async_trait;
use email_address::EmailAddress;
use mail_send::{SmtpClient, smtp};
use std::{borrow::Cow, fmt::Display, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::{crypto, crypto::CryptoProvider};
use tracing::{debug, info, warn};

/// Delivery outcome classification. Temporary failures are retried with
/// backoff; permanent ones fail the message and trigger a bounce.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("{0}")]
    Temporary(String),
    #[error("{0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, SendError::Temporary(_))
    }
}

/// The processor's view of whatever performs the actual delivery: the SMTP
/// client in production, the domain-mode interposer in front of it, or a
/// scripted double in tests.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), SendError>;
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Hostname announced in EHLO.
    pub helo_hostname: String,
    pub smtp_port: u16,
    /// Per-connection I/O timeout.
    pub timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            helo_hostname: "localhost".to_string(),
            smtp_port: 25,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy)]
enum Protection {
    Tls,
    Plaintext,
}

/// Outbound ESMTP client: resolves MX hosts, walks them in priority order,
/// upgrades to TLS where the server offers it and DKIM-signs where a key is
/// configured.
pub struct SmtpSender {
    resolver: MxResolver,
    dkim: Arc<DkimCatalog>,
    config: SenderConfig,
}

impl SmtpSender {
    pub fn new(resolver: MxResolver, dkim: Arc<DkimCatalog>, config: SenderConfig) -> Self {
        if CryptoProvider::get_default().is_none() {
            CryptoProvider::install_default(crypto::aws_lc_rs::default_provider())
                .expect("Failed to install crypto provider");
        }

        Self {
            resolver,
            dkim,
            config,
        }
    }

    /// One domain's recipients through that domain's MX hosts. A permanent
    /// rejection stops the walk; a temporary one moves to the next host.
    async fn send_to_domain(
        &self,
        domain: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<(), SendError> {
        let hosts = self.resolver.lookup_mx(domain).await.map_err(|err| {
            SendError::Temporary(format!("MX lookup for {domain} failed: {err}"))
        })?;

        let mut last_error = None;
        for mx in hosts {
            match self.send_to_host(&mx.host, from, recipients, data).await {
                Ok(()) => {
                    debug!(domain, host = mx.host, "successfully sent email");
                    return Ok(());
                }
                Err(err @ SendError::Permanent(_)) => return Err(err),
                Err(err) => {
                    info!(domain, host = mx.host, "could not use server: {err}");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SendError::Temporary(format!("no mail server for {domain} accepted the message"))
        }))
    }

    async fn send_to_host(
        &self,
        host: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<(), SendError> {
        match self.attempt(host, from, recipients, data, Protection::Tls).await {
            Ok(()) => Ok(()),
            Err(err) if starttls_failed(&err) => {
                warn!(host, "STARTTLS unavailable, continuing in plaintext: {err}");
                self.attempt(host, from, recipients, data, Protection::Plaintext)
                    .await
                    .map_err(classify)
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn attempt(
        &self,
        host: &str,
        from: &str,
        recipients: &[String],
        data: &[u8],
        protection: Protection,
    ) -> Result<(), mail_send::Error> {
        let builder = mail_send::SmtpClientBuilder::new(host, self.config.smtp_port)
            .implicit_tls(false)
            .helo_host(&self.config.helo_hostname)
            .timeout(self.config.timeout);

        let message = smtp::message::Message {
            mail_from: from.into(),
            rcpt_to: recipients.iter().map(|r| r.as_str().into()).collect(),
            body: data.into(),
        };

        match protection {
            Protection::Tls => {
                let mut client = builder.connect().await?;
                let result = client.send(message).await;
                Self::quit(client, host).await;
                result
            }
            Protection::Plaintext => {
                let mut client = builder.connect_plain().await?;
                let result = client.send(message).await;
                Self::quit(client, host).await;
                result
            }
        }
    }

    async fn quit<T, D>(client: SmtpClient<T>, hostname: D)
    where
        D: Display,
        T: AsyncRead + AsyncWrite + Unpin,
    {
        client
            .quit()
            .await
            .inspect_err(|err| {
                warn!("failed to close SMTP connection with {hostname}: {err}");
            })
            .ok();
    }
}

#[async_trait]
impl MessageSender for SmtpSender {
    async fn send(&self, message: &Message) -> Result<(), SendError> {
        let data: Cow<[u8]> = match self.dkim.sign_header(&message.from, &message.data) {
            Some(Ok(header)) => {
                let mut signed = header.into_bytes();
                signed.extend_from_slice(&message.data);
                Cow::Owned(signed)
            }
            Some(Err(err)) => {
                warn!(id = message.id, "DKIM signing failed, sending unsigned: {err}");
                Cow::Borrowed(&message.data)
            }
            None => Cow::Borrowed(&message.data),
        };

        let (groups, invalid) = group_by_domain(&message.to);

        let mut permanent: Option<String> = None;
        let mut temporary: Option<String> = None;

        for recipient in invalid {
            permanent.get_or_insert(format!("invalid recipient address {recipient}"));
        }

        for (domain, recipients) in groups {
            match self
                .send_to_domain(&domain, &message.from, &recipients, &data)
                .await
            {
                Ok(()) => {}
                Err(SendError::Permanent(err)) => {
                    permanent.get_or_insert(err);
                }
                Err(SendError::Temporary(err)) => temporary = Some(err),
            }
        }

        if let Some(err) = permanent {
            return Err(SendError::Permanent(err));
        }
        if let Some(err) = temporary {
            return Err(SendError::Temporary(err));
        }
        Ok(())
    }
}

/// Recipients grouped by their lowercased domain part, in first-appearance
/// order. Addresses without a usable domain come back separately.
fn group_by_domain(recipients: &[String]) -> (Vec<(String, Vec<String>)>, Vec<String>) {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    let mut invalid = Vec::new();

    for recipient in recipients {
        if !EmailAddress::is_valid(recipient) {
            invalid.push(recipient.clone());
            continue;
        }
        // is_valid guarantees the '@' is there
        let domain = recipient
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
            .unwrap_or_default();
        match groups.iter_mut().find(|(existing, _)| *existing == domain) {
            Some((_, members)) => members.push(recipient.clone()),
            None => groups.push((domain, vec![recipient.clone()])),
        }
    }

    (groups, invalid)
}

fn starttls_failed(err: &mail_send::Error) -> bool {
    matches!(
        err,
        mail_send::Error::Tls(_)
            | mail_send::Error::InvalidTLSName
            | mail_send::Error::MissingStartTls
    )
}

fn classify(err: mail_send::Error) -> SendError {
    let text = match err {
        mail_send::Error::UnexpectedReply(response)
        | mail_send::Error::AuthenticationFailed(response) => {
            format!("{} {}", response.code, response.message)
        }
        other => other.to_string(),
    };
    // only the final rejection codes stop the retry machinery; any other
    // reply, 5xx included, is tried again on the next host or attempt
    if is_permanent_error(&text) {
        SendError::Permanent(text)
    } else {
        SendError::Temporary(text)
    }
}

/// An error is permanent when it carries one of the final SMTP rejection
/// codes.
pub fn is_permanent_error(text: &str) -> bool {
    ["550", "551", "552", "553", "554"]
        .iter()
        .any(|code| text.contains(code))
}

/// Fixed failure taxonomy used for metrics.
pub fn categorize(text: &str) -> &'static str {
    let lower = text.to_ascii_lowercase();
    let has = |code: &str| text.contains(code);

    if (has("550") || has("551")) && lower.contains("relay") {
        "relay_denied"
    } else if has("550") || has("551") || has("552") || has("553") {
        "recipient_rejected"
    } else if has("554") {
        "spam_rejected"
    } else if has("530") || has("535") {
        "auth_failed"
    } else if lower.contains("connection refused") {
        "connection_refused"
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("dns") || lower.contains("resolve") {
        "dns_error"
    } else if lower.contains("tls") {
        "tls_error"
    } else {
        "other"
    }
}
