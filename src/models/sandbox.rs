use crate::{
    models::{DeliveryMode, Error, Message, sort_key},
    store::{Kv, SANDBOX},
};
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A shadow copy of a message the interposer kept out of (or duplicated
/// around) normal delivery. `to` holds the recipients that were actually
/// used; `original_to` the pre-rewrite ones where a rewrite happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub original_to: Option<Vec<String>>,
    pub subject: String,
    pub data: Vec<u8>,
    pub domain: String,
    pub mode: DeliveryMode,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub client_ip: String,
    pub simulated_error: Option<String>,
}

impl SandboxRecord {
    pub fn capture(
        message: &Message,
        domain: &str,
        mode: DeliveryMode,
        to: Vec<String>,
        original_to: Option<Vec<String>>,
    ) -> Self {
        let subject = MessageParser::default()
            .parse(&message.data)
            .and_then(|parsed| parsed.subject().map(str::to_string))
            .unwrap_or_default();

        Self {
            id: message.id.clone(),
            from: message.from.clone(),
            to,
            original_to,
            subject,
            data: message.data.clone(),
            domain: domain.to_string(),
            mode,
            captured_at: Utc::now(),
            client_ip: message.client_ip.clone(),
            simulated_error: None,
        }
    }
}

#[derive(Clone)]
pub struct SandboxRepository {
    kv: Arc<Kv>,
}

impl SandboxRepository {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    pub fn store(&self, record: &SandboxRecord) -> Result<(), Error> {
        self.kv.update(|txn| {
            txn.put(
                SANDBOX,
                sort_key(&record.captured_at, &record.id),
                serde_json::to_vec(record)?,
            )?;
            Ok(())
        })
    }

    /// Captured records in capture order.
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<SandboxRecord>, Error> {
        let mut records = Vec::new();
        for entry in self.kv.iter(SANDBOX)? {
            let (_, raw) = entry?;
            records.push(serde_json::from_slice(&raw)?);
        }
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{sample_message_with_data, scratch_kv};

    #[test]
    fn capture_extracts_the_subject() {
        let message = sample_message_with_data(
            "s@sandbox.com",
            &["anyone@example.com"],
            b"Subject: Weekly report\r\nFrom: s@sandbox.com\r\n\r\nbody\r\n",
        );
        let record = SandboxRecord::capture(
            &message,
            "sandbox.com",
            DeliveryMode::Sandbox,
            message.to.clone(),
            None,
        );
        assert_eq!(record.subject, "Weekly report");
        assert_eq!(record.to, vec!["anyone@example.com".to_string()]);
        assert!(record.original_to.is_none());
    }

    #[test]
    fn capture_tolerates_unparseable_data() {
        let message = sample_message_with_data("s@sandbox.com", &["x@example.com"], b"\xff\xfe");
        let record = SandboxRecord::capture(
            &message,
            "sandbox.com",
            DeliveryMode::Sandbox,
            message.to.clone(),
            None,
        );
        assert_eq!(record.subject, "");
    }

    #[test]
    fn store_and_list_in_capture_order() {
        let (_dir, kv) = scratch_kv();
        let repository = SandboxRepository::new(kv);

        for i in 0..3 {
            let message = sample_message_with_data(
                "s@sandbox.com",
                &["x@example.com"],
                format!("Subject: msg {i}\r\n\r\n.").as_bytes(),
            );
            let record = SandboxRecord::capture(
                &message,
                "sandbox.com",
                DeliveryMode::Sandbox,
                message.to.clone(),
                None,
            );
            repository.store(&record).unwrap();
        }

        let records = repository.list(10, 0).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].subject, "msg 0");
        assert_eq!(records[2].subject, "msg 2");

        assert_eq!(repository.list(1, 2).unwrap()[0].subject, "msg 2");
    }
}
