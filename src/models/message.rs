use crate::{
    models::Error,
    store::{DEAD_LETTER, DEFERRED, Kv, MESSAGES, PENDING, WriteTxn},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Sending,
    Deferred,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sending => "sending",
            MessageStatus::Deferred => "deferred",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }
}

/// A message accepted for delivery. `data` is the complete RFC 5322 message
/// as composed by the producer; the pipeline treats it as an opaque blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub data: Vec<u8>,
    pub status: MessageStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: String,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub auth_user: String,
    #[serde(default)]
    pub client_ip: String,
}

impl Message {
    pub fn new(from: impl Into<String>, to: Vec<String>, data: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to,
            data,
            status: MessageStatus::Pending,
            retry_count: 0,
            last_error: String::new(),
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            auth_user: String::new(),
            client_ip: String::new(),
        }
    }

    /// Domain part of the envelope sender, if there is one. Bounces carry a
    /// null sender and have no domain.
    pub fn sender_domain(&self) -> Option<&str> {
        self.from.rsplit_once('@').map(|(_, domain)| domain)
    }
}

/// Index key: full-precision RFC 3339 timestamp, then the id as tie-breaker.
/// The timestamp is fixed width (30 bytes, nanoseconds, UTC `Z`), so
/// lexicographic key order is chronological order.
pub fn sort_key(ts: &DateTime<Utc>, id: &str) -> Vec<u8> {
    format!("{}:{id}", ts.to_rfc3339_opts(SecondsFormat::Nanos, true)).into_bytes()
}

const SORT_KEY_TS_LEN: usize = 30;

fn split_sort_key(key: &[u8]) -> Option<(DateTime<Utc>, &str)> {
    if key.len() < SORT_KEY_TS_LEN + 2 {
        return None;
    }
    let ts = std::str::from_utf8(&key[..SORT_KEY_TS_LEN]).ok()?;
    let ts = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    let id = std::str::from_utf8(&key[SORT_KEY_TS_LEN + 1..]).ok()?;
    Some((ts, id))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            status: None,
            offset: 0,
            limit: 100,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub sending: usize,
    pub deferred: usize,
    pub delivered: usize,
    pub failed: usize,
    pub total: usize,
}

/// Dead-letter capability, separate from the plain queue so collaborators
/// that only need one of the two can say so.
pub trait DeadLetter: Send + Sync {
    fn move_to_dead_letter(&self, message: &mut Message) -> Result<(), Error>;
    fn list_dead_letter(&self, limit: usize, offset: usize) -> Result<Vec<Message>, Error>;
    fn get_dead_letter(&self, id: &str) -> Result<Option<Message>, Error>;
    fn retry_dead_letter(&self, id: &str) -> Result<(), Error>;
    fn delete_dead_letter(&self, id: &str) -> Result<(), Error>;
}

/// Durable message queue: the main record bucket plus the pending, deferred
/// and dead-letter indexes, every mutation a single atomic transaction.
#[derive(Clone)]
pub struct MessageQueue {
    kv: Arc<Kv>,
}

impl MessageQueue {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    #[cfg(test)]
    pub(crate) fn kv_handle(&self) -> Arc<Kv> {
        self.kv.clone()
    }

    /// Accept a message for delivery: write the main record and the pending
    /// index entry together. An existing record with the same id is
    /// overwritten.
    pub fn enqueue(&self, message: &Message) -> Result<(), Error> {
        self.kv.update(|txn| {
            txn.put(MESSAGES, &message.id, serde_json::to_vec(message)?)?;
            txn.put(
                PENDING,
                sort_key(&message.created_at, &message.id),
                &message.id,
            )?;
            Ok(())
        })
    }

    /// Claim the next message that is due: deferred entries first (oldest
    /// due retry wins), then pending ones. The claimed message is marked
    /// `sending` and its index entry removed in the same transaction, so no
    /// two callers ever receive the same message. Index entries whose record
    /// has vanished are dropped on the way.
    pub fn dequeue(&self) -> Result<Option<Message>, Error> {
        let now = Utc::now();
        self.kv.update(|txn| {
            for bucket in [DEFERRED, PENDING] {
                if let Some(message) = Self::claim_next(txn, bucket, now)? {
                    return Ok(Some(message));
                }
            }
            Ok(None)
        })
    }

    fn claim_next(
        txn: &mut WriteTxn,
        bucket: &'static str,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>, Error> {
        let mut orphans = Vec::new();
        let mut claimed = None;

        for entry in txn.iter(bucket)? {
            let (key, value) = entry?;
            if let Some((due, _)) = split_sort_key(&key)
                && due > now
            {
                // keys are time ordered, everything after this is later
                break;
            }
            let id = String::from_utf8_lossy(&value).into_owned();
            let Some(raw) = txn.get(MESSAGES, &id)? else {
                warn!(id, bucket, "dropping queue entry without a message record");
                orphans.push(key);
                continue;
            };

            let mut message: Message = serde_json::from_slice(&raw)?;
            message.status = MessageStatus::Sending;
            message.updated_at = now;
            claimed = Some((key, message));
            break;
        }

        for key in orphans {
            txn.delete(bucket, key)?;
        }

        let Some((key, message)) = claimed else {
            return Ok(None);
        };
        txn.put(MESSAGES, &message.id, serde_json::to_vec(&message)?)?;
        txn.delete(bucket, key)?;
        Ok(Some(message))
    }

    /// Persist the message, stamping `updated_at`. A deferred message is
    /// (re-)inserted into the deferred index; no other index is touched.
    pub fn update(&self, message: &mut Message) -> Result<(), Error> {
        message.updated_at = Utc::now();
        self.kv.update(|txn| {
            txn.put(MESSAGES, &message.id, serde_json::to_vec(message)?)?;
            if message.status == MessageStatus::Deferred {
                let due = message.next_retry_at.unwrap_or(message.updated_at);
                txn.put(DEFERRED, sort_key(&due, &message.id), &message.id)?;
            }
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>, Error> {
        match self.kv.get(MESSAGES, id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Scan of the main bucket with a status filter and offset/limit.
    /// Iteration order is the bucket's (id order); time-ordered listings
    /// come from the dedicated indexes.
    pub fn list(&self, filter: &MessageFilter) -> Result<Vec<Message>, Error> {
        let mut messages = Vec::new();
        for entry in self.kv.iter(MESSAGES)? {
            let (_, raw) = entry?;
            let message: Message = serde_json::from_slice(&raw)?;
            if let Some(status) = filter.status
                && message.status != status
            {
                continue;
            }
            messages.push(message);
        }
        Ok(messages
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    /// Remove the message and its index entries (best effort, an entry that
    /// was re-keyed is swept up later by `dequeue` as an orphan).
    pub fn delete(&self, id: &str) -> Result<(), Error> {
        self.kv.update(|txn| {
            if let Some(raw) = txn.get(MESSAGES, id)? {
                if let Ok(message) = serde_json::from_slice::<Message>(&raw) {
                    txn.delete(PENDING, sort_key(&message.created_at, id))?;
                    if let Some(due) = message.next_retry_at {
                        txn.delete(DEFERRED, sort_key(&due, id))?;
                    }
                }
                txn.delete(MESSAGES, id)?;
            }
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<QueueStats, Error> {
        let mut stats = QueueStats::default();
        for entry in self.kv.iter(MESSAGES)? {
            let (_, raw) = entry?;
            let message: Message = serde_json::from_slice(&raw)?;
            match message.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Sending => stats.sending += 1,
                MessageStatus::Deferred => stats.deferred += 1,
                MessageStatus::Delivered => stats.delivered += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    /// Delete delivered messages older than `max_age`. Returns how many were
    /// removed.
    pub fn cleanup_delivered(&self, max_age: chrono::Duration) -> Result<usize, Error> {
        let cutoff = Utc::now() - max_age;
        self.kv.update(|txn| {
            let mut expired = Vec::new();
            for entry in txn.iter(MESSAGES)? {
                let (key, raw) = entry?;
                let message: Message = serde_json::from_slice(&raw)?;
                if message.status == MessageStatus::Delivered && message.updated_at < cutoff {
                    expired.push(key);
                }
            }
            let removed = expired.len();
            for key in expired {
                txn.delete(MESSAGES, key)?;
            }
            Ok(removed)
        })
    }

    /// Dead-letter retention: first drop entries older than `max_age`, then,
    /// if `max_count > 0` and the queue is still over it, drop the oldest
    /// entries until it fits. Returns how many were removed.
    pub fn cleanup_dead_letter(
        &self,
        max_age: chrono::Duration,
        max_count: usize,
    ) -> Result<usize, Error> {
        let cutoff = Utc::now() - max_age;
        self.kv.update(|txn| {
            let mut expired = Vec::new();
            let mut remaining = Vec::new();

            for entry in txn.iter(DEAD_LETTER)? {
                let (key, value) = entry?;
                let id = String::from_utf8_lossy(&value).into_owned();
                match split_sort_key(&key) {
                    Some((moved_at, _)) if max_age > chrono::Duration::zero() && moved_at < cutoff => {
                        expired.push((key, id));
                    }
                    Some(_) => remaining.push((key, id)),
                    None => expired.push((key, id)),
                }
            }

            // the index is scanned oldest first, so draining from the front
            // of `remaining` is FIFO
            if max_count > 0 && remaining.len() > max_count {
                let excess = remaining.len() - max_count;
                expired.extend(remaining.drain(..excess));
            }

            let removed = expired.len();
            for (key, id) in expired {
                txn.delete(DEAD_LETTER, key)?;
                txn.delete(MESSAGES, id)?;
            }
            Ok(removed)
        })
    }

    /// Startup sweep: a crash mid-delivery leaves messages stuck in
    /// `sending` with no index entry. Put them back in pending so they are
    /// attempted again.
    pub fn recover_interrupted(&self) -> Result<usize, Error> {
        let now = Utc::now();
        self.kv.update(|txn| {
            let mut interrupted = Vec::new();
            for entry in txn.iter(MESSAGES)? {
                let (_, raw) = entry?;
                let message: Message = serde_json::from_slice(&raw)?;
                if message.status == MessageStatus::Sending {
                    interrupted.push(message);
                }
            }

            let recovered = interrupted.len();
            for mut message in interrupted {
                warn!(id = message.id, "requeueing message interrupted mid-delivery");
                message.status = MessageStatus::Pending;
                message.last_error = "delivery interrupted by shutdown, requeued".to_string();
                message.updated_at = now;
                txn.put(MESSAGES, &message.id, serde_json::to_vec(&message)?)?;
                txn.put(PENDING, sort_key(&now, &message.id), &message.id)?;
            }
            Ok(recovered)
        })
    }
}

impl DeadLetter for MessageQueue {
    /// Mark the message failed and add it to the dead-letter index. The main
    /// record is written here, so callers must not `update` afterwards.
    fn move_to_dead_letter(&self, message: &mut Message) -> Result<(), Error> {
        message.status = MessageStatus::Failed;
        message.updated_at = Utc::now();
        self.kv.update(|txn| {
            txn.put(MESSAGES, &message.id, serde_json::to_vec(message)?)?;
            txn.put(
                DEAD_LETTER,
                sort_key(&message.updated_at, &message.id),
                &message.id,
            )?;
            Ok(())
        })
    }

    fn list_dead_letter(&self, limit: usize, offset: usize) -> Result<Vec<Message>, Error> {
        let mut messages = Vec::new();
        for entry in self.kv.iter(DEAD_LETTER)? {
            let (_, value) = entry?;
            let id = String::from_utf8_lossy(&value).into_owned();
            if let Some(raw) = self.kv.get(MESSAGES, &id)? {
                messages.push(serde_json::from_slice(&raw)?);
            }
        }
        Ok(messages.into_iter().skip(offset).take(limit).collect())
    }

    fn get_dead_letter(&self, id: &str) -> Result<Option<Message>, Error> {
        Ok(self
            .get(id)?
            .filter(|message| message.status == MessageStatus::Failed))
    }

    /// Hand a dead letter back to the pipeline: retry budget reset, error
    /// cleared, re-inserted into pending.
    fn retry_dead_letter(&self, id: &str) -> Result<(), Error> {
        self.kv.update(|txn| {
            let raw = txn
                .get(MESSAGES, id)?
                .ok_or(Error::NotFound("dead letter message"))?;
            let mut message: Message = serde_json::from_slice(&raw)?;

            txn.delete(DEAD_LETTER, sort_key(&message.updated_at, id))?;

            message.status = MessageStatus::Pending;
            message.retry_count = 0;
            message.last_error.clear();
            message.next_retry_at = None;
            message.updated_at = Utc::now();

            txn.put(MESSAGES, id, serde_json::to_vec(&message)?)?;
            txn.put(PENDING, sort_key(&message.updated_at, id), id)?;
            Ok(())
        })
    }

    fn delete_dead_letter(&self, id: &str) -> Result<(), Error> {
        self.kv.update(|txn| {
            if let Some(raw) = txn.get(MESSAGES, id)? {
                if let Ok(message) = serde_json::from_slice::<Message>(&raw) {
                    txn.delete(DEAD_LETTER, sort_key(&message.updated_at, id))?;
                }
                txn.delete(MESSAGES, id)?;
            }
            Ok(())
        })
    }
}
