//! Test doubles: a minimal mock-up for hickory_resolver and a scriptable
//! sender for driving the processor and the interposer.

use crate::{
    delivery::sender::{MessageSender, SendError},
    models::Message,
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

#[derive(Clone, Default)]
pub struct Resolver {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    records: Mutex<Vec<(String, u16)>>,
    queries: AtomicUsize,
    failure: Mutex<Option<String>>,
}

impl Resolver {
    pub fn with_records(records: &[(&str, u16)]) -> Self {
        let resolver = Self::default();
        resolver.set_records(records);
        resolver
    }

    pub fn set_records(&self, records: &[(&str, u16)]) {
        *self.inner.records.lock().unwrap() = records
            .iter()
            .map(|(host, priority)| (host.to_string(), *priority))
            .collect();
    }

    pub fn fail_with(&self, message: &str) {
        *self.inner.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn queries(&self) -> usize {
        self.inner.queries.load(Ordering::SeqCst)
    }

    pub async fn mx_lookup(
        &self,
        _name: impl AsRef<str>,
    ) -> Result<MxLookup, hickory_resolver::ResolveError> {
        self.inner.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.inner.failure.lock().unwrap().clone() {
            return Err(hickory_resolver::ResolveError::from(message));
        }
        Ok(MxLookup {
            records: self.inner.records.lock().unwrap().clone(),
        })
    }
}

pub struct MxLookup {
    records: Vec<(String, u16)>,
}

impl MxLookup {
    pub fn iter(&self) -> impl Iterator<Item = Mx> + '_ {
        self.records.iter().map(|(host, priority)| Mx {
            host: host.clone(),
            priority: *priority,
        })
    }
}

pub struct Mx {
    host: String,
    priority: u16,
}

impl Mx {
    pub fn preference(&self) -> u16 {
        self.priority
    }

    pub fn exchange(&self) -> Name {
        Name(self.host.clone())
    }
}

pub struct Name(String);

impl Name {
    pub fn to_utf8(&self) -> String {
        self.0.clone()
    }
}

/// Sender whose outcomes are scripted up front; defaults to success once the
/// script runs out. Records every message it was handed.
#[derive(Default)]
pub struct ScriptedSender {
    results: Mutex<VecDeque<Result<(), SendError>>>,
    calls: Mutex<Vec<Message>>,
}

impl ScriptedSender {
    pub fn always_ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_results(results: Vec<Result<(), SendError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Message> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageSender for ScriptedSender {
    async fn send(&self, message: &Message) -> Result<(), SendError> {
        self.calls.lock().unwrap().push(message.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}
