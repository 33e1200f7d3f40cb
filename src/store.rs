use crate::models::Error;
use rocksdb::{DB, IteratorMode, Options, WriteBatch};
use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};

/// Main message records, keyed by message id.
pub const MESSAGES: &str = "messages";
/// Dispatch index for messages that were never attempted, keyed by
/// `sort_key(created_at, id)`.
pub const PENDING: &str = "pending";
/// Dispatch index for messages awaiting a retry, keyed by
/// `sort_key(next_retry_at, id)`.
pub const DEFERRED: &str = "deferred";
/// Index over permanently failed messages kept for inspection, keyed by
/// `sort_key(moved_at, id)`.
pub const DEAD_LETTER: &str = "dead_letter";
/// Persisted rate counters, keyed by `<level>:<key>`.
pub const RATE_LIMITS: &str = "rate_limits";
/// Captured sandbox/redirect/bcc copies, keyed by `sort_key(captured_at, id)`.
pub const SANDBOX: &str = "sandbox";

const BUCKETS: [&str; 6] = [MESSAGES, PENDING, DEFERRED, DEAD_LETTER, RATE_LIMITS, SANDBOX];

/// Embedded key-value store with named buckets.
///
/// Buckets are rocksdb column families. Mutations go through [`Kv::update`],
/// which stages every write on a single `WriteBatch` and commits it while
/// holding the writer mutex: concurrent updates are serialised and each
/// transaction is all-or-nothing. Readers never take the mutex; iterators are
/// point-in-time views.
pub struct Kv {
    db: DB,
    writer: Mutex<()>,
}

/// A single write transaction. Reads observe the committed state, not the
/// writes staged on this transaction.
pub struct WriteTxn<'a> {
    db: &'a DB,
    batch: WriteBatch,
}

impl Kv {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let db = DB::open_cf(&options, path, BUCKETS)?;

        Ok(Self {
            db,
            writer: Mutex::new(()),
        })
    }

    fn bucket<'a>(db: &'a DB, name: &'static str) -> Result<&'a rocksdb::ColumnFamily, Error> {
        db.cf_handle(name).ok_or(Error::UnknownBucket(name))
    }

    pub fn get(&self, bucket: &'static str, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let cf = Self::bucket(&self.db, bucket)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    /// Ordered cursor over a bucket. Keys come back in lexicographic order,
    /// which the queue indexes exploit for chronological scans.
    pub fn iter(
        &self,
        bucket: &'static str,
    ) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), Error>> + '_, Error> {
        let cf = Self::bucket(&self.db, bucket)?;
        Ok(self
            .db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|entry| entry.map_err(Error::from)))
    }

    /// Run `f` as a single atomic transaction: all staged writes commit
    /// together, or none do. Only one update runs at a time.
    pub fn update<T>(&self, f: impl FnOnce(&mut WriteTxn) -> Result<T, Error>) -> Result<T, Error> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut txn = WriteTxn {
            db: &self.db,
            batch: WriteBatch::default(),
        };
        let out = f(&mut txn)?;
        self.db.write(txn.batch)?;

        Ok(out)
    }
}

impl WriteTxn<'_> {
    pub fn get(&self, bucket: &'static str, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let cf = Kv::bucket(self.db, bucket)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    pub fn iter(
        &self,
        bucket: &'static str,
    ) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), Error>> + '_, Error> {
        let cf = Kv::bucket(self.db, bucket)?;
        Ok(self
            .db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|entry| entry.map_err(Error::from)))
    }

    pub fn put(
        &mut self,
        bucket: &'static str,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<(), Error> {
        let cf = Kv::bucket(self.db, bucket)?;
        self.batch.put_cf(cf, key, value);
        Ok(())
    }

    pub fn delete(&mut self, bucket: &'static str, key: impl AsRef<[u8]>) -> Result<(), Error> {
        let cf = Kv::bucket(self.db, bucket)?;
        self.batch.delete_cf(cf, key);
        Ok(())
    }
}
