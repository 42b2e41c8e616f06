//! Dead letter storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use uno_core::{DlqError, DlqResult, RecordId};
use uno_events::{DeadLetterReason, DeadLetterRecord};

/// Callback applied to a record inside [`DeadLetterStore::update`].
///
/// `FnMut` rather than `FnOnce`: a backend using optimistic concurrency may
/// re-run it against a fresh copy after a conflict.
pub type Mutator<'a> = &'a mut (dyn FnMut(&mut DeadLetterRecord) + Send);

/// Dead letter store abstraction.
///
/// Every operation is atomic with respect to a single record. Records handed
/// out are snapshots; the only way to change a stored record is `update`.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Persist a new record. Fails with `DuplicateRecord` if the id exists.
    async fn add(&self, record: DeadLetterRecord) -> DlqResult<()>;

    async fn get(&self, id: RecordId) -> DlqResult<Option<DeadLetterRecord>>;

    /// Records matching `filter`, oldest first (ties broken by id).
    async fn list(&self, filter: &RecordFilter) -> DlqResult<Vec<DeadLetterRecord>>;

    /// Read-modify-write one record and return the stored result.
    async fn update(&self, id: RecordId, mutator: Mutator<'_>) -> DlqResult<DeadLetterRecord>;

    /// Delete a record. Returns `false` if it was already gone.
    async fn remove(&self, id: RecordId) -> DlqResult<bool>;

    /// Delete everything, returning how many records were removed.
    async fn clear(&self) -> DlqResult<usize>;

    async fn len(&self) -> DlqResult<usize>;
}

#[async_trait]
impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    async fn add(&self, record: DeadLetterRecord) -> DlqResult<()> {
        (**self).add(record).await
    }

    async fn get(&self, id: RecordId) -> DlqResult<Option<DeadLetterRecord>> {
        (**self).get(id).await
    }

    async fn list(&self, filter: &RecordFilter) -> DlqResult<Vec<DeadLetterRecord>> {
        (**self).list(filter).await
    }

    async fn update(&self, id: RecordId, mutator: Mutator<'_>) -> DlqResult<DeadLetterRecord> {
        (**self).update(id, mutator).await
    }

    async fn remove(&self, id: RecordId) -> DlqResult<bool> {
        (**self).remove(id).await
    }

    async fn clear(&self) -> DlqResult<usize> {
        (**self).clear().await
    }

    async fn len(&self) -> DlqResult<usize> {
        (**self).len().await
    }
}

/// Selection criteria for [`DeadLetterStore::list`]. Empty filter = everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub limit: Option<usize>,
    pub reason: Option<DeadLetterReason>,
    pub subscription_id: Option<String>,
    /// `Some(true)` = only quarantined, `Some(false)` = only not quarantined.
    pub quarantined: Option<bool>,
    /// Only records a sweep at this instant would pick up.
    pub due_at: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn due_at(at: DateTime<Utc>) -> Self {
        Self {
            due_at: Some(at),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_reason(mut self, reason: DeadLetterReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_subscription_id(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_quarantined(mut self, quarantined: bool) -> Self {
        self.quarantined = Some(quarantined);
        self
    }

    pub fn matches(&self, record: &DeadLetterRecord) -> bool {
        self.reason.is_none_or(|r| record.reason() == r)
            && self
                .subscription_id
                .as_deref()
                .is_none_or(|s| record.subscription_id() == Some(s))
            && self
                .quarantined
                .is_none_or(|q| record.is_quarantined() == q)
            && self.due_at.is_none_or(|at| record.is_due(at))
    }

    /// Filter, order and truncate an arbitrary set of records.
    pub fn apply<'a>(
        &self,
        records: impl IntoIterator<Item = &'a DeadLetterRecord>,
    ) -> Vec<DeadLetterRecord> {
        let mut result: Vec<_> = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.timestamp(), r.id()));
        if let Some(limit) = self.limit {
            result.truncate(limit);
        }
        result
    }
}

/// In-memory dead letter store for tests/dev and as the base of
/// [`FileDeadLetterStore`](super::file_store::FileDeadLetterStore).
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<HashMap<RecordId, DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a store, e.g. from a snapshot. Later duplicates win.
    pub fn from_records(records: impl IntoIterator<Item = DeadLetterRecord>) -> Self {
        let records = records.into_iter().map(|r| (r.id(), r)).collect();
        Self {
            records: RwLock::new(records),
        }
    }

    fn read(&self) -> DlqResult<RwLockReadGuard<'_, HashMap<RecordId, DeadLetterRecord>>> {
        self.records
            .read()
            .map_err(|_| DlqError::unavailable("dead letter store lock poisoned"))
    }

    fn write(&self) -> DlqResult<RwLockWriteGuard<'_, HashMap<RecordId, DeadLetterRecord>>> {
        self.records
            .write()
            .map_err(|_| DlqError::unavailable("dead letter store lock poisoned"))
    }

    /// A copy of the whole map, for stores that stage changes before
    /// committing them.
    pub(crate) fn records(&self) -> DlqResult<HashMap<RecordId, DeadLetterRecord>> {
        Ok(self.read()?.clone())
    }

    pub(crate) fn replace(&self, records: HashMap<RecordId, DeadLetterRecord>) -> DlqResult<()> {
        *self.write()? = records;
        Ok(())
    }

    fn add_sync(&self, record: DeadLetterRecord) -> DlqResult<()> {
        let mut records = self.write()?;
        if records.contains_key(&record.id()) {
            return Err(DlqError::DuplicateRecord(record.id()));
        }
        records.insert(record.id(), record);
        Ok(())
    }

    fn update_sync(
        &self,
        id: RecordId,
        mutator: Mutator<'_>,
    ) -> DlqResult<DeadLetterRecord> {
        let mut records = self.write()?;
        let record = records.get_mut(&id).ok_or(DlqError::RecordNotFound(id))?;
        mutator(record);
        Ok(record.clone())
    }

    fn remove_sync(&self, id: RecordId) -> DlqResult<bool> {
        Ok(self.write()?.remove(&id).is_some())
    }

    fn clear_sync(&self) -> DlqResult<usize> {
        let mut records = self.write()?;
        let removed = records.len();
        records.clear();
        Ok(removed)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn add(&self, record: DeadLetterRecord) -> DlqResult<()> {
        self.add_sync(record)
    }

    async fn get(&self, id: RecordId) -> DlqResult<Option<DeadLetterRecord>> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn list(&self, filter: &RecordFilter) -> DlqResult<Vec<DeadLetterRecord>> {
        let records = self.read()?;
        Ok(filter.apply(records.values()))
    }

    async fn update(&self, id: RecordId, mutator: Mutator<'_>) -> DlqResult<DeadLetterRecord> {
        self.update_sync(id, mutator)
    }

    async fn remove(&self, id: RecordId) -> DlqResult<bool> {
        self.remove_sync(id)
    }

    async fn clear(&self) -> DlqResult<usize> {
        self.clear_sync()
    }

    async fn len(&self) -> DlqResult<usize> {
        Ok(self.read()?.len())
    }
}
