//! Snapshot-file dead letter store.
//!
//! Keeps the working set in an [`InMemoryDeadLetterStore`] and rewrites a
//! JSON snapshot on every mutation. Each change is staged on a copy, the
//! snapshot is written to a sibling temp file and renamed into place, and
//! only then is the change made visible in memory. A failed write leaves
//! both memory and disk at the previous state. Meant for single-process
//! tools such as the operator CLI, not for sharing between processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error};

use uno_core::{DlqError, DlqResult, RecordId};
use uno_events::DeadLetterRecord;

use super::store::{DeadLetterStore, InMemoryDeadLetterStore, Mutator, RecordFilter};

type Records = HashMap<RecordId, DeadLetterRecord>;

#[derive(Debug)]
pub struct FileDeadLetterStore {
    path: PathBuf,
    inner: InMemoryDeadLetterStore,
    // Held from staging to commit; one writer at a time.
    persist: Mutex<()>,
}

impl FileDeadLetterStore {
    /// Load `path`, or start empty if the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> DlqResult<Self> {
        let path = path.into();

        let records: Vec<DeadLetterRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(DlqError::unavailable(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };

        debug!(path = %path.display(), records = records.len(), "opened dead letter snapshot");

        Ok(Self {
            path,
            inner: InMemoryDeadLetterStore::from_records(records),
            persist: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the records, write that copy, then
    /// commit it. `change` returning `Ok((_, false))` means nothing changed
    /// and nothing is written.
    async fn write_through<T, F>(&self, change: F) -> DlqResult<T>
    where
        T: Send,
        F: FnOnce(&mut Records) -> DlqResult<(T, bool)> + Send,
    {
        let _guard = self.persist.lock().await;

        let mut staged = self.inner.records()?;
        let (result, changed) = change(&mut staged)?;
        if !changed {
            return Ok(result);
        }

        self.write_snapshot(&staged).await?;
        self.inner.replace(staged)?;
        Ok(result)
    }

    async fn write_snapshot(&self, records: &Records) -> DlqResult<()> {
        let ordered = RecordFilter::all().apply(records.values());
        let bytes = serde_json::to_vec_pretty(&ordered)?;

        let tmp = self.path.with_extension("json.tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write.await.map_err(|e| {
            error!(path = %self.path.display(), error = %e, "failed to write dead letter snapshot");
            DlqError::unavailable(format!("cannot write {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn add(&self, record: DeadLetterRecord) -> DlqResult<()> {
        self.write_through(move |records| {
            if records.contains_key(&record.id()) {
                return Err(DlqError::DuplicateRecord(record.id()));
            }
            records.insert(record.id(), record);
            Ok(((), true))
        })
        .await
    }

    async fn get(&self, id: RecordId) -> DlqResult<Option<DeadLetterRecord>> {
        self.inner.get(id).await
    }

    async fn list(&self, filter: &RecordFilter) -> DlqResult<Vec<DeadLetterRecord>> {
        self.inner.list(filter).await
    }

    async fn update(&self, id: RecordId, mutator: Mutator<'_>) -> DlqResult<DeadLetterRecord> {
        self.write_through(move |records| {
            let record = records.get_mut(&id).ok_or(DlqError::RecordNotFound(id))?;
            mutator(record);
            Ok((record.clone(), true))
        })
        .await
    }

    async fn remove(&self, id: RecordId) -> DlqResult<bool> {
        self.write_through(move |records| {
            let removed = records.remove(&id).is_some();
            Ok((removed, removed))
        })
        .await
    }

    async fn clear(&self) -> DlqResult<usize> {
        self.write_through(|records| {
            let removed = records.len();
            records.clear();
            Ok((removed, true))
        })
        .await
    }

    async fn len(&self) -> DlqResult<usize> {
        self.inner.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uno_events::{DeadLetterReason, NewDeadLetter};

    fn record() -> DeadLetterRecord {
        DeadLetterRecord::new(
            NewDeadLetter::new(json!({"order_id": "123"}), DeadLetterReason::HandlerFailed)
                .with_error("boom")
                .with_subscription_id("payments"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeadLetterStore::open(dir.path().join("dlq.json"))
            .await
            .unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mutations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.json");

        let first = record();
        let second = record();
        {
            let store = FileDeadLetterStore::open(&path).await.unwrap();
            store.add(first.clone()).await.unwrap();
            store.add(second.clone()).await.unwrap();
            store
                .update(first.id(), &mut |r| {
                    r.record_failure("retry failed", Utc::now());
                })
                .await
                .unwrap();
            store.remove(second.id()).await.unwrap();
        }

        let reopened = FileDeadLetterStore::open(&path).await.unwrap();
        let records = reopened.list(&RecordFilter::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), first.id());
        assert_eq!(records[0].attempt_count(), 2);
        assert_eq!(records[0].event_data(), first.event_data());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result = FileDeadLetterStore::open(&path).await;
        assert!(matches!(result, Err(DlqError::Serialization(_))));
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.json");
        let store = FileDeadLetterStore::open(&path).await.unwrap();
        let kept = record();
        store.add(kept.clone()).await.unwrap();

        std::fs::remove_dir_all(dir.path()).unwrap();

        let lost = record();
        assert!(matches!(
            store.add(lost.clone()).await,
            Err(DlqError::StoreUnavailable(_))
        ));
        assert!(store.get(lost.id()).await.unwrap().is_none());

        assert!(
            store
                .update(kept.id(), &mut |r| {
                    r.record_failure("retry failed", Utc::now());
                })
                .await
                .is_err()
        );
        assert_eq!(
            store.get(kept.id()).await.unwrap().unwrap().attempt_count(),
            1
        );

        assert!(store.remove(kept.id()).await.is_err());
        assert!(store.clear().await.is_err());
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDeadLetterStore::open(dir.path().join("dlq.json"))
            .await
            .unwrap();
        let r = record();
        store.add(r.clone()).await.unwrap();

        assert_eq!(
            store.add(r.clone()).await,
            Err(DlqError::DuplicateRecord(r.id()))
        );
        assert_eq!(store.len().await.unwrap(), 1);
    }
}
