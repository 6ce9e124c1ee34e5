use crate::error::StoreError;
use crate::job::JobRecord;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

const INDEX_KEY: &str = "jobs:index";
const SEQUENCE_KEY: &str = "jobs:seq";
const VERSION_KEY: &str = "jobs:version";
const SUCCEEDED_KEY: &str = "jobs:succeeded";
const FAILED_KEY: &str = "jobs:failed";

fn job_key(id: Uuid) -> String {
    format!("jobs:{}", id)
}

#[derive(Serialize, Deserialize, Default)]
struct Stored {
    entries: HashMap<String, Vec<u8>>,
}

struct KvFile {
    path: PathBuf,
    data: Stored,
}

impl KvFile {
    fn open_or_create(path: impl AsRef<Path>, namespace: &str) -> Result<Self, StoreError> {
        let mut base = path.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|_| StoreError::Io)?;
        base.push(format!("{}-jobs.json", namespace));
        let data = if base.exists() {
            let content = fs::read_to_string(&base).map_err(|_| StoreError::Io)?;
            serde_json::from_str(&content).map_err(|_| StoreError::Codec)?
        } else {
            Stored::default()
        };
        Ok(Self { path: base, data })
    }

    fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.data.entries.get(key)
    }

    fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.entries.insert(key.to_string(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.data.entries.remove(key);
        self.flush()
    }

    fn flush(&self) -> Result<(), StoreError> {
        let serialized =
            serde_json::to_string_pretty(&self.data).map_err(|_| StoreError::Codec)?;
        fs::write(&self.path, serialized).map_err(|_| StoreError::Io)?;
        Ok(())
    }
}

/// Durable job queue state. Pending records live under per-job keys with a
/// shared index; terminal outcomes are appended to bookkeeping sets so tests
/// and diagnostics can see what finished and how.
pub struct JobStorage {
    kv: Mutex<KvFile>,
}

impl JobStorage {
    pub fn open(path: impl AsRef<Path>, namespace: &str) -> Result<Self, StoreError> {
        Ok(Self {
            kv: Mutex::new(KvFile::open_or_create(path, namespace)?),
        })
    }

    /// First insert of a record: allocates its enqueue sequence number under
    /// the store lock, so queue order is a property of the store rather than
    /// of enqueue timing.
    pub async fn insert_job(&self, record: &mut JobRecord) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        if record.sequence == 0 {
            let next: u64 = kv
                .get(SEQUENCE_KEY)
                .and_then(|blob| serde_json::from_slice::<u64>(blob).ok())
                .unwrap_or(0)
                + 1;
            let blob = serde_json::to_vec(&next).map_err(|_| StoreError::Codec)?;
            kv.put(SEQUENCE_KEY, blob)?;
            record.sequence = next;
        }
        store_record(&mut kv, record)
    }

    pub async fn put_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        store_record(&mut kv, record)
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        kv.remove(&job_key(id))?;
        let mut index = read_index(&kv);
        if index.remove(&id) {
            write_index(&mut kv, &index)?;
        }
        Ok(())
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let kv = self.kv.lock().await;
        match kv.get(&job_key(id)) {
            Some(blob) => Ok(Some(
                serde_json::from_slice(blob).map_err(|_| StoreError::Codec)?,
            )),
            None => Ok(None),
        }
    }

    /// Loads every pending record. Entries that no longer decode are pruned
    /// rather than poisoning startup.
    pub async fn load_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut kv = self.kv.lock().await;
        let index = read_index(&kv);
        let mut records = Vec::with_capacity(index.len());
        let mut pruned = HashSet::new();
        for id in index.iter() {
            match kv.get(&job_key(*id)) {
                Some(blob) => match serde_json::from_slice::<JobRecord>(blob) {
                    Ok(record) => records.push(record),
                    Err(_) => {
                        warn!(job = %id, "pruning undecodable job record");
                        pruned.insert(*id);
                    }
                },
                None => {
                    pruned.insert(*id);
                }
            }
        }
        if !pruned.is_empty() {
            let kept: HashSet<Uuid> = index.difference(&pruned).copied().collect();
            for id in pruned.iter() {
                kv.remove(&job_key(*id))?;
            }
            write_index(&mut kv, &kept)?;
        }
        records.sort_by_key(|record| (record.sequence, record.created_at_ms));
        Ok(records)
    }

    pub async fn replace_all(&self, records: &[JobRecord]) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let old = read_index(&kv);
        for id in old.iter() {
            kv.remove(&job_key(*id))?;
        }
        let mut index = HashSet::new();
        for record in records {
            let blob = serde_json::to_vec(record).map_err(|_| StoreError::Codec)?;
            kv.put(&job_key(record.id), blob)?;
            index.insert(record.id);
        }
        write_index(&mut kv, &index)
    }

    pub async fn mark_succeeded(&self, id: Uuid) -> Result<(), StoreError> {
        self.append_outcome(SUCCEEDED_KEY, id).await
    }

    pub async fn mark_failed(&self, id: Uuid) -> Result<(), StoreError> {
        self.append_outcome(FAILED_KEY, id).await
    }

    pub async fn succeeded(&self) -> Vec<Uuid> {
        self.read_outcomes(SUCCEEDED_KEY).await
    }

    pub async fn failed(&self) -> Vec<Uuid> {
        self.read_outcomes(FAILED_KEY).await
    }

    pub async fn version(&self) -> Result<u32, StoreError> {
        let kv = self.kv.lock().await;
        match kv.get(VERSION_KEY) {
            Some(blob) => serde_json::from_slice(blob).map_err(|_| StoreError::Codec),
            None => Ok(0),
        }
    }

    pub async fn set_version(&self, version: u32) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let blob = serde_json::to_vec(&version).map_err(|_| StoreError::Codec)?;
        kv.put(VERSION_KEY, blob)
    }

    async fn append_outcome(&self, key: &str, id: Uuid) -> Result<(), StoreError> {
        let mut kv = self.kv.lock().await;
        let mut ids: Vec<Uuid> = match kv.get(key) {
            Some(blob) => serde_json::from_slice(blob).map_err(|_| StoreError::Codec)?,
            None => Vec::new(),
        };
        ids.push(id);
        let blob = serde_json::to_vec(&ids).map_err(|_| StoreError::Codec)?;
        kv.put(key, blob)
    }

    async fn read_outcomes(&self, key: &str) -> Vec<Uuid> {
        let kv = self.kv.lock().await;
        kv.get(key)
            .and_then(|blob| serde_json::from_slice(blob).ok())
            .unwrap_or_default()
    }
}

fn store_record(kv: &mut KvFile, record: &JobRecord) -> Result<(), StoreError> {
    let blob = serde_json::to_vec(record).map_err(|_| StoreError::Codec)?;
    kv.put(&job_key(record.id), blob)?;
    let mut index = read_index(kv);
    if index.insert(record.id) {
        write_index(kv, &index)?;
    }
    Ok(())
}

fn read_index(kv: &KvFile) -> HashSet<Uuid> {
    kv.get(INDEX_KEY)
        .and_then(|blob| serde_json::from_slice(blob).ok())
        .unwrap_or_default()
}

fn write_index(kv: &mut KvFile, index: &HashSet<Uuid>) -> Result<(), StoreError> {
    let blob = serde_json::to_vec(index).map_err(|_| StoreError::Codec)?;
    kv.put(INDEX_KEY, blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, Parameters};

    fn record() -> JobRecord {
        JobRecord::new(JobKind::GroupSend, serde_json::json!({}), Parameters::default())
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = record();
        {
            let storage = JobStorage::open(dir.path(), "test").expect("open");
            storage.put_job(&first).await.expect("put");
        }
        let storage = JobStorage::open(dir.path(), "test").expect("reopen");
        let loaded = storage.load_jobs().await.expect("load");
        assert_eq!(loaded, vec![first]);
    }

    #[tokio::test]
    async fn delete_removes_record_and_index_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::open(dir.path(), "test").expect("open");
        let job = record();
        storage.put_job(&job).await.expect("put");
        storage.delete_job(job.id).await.expect("delete");
        assert!(storage.load_jobs().await.expect("load").is_empty());
        assert_eq!(storage.job(job.id).await.expect("get"), None);
    }

    #[tokio::test]
    async fn load_is_ordered_by_insert_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::open(dir.path(), "test").expect("open");
        // Identical timestamps must not make the order arbitrary, and a
        // later timestamp must not jump the queue.
        let mut first = record();
        first.created_at_ms = 9;
        let mut second = record();
        second.created_at_ms = 9;
        let mut third = record();
        third.created_at_ms = 5;
        storage.insert_job(&mut first).await.expect("insert");
        storage.insert_job(&mut second).await.expect("insert");
        storage.insert_job(&mut third).await.expect("insert");
        assert_eq!((first.sequence, second.sequence, third.sequence), (1, 2, 3));
        let loaded = storage.load_jobs().await.expect("load");
        assert_eq!(loaded, vec![first, second, third]);
    }

    #[tokio::test]
    async fn sequence_counter_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut first = record();
        {
            let storage = JobStorage::open(dir.path(), "test").expect("open");
            storage.insert_job(&mut first).await.expect("insert");
        }
        let storage = JobStorage::open(dir.path(), "test").expect("reopen");
        let mut second = record();
        storage.insert_job(&mut second).await.expect("insert");
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn updates_keep_the_assigned_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::open(dir.path(), "test").expect("open");
        let mut job = record();
        storage.insert_job(&mut job).await.expect("insert");
        let assigned = job.sequence;
        job.attempts = 3;
        storage.put_job(&job).await.expect("update");
        storage.insert_job(&mut job).await.expect("reinsert");
        assert_eq!(job.sequence, assigned);
        let loaded = storage.load_jobs().await.expect("load");
        assert_eq!(loaded[0].sequence, assigned);
        assert_eq!(loaded[0].attempts, 3);
    }

    #[tokio::test]
    async fn undecodable_records_are_pruned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::open(dir.path(), "test").expect("open");
        let good = record();
        storage.put_job(&good).await.expect("put");
        let bad_id = Uuid::new_v4();
        {
            let mut kv = storage.kv.lock().await;
            kv.put(&job_key(bad_id), b"not json".to_vec()).expect("put");
            let mut index = read_index(&kv);
            index.insert(bad_id);
            write_index(&mut kv, &index).expect("index");
        }
        let loaded = storage.load_jobs().await.expect("load");
        assert_eq!(loaded, vec![good]);
        // A second load sees a clean index.
        assert_eq!(storage.load_jobs().await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn outcome_sets_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = JobStorage::open(dir.path(), "test").expect("open");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        storage.mark_succeeded(a).await.expect("mark");
        storage.mark_failed(b).await.expect("mark");
        assert_eq!(storage.succeeded().await, vec![a]);
        assert_eq!(storage.failed().await, vec![b]);
    }
}
