//! In-memory credential store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{validate_entry, Artifact, CredentialStore, Record, RecordDomain, StoreError, StoreLock};
use crate::tenant::Tenant;

#[derive(Debug, Default)]
struct Contents {
    records: BTreeMap<RecordDomain, Record>,
    artifacts: BTreeMap<Artifact, Vec<u8>>,
}

/// Credential store kept entirely in memory. Nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    contents: Arc<Mutex<Contents>>,
    locked: Arc<AtomicBool>,
    read_only: Arc<AtomicBool>,
    failing_writes: Arc<AtomicBool>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an infrastructure record.
    #[must_use]
    pub fn with_infrastructure(entries: &[(&str, &str)]) -> Self {
        let store = Self::new();
        let record = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        store
            .contents()
            .records
            .insert(RecordDomain::Infrastructure, record);
        store
    }

    /// Number of successful record and artifact writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make preflight checks and writes fail.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Make writes fail while preflight checks still pass.
    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) || self.failing_writes.load(Ordering::SeqCst) {
            return Err(denied());
        }
        Ok(())
    }

    fn contents(&self) -> MutexGuard<'_, Contents> {
        self.contents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn count_write(&self) {
        *self.writes.lock().unwrap_or_else(std::sync::PoisonError::into_inner) += 1;
    }
}

fn denied() -> StoreError {
    StoreError::Io {
        path: "memory".into(),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "store is read-only"),
    }
}

impl CredentialStore for MemoryStore {
    fn read_record(&self, domain: &RecordDomain) -> Result<Option<Record>, StoreError> {
        Ok(self.contents().records.get(domain).cloned())
    }

    fn write_record(&self, domain: &RecordDomain, record: &Record) -> Result<(), StoreError> {
        for (key, value) in record {
            validate_entry(key, value)?;
        }
        self.check_writable()?;
        self.contents()
            .records
            .insert(domain.clone(), record.clone());
        self.count_write();
        Ok(())
    }

    fn read_artifact(&self, artifact: &Artifact) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.contents().artifacts.get(artifact).cloned())
    }

    fn write_artifact(&self, artifact: &Artifact, contents: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        self.contents()
            .artifacts
            .insert(artifact.clone(), contents.to_vec());
        self.count_write();
        Ok(())
    }

    fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        Ok(self
            .contents()
            .records
            .keys()
            .filter_map(|domain| match domain {
                RecordDomain::Tenant(tenant) => Some(tenant.clone()),
                RecordDomain::Infrastructure => None,
            })
            .collect())
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Locked {
                path: "memory".into(),
                holder: std::process::id().to_string(),
            });
        }
        let locked = Arc::clone(&self.locked);
        Ok(StoreLock::new(move || locked.store(false, Ordering::SeqCst)))
    }

    fn preflight(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(denied());
        }
        Ok(())
    }
}
