//! File-backed credential store.
//!
//! Layout under the root directory:
//!
//! ```text
//! infrastructure.env            KEY=value, infrastructure-wide credentials
//! tenants/<tenant>.env          KEY=value, one file per onboarded tenant
//! kubeconfigs/<t>-<e>.kubeconfig rendered CI/CD client configuration
//! artifacts/cluster-ca.crt      cluster certificate authority
//! .lock                         flock target, holds the owner's pid
//! ```
//!
//! Directories are `0700` and files `0600`. Every write goes through a temp
//! file in the same directory followed by fsync and rename, so a record is
//! either fully old or fully new.

use std::fs::{self, OpenOptions, TryLockError};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{validate_entry, Artifact, CredentialStore, Record, RecordDomain, StoreError, StoreLock};
use crate::tenant::Tenant;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;
const INFRASTRUCTURE_FILE: &str = "infrastructure.env";
const TENANTS_DIR: &str = "tenants";
const KUBECONFIGS_DIR: &str = "kubeconfigs";
const ARTIFACTS_DIR: &str = "artifacts";
const LOCK_FILE: &str = ".lock";

/// Credential store rooted at a private directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open the store, creating the directory tree if it does not exist.
    ///
    /// Existing directories are tightened to owner-only access.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created or secured.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        for dir in [
            store.root.clone(),
            store.root.join(TENANTS_DIR),
            store.root.join(KUBECONFIGS_DIR),
            store.root.join(ARTIFACTS_DIR),
        ] {
            ensure_private_dir(&dir)?;
        }
        debug!(root = %store.root.display(), "Opened credential store");
        Ok(store)
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a record file.
    #[must_use]
    pub fn record_path(&self, domain: &RecordDomain) -> PathBuf {
        match domain {
            RecordDomain::Infrastructure => self.root.join(INFRASTRUCTURE_FILE),
            RecordDomain::Tenant(tenant) => {
                self.root.join(TENANTS_DIR).join(format!("{tenant}.env"))
            }
        }
    }

    /// Path of an artifact file.
    #[must_use]
    pub fn artifact_path(&self, artifact: &Artifact) -> PathBuf {
        let dir = match artifact {
            Artifact::ClusterCa => ARTIFACTS_DIR,
            Artifact::Kubeconfig { .. } => KUBECONFIGS_DIR,
        };
        self.root.join(dir).join(artifact.file_name())
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }
}

impl CredentialStore for FileStore {
    fn read_record(&self, domain: &RecordDomain) -> Result<Option<Record>, StoreError> {
        let path = self.record_path(domain);
        let Some(bytes) = read_private(&path)? else {
            return Ok(None);
        };
        let content = String::from_utf8(bytes).map_err(|_| StoreError::Malformed {
            path: path.clone(),
            line: 0,
            message: "record is not valid UTF-8".to_string(),
        })?;
        parse_record(&path, &content).map(Some)
    }

    fn write_record(&self, domain: &RecordDomain, record: &Record) -> Result<(), StoreError> {
        for (key, value) in record {
            validate_entry(key, value)?;
        }
        let path = self.record_path(domain);
        write_atomic(&path, render_record(record).as_bytes())?;
        debug!(domain = %domain, keys = record.len(), "Wrote credential record");
        Ok(())
    }

    fn read_artifact(&self, artifact: &Artifact) -> Result<Option<Vec<u8>>, StoreError> {
        read_private(&self.artifact_path(artifact))
    }

    fn write_artifact(&self, artifact: &Artifact, contents: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.artifact_path(artifact), contents)?;
        debug!(artifact = %artifact, bytes = contents.len(), "Wrote credential artifact");
        Ok(())
    }

    fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let dir = self.root.join(TENANTS_DIR);
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut tenants = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("env") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Tenant::new(stem) {
                Ok(tenant) => tenants.push(tenant),
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring stray tenant record"),
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        let path = self.lock_path();
        let io_err = |source| StoreError::Io {
            path: self.lock_path(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(FILE_MODE)
            .open(&path)
            .map_err(io_err)?;
        // Released by the kernel when the holder exits.
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(StoreError::Locked { path, holder });
            }
            Err(TryLockError::Error(source)) => return Err(io_err(source)),
        }

        // The pid is only for the error message of a contending run.
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        debug!(path = %path.display(), "Acquired credential store lock");

        Ok(StoreLock::new(move || {
            if let Err(e) = file.set_len(0) {
                warn!(path = %path.display(), error = %e, "Failed to clear credential store lock");
            }
            // Closing the descriptor releases the lock.
            drop(file);
        }))
    }

    fn preflight(&self) -> Result<(), StoreError> {
        tempfile::NamedTempFile::new_in(&self.root)
            .map(drop)
            .map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })
    }
}

/// Create `dir` if missing and restrict it to the owner.
fn ensure_private_dir(dir: &Path) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).map_err(io_err)?;
    let mode = fs::metadata(dir).map_err(io_err)?.permissions().mode() & 0o777;
    if mode != DIR_MODE {
        fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE)).map_err(io_err)?;
    }
    Ok(())
}

/// Read a store file, refusing files readable by group or others.
fn read_private(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(StoreError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }

    fs::read(path).map(Some).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with `contents` via temp file, fsync and rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(FILE_MODE))
        .map_err(io_err)?;
    tmp.write_all(contents).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    // Make the rename itself durable.
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

fn parse_record(path: &Path, content: &str) -> Result<Record, StoreError> {
    let mut record = Record::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(StoreError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
                message: "expected KEY=value".to_string(),
            });
        };
        record.insert(key.trim().to_string(), value.to_string());
    }
    Ok(record)
}

fn render_record(record: &Record) -> String {
    let mut out = String::from("# Managed by tenantctl. Do not edit while an operation is running.\n");
    for (key, value) in record {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{Environment, TenantEnvironment};

    fn open_temp() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_layout_is_owner_only() {
        let (_dir, store) = open_temp();
        assert_eq!(mode(store.root()), 0o700);
        assert_eq!(mode(&store.root().join(TENANTS_DIR)), 0o700);
        assert_eq!(mode(&store.root().join(KUBECONFIGS_DIR)), 0o700);

        let mut record = Record::new();
        record.insert("POSTGRES_ADMIN_PASSWORD".into(), "secret".into());
        store
            .write_record(&RecordDomain::Infrastructure, &record)
            .unwrap();
        assert_eq!(mode(&store.record_path(&RecordDomain::Infrastructure)), 0o600);
    }

    #[test]
    fn test_record_round_trip_preserves_values() {
        let (_dir, store) = open_temp();
        let tenant = Tenant::new("acme").unwrap();
        let domain = RecordDomain::Tenant(tenant.clone());

        let mut record = Record::new();
        record.insert("ALPHA_DATABASE_PASSWORD".into(), "a=b==c".into());
        record.insert("PROD_DATABASE_PASSWORD".into(), "xyz".into());
        store.write_record(&domain, &record).unwrap();

        assert_eq!(store.read_record(&domain).unwrap(), Some(record));
        assert_eq!(store.list_tenants().unwrap(), vec![tenant]);
    }

    #[test]
    fn test_missing_record_is_none() {
        let (_dir, store) = open_temp();
        assert!(store
            .read_record(&RecordDomain::Infrastructure)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_record_is_rejected() {
        let (_dir, store) = open_temp();
        let path = store.record_path(&RecordDomain::Infrastructure);
        write_atomic(&path, b"GOOD=1\nnot a pair\n").unwrap();

        let err = store.read_record(&RecordDomain::Infrastructure).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_world_readable_file_is_refused() {
        let (_dir, store) = open_temp();
        let path = store.record_path(&RecordDomain::Infrastructure);
        write_atomic(&path, b"KEY=value\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let err = store.read_record(&RecordDomain::Infrastructure).unwrap_err();
        assert!(matches!(err, StoreError::InsecurePermissions { .. }));
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let (_dir, store) = open_temp();

        let guard = store.lock().unwrap();
        let err = store.lock().unwrap_err();
        assert!(matches!(err, StoreError::Locked { ref holder, .. } if *holder == std::process::id().to_string()));

        drop(guard);
        assert!(store.lock().is_ok());
    }

    #[test]
    fn test_lock_left_by_dead_process_is_taken_over() {
        let (dir, store) = open_temp();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, "4194304\n").unwrap();

        let _guard = store.lock().unwrap();

        let holder = fs::read_to_string(&path).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_artifacts_are_private() {
        let (_dir, store) = open_temp();
        let tenant = Tenant::new("acme").unwrap();
        let artifact = Artifact::kubeconfig(&TenantEnvironment::new(&tenant, Environment::Alpha));

        store.write_artifact(&artifact, b"apiVersion: v1\n").unwrap();
        assert_eq!(
            store.read_artifact(&artifact).unwrap().as_deref(),
            Some(&b"apiVersion: v1\n"[..])
        );
        assert_eq!(mode(&store.artifact_path(&artifact)), 0o600);
        assert!(store.read_artifact(&Artifact::ClusterCa).unwrap().is_none());
    }

    #[test]
    fn test_preflight_leaves_no_files_behind() {
        let (_dir, store) = open_temp();
        store.preflight().unwrap();
        let entries: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .collect();
        assert!(entries.is_empty());
    }
}
