//! Read-only access to stored secrets: artifact export and record display.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::store::{Artifact, CredentialStore, Record, RecordDomain};
use crate::tenant::{Environment, Tenant, TenantEnvironment};

const EXPORT_MODE: u32 = 0o600;

/// Owner to hand exported files to when running under sudo.
fn invoking_user() -> Option<(u32, u32)> {
    let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = std::env::var("SUDO_GID").ok()?.parse().ok()?;
    Some((uid, gid))
}

fn export_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProvisionError + '_ {
    move |source| ProvisionError::Export {
        path: path.to_path_buf(),
        source,
    }
}

/// Resolve the output path. A directory destination gets the artifact's file name.
fn resolve_destination(artifact: &Artifact, dest: &Path) -> PathBuf {
    if dest.is_dir() {
        dest.join(artifact.file_name())
    } else {
        dest.to_path_buf()
    }
}

fn refuse_symlink(path: &Path) -> Result<(), ProvisionError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(ProvisionError::Export {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "destination is a symbolic link",
            ),
        }),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(export_error(path)(e)),
    }
}

/// Copy one artifact out of the store. Returns the written path.
///
/// # Errors
///
/// Returns [`ProvisionError::ArtifactMissing`] if nothing is stored for the
/// artifact, or [`ProvisionError::Export`] if the destination cannot be written.
pub fn export_artifact(
    store: &dyn CredentialStore,
    artifact: &Artifact,
    dest: &Path,
) -> Result<PathBuf, ProvisionError> {
    let contents = store
        .read_artifact(artifact)?
        .ok_or_else(|| ProvisionError::ArtifactMissing(artifact.to_string()))?;

    let path = resolve_destination(artifact, dest);
    refuse_symlink(&path)?;

    // Written beside the destination and renamed over it, so a link planted
    // after the check is replaced rather than followed.
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(export_error(&path))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(EXPORT_MODE))
        .map_err(export_error(&path))?;
    tmp.write_all(&contents).map_err(export_error(&path))?;
    tmp.as_file().sync_all().map_err(export_error(&path))?;

    if let Some((uid, gid)) = invoking_user() {
        std::os::unix::fs::fchown(tmp.as_file(), Some(uid), Some(gid))
            .map_err(export_error(&path))?;
        debug!(uid, gid, "Handed export to invoking user");
    }
    tmp.persist(&path).map_err(|e| export_error(&path)(e.error))?;

    info!(artifact = %artifact, path = %path.display(), "Exported artifact");
    Ok(path)
}

/// Export the cluster CA certificate.
///
/// # Errors
///
/// See [`export_artifact`].
pub fn export_cert(store: &dyn CredentialStore, dest: &Path) -> Result<PathBuf, ProvisionError> {
    export_artifact(store, &Artifact::ClusterCa, dest)
}

/// Export a tenant environment's CI/CD kubeconfig.
///
/// # Errors
///
/// See [`export_artifact`].
pub fn export_kubeconfig(
    store: &dyn CredentialStore,
    tenant: &Tenant,
    environment: Environment,
    dest: &Path,
) -> Result<PathBuf, ProvisionError> {
    let target = TenantEnvironment::new(tenant, environment);
    export_artifact(store, &Artifact::kubeconfig(&target), dest)
}

/// Stored entries selected for display.
///
/// With a tenant, that tenant's record. Otherwise the infrastructure record,
/// narrowed to keys starting with the upper-cased `service` prefix.
///
/// # Errors
///
/// Returns [`ProvisionError::ArtifactMissing`] if the selected record was
/// never written, or a store error.
pub fn show(
    store: &dyn CredentialStore,
    service: Option<&str>,
    tenant: Option<&Tenant>,
) -> Result<Record, ProvisionError> {
    let domain = tenant.map_or(RecordDomain::Infrastructure, |t| {
        RecordDomain::Tenant(t.clone())
    });
    let record = store
        .read_record(&domain)?
        .ok_or_else(|| ProvisionError::ArtifactMissing(domain.to_string()))?;

    let Some(service) = service else {
        return Ok(record);
    };
    let prefix = format!("{}_", service.to_uppercase().replace('-', "_"));
    Ok(record
        .into_iter()
        .filter(|(key, _)| key.starts_with(&prefix))
        .collect())
}
