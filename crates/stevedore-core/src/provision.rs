//! Idempotent creation of external resources.
//!
//! Every operation here is check-then-act and safe to re-run after a partial
//! failure: a resource that already exists is logged, never an error, and
//! re-invocation performs no duplicate effect.

use crate::error::{StevedoreError, StevedoreResult};
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Message-bus administration contract consumed by topic provisioning.
pub trait MessageBusAdmin {
    fn topic_exists(&self, admin_id: &str, name: &str) -> StevedoreResult<bool>;
    fn create_topic(&self, admin_id: &str, names: &[String], partitions: u32)
        -> StevedoreResult<()>;
}

/// Create the topic unless it already exists.
///
/// The existence check runs first so a second invocation is a no-op probe.
pub fn ensure_topic(
    bus: &dyn MessageBusAdmin,
    admin_id: &str,
    name: &str,
    partitions: u32,
) -> StevedoreResult<()> {
    if bus.topic_exists(admin_id, name)? {
        info!("topic '{name}' already exists");
        return Ok(());
    }
    bus.create_topic(admin_id, &[name.to_string()], partitions)?;
    info!("topic '{name}' created with {partitions} partitions");
    Ok(())
}

/// Failure modes of the directory-service account API.
///
/// `AlreadyExists` is structurally distinguishable so callers never have to
/// string-match; [`DirectoryError::classify`] is the shim for collaborators
/// that can only report text.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("account already exists: {0}")]
    AlreadyExists(String),
    #[error("directory backend error: {0}")]
    Backend(String),
}

impl DirectoryError {
    /// Classify a textual error coming from a collaborator that cannot
    /// report structured kinds.
    pub fn classify(message: &str) -> Self {
        if message.contains("Already exists") {
            DirectoryError::AlreadyExists(message.to_string())
        } else {
            DirectoryError::Backend(message.to_string())
        }
    }
}

/// Directory-service account API.
pub trait DirectoryAccounts {
    fn create_account(
        &self,
        user: &str,
        password: &str,
        params: &BTreeMap<String, String>,
        endpoint_url: &str,
    ) -> Result<(), DirectoryError>;
}

/// Create the service account, treating pre-existence as success.
pub fn ensure_account(
    api: &dyn DirectoryAccounts,
    user: &str,
    password: &str,
    params: &BTreeMap<String, String>,
    endpoint_url: &str,
) -> StevedoreResult<()> {
    match api.create_account(user, password, params, endpoint_url) {
        Ok(()) => {
            info!("service account created via {endpoint_url}");
            Ok(())
        }
        Err(DirectoryError::AlreadyExists(detail)) => {
            warn!("service account already exists: {detail}");
            Ok(())
        }
        Err(DirectoryError::Backend(detail)) => Err(StevedoreError::ExternalProcess(format!(
            "failed to create service account: {detail}"
        ))),
    }
}

/// Leave `dst -> src` in place regardless of what `dst` was before.
///
/// Last-writer-wins: a pre-existing destination is unlinked first, so this
/// never errors on pre-existence.
pub fn ensure_symlink(src: &Path, dst: &Path) -> StevedoreResult<()> {
    if dst.symlink_metadata().is_ok() {
        info!("symbolic link {} already present; replacing", dst.display());
        fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(src, dst)?;
    info!("symbolic link {} -> {}", dst.display(), src.display());
    Ok(())
}

/// Assign deterministic sequential names to the generated FID files.
///
/// Enumerates files in `sysconfig_dir` named `<prefix>-0x*`, requires at
/// least `instance_count` of them (a hard precondition, checked before any
/// link is created), and links `<prefix>-1..N` to every match in sorted
/// enumeration order. Returns the created link paths.
pub fn link_fid_files(
    sysconfig_dir: &Path,
    prefix: &str,
    instance_count: usize,
) -> StevedoreResult<Vec<PathBuf>> {
    let pattern = format!("{prefix}-0x");
    let mut matching: Vec<PathBuf> = fs::read_dir(sysconfig_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&pattern))
        })
        .collect();
    matching.sort();

    info!(
        "found {} FID file(s) in {} for {} instance(s)",
        matching.len(),
        sysconfig_dir.display(),
        instance_count
    );
    if matching.len() < instance_count {
        return Err(StevedoreError::InvalidConfig(format!(
            "FID file count {} does not match instance count {} in {}",
            matching.len(),
            instance_count,
            sysconfig_dir.display()
        )));
    }

    let mut created = Vec::with_capacity(matching.len());
    for (index, src) in matching.iter().enumerate() {
        let dst = sysconfig_dir.join(format!("{prefix}-{}", index + 1));
        ensure_symlink(src, &dst)?;
        created.push(dst);
    }
    Ok(created)
}
