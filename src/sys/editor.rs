// src/sys/editor.rs

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use nix::sys::stat::stat;
use nix::unistd::{chown, Gid, Uid};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::AgentError;

/// What a mutation decided the resource should become.
pub enum NewState {
    /// Already in the desired state; nothing is written.
    Unchanged,
    /// Replace the content atomically.
    Content(String),
    /// Remove the file (backed up first).
    Absent,
}

#[derive(Debug)]
pub struct EditOutcome {
    pub changed: bool,
    pub backup: Option<PathBuf>,
}

/// Transactional editor for the managed structured text files.
///
/// Writers to the same path are serialized through a per-resource lock; a
/// second writer waits up to `lock_wait` and then fails `ResourceBusy`.
/// The write path never exposes a partially written file: content goes to
/// a unique temp file in the target directory, is fsynced and verified,
/// and only then renamed over the target. The previous version is kept as
/// a timestamped backup with bounded retention.
pub struct ResourceEditor {
    locks: StdMutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    lock_wait: Duration,
    backup_retention: usize,
}

impl ResourceEditor {
    pub fn new(lock_wait: Duration, backup_retention: usize) -> Self {
        Self { locks: StdMutex::new(HashMap::new()), lock_wait, backup_retention }
    }

    /// Reads the resource, applies the pure `mutate` function, and commits
    /// the result atomically. `mutate` sees `None` when the file does not
    /// exist and may carry auxiliary data (e.g. an inverse mutation) back
    /// to the caller.
    pub async fn edit<T, F>(&self, path: &Path, mutate: F) -> Result<(EditOutcome, T), AgentError>
    where
        F: FnOnce(Option<&str>) -> Result<(NewState, T), AgentError> + Send,
        T: Send,
    {
        if !path.is_absolute() {
            return Err(AgentError::Internal(format!(
                "resource path must be absolute: {}",
                path.display()
            )));
        }

        let lock = self.lock_for(path);
        let _guard = tokio::time::timeout(self.lock_wait, lock.lock())
            .await
            .map_err(|_| AgentError::ResourceBusy(path.display().to_string()))?;

        let current = match tokio::fs::read_to_string(path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(AgentError::Edit(format!("cannot read {}: {}", path.display(), e)));
            }
        };

        let (state, carry) = mutate(current.as_deref())?;

        let outcome = match state {
            NewState::Unchanged => EditOutcome { changed: false, backup: None },
            NewState::Content(new_content) => {
                let path = path.to_path_buf();
                let retention = self.backup_retention;
                let backup = tokio::task::spawn_blocking(move || {
                    write_replace(&path, &new_content, retention)
                })
                .await
                .map_err(|e| AgentError::Internal(format!("editor task failed: {}", e)))??;
                EditOutcome { changed: true, backup }
            }
            NewState::Absent => {
                if current.is_none() {
                    EditOutcome { changed: false, backup: None }
                } else {
                    let path = path.to_path_buf();
                    let retention = self.backup_retention;
                    let backup = tokio::task::spawn_blocking(move || {
                        remove_with_backup(&path, retention)
                    })
                    .await
                    .map_err(|e| AgentError::Internal(format!("editor task failed: {}", e)))??;
                    EditOutcome { changed: true, backup: Some(backup) }
                }
            }
        };

        Ok((outcome, carry))
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.lock_for(path)
    }
}

/// Write `content` next to `path`, verify it, back up the original, then
/// atomically rename over the target. Any failure before the rename
/// leaves the original untouched.
fn write_replace(
    path: &Path,
    content: &str,
    retention: usize,
) -> Result<Option<PathBuf>, AgentError> {
    let parent = path
        .parent()
        .ok_or_else(|| AgentError::Edit(format!("{} has no parent directory", path.display())))?;

    let original = match stat(path) {
        Ok(st) => Some(st),
        Err(nix::errno::Errno::ENOENT) => None,
        Err(e) => return Err(AgentError::Edit(format!("stat {}: {}", path.display(), e))),
    };

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| AgentError::Edit(format!("cannot create temp file in {}: {}", parent.display(), e)))?;
    temp.write_all(content.as_bytes())
        .map_err(|e| AgentError::Edit(format!("write failed: {}", e)))?;
    temp.flush().map_err(|e| AgentError::Edit(format!("flush failed: {}", e)))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| AgentError::Edit(format!("fsync failed: {}", e)))?;

    // Verify what actually landed on disk before it can replace anything.
    let written = fs::read(temp.path())
        .map_err(|e| AgentError::Edit(format!("verification read failed: {}", e)))?;
    if Sha256::digest(&written) != Sha256::digest(content.as_bytes()) {
        return Err(AgentError::Edit(format!(
            "write verification failed for {}",
            path.display()
        )));
    }

    // The replacement must keep the mode and ownership the daemons that
    // read these files expect.
    match &original {
        Some(st) => {
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(st.st_mode & 0o7777))
                .map_err(|e| AgentError::Edit(format!("chmod failed: {}", e)))?;
            chown(temp.path(), Some(Uid::from_raw(st.st_uid)), Some(Gid::from_raw(st.st_gid)))
                .map_err(|e| AgentError::Edit(format!("chown failed: {}", e)))?;
        }
        None => {
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o644))
                .map_err(|e| AgentError::Edit(format!("chmod failed: {}", e)))?;
        }
    }

    let backup = if original.is_some() {
        let backup_path = backup_path_for(path);
        fs::copy(path, &backup_path)
            .map_err(|e| AgentError::Edit(format!("backup failed: {}", e)))?;
        prune_backups(path, retention);
        Some(backup_path)
    } else {
        None
    };

    temp.persist(path)
        .map_err(|e| AgentError::Edit(format!("atomic rename failed: {}", e.error)))?;
    Ok(backup)
}

fn remove_with_backup(path: &Path, retention: usize) -> Result<PathBuf, AgentError> {
    let backup_path = backup_path_for(path);
    fs::copy(path, &backup_path)
        .map_err(|e| AgentError::Edit(format!("backup failed: {}", e)))?;
    prune_backups(path, retention);
    fs::remove_file(path).map_err(|e| AgentError::Edit(format!("remove failed: {}", e)))?;
    Ok(backup_path)
}

fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    path.with_file_name(format!("{}.{}.bak", name, stamp))
}

/// Keeps the newest `retention` backups of `path`. The timestamp format
/// sorts alphabetically in chronological order.
fn prune_backups(path: &Path, retention: usize) {
    let Some(parent) = path.parent() else { return };
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else { return };
    let prefix = format!("{}.", name);

    let Ok(entries) = fs::read_dir(parent) else { return };
    let mut backups: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();

    if backups.len() <= retention {
        return;
    }
    let prune_count = backups.len() - retention;
    for stale in &backups[0..prune_count] {
        if let Err(e) = fs::remove_file(stale) {
            tracing::warn!(path = %stale.display(), error = %e, "failed to prune backup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> ResourceEditor {
        ResourceEditor::new(Duration::from_millis(100), 3)
    }

    #[tokio::test]
    async fn creates_a_missing_file_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("authz");

        let (outcome, _) = editor()
            .edit(&target, |current| {
                assert!(current.is_none());
                Ok((NewState::Content("[groups]\n".to_string()), ()))
            })
            .await
            .unwrap();

        assert!(outcome.changed);
        assert!(outcome.backup.is_none());
        assert_eq!(fs::read_to_string(&target).unwrap(), "[groups]\n");
    }

    #[tokio::test]
    async fn replaces_content_and_keeps_a_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("passwd");
        fs::write(&target, "old\n").unwrap();

        let (outcome, _) = editor()
            .edit(&target, |current| {
                assert_eq!(current, Some("old\n"));
                Ok((NewState::Content("new\n".to_string()), ()))
            })
            .await
            .unwrap();

        assert!(outcome.changed);
        let backup = outcome.backup.unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "new\n");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "old\n");
    }

    #[tokio::test]
    async fn unchanged_state_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("passwd");
        fs::write(&target, "same\n").unwrap();

        let (outcome, _) = editor()
            .edit(&target, |_| Ok((NewState::Unchanged, ())))
            .await
            .unwrap();

        assert!(!outcome.changed);
        assert!(outcome.backup.is_none());
        assert_eq!(fs::read_to_string(&target).unwrap(), "same\n");
    }

    #[tokio::test]
    async fn mutation_failure_leaves_the_original_intact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("vhost");
        fs::write(&target, "intact\n").unwrap();

        let result: Result<(EditOutcome, ()), _> = editor()
            .edit(&target, |_| Err(AgentError::Edit("mutation refused".to_string())))
            .await;

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "intact\n");
    }

    #[tokio::test]
    async fn contended_resource_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("authz");
        fs::write(&target, "x\n").unwrap();

        let ed = editor();
        let lock = ed.lock_for_test(&target);
        let _held = lock.lock().await;

        let result = ed.edit(&target, |_| Ok((NewState::Content("y\n".to_string()), ()))).await;
        match result {
            Err(AgentError::ResourceBusy(_)) => {}
            other => panic!("expected ResourceBusy, got {:?}", other.map(|(o, ())| o)),
        }
        // The blocked writer must not have touched the file.
        assert_eq!(fs::read_to_string(&target).unwrap(), "x\n");
    }

    #[tokio::test]
    async fn waiting_writer_succeeds_after_the_lock_frees() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("authz");
        fs::write(&target, "x\n").unwrap();

        let ed = ResourceEditor::new(Duration::from_secs(2), 3);
        let lock = ed.lock_for_test(&target);
        let held = lock.lock().await;

        let release = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        };
        let edit = ed.edit(&target, |_| Ok((NewState::Content("y\n".to_string()), ())));

        let (_, result) = tokio::join!(release, edit);
        assert!(result.is_ok());
        assert_eq!(fs::read_to_string(&target).unwrap(), "y\n");
    }

    #[tokio::test]
    async fn removes_with_backup_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("site.conf");
        fs::write(&target, "server {}\n").unwrap();

        let ed = editor();
        let (outcome, _) = ed.edit(&target, |_| Ok((NewState::Absent, ()))).await.unwrap();
        assert!(outcome.changed);
        assert!(!target.exists());
        assert_eq!(fs::read_to_string(outcome.backup.unwrap()).unwrap(), "server {}\n");

        // Removing an already-absent file is a no-op, not an error.
        let (outcome, _) = ed.edit(&target, |_| Ok((NewState::Absent, ()))).await.unwrap();
        assert!(!outcome.changed);
    }

    #[tokio::test]
    async fn backup_retention_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("passwd");
        fs::write(&target, "v0\n").unwrap();

        let ed = editor();
        for i in 1..=6 {
            ed.edit(&target, |_| Ok((NewState::Content(format!("v{}\n", i)), ())))
                .await
                .unwrap();
        }

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .collect();
        assert!(backups.len() <= 3, "expected at most 3 backups, found {}", backups.len());
    }
}
