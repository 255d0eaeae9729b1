//! Temporary test folders mounted into containers.
//!
//! Every folder created directly under the output root is registered for
//! cleanup. [`ResourceManager::teardown`] archives each registered folder to
//! `<root>/<leaf>.tar.gz`, hands ownership back to the invoking user, deletes
//! the folder and clears the registry. Teardown never fails; problems are
//! collected in the returned [`TeardownReport`].

use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use graphdock_common::{HarnessError, HarnessResult, OwnerSpec};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::archive;
use super::ownership::OwnershipAuthority;
use crate::runtime::ContainerSpec;

/// Upper bound (exclusive) of the random folder suffix.
const SUFFIX_RANGE: u32 = 10_000;

/// Suffixes drawn before giving up on a free folder name.
const MAX_NAME_ATTEMPTS: usize = 32;

/// A host folder created for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDirectory {
    /// Absolute path of the folder.
    pub path: PathBuf,
    /// The output root of the manager that created it.
    pub creation_root: PathBuf,
    /// True if created directly under the output root, and so registered.
    pub under_managed_root: bool,
}

impl ManagedDirectory {
    /// Absolute path of the folder.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for ManagedDirectory {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Teardown step a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    /// Writing the archive.
    Archive,
    /// Handing ownership back to the invoking user.
    Ownership,
    /// Deleting the folder.
    Delete,
}

impl fmt::Display for TeardownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive => write!(f, "archive"),
            Self::Ownership => write!(f, "ownership"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A non-fatal teardown problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// Step that failed.
    pub stage: TeardownStage,
    /// Path involved.
    pub path: PathBuf,
    /// What went wrong.
    pub reason: String,
}

/// What a teardown did.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Archives written, in registration order.
    pub archives: Vec<PathBuf>,
    /// Folders deleted.
    pub removed: Vec<PathBuf>,
    /// Isolated failures.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// True if nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, stage: TeardownStage, path: &Path, reason: impl ToString) {
        self.failures.push(TeardownFailure {
            stage,
            path: path.to_path_buf(),
            reason: reason.to_string(),
        });
    }
}

struct CleanupRegistry {
    pending: Vec<ManagedDirectory>,
    rng: StdRng,
}

/// Creates, tracks and cleans up test folders.
///
/// Not designed for concurrent use; the mutex only keeps `&self` methods
/// sound when scenarios share a manager.
pub struct ResourceManager {
    output_root: PathBuf,
    registry: Mutex<CleanupRegistry>,
    authority: Arc<dyn OwnershipAuthority>,
    invoking_user: OwnerSpec,
}

impl ResourceManager {
    /// Create a manager rooted at `output_root`, creating the root if needed.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::DirectoryCreation`] if the root cannot be created.
    pub fn new(
        output_root: impl AsRef<Path>,
        authority: Arc<dyn OwnershipAuthority>,
    ) -> HarnessResult<Self> {
        Self::with_rng(output_root, authority, StdRng::from_entropy())
    }

    /// Like [`ResourceManager::new`] with a seeded name generator.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::DirectoryCreation`] if the root cannot be created.
    pub fn with_seed(
        output_root: impl AsRef<Path>,
        authority: Arc<dyn OwnershipAuthority>,
        seed: u64,
    ) -> HarnessResult<Self> {
        Self::with_rng(output_root, authority, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        output_root: impl AsRef<Path>,
        authority: Arc<dyn OwnershipAuthority>,
        rng: StdRng,
    ) -> HarnessResult<Self> {
        let output_root = absolute(output_root.as_ref())?;
        std::fs::create_dir_all(&output_root).map_err(|source| HarnessError::DirectoryCreation {
            path: output_root.clone(),
            source,
        })?;
        Ok(Self {
            output_root,
            registry: Mutex::new(CleanupRegistry {
                pending: Vec::new(),
                rng,
            }),
            authority,
            invoking_user: OwnerSpec::current_user(),
        })
    }

    /// The output root.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Owner restored on registered folders before they are deleted.
    #[must_use]
    pub const fn invoking_user(&self) -> &OwnerSpec {
        &self.invoking_user
    }

    /// Create `<root>/<prefix><NNNN>` and register it for cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::DirectoryCreation`] if the folder cannot be created.
    pub fn create_directory(&self, prefix: &str) -> HarnessResult<ManagedDirectory> {
        let root = self.output_root.clone();
        self.create_directory_in(prefix, &root)
    }

    /// Create `<parent>/<prefix><NNNN>`.
    ///
    /// The folder is registered only if `parent` is the output root; folders
    /// nested elsewhere are cleaned up with their parent.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::DirectoryCreation`] if the folder cannot be created.
    pub fn create_directory_in(&self, prefix: &str, parent: &Path) -> HarnessResult<ManagedDirectory> {
        let parent = absolute(parent)?;
        std::fs::create_dir_all(&parent).map_err(|source| HarnessError::DirectoryCreation {
            path: parent.clone(),
            source,
        })?;

        let mut registry = self.registry.lock();
        let mut last = None;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let suffix = registry.rng.gen_range(0..SUFFIX_RANGE);
            let path = parent.join(format!("{prefix}{suffix:04}"));
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    let dir = ManagedDirectory {
                        under_managed_root: parent == self.output_root,
                        creation_root: self.output_root.clone(),
                        path,
                    };
                    if dir.under_managed_root {
                        registry.pending.push(dir.clone());
                    }
                    tracing::info!(
                        path = %dir.path.display(),
                        registered = dir.under_managed_root,
                        "Created test folder"
                    );
                    return Ok(dir);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!(path = %path.display(), "Folder name taken, drawing another");
                    last = Some(path);
                }
                Err(source) => return Err(HarnessError::DirectoryCreation { path, source }),
            }
        }

        Err(HarnessError::DirectoryCreation {
            path: last.unwrap_or(parent),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free name for prefix '{prefix}' after {MAX_NAME_ATTEMPTS} attempts"),
            ),
        })
    }

    /// A fresh zero-padded four digit suffix, as used in folder names.
    #[must_use]
    pub fn random_suffix(&self) -> String {
        let suffix = self.registry.lock().rng.gen_range(0..SUFFIX_RANGE);
        format!("{suffix:04}")
    }

    /// Register a folder created by other means for cleanup.
    pub fn register(&self, path: &Path) {
        let dir = ManagedDirectory {
            path: path.to_path_buf(),
            creation_root: self.output_root.clone(),
            under_managed_root: path.parent() == Some(self.output_root.as_path()),
        };
        self.registry.lock().pending.push(dir);
    }

    /// Bind `dir` read-write at `mount_point` in a container.
    pub fn bind_directory(&self, spec: &mut ContainerSpec, dir: &Path, mount_point: &str) {
        spec.bind_directory(dir, mount_point);
    }

    /// Create a registered folder and bind it at `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::DirectoryCreation`] if the folder cannot be created.
    pub fn create_and_bind(
        &self,
        spec: &mut ContainerSpec,
        prefix: &str,
        mount_point: &str,
    ) -> HarnessResult<ManagedDirectory> {
        let dir = self.create_directory(prefix)?;
        self.bind_directory(spec, &dir.path, mount_point);
        Ok(dir)
    }

    /// Create a folder under `parent` and bind it at `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::DirectoryCreation`] if the folder cannot be created.
    pub fn create_and_bind_in(
        &self,
        spec: &mut ContainerSpec,
        prefix: &str,
        mount_point: &str,
        parent: &Path,
    ) -> HarnessResult<ManagedDirectory> {
        let dir = self.create_directory_in(prefix, parent)?;
        self.bind_directory(spec, &dir.path, mount_point);
        Ok(dir)
    }

    /// Recursively change the owner of `dirs`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::OwnershipChange`] if the change fails.
    pub async fn reassign_owner(&self, owner: &OwnerSpec, dirs: &[&Path]) -> HarnessResult<()> {
        let paths: Vec<PathBuf> = dirs.iter().map(|d| d.to_path_buf()).collect();
        self.authority.chown_recursive(owner, &paths).await
    }

    /// Folders awaiting teardown, in registration order.
    #[must_use]
    pub fn pending(&self) -> Vec<PathBuf> {
        self.registry
            .lock()
            .pending
            .iter()
            .map(|d| d.path.clone())
            .collect()
    }

    /// Archive, re-own and delete every registered folder, then clear the registry.
    ///
    /// Safe to call repeatedly; with nothing registered it does nothing.
    pub async fn teardown(&self) -> TeardownReport {
        let pending = std::mem::take(&mut self.registry.lock().pending);
        let mut report = TeardownReport::default();
        if pending.is_empty() {
            tracing::debug!("Nothing to tear down");
            return report;
        }

        for dir in &pending {
            match archive::archive_directory(&dir.path, &dir.creation_root) {
                Ok(outcome) => {
                    for skipped in outcome.skipped {
                        report.fail(TeardownStage::Archive, &skipped.path, skipped.reason);
                    }
                    report.archives.push(outcome.archive);
                }
                Err(err) => {
                    tracing::warn!(path = %dir.path.display(), error = %err, "Archiving failed");
                    report.fail(TeardownStage::Archive, &dir.path, err);
                }
            }
        }

        let existing: Vec<PathBuf> = pending
            .iter()
            .filter(|d| d.path.exists())
            .map(|d| d.path.clone())
            .collect();
        for (path, err) in self.authority.chown_each(&self.invoking_user, &existing).await {
            tracing::warn!(path = %path.display(), owner = %self.invoking_user, error = %err, "Could not reclaim test folder");
            report.fail(TeardownStage::Ownership, &path, err);
        }

        for dir in &pending {
            match std::fs::remove_dir_all(&dir.path) {
                Ok(()) => report.removed.push(dir.path.clone()),
                Err(err) => {
                    tracing::warn!(path = %dir.path.display(), error = %err, "Could not delete test folder");
                    report.fail(TeardownStage::Delete, &dir.path, err);
                }
            }
        }

        tracing::info!(
            archives = report.archives.len(),
            removed = report.removed.len(),
            failures = report.failures.len(),
            "Teardown finished"
        );
        for failure in &report.failures {
            tracing::warn!(
                stage = %failure.stage,
                path = %failure.path.display(),
                reason = %failure.reason,
                "Teardown failure"
            );
        }
        report
    }

    /// Run `body`, then tear down, even if `body` panicked.
    ///
    /// A panic is resumed after teardown so the test still fails.
    pub async fn scoped<F, T>(&self, body: F) -> T
    where
        F: Future<Output = T>,
    {
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        self.teardown().await;
        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn absolute(path: &Path) -> HarnessResult<PathBuf> {
    std::path::absolute(path).map_err(|source| HarnessError::DirectoryCreation {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingAuthority {
        calls: Mutex<Vec<(OwnerSpec, Vec<PathBuf>)>>,
        fail: bool,
    }

    #[async_trait]
    impl OwnershipAuthority for RecordingAuthority {
        async fn chown_recursive(&self, owner: &OwnerSpec, paths: &[PathBuf]) -> HarnessResult<()> {
            self.calls.lock().push((owner.clone(), paths.to_vec()));
            if self.fail {
                return Err(HarnessError::OwnershipChange {
                    path: paths[0].clone(),
                    owner: owner.to_string(),
                    message: "helper unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    fn manager(root: &Path, seed: u64) -> (ResourceManager, Arc<RecordingAuthority>) {
        let authority = Arc::new(RecordingAuthority::default());
        let manager = ResourceManager::with_seed(root, authority.clone(), seed).unwrap();
        (manager, authority)
    }

    #[test]
    fn names_have_four_digit_suffix() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _) = manager(root.path(), 7);
        let dir = manager.create_directory("data-").unwrap();
        let name = dir.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("data-"));
        let suffix = &name["data-".len()..];
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
        assert!(dir.path.is_dir());
        assert!(dir.under_managed_root);
        assert_eq!(manager.pending(), vec![dir.path.clone()]);
    }

    #[test]
    fn taken_name_draws_another_suffix() {
        let root = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let first = rng.gen_range(0..SUFFIX_RANGE);
        let taken = root.path().join(format!("logs-{first:04}"));
        std::fs::create_dir(&taken).unwrap();

        let (manager, _) = manager(root.path(), 11);
        let dir = manager.create_directory("logs-").unwrap();
        assert_ne!(dir.path, taken);
        assert_eq!(manager.pending(), vec![dir.path]);
    }

    #[test]
    fn nested_folders_are_not_registered() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _) = manager(root.path(), 3);
        let parent = manager.create_directory("upgrade-44-").unwrap();
        let nested = manager.create_directory_in("data-", &parent.path).unwrap();
        assert!(!nested.under_managed_root);
        assert!(nested.path.starts_with(&parent.path));
        assert_eq!(manager.pending(), vec![parent.path.clone()]);

        let explicit = manager.create_directory_in("import-", root.path()).unwrap();
        assert!(explicit.under_managed_root);
        assert_eq!(manager.pending().len(), 2);
    }

    #[test]
    fn creation_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _) = manager(root.path(), 1);
        let blocker = root.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let err = manager.create_directory_in("data-", &blocker).unwrap_err();
        assert!(matches!(err, HarnessError::DirectoryCreation { .. }));
        assert!(manager.pending().is_empty());
    }

    #[test]
    fn bind_adds_read_write_mount() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _) = manager(root.path(), 5);
        let mut spec = ContainerSpec::new("neo4j:5.1.0");
        let dir = manager.create_and_bind(&mut spec, "data-", "/data").unwrap();
        let binding = spec.mount_at("/data").unwrap();
        assert_eq!(binding.source.as_directory(), Some(dir.path()));
        assert_eq!(binding.mode, crate::runtime::BindMode::ReadWrite);
    }

    #[test_log::test(tokio::test)]
    async fn teardown_archives_reowns_and_deletes() {
        let root = tempfile::tempdir().unwrap();
        let (manager, authority) = manager(root.path(), 42);
        let a = manager.create_directory("foo-").unwrap();
        let b = manager.create_directory("foo-").unwrap();
        assert_ne!(a.path, b.path);
        std::fs::write(a.path.join("neo4j.log"), b"Started.").unwrap();

        let report = manager.teardown().await;
        assert!(report.is_clean(), "{:?}", report.failures);
        assert!(!a.path.exists());
        assert!(!b.path.exists());
        assert_eq!(
            report.archives,
            vec![
                archive::archive_path(&a.path, manager.output_root()),
                archive::archive_path(&b.path, manager.output_root()),
            ]
        );
        assert!(report.archives.iter().all(|p| p.is_file()));

        let calls = authority.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(owner, _)| owner == manager.invoking_user()));
        assert_eq!(calls[0].1, vec![a.path.clone()]);
        assert_eq!(calls[1].1, vec![b.path.clone()]);
    }

    #[tokio::test]
    async fn second_teardown_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let (manager, authority) = manager(root.path(), 9);
        manager.create_directory("foo-").unwrap();
        manager.teardown().await;

        let report = manager.teardown().await;
        assert!(report.archives.is_empty());
        assert!(report.is_clean());
        assert_eq!(authority.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn ownership_failure_does_not_stop_deletion() {
        let root = tempfile::tempdir().unwrap();
        let authority = Arc::new(RecordingAuthority {
            fail: true,
            ..RecordingAuthority::default()
        });
        let manager = ResourceManager::with_seed(root.path(), authority, 2).unwrap();
        let dir = manager.create_directory("metrics-").unwrap();

        let report = manager.teardown().await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, TeardownStage::Ownership);
        assert_eq!(report.failures[0].path, dir.path);
        assert!(!dir.path.exists());
        assert_eq!(report.archives.len(), 1);
    }

    #[tokio::test]
    async fn ownership_failures_are_isolated_per_folder() {
        let root = tempfile::tempdir().unwrap();
        let authority = Arc::new(RecordingAuthority {
            fail: true,
            ..RecordingAuthority::default()
        });
        let manager = ResourceManager::with_seed(root.path(), authority.clone(), 8).unwrap();
        let a = manager.create_directory("data-").unwrap();
        let b = manager.create_directory("logs-").unwrap();

        let report = manager.teardown().await;
        let failed: Vec<&Path> = report
            .failures
            .iter()
            .filter(|f| f.stage == TeardownStage::Ownership)
            .map(|f| f.path.as_path())
            .collect();
        assert_eq!(failed, [a.path.as_path(), b.path.as_path()]);
        assert_eq!(authority.calls.lock().len(), 2);
        assert_eq!(report.removed, vec![a.path, b.path]);
    }

    #[tokio::test]
    async fn scoped_tears_down_after_panic() {
        let root = tempfile::tempdir().unwrap();
        let (manager, _) = manager(root.path(), 4);
        let manager = Arc::new(manager);

        let inner = manager.clone();
        let handle = tokio::spawn(async move {
            inner
                .scoped(async {
                    inner.create_directory("data-").unwrap();
                    panic!("assertion failed inside test body");
                })
                .await;
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert!(manager.pending().is_empty());
        let archives = std::fs::read_dir(manager.output_root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "gz"))
            .count();
        assert_eq!(archives, 1);
    }
}
