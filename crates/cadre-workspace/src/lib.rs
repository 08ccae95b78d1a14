mod paths;

pub use paths::{normalize_relative, path_within};

use cadre_store::{Store, StoreError};
use cadre_types::{
    MergeFileOutcome, MergeReport, WorkspaceCreateRequest, WorkspaceFileRow, WorkspaceFileState,
    WorkspaceMergeRequest, WorkspaceRun, WorkspaceRunStatus,
};
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("workspace run {run_key} status is {status}, expected {expected}")]
    Policy {
        run_key: String,
        status: String,
        expected: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkspaceResult<T> = std::result::Result<T, WorkspaceError>;

#[derive(Debug, Clone)]
pub struct WorkspaceLimits {
    pub max_files: usize,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for WorkspaceLimits {
    fn default() -> Self {
        Self {
            max_files: 5000,
            max_file_bytes: 8 * 1024 * 1024,
            max_total_bytes: 256 * 1024 * 1024,
        }
    }
}

fn run_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][\w.\-]{2,127}$").unwrap())
}

/// Stages a subset of a source tree under `root_dir/<run_key>/workspace`,
/// then merges authored changes back under optimistic concurrency guarded
/// by content hashes. Run status transitions go through the store's
/// compare-and-swap so parallel merges on one run fail deterministically.
pub struct WorkspaceManager {
    root_dir: PathBuf,
    store: Arc<Store>,
    limits: WorkspaceLimits,
}

impl WorkspaceManager {
    pub fn new(root_dir: impl Into<PathBuf>, store: Arc<Store>) -> Self {
        Self {
            root_dir: root_dir.into(),
            store,
            limits: WorkspaceLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: WorkspaceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub async fn list_runs(&self) -> WorkspaceResult<Vec<WorkspaceRun>> {
        Ok(self.store.list_workspace_runs().await?)
    }

    pub async fn get_run(&self, run_key: &str) -> WorkspaceResult<WorkspaceRun> {
        Ok(self.store.get_workspace_run(run_key).await?)
    }

    pub async fn create_run(&self, req: &WorkspaceCreateRequest) -> WorkspaceResult<WorkspaceRun> {
        if !run_key_re().is_match(&req.run_key) {
            return Err(WorkspaceError::Validation(format!(
                "invalid run key: {:?}",
                req.run_key
            )));
        }
        let source_root = PathBuf::from(&req.source_root);
        let source_root = source_root.canonicalize().map_err(|_| {
            WorkspaceError::Validation(format!("source root does not exist: {}", req.source_root))
        })?;
        if !source_root.is_dir() {
            return Err(WorkspaceError::Validation(format!(
                "source root is not a directory: {}",
                req.source_root
            )));
        }

        std::fs::create_dir_all(&self.root_dir)?;
        let root = self.root_dir.canonicalize()?;
        let workspace_path = root.join(&req.run_key).join("workspace");
        std::fs::create_dir_all(&workspace_path)?;
        if !path_within(&root, &workspace_path.canonicalize()?) {
            return Err(WorkspaceError::Validation(
                "workspace path escapes the workspace root".into(),
            ));
        }

        let now = Utc::now();
        let run = WorkspaceRun {
            run_key: req.run_key.clone(),
            dag_key: req.dag_key.clone(),
            source_root: source_root.to_string_lossy().into_owned(),
            workspace_path: workspace_path.to_string_lossy().into_owned(),
            status: WorkspaceRunStatus::Active,
            metadata: req.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_workspace_run(&run).await?;

        if let Err(err) = self
            .bootstrap_files(&run, &source_root, &workspace_path, &req.paths)
            .await
        {
            let _ = self
                .store
                .set_workspace_run_status(&req.run_key, WorkspaceRunStatus::Failed)
                .await;
            return Err(err);
        }

        Ok(self.store.get_workspace_run(&req.run_key).await?)
    }

    async fn bootstrap_files(
        &self,
        run: &WorkspaceRun,
        source_root: &Path,
        workspace_path: &Path,
        paths: &[String],
    ) -> WorkspaceResult<()> {
        if paths.len() > self.limits.max_files {
            return Err(WorkspaceError::Validation(format!(
                "bootstrap set exceeds {} files",
                self.limits.max_files
            )));
        }

        let mut total: u64 = 0;
        for raw in paths {
            let rel = normalize_relative(raw)
                .map_err(|reason| WorkspaceError::Validation(format!("{raw:?}: {reason}")))?;
            let src = source_root.join(&rel);
            let meta = std::fs::symlink_metadata(&src).map_err(|_| {
                WorkspaceError::Validation(format!("missing source file: {}", rel.display()))
            })?;
            if meta.file_type().is_symlink() {
                return Err(WorkspaceError::Validation(format!(
                    "refusing to stage symlink: {}",
                    rel.display()
                )));
            }
            if meta.is_dir() {
                return Err(WorkspaceError::Validation(format!(
                    "refusing to stage directory: {}",
                    rel.display()
                )));
            }
            if meta.len() > self.limits.max_file_bytes {
                return Err(WorkspaceError::Validation(format!(
                    "file too large ({} bytes): {}",
                    meta.len(),
                    rel.display()
                )));
            }
            total += meta.len();
            if total > self.limits.max_total_bytes {
                return Err(WorkspaceError::Validation(format!(
                    "bootstrap set exceeds {} bytes",
                    self.limits.max_total_bytes
                )));
            }

            let target = workspace_path.join(&rel);
            atomic_copy(&src, &target)?;
            let hash = hash_file(&target)?;
            self.store
                .upsert_workspace_file(&WorkspaceFileRow {
                    run_key: run.run_key.clone(),
                    relative_path: rel.to_string_lossy().into_owned(),
                    baseline_sha256: hash.clone(),
                    workspace_sha256: hash.clone(),
                    source_sha256_before: hash.clone(),
                    source_sha256_after: hash,
                    state: WorkspaceFileState::Synced,
                    last_error: None,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn abort_run(&self, run_key: &str) -> WorkspaceResult<WorkspaceRun> {
        let moved = self
            .store
            .cas_workspace_run_status(run_key, WorkspaceRunStatus::Active, WorkspaceRunStatus::Aborted)
            .await?;
        if !moved {
            let run = self.store.get_workspace_run(run_key).await?;
            return Err(WorkspaceError::Policy {
                run_key: run_key.to_string(),
                status: run.status.as_str().to_string(),
                expected: "active".to_string(),
            });
        }
        Ok(self.store.get_workspace_run(run_key).await?)
    }

    pub async fn merge_run(&self, req: &WorkspaceMergeRequest) -> WorkspaceResult<MergeReport> {
        let moved = self
            .store
            .cas_workspace_run_status(
                &req.run_key,
                WorkspaceRunStatus::Active,
                WorkspaceRunStatus::Merging,
            )
            .await?;
        if !moved {
            let run = self.store.get_workspace_run(&req.run_key).await?;
            return Err(WorkspaceError::Policy {
                run_key: req.run_key.clone(),
                status: run.status.as_str().to_string(),
                expected: "active".to_string(),
            });
        }

        let run = self.store.get_workspace_run(&req.run_key).await?;
        let source_root = PathBuf::from(&run.source_root);
        let workspace_path = PathBuf::from(&run.workspace_path);

        let tracked: HashMap<String, WorkspaceFileRow> = self
            .store
            .list_workspace_files(&req.run_key)
            .await?
            .into_iter()
            .map(|row| (row.relative_path.clone(), row))
            .collect();

        let mut report = MergeReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut walked = 0usize;

        for entry in WalkDir::new(&workspace_path).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    report.errors += 1;
                    report.files.push(MergeFileOutcome {
                        path: err
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                        action: "error".into(),
                        reason: Some(err.to_string()),
                    });
                    continue;
                }
            };
            if entry.file_type().is_symlink() {
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            walked += 1;
            if walked > self.limits.max_files {
                report.errors += 1;
                report.files.push(MergeFileOutcome {
                    path: String::new(),
                    action: "error".into(),
                    reason: Some(format!(
                        "workspace exceeds {} files, merge truncated",
                        self.limits.max_files
                    )),
                });
                break;
            }

            let rel = match entry.path().strip_prefix(&workspace_path) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let rel_str = rel.to_string_lossy().into_owned();
            seen.insert(rel_str.clone());

            if let Err(err) = self
                .merge_one_file(
                    req,
                    &run,
                    &source_root,
                    entry.path(),
                    &rel,
                    tracked.get(&rel_str),
                    &mut report,
                )
                .await
            {
                report.errors += 1;
                report.files.push(MergeFileOutcome {
                    path: rel_str.clone(),
                    action: "error".into(),
                    reason: Some(err.to_string()),
                });
                let _ = self
                    .store
                    .upsert_workspace_file(&WorkspaceFileRow {
                        run_key: req.run_key.clone(),
                        relative_path: rel_str,
                        baseline_sha256: tracked
                            .get(&rel.to_string_lossy().into_owned())
                            .map(|r| r.baseline_sha256.clone())
                            .unwrap_or_default(),
                        workspace_sha256: String::new(),
                        source_sha256_before: String::new(),
                        source_sha256_after: String::new(),
                        state: WorkspaceFileState::Error,
                        last_error: Some(err.to_string()),
                    })
                    .await;
            }
        }

        if req.delete_removed {
            self.delete_removed(req, &source_root, &tracked, &seen, &mut report)
                .await?;
        }

        // The terminal transition is recorded no matter what happened above.
        let terminal = if req.dry_run {
            WorkspaceRunStatus::Active
        } else if report.conflicts > 0 || report.errors > 0 {
            WorkspaceRunStatus::Failed
        } else {
            WorkspaceRunStatus::Merged
        };
        self.store
            .set_workspace_run_status(&req.run_key, terminal)
            .await?;
        report.status = Some(terminal);
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_one_file(
        &self,
        req: &WorkspaceMergeRequest,
        run: &WorkspaceRun,
        source_root: &Path,
        workspace_file: &Path,
        rel: &Path,
        tracked: Option<&WorkspaceFileRow>,
        report: &mut MergeReport,
    ) -> WorkspaceResult<()> {
        let rel_str = rel.to_string_lossy().into_owned();
        let ws_hash = hash_file(workspace_file)?;
        let src_path = source_root.join(rel);
        if !path_within(source_root, &src_path) {
            return Err(WorkspaceError::Validation(format!(
                "merge target escapes source root: {rel_str}"
            )));
        }
        let source_before = match std::fs::symlink_metadata(&src_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(WorkspaceError::Validation(format!(
                    "refusing to merge onto symlink: {rel_str}"
                )))
            }
            Ok(_) => hash_file(&src_path)?,
            Err(_) => String::new(),
        };
        let baseline = tracked
            .map(|row| row.baseline_sha256.clone())
            .filter(|hash| !hash.is_empty())
            .unwrap_or_else(|| source_before.clone());

        if ws_hash == baseline {
            report.unchanged += 1;
            self.store
                .upsert_workspace_file(&WorkspaceFileRow {
                    run_key: run.run_key.clone(),
                    relative_path: rel_str,
                    baseline_sha256: baseline,
                    workspace_sha256: ws_hash,
                    source_sha256_before: source_before.clone(),
                    source_sha256_after: source_before,
                    state: WorkspaceFileState::Unchanged,
                    last_error: None,
                })
                .await?;
            return Ok(());
        }

        if !baseline.is_empty() && !source_before.is_empty() && source_before != baseline {
            // Source drifted since bootstrap; never overwrite it.
            report.conflicts += 1;
            report.files.push(MergeFileOutcome {
                path: rel_str.clone(),
                action: "conflict".into(),
                reason: Some("source changed since baseline".into()),
            });
            self.store
                .upsert_workspace_file(&WorkspaceFileRow {
                    run_key: run.run_key.clone(),
                    relative_path: rel_str,
                    baseline_sha256: baseline,
                    workspace_sha256: ws_hash,
                    source_sha256_before: source_before.clone(),
                    source_sha256_after: source_before,
                    state: WorkspaceFileState::Conflict,
                    last_error: None,
                })
                .await?;
            return Ok(());
        }

        if req.dry_run {
            report.merged += 1;
            report.files.push(MergeFileOutcome {
                path: rel_str,
                action: "would_merge".into(),
                reason: None,
            });
            return Ok(());
        }

        atomic_copy(workspace_file, &src_path)?;
        let source_after = hash_file(&src_path)?;
        report.merged += 1;
        report.files.push(MergeFileOutcome {
            path: rel_str.clone(),
            action: "merged".into(),
            reason: None,
        });
        self.store
            .upsert_workspace_file(&WorkspaceFileRow {
                run_key: run.run_key.clone(),
                relative_path: rel_str,
                baseline_sha256: baseline,
                workspace_sha256: ws_hash,
                source_sha256_before: source_before,
                source_sha256_after: source_after,
                state: WorkspaceFileState::Merged,
                last_error: None,
            })
            .await?;
        Ok(())
    }

    async fn delete_removed(
        &self,
        req: &WorkspaceMergeRequest,
        source_root: &Path,
        tracked: &HashMap<String, WorkspaceFileRow>,
        seen: &HashSet<String>,
        report: &mut MergeReport,
    ) -> WorkspaceResult<()> {
        for (rel_str, row) in tracked {
            if seen.contains(rel_str) {
                continue;
            }
            let src_path = source_root.join(rel_str);
            let src_hash = match std::fs::metadata(&src_path) {
                Ok(_) => hash_file(&src_path)?,
                Err(_) => String::new(),
            };
            if !row.baseline_sha256.is_empty()
                && !src_hash.is_empty()
                && src_hash != row.baseline_sha256
            {
                report.conflicts += 1;
                report.files.push(MergeFileOutcome {
                    path: rel_str.clone(),
                    action: "conflict".into(),
                    reason: Some("source changed since baseline".into()),
                });
                continue;
            }
            if req.dry_run {
                report.deleted += 1;
                report.files.push(MergeFileOutcome {
                    path: rel_str.clone(),
                    action: "would_delete".into(),
                    reason: None,
                });
                continue;
            }
            match std::fs::remove_file(&src_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.store
                .delete_workspace_file(&req.run_key, rel_str)
                .await?;
            report.deleted += 1;
            report.files.push(MergeFileOutcome {
                path: rel_str.clone(),
                action: "deleted".into(),
                reason: None,
            });
        }
        Ok(())
    }
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Copy via temp file in the target directory, fsync, chmod to the source
/// mode, then rename into place.
fn atomic_copy(src: &Path, target: &Path) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::other("target has no parent directory"))?;
    std::fs::create_dir_all(parent)?;
    let data = std::fs::read(src)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(src)?.permissions().mode();
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
    }
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        source_root: PathBuf,
        manager: WorkspaceManager,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source_root = dir.path().join("source");
        std::fs::create_dir_all(&source_root).unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let manager = WorkspaceManager::new(dir.path().join("runs"), store);
        Fixture {
            _dir: dir,
            source_root,
            manager,
        }
    }

    fn create_req(fx: &Fixture, run_key: &str, paths: &[&str]) -> WorkspaceCreateRequest {
        WorkspaceCreateRequest {
            run_key: run_key.into(),
            dag_key: "dag-1".into(),
            source_root: fx.source_root.to_string_lossy().into_owned(),
            paths: paths.iter().map(|s| s.to_string()).collect(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn bootstrap_then_dry_run_merge_is_all_unchanged() {
        let fx = fixture().await;
        for name in ["a.txt", "b.txt", "nested/c.txt"] {
            let path = fx.source_root.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, format!("content of {name}")).unwrap();
        }
        let run = fx
            .manager
            .create_run(&create_req(&fx, "run-1", &["a.txt", "b.txt", "nested/c.txt"]))
            .await
            .unwrap();
        assert_eq!(run.status, WorkspaceRunStatus::Active);

        let report = fx
            .manager
            .merge_run(&WorkspaceMergeRequest {
                run_key: "run-1".into(),
                dry_run: true,
                delete_removed: false,
            })
            .await
            .unwrap();
        assert_eq!(report.merged, 0);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.unchanged, 3);
        assert_eq!(report.status, Some(WorkspaceRunStatus::Active));
    }

    #[tokio::test]
    async fn edited_workspace_file_merges_back_atomically() {
        let fx = fixture().await;
        std::fs::write(fx.source_root.join("a.txt"), "v1").unwrap();
        let run = fx
            .manager
            .create_run(&create_req(&fx, "run-1", &["a.txt"]))
            .await
            .unwrap();

        std::fs::write(Path::new(&run.workspace_path).join("a.txt"), "v2").unwrap();
        let report = fx
            .manager
            .merge_run(&WorkspaceMergeRequest {
                run_key: "run-1".into(),
                dry_run: false,
                delete_removed: false,
            })
            .await
            .unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.status, Some(WorkspaceRunStatus::Merged));
        assert_eq!(
            std::fs::read_to_string(fx.source_root.join("a.txt")).unwrap(),
            "v2"
        );
    }

    #[tokio::test]
    async fn source_drift_is_a_conflict_and_source_stays_untouched() {
        let fx = fixture().await;
        std::fs::write(fx.source_root.join("a.txt"), "baseline").unwrap();
        let run = fx
            .manager
            .create_run(&create_req(&fx, "run-1", &["a.txt"]))
            .await
            .unwrap();

        // Source and workspace both drift after bootstrap.
        std::fs::write(fx.source_root.join("a.txt"), "external edit").unwrap();
        std::fs::write(Path::new(&run.workspace_path).join("a.txt"), "agent edit").unwrap();

        let report = fx
            .manager
            .merge_run(&WorkspaceMergeRequest {
                run_key: "run-1".into(),
                dry_run: false,
                delete_removed: false,
            })
            .await
            .unwrap();
        assert_eq!(report.merged, 0);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].path, "a.txt");
        assert_eq!(report.files[0].action, "conflict");
        assert_eq!(
            report.files[0].reason.as_deref(),
            Some("source changed since baseline")
        );
        assert_eq!(report.status, Some(WorkspaceRunStatus::Failed));
        assert_eq!(
            std::fs::read_to_string(fx.source_root.join("a.txt")).unwrap(),
            "external edit"
        );
    }

    #[tokio::test]
    async fn second_merge_on_same_run_loses_the_cas_race() {
        let fx = fixture().await;
        std::fs::write(fx.source_root.join("a.txt"), "v1").unwrap();
        fx.manager
            .create_run(&create_req(&fx, "run-1", &["a.txt"]))
            .await
            .unwrap();
        fx.manager
            .merge_run(&WorkspaceMergeRequest {
                run_key: "run-1".into(),
                dry_run: false,
                delete_removed: false,
            })
            .await
            .unwrap();

        let err = fx
            .manager
            .merge_run(&WorkspaceMergeRequest {
                run_key: "run-1".into(),
                dry_run: false,
                delete_removed: false,
            })
            .await
            .unwrap_err();
        match err {
            WorkspaceError::Policy { status, expected, .. } => {
                assert_eq!(status, "merged");
                assert_eq!(expected, "active");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn delete_removed_cleans_source_files_dropped_from_workspace() {
        let fx = fixture().await;
        std::fs::write(fx.source_root.join("keep.txt"), "k").unwrap();
        std::fs::write(fx.source_root.join("drop.txt"), "d").unwrap();
        let run = fx
            .manager
            .create_run(&create_req(&fx, "run-1", &["keep.txt", "drop.txt"]))
            .await
            .unwrap();

        std::fs::remove_file(Path::new(&run.workspace_path).join("drop.txt")).unwrap();
        let report = fx
            .manager
            .merge_run(&WorkspaceMergeRequest {
                run_key: "run-1".into(),
                dry_run: false,
                delete_removed: true,
            })
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.unchanged, 1);
        assert!(!fx.source_root.join("drop.txt").exists());
        assert_eq!(report.status, Some(WorkspaceRunStatus::Merged));
    }

    #[tokio::test]
    async fn invalid_run_keys_are_rejected() {
        let fx = fixture().await;
        for bad in ["", "ab", ".hidden", "bad key", "a/b", &"x".repeat(129)] {
            let err = fx
                .manager
                .create_run(&create_req(&fx, bad, &[]))
                .await
                .unwrap_err();
            assert!(matches!(err, WorkspaceError::Validation(_)), "key {bad:?}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bootstrap_rejects_symlinks_and_fails_the_run() {
        let fx = fixture().await;
        std::fs::write(fx.source_root.join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink(
            fx.source_root.join("real.txt"),
            fx.source_root.join("link.txt"),
        )
        .unwrap();

        let err = fx
            .manager
            .create_run(&create_req(&fx, "run-1", &["link.txt"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Validation(_)));
        assert_eq!(
            fx.manager.get_run("run-1").await.unwrap().status,
            WorkspaceRunStatus::Failed
        );
    }

    #[tokio::test]
    async fn bootstrap_enforces_per_file_size_limit() {
        let fx = fixture().await;
        std::fs::write(fx.source_root.join("big.bin"), vec![0u8; 4096]).unwrap();
        let store = fx.manager.store.clone();
        let manager = WorkspaceManager::new(fx.manager.root_dir.clone(), store).with_limits(
            WorkspaceLimits {
                max_files: 10,
                max_file_bytes: 1024,
                max_total_bytes: 1024 * 1024,
            },
        );
        let err = manager
            .create_run(&create_req(&fx, "run-big", &["big.bin"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn traversal_paths_are_rejected() {
        let fx = fixture().await;
        std::fs::write(fx.source_root.join("a.txt"), "x").unwrap();
        let err = fx
            .manager
            .create_run(&create_req(&fx, "run-1", &["../a.txt"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Validation(_)));
    }
}
