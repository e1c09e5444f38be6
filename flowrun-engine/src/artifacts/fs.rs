use super::{digest, handle_for, validate_name, ArtifactHandle, ArtifactStore};
use crate::error::{EngineError, EngineResult};
use crate::execution::report::RunId;

use walkdir::WalkDir;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const TEMP_PREFIX: &str = ".flowrun-tmp-";

/// Artifact store laid out as `<root>/<run-id>/<name>`.
///
/// Every put writes a temp file and then publishes it: new artifacts with a
/// hard link, which fails when the name exists, so the filesystem decides
/// which of two racing puts wins; overwrites with a rename. Readers never
/// observe a partial file.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    fn duplicate(run_id: &RunId, name: &str) -> EngineError {
        EngineError::DuplicateArtifact {
            run_id: run_id.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        run_id: &RunId,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> EngineResult<ArtifactHandle> {
        RunId::check(run_id.as_str())?;
        validate_name(name)?;
        let path = self.run_dir(run_id.as_str()).join(name);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let handle = handle_for(run_id, name, &bytes);

        // Bytes land in a temp file first, so the key only ever names a
        // complete artifact
        let temp = parent.join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4().simple()));
        let published = match tokio::fs::write(&temp, &bytes).await {
            Err(e) => Err(e.into()),
            Ok(()) if overwrite => tokio::fs::rename(&temp, &path).await.map_err(EngineError::from),
            // hard_link never replaces an existing file
            Ok(()) => match tokio::fs::hard_link(&temp, &path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Self::duplicate(run_id, name)),
                Err(e) => Err(e.into()),
            },
        };
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %temp.display(), error = %e, "failed to remove temp file");
            }
        }
        published?;

        tracing::debug!(run_id = %run_id, name, size = handle.size, "stored artifact");
        Ok(handle)
    }

    async fn get(&self, handle: &ArtifactHandle) -> EngineResult<Vec<u8>> {
        RunId::check(&handle.run_id)?;
        validate_name(&handle.name)?;
        let path = self.run_dir(&handle.run_id).join(&handle.name);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EngineError::ArtifactNotFound {
                    run_id: handle.run_id.clone(),
                    name: handle.name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        if digest(&bytes) != handle.digest {
            return Err(EngineError::ArtifactCorrupted(handle.name.clone()));
        }
        Ok(bytes)
    }

    async fn list(&self, run_id: &RunId) -> EngineResult<Vec<ArtifactHandle>> {
        RunId::check(run_id.as_str())?;
        let run_dir = self.run_dir(run_id.as_str());
        let run_id = run_id.to_string();

        let handles = tokio::task::spawn_blocking(move || -> EngineResult<Vec<ArtifactHandle>> {
            if !run_dir.is_dir() {
                return Ok(Vec::new());
            }

            let mut handles = Vec::new();
            for entry in WalkDir::new(&run_dir).sort_by_file_name() {
                let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
                if !entry.file_type().is_file()
                    || entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX)
                {
                    continue;
                }

                let Ok(relative) = entry.path().strip_prefix(&run_dir) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                let bytes = std::fs::read(entry.path())?;
                handles.push(ArtifactHandle {
                    run_id: run_id.clone(),
                    name,
                    size: bytes.len() as u64,
                    digest: digest(&bytes),
                });
            }
            handles.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(handles)
        })
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_get_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run = RunId::new("r1");

        let handle = store
            .put(&run, "coverage/coverage_a.xml", b"<a/>".to_vec(), false)
            .await
            .unwrap();

        assert!(dir.path().join("r1/coverage/coverage_a.xml").is_file());
        assert_eq!(store.get(&handle).await.unwrap(), b"<a/>");

        let listed = store.list(&run).await.unwrap();
        assert_eq!(listed, vec![handle]);
    }

    #[tokio::test]
    async fn test_duplicate_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run = RunId::new("r1");

        let first = store.put(&run, "report", b"one".to_vec(), false).await.unwrap();
        let err = store
            .put(&run, "report", b"two".to_vec(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateArtifact { .. }));
        assert_eq!(store.get(&first).await.unwrap(), b"one");

        let second = store.put(&run, "report", b"two".to_vec(), true).await.unwrap();
        assert_eq!(store.get(&second).await.unwrap(), b"two");
        // The old handle no longer matches the stored content
        assert!(matches!(
            store.get(&first).await,
            Err(EngineError::ArtifactCorrupted(_))
        ));
        assert_eq!(store.list(&run).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_puts_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsArtifactStore::new(dir.path()));
        let run = RunId::new("r1");

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let run = run.clone();
            tasks.spawn(async move {
                store
                    .put(&run, &format!("coverage_{}.xml", i), format!("{}", i).into_bytes(), false)
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let handles = store.list(&run).await.unwrap();
        assert_eq!(handles.len(), 16);
        let found = store.find(&run, "coverage_7.xml").await.unwrap();
        assert_eq!(store.get(&found).await.unwrap(), b"7");
    }

    #[tokio::test]
    async fn test_racing_puts_same_key_leave_one_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsArtifactStore::new(dir.path()));
        let run = RunId::new("r1");

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8u8 {
            let store = Arc::clone(&store);
            let run = run.clone();
            tasks.spawn(async move { store.put(&run, "report", vec![i; 4096], false).await });
        }
        let mut winners = Vec::new();
        let mut duplicates = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(handle) => winners.push(handle),
                Err(EngineError::DuplicateArtifact { .. }) => duplicates += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(duplicates, 7);
        assert_eq!(store.get(&winners[0]).await.unwrap().len(), 4096);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("r1"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("report")]);
    }

    #[tokio::test]
    async fn test_run_id_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("artifacts");
        let store = FsArtifactStore::new(&root);

        for run in ["../escaped", "/tmp/abs", ".."] {
            let err = store
                .put(&RunId::new(run), "cov", b"x".to_vec(), false)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)), "{}", run);
            assert!(store.list(&RunId::new(run)).await.is_err());
        }
        assert!(!dir.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run = RunId::new("r1");

        assert!(store.list(&run).await.unwrap().is_empty());
        assert!(matches!(
            store.find(&run, "nope").await,
            Err(EngineError::ArtifactNotFound { .. })
        ));
        assert!(store
            .put(&run, "../outside", b"x".to_vec(), false)
            .await
            .is_err());
    }
}
