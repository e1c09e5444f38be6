use super::{handle_for, validate_name, ArtifactHandle, ArtifactStore};
use crate::error::{EngineError, EngineResult};
use crate::execution::report::RunId;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use std::sync::Arc;

type Key = (String, String);

/// In-process artifact store, used by tests and dry runs
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: DashMap<Key, (ArtifactHandle, Arc<Vec<u8>>)>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        run_id: &RunId,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> EngineResult<ArtifactHandle> {
        validate_name(name)?;
        let handle = handle_for(run_id, name, &bytes);
        let value = (handle.clone(), Arc::new(bytes));

        // The entry holds the shard lock, so check-and-insert is atomic
        match self.entries.entry((run_id.to_string(), name.to_string())) {
            Entry::Occupied(mut entry) => {
                if !overwrite {
                    return Err(EngineError::DuplicateArtifact {
                        run_id: run_id.to_string(),
                        name: name.to_string(),
                    });
                }
                entry.insert(value);
            }
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }

        Ok(handle)
    }

    async fn get(&self, handle: &ArtifactHandle) -> EngineResult<Vec<u8>> {
        let key = (handle.run_id.clone(), handle.name.clone());
        let Some(entry) = self.entries.get(&key) else {
            return Err(EngineError::ArtifactNotFound {
                run_id: handle.run_id.clone(),
                name: handle.name.clone(),
            });
        };

        let (stored, bytes) = entry.value();
        if stored.digest != handle.digest {
            return Err(EngineError::ArtifactCorrupted(handle.name.clone()));
        }
        Ok(bytes.as_ref().clone())
    }

    async fn list(&self, run_id: &RunId) -> EngineResult<Vec<ArtifactHandle>> {
        let mut handles: Vec<ArtifactHandle> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == run_id.as_str())
            .map(|entry| entry.value().0.clone())
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryArtifactStore::new();
        let run = RunId::new("r1");

        let handle = store
            .put(&run, "coverage_a.xml", b"<coverage/>".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(handle.size, 11);
        assert_eq!(store.get(&handle).await.unwrap(), b"<coverage/>");
    }

    #[tokio::test]
    async fn test_duplicate_without_overwrite() {
        let store = MemoryArtifactStore::new();
        let run = RunId::new("r1");

        store.put(&run, "report", b"one".to_vec(), false).await.unwrap();
        let err = store
            .put(&run, "report", b"two".to_vec(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateArtifact { .. }));

        let replaced = store.put(&run, "report", b"two".to_vec(), true).await.unwrap();
        assert_eq!(store.get(&replaced).await.unwrap(), b"two");

        // Same name in another run is a different key
        store
            .put(&RunId::new("r2"), "report", b"one".to_vec(), false)
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_puts_distinct_keys() {
        let store = Arc::new(MemoryArtifactStore::new());
        let run = RunId::new("r1");

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            let run = run.clone();
            tasks.spawn(async move {
                store
                    .put(&run, &format!("coverage_{}.xml", i), vec![i as u8; 64], false)
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let handles = store.list(&run).await.unwrap();
        assert_eq!(handles.len(), 32);
        for handle in &handles {
            assert_eq!(store.get(handle).await.unwrap().len(), 64);
        }
    }

    #[tokio::test]
    async fn test_concurrent_puts_same_key_exactly_one_wins() {
        let store = Arc::new(MemoryArtifactStore::new());
        let run = RunId::new("r1");

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16u8 {
            let store = Arc::clone(&store);
            let run = run.clone();
            tasks.spawn(async move { store.put(&run, "shared", vec![i], false).await });
        }

        let mut successes = 0;
        let mut duplicates = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => successes += 1,
                Err(EngineError::DuplicateArtifact { .. }) => duplicates += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(duplicates, 15);
    }

    #[tokio::test]
    async fn test_find_missing_artifact() {
        let store = MemoryArtifactStore::new();
        let err = store.find(&RunId::new("r1"), "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::ArtifactNotFound { .. }));
    }
}
