// Artifact Store
// Named byte blobs scoped to a run

pub mod fs;
pub mod memory;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;

use crate::error::{EngineError, EngineResult};
use crate::execution::report::RunId;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use std::path::PathBuf;

/// Reference to a stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub run_id: String,
    pub name: String,
    pub size: u64,
    /// Hex-encoded sha256 of the content
    pub digest: String,
}

/// An artifact captured by a job instance
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    #[serde(flatten)]
    pub handle: ArtifactHandle,
    /// File the content was read from
    pub source_path: PathBuf,
    /// Key of the instance that uploaded it
    pub instance: String,
    pub created_at: DateTime<Utc>,
}

/// Storage for run artifacts.
///
/// `put` must be atomic per (run id, name): of two concurrent puts of the
/// same key without `overwrite`, exactly one succeeds.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under (run id, name)
    async fn put(
        &self,
        run_id: &RunId,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> EngineResult<ArtifactHandle>;

    /// Read back the content of an artifact
    async fn get(&self, handle: &ArtifactHandle) -> EngineResult<Vec<u8>>;

    /// All artifacts of a run, ordered by name
    async fn list(&self, run_id: &RunId) -> EngineResult<Vec<ArtifactHandle>>;

    /// Look up an artifact by name
    async fn find(&self, run_id: &RunId, name: &str) -> EngineResult<ArtifactHandle> {
        self.list(run_id)
            .await?
            .into_iter()
            .find(|handle| handle.name == name)
            .ok_or_else(|| EngineError::ArtifactNotFound {
                run_id: run_id.to_string(),
                name: name.to_string(),
            })
    }
}

/// Hex sha256 of `bytes`
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check an artifact name: non-empty, relative, `/`-separated, no `..`
pub fn validate_name(name: &str) -> EngineResult<()> {
    const INVALID_CHARS: [char; 8] = ['"', ':', '<', '>', '|', '*', '?', '\\'];

    let invalid = |reason: &str| {
        Err(EngineError::InvalidInput(format!(
            "invalid artifact name '{}': {}",
            name, reason
        )))
    };

    if name.trim().is_empty() {
        return invalid("name is empty");
    }
    if let Some(c) = name.chars().find(|c| INVALID_CHARS.contains(c) || c.is_control()) {
        return invalid(&format!("contains '{}'", c.escape_default()));
    }

    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return invalid("must be a relative path without empty, '.' or '..' segments");
    }

    Ok(())
}

fn handle_for(run_id: &RunId, name: &str, bytes: &[u8]) -> ArtifactHandle {
    ArtifactHandle {
        run_id: run_id.to_string(),
        name: name.to_string(),
        size: bytes.len() as u64,
        digest: digest(bytes),
    }
}
