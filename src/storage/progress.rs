use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::CrawlerResult;
use crate::models::BulkCrawlProgress;

/// **Campaign Progress Store**
///
/// Persists `BulkCrawlProgress` records so campaigns survive restarts. The
/// control latches live in the persisted record, which is what makes pause
/// and resume trivial after a crash.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save(&self, progress: &BulkCrawlProgress) -> CrawlerResult<()>;
    async fn find(&self, operation_id: &str) -> CrawlerResult<Option<BulkCrawlProgress>>;
    async fn list(&self) -> CrawlerResult<Vec<BulkCrawlProgress>>;
    async fn delete(&self, operation_id: &str) -> CrawlerResult<bool>;
}

/// One JSON file per operation under `<base>/_progress/`, written with
/// truncate semantics. Used by every storage type.
pub struct JsonProgressStore {
    dir: PathBuf,
}

impl JsonProgressStore {
    pub fn open(base_path: &Path) -> CrawlerResult<Self> {
        let dir = base_path.join("_progress");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, operation_id: &str) -> PathBuf {
        self.dir.join(format!("{operation_id}.json"))
    }
}

#[async_trait]
impl ProgressStore for JsonProgressStore {
    async fn save(&self, progress: &BulkCrawlProgress) -> CrawlerResult<()> {
        let json = serde_json::to_vec_pretty(progress)?;
        tokio::fs::write(self.path_for(&progress.operation_id), json).await?;
        Ok(())
    }

    async fn find(&self, operation_id: &str) -> CrawlerResult<Option<BulkCrawlProgress>> {
        match tokio::fs::read_to_string(self.path_for(operation_id)).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> CrawlerResult<Vec<BulkCrawlProgress>> {
        let mut campaigns = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => match serde_json::from_str(&text) {
                    Ok(progress) => campaigns.push(progress),
                    Err(e) => warn!("Skipping unreadable campaign file {}: {e}", path.display()),
                },
                Err(e) => warn!("Could not read campaign file {}: {e}", path.display()),
            }
        }
        campaigns.sort_by(|a: &BulkCrawlProgress, b: &BulkCrawlProgress| {
            a.created_at.cmp(&b.created_at)
        });
        Ok(campaigns)
    }

    async fn delete(&self, operation_id: &str) -> CrawlerResult<bool> {
        match tokio::fs::remove_file(self.path_for(operation_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
