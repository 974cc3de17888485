use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::counter;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::util::bytes::format_bytes;

use super::{
    category::CacheCategory,
    clock::{Clock, SystemClock},
    disk,
    error::CacheError,
};

const DEFAULT_EXPIRY_DAYS: u32 = 7;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Retention per category in days. Zero disables sweeping for that category.
pub type ExpiryTable = BTreeMap<CacheCategory, u32>;

pub fn default_expiries() -> ExpiryTable {
    CacheCategory::DEFAULT_EXPIRING
        .into_iter()
        .map(|category| (category, DEFAULT_EXPIRY_DAYS))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: BTreeMap<CacheCategory, usize>,
    pub freed_bytes: u64,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.removed.values().sum()
    }
}

/// Deletes source assets not accessed within their category's retention.
///
/// Each category directory is walked recursively, so `draw` also covers
/// `draw/dynamic`, `draw/live` and `draw/search`.
pub struct AssetSweeper {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl AssetSweeper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn sweep(&self, expiries: &ExpiryTable) -> Result<SweepReport, CacheError> {
        let started = Instant::now();
        let root = self.root.clone();
        let now = self.clock.now();
        let expiries = expiries.clone();

        let report = spawn_blocking(move || {
            let mut report = SweepReport::default();
            for (category, days) in expiries {
                if days == 0 {
                    continue;
                }
                let retention = Duration::from_secs(u64::from(days) * SECS_PER_DAY);
                let mut removed = 0;
                for file in disk::walk_files(&root.join(category.path())) {
                    if disk::age(now, file.modified) < retention {
                        continue;
                    }
                    match disk::remove(&file.path) {
                        Ok(true) => {
                            removed += 1;
                            report.freed_bytes += file.size;
                            debug!(
                                target = "cache::sweep",
                                %category,
                                path = %file.path.display(),
                                age_days = disk::age(now, file.modified).as_secs() / SECS_PER_DAY,
                                "Removed expired asset"
                            );
                        }
                        Ok(false) => {}
                        Err(err) => warn!(
                            target = "cache::sweep",
                            %category,
                            path = %file.path.display(),
                            error = %err,
                            "Failed to remove expired asset"
                        ),
                    }
                }
                if removed > 0 {
                    counter!("feedcard_asset_cache_expired_total", "category" => category.as_str())
                        .increment(removed as u64);
                }
                report.removed.insert(category, removed);
            }
            report
        })
        .await?;

        info!(
            target = "cache::sweep",
            op = "sweep",
            removed = report.total_removed(),
            freed = %format_bytes(report.freed_bytes),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Asset sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::clock::ManualClock;

    #[tokio::test]
    async fn removes_only_files_past_retention() {
        let dir = TempDir::new().expect("temp dir");
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = Arc::new(ManualClock::new(start));

        let old = start - Duration::from_secs(8 * SECS_PER_DAY);
        let fresh = start - Duration::from_secs(SECS_PER_DAY);
        disk::write_atomic(&dir.path().join("draw/live/old.png"), b"old", old).expect("write");
        disk::write_atomic(&dir.path().join("draw/fresh.png"), b"fresh", fresh).expect("write");
        disk::write_atomic(&dir.path().join("emoji/old.png"), b"kept", old).expect("write");

        let sweeper = AssetSweeper::new(dir.path()).with_clock(clock);
        let expiries = ExpiryTable::from([(CacheCategory::Draw, 7), (CacheCategory::Emoji, 0)]);
        let report = sweeper.sweep(&expiries).await.expect("sweep");

        assert_eq!(report.removed.get(&CacheCategory::Draw), Some(&1));
        assert_eq!(report.freed_bytes, 3);
        assert!(!dir.path().join("draw/live/old.png").exists());
        assert!(dir.path().join("draw/fresh.png").exists());
        assert!(dir.path().join("emoji/old.png").exists());
    }

    #[tokio::test]
    async fn missing_category_directories_are_empty() {
        let dir = TempDir::new().expect("temp dir");
        let report = AssetSweeper::new(dir.path())
            .sweep(&default_expiries())
            .await
            .expect("sweep");
        assert_eq!(report.total_removed(), 0);
        assert_eq!(report.removed.len(), 5);
    }
}
