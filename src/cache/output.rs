use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    infra::{
        fetcher::{AssetFetcher, RetryPolicy, fetch_with_retry},
        net_guard::is_private_target,
    },
    util::bytes::{format_bytes, mebibytes},
};

use super::{
    clock::{Clock, SystemClock},
    disk,
    error::CacheError,
    naming::{hashed_file_name, output_file_name},
};

const FILE_SCHEME: &str = "file://";

/// Retention knobs for [`OutputCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPolicy {
    /// Entries younger than this are served without network access.
    pub freshness: Duration,
    /// Entries older than this are removed by `clean_expired_cache`.
    pub max_age: Duration,
    /// Size budget enforced by `clean_cache`.
    pub max_bytes: u64,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(24 * 60 * 60),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_bytes: mebibytes(1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub before: CacheStats,
    pub after: CacheStats,
    pub expired_removed: usize,
    pub evicted: usize,
}

/// A cached artifact on local disk, addressable by the chat client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReference {
    path: PathBuf,
    url: String,
}

impl LocalReference {
    fn from_path(path: PathBuf) -> Self {
        let url = file_url(&path);
        Self { path, url }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `file://` URL with forward slashes.
    pub fn file_url(&self) -> &str {
        &self.url
    }
}

/// Flat, hash-keyed cache of finished artifacts and the remote images the
/// chat client is pointed at.
///
/// Recency is fixed: reads never touch an entry, so its age is always the
/// time since it was written.
pub struct OutputCache {
    dir: PathBuf,
    data_dir: PathBuf,
    fetcher: Arc<dyn AssetFetcher>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    policy: OutputPolicy,
}

impl OutputCache {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn AssetFetcher>) -> Self {
        let dir = dir.into();
        let data_dir = dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            dir,
            data_dir,
            fetcher,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            policy: OutputPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: OutputPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Base for relative paths passed to [`to_file_url`](Self::to_file_url).
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> OutputPolicy {
        self.policy
    }

    /// Local copy of `url`, downloading when absent or stale.
    pub async fn get_or_fetch(&self, url: &str) -> Option<LocalReference> {
        if url.trim().is_empty() {
            return None;
        }
        if url.starts_with(FILE_SCHEME) {
            return Some(LocalReference {
                path: file_url_path(url),
                url: url.to_string(),
            });
        }

        let path = self.dir.join(output_file_name(url));
        let now = self.clock.now();
        let freshness = self.policy.freshness;
        let target = path.clone();
        let fresh = spawn_blocking(move || disk::modified(&target))
            .await
            .ok()
            .and_then(Result::ok)
            .flatten()
            .is_some_and(|modified| disk::age(now, modified) < freshness);

        if fresh {
            counter!("feedcard_output_cache_hit_total").increment(1);
            debug!(
                target = "cache::output",
                op = "get_or_fetch",
                result = "hit",
                path = %path.display(),
                "Serving cached artifact"
            );
            return Some(LocalReference::from_path(absolute(path)));
        }
        counter!("feedcard_output_cache_miss_total").increment(1);

        if is_private_target(url) {
            counter!("feedcard_output_cache_blocked_total").increment(1);
            warn!(
                target = "cache::output",
                op = "get_or_fetch",
                url,
                result = "blocked",
                "Refusing to fetch private network target"
            );
            return None;
        }

        let bytes = fetch_with_retry(self.fetcher.as_ref(), url, self.retry)
            .await
            .ok()?;
        match self.write(path, bytes).await {
            Ok(reference) => Some(reference),
            Err(err) => {
                warn!(
                    target = "cache::output",
                    op = "get_or_fetch",
                    url,
                    error = %err,
                    "Failed to persist downloaded artifact"
                );
                None
            }
        }
    }

    /// Store a rendered artifact under `sha256(key)` with an allow-listed extension.
    pub async fn put(
        &self,
        key: &str,
        extension: &str,
        contents: Bytes,
    ) -> Result<LocalReference, CacheError> {
        let path = self.dir.join(hashed_file_name(key, extension));
        self.write(path, contents).await
    }

    /// `file://` URL for `path`; relative paths resolve against the data directory.
    pub fn to_file_url(&self, path: impl AsRef<Path>) -> String {
        let path = path.as_ref();
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        };
        file_url(&absolute(resolved))
    }

    /// Remove entries older than the policy's `max_age`. Returns how many went.
    pub async fn clean_expired_cache(&self) -> Result<usize, CacheError> {
        let dir = self.dir.clone();
        let now = self.clock.now();
        let max_age = self.policy.max_age;
        let removed = spawn_blocking(move || remove_expired(&dir, now, max_age)).await??;
        if removed > 0 {
            counter!("feedcard_output_cache_evicted_total", "reason" => "expired")
                .increment(removed as u64);
        }
        Ok(removed)
    }

    /// Remove oldest entries until the total size is within `max_bytes`.
    pub async fn clean_by_size(&self, max_bytes: u64) -> Result<usize, CacheError> {
        let dir = self.dir.clone();
        let evicted = spawn_blocking(move || evict_to_budget(&dir, max_bytes)).await??;
        if evicted > 0 {
            counter!("feedcard_output_cache_evicted_total", "reason" => "size")
                .increment(evicted as u64);
        }
        Ok(evicted)
    }

    /// Age expiry followed by the size budget.
    pub async fn clean_cache(&self) -> Result<CleanReport, CacheError> {
        let started = Instant::now();
        let before = self.cache_stats().await;
        let expired_removed = self.clean_expired_cache().await?;
        let evicted = self.clean_by_size(self.policy.max_bytes).await?;
        let after = self.cache_stats().await;

        info!(
            target = "cache::output",
            op = "clean_cache",
            files_before = before.file_count,
            files_after = after.file_count,
            size_before = %format_bytes(before.total_bytes),
            size_after = %format_bytes(after.total_bytes),
            expired_removed,
            evicted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Output cache cleaned"
        );

        Ok(CleanReport {
            before,
            after,
            expired_removed,
            evicted,
        })
    }

    /// File count and total size. Unreadable directories report as empty.
    pub async fn cache_stats(&self) -> CacheStats {
        let dir = self.dir.clone();
        let files = spawn_blocking(move || disk::list_files(&dir)).await;
        let (file_count, total_bytes) = match files {
            Ok(Ok(files)) => (files.len(), files.iter().map(|file| file.size).sum()),
            Ok(Err(err)) => {
                warn!(
                    target = "cache::output",
                    op = "cache_stats",
                    error = %err,
                    "Failed to list output cache"
                );
                (0, 0)
            }
            Err(err) => {
                warn!(
                    target = "cache::output",
                    op = "cache_stats",
                    error = %err,
                    "Output cache stats task failed"
                );
                (0, 0)
            }
        };

        CacheStats {
            file_count,
            total_bytes,
            directory: absolute(self.dir.clone()),
        }
    }

    async fn write(&self, path: PathBuf, contents: Bytes) -> Result<LocalReference, CacheError> {
        let stamp = self.clock.now();
        let target = path.clone();
        let size = contents.len();
        spawn_blocking(move || disk::write_atomic(&target, &contents, stamp))
            .await?
            .map_err(|err| CacheError::io(&path, err))?;

        debug!(
            target = "cache::output",
            op = "write",
            path = %path.display(),
            bytes = size,
            "Artifact cached"
        );
        Ok(LocalReference::from_path(absolute(path)))
    }
}

fn remove_expired(dir: &Path, now: SystemTime, max_age: Duration) -> Result<usize, CacheError> {
    let files = disk::list_files(dir).map_err(|err| CacheError::io(dir, err))?;
    Ok(expire_files(files, now, max_age, disk::remove))
}

fn expire_files(
    files: Vec<disk::CachedFile>,
    now: SystemTime,
    max_age: Duration,
    mut remove: impl FnMut(&Path) -> std::io::Result<bool>,
) -> usize {
    let mut removed = 0;
    for file in files {
        if disk::age(now, file.modified) <= max_age {
            continue;
        }
        match remove(&file.path) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(err) => warn!(
                target = "cache::output",
                op = "clean_expired_cache",
                path = %file.path.display(),
                error = %err,
                "Failed to remove expired artifact"
            ),
        }
    }
    removed
}

fn evict_to_budget(dir: &Path, max_bytes: u64) -> Result<usize, CacheError> {
    let files = disk::list_files(dir).map_err(|err| CacheError::io(dir, err))?;
    Ok(evict_oldest(files, max_bytes, disk::remove))
}

/// Oldest mtime first until the total fits. Files that cannot be removed are
/// skipped and still count towards the total.
fn evict_oldest(
    mut files: Vec<disk::CachedFile>,
    max_bytes: u64,
    mut remove: impl FnMut(&Path) -> std::io::Result<bool>,
) -> usize {
    let mut total: u64 = files.iter().map(|file| file.size).sum();
    if total <= max_bytes {
        return 0;
    }

    files.sort_by_key(|file| file.modified);
    let mut evicted = 0;
    for file in files {
        if total <= max_bytes {
            break;
        }
        match remove(&file.path) {
            Ok(removed) => {
                if removed {
                    evicted += 1;
                }
                total = total.saturating_sub(file.size);
            }
            Err(err) => warn!(
                target = "cache::output",
                op = "clean_by_size",
                path = %file.path.display(),
                error = %err,
                "Failed to evict artifact; trying the next oldest"
            ),
        }
    }
    debug!(
        target = "cache::output",
        op = "clean_by_size",
        evicted,
        remaining = %format_bytes(total),
        budget = %format_bytes(max_bytes),
        "Evicted oldest artifacts"
    );
    evicted
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

fn file_url(path: &Path) -> String {
    match Url::from_file_path(path) {
        Ok(url) => url.into(),
        Err(()) => {
            let display = path.to_string_lossy().replace('\\', "/");
            format!("file:///{}", display.trim_start_matches('/'))
        }
    }
}

fn file_url_path(url: &str) -> PathBuf {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.to_file_path().ok())
        .unwrap_or_else(|| PathBuf::from(url.trim_start_matches(FILE_SCHEME)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::{cache::clock::ManualClock, infra::fetcher::FetchError};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AssetFetcher for CountingFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"remote-image"))
        }
    }

    fn start() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_urls_pass_through() {
        let dir = TempDir::new().expect("temp dir");
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = OutputCache::new(dir.path(), fetcher.clone());

        let reference = cache
            .get_or_fetch("file:///tmp/card.png")
            .await
            .expect("reference");
        assert_eq!(reference.file_url(), "file:///tmp/card.png");
        assert_eq!(reference.path(), Path::new("/tmp/card.png"));
        assert!(cache.get_or_fetch("   ").await.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_entries_are_refetched() {
        let dir = TempDir::new().expect("temp dir");
        let fetcher = Arc::new(CountingFetcher::default());
        let clock = Arc::new(ManualClock::new(start()));
        let cache = OutputCache::new(dir.path(), fetcher.clone()).with_clock(clock.clone());
        let url = "https://example.com/cover.jpg";

        cache.get_or_fetch(url).await.expect("download");
        clock.advance(Duration::from_secs(23 * 60 * 60));
        cache.get_or_fetch(url).await.expect("fresh hit");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(2 * 60 * 60));
        cache.get_or_fetch(url).await.expect("refetch");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expiry_removes_entries_older_than_max_age() {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::new(start()));
        let cache = OutputCache::new(dir.path(), Arc::new(CountingFetcher::default()))
            .with_clock(clock.clone());

        disk::write_atomic(
            &dir.path().join("old.png"),
            b"old",
            start() - Duration::from_secs(8 * 24 * 60 * 60),
        )
        .expect("write");
        disk::write_atomic(
            &dir.path().join("recent.png"),
            b"recent",
            start() - Duration::from_secs(24 * 60 * 60),
        )
        .expect("write");

        assert_eq!(cache.clean_expired_cache().await.expect("clean"), 1);
        assert!(!dir.path().join("old.png").exists());
        assert!(dir.path().join("recent.png").exists());
    }

    #[tokio::test]
    async fn put_and_stats() {
        let dir = TempDir::new().expect("temp dir");
        let cache = OutputCache::new(dir.path(), Arc::new(CountingFetcher::default()));

        let reference = cache
            .put("dynamic:123", "png", Bytes::from_static(b"12345"))
            .await
            .expect("put");
        assert!(reference.file_url().starts_with("file:///"));
        assert!(reference.path().is_file());

        let stats = cache.cache_stats().await;
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.total_bytes, 5);
    }

    #[cfg(unix)]
    #[test]
    fn relative_paths_resolve_against_data_dir() {
        let cache = OutputCache::new(
            "/srv/feedcard/data/image_cache",
            Arc::new(CountingFetcher::default()),
        );
        assert_eq!(
            cache.to_file_url("cache/draw/1.png"),
            "file:///srv/feedcard/data/cache/draw/1.png"
        );
        assert_eq!(cache.to_file_url("/abs/x.png"), "file:///abs/x.png");
    }

    fn cached(name: &str, size: u64, modified: SystemTime) -> disk::CachedFile {
        disk::CachedFile {
            path: PathBuf::from(name),
            size,
            modified,
        }
    }

    fn refuse(name: &'static str) -> impl FnMut(&Path) -> std::io::Result<bool> {
        move |path| {
            if path == Path::new(name) {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"))
            } else {
                Ok(true)
            }
        }
    }

    #[test]
    fn eviction_skips_files_it_cannot_remove() {
        let base = start();
        let files = vec![
            cached("a.png", 100, base),
            cached("b.png", 100, base + Duration::from_secs(1)),
            cached("c.png", 100, base + Duration::from_secs(2)),
            cached("d.png", 100, base + Duration::from_secs(3)),
        ];

        let mut attempted = Vec::new();
        let mut remove = refuse("a.png");
        let evicted = evict_oldest(files, 250, |path: &Path| {
            attempted.push(path.to_path_buf());
            remove(path)
        });

        assert_eq!(evicted, 2);
        assert_eq!(
            attempted,
            vec![
                PathBuf::from("a.png"),
                PathBuf::from("b.png"),
                PathBuf::from("c.png"),
            ]
        );
    }

    #[test]
    fn expiry_continues_past_a_failed_removal() {
        let now = start();
        let old = now - Duration::from_secs(8 * 24 * 60 * 60);
        let files = vec![
            cached("locked.png", 10, old),
            cached("stale.png", 10, old),
            cached("fresh.png", 10, now),
        ];

        let removed = expire_files(files, now, OutputPolicy::default().max_age, refuse("locked.png"));
        assert_eq!(removed, 1);
    }
}
