use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use metrics::counter;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::infra::{
    fetcher::{AssetFetcher, RetryPolicy, fetch_with_retry},
    net_guard::is_private_target,
};

use super::{
    category::CacheCategory,
    clock::{Clock, SystemClock, epoch_millis},
    disk,
    error::CacheError,
    naming::asset_file_name,
};

const LOCAL_PREFIX: &str = "cache/";

/// Category-partitioned cache of downloaded source assets (avatars, covers,
/// emoji) and of finished cards stored for reuse.
///
/// Recency is sliding: every hit stamps the file's mtime, so an asset that
/// keeps being drawn is never swept by [`AssetSweeper`](super::AssetSweeper).
pub struct AssetCache {
    root: PathBuf,
    fetcher: Arc<dyn AssetFetcher>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    download_original: bool,
}

enum Lookup {
    Hit(Vec<u8>),
    Miss(PathBuf),
}

impl AssetCache {
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            download_original: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// When disabled, [`fetch_or_fallback`](Self::fetch_or_fallback) goes
    /// straight to the fallback URL.
    pub fn with_download_original(mut self, download_original: bool) -> Self {
        self.download_original = download_original;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: CacheCategory) -> PathBuf {
        self.root.join(category.path())
    }

    /// Return the bytes for `url`, downloading on a miss.
    ///
    /// `None` covers every failure: local `cache/` references that are not on
    /// disk, blocked private targets, and downloads that failed after retry.
    pub async fn fetch(&self, url: &str, category: CacheCategory) -> Option<Bytes> {
        let now = self.clock.now();
        let name = asset_file_name(url, epoch_millis(now));
        let root = self.root.clone();

        let path = match spawn_blocking(move || lookup(&root, category, &name, now)).await {
            Ok(Ok(Lookup::Hit(contents))) => {
                counter!("feedcard_asset_cache_hit_total", "category" => category.as_str())
                    .increment(1);
                return Some(Bytes::from(contents));
            }
            Ok(Ok(Lookup::Miss(path))) => path,
            Ok(Err(err)) => {
                warn!(
                    target = "cache::assets",
                    op = "fetch",
                    url,
                    %category,
                    error = %err,
                    "Failed to read cached asset"
                );
                return None;
            }
            Err(err) => {
                warn!(
                    target = "cache::assets",
                    op = "fetch",
                    url,
                    error = %err,
                    "Cache lookup task failed"
                );
                return None;
            }
        };
        counter!("feedcard_asset_cache_miss_total", "category" => category.as_str()).increment(1);

        if url.starts_with(LOCAL_PREFIX) {
            debug!(
                target = "cache::assets",
                op = "fetch",
                url,
                result = "local_missing",
                "Local cache reference not on disk"
            );
            return None;
        }

        if is_private_target(url) {
            counter!("feedcard_asset_cache_blocked_total").increment(1);
            warn!(
                target = "cache::assets",
                op = "fetch",
                url,
                result = "blocked",
                "Refusing to fetch private network target"
            );
            return None;
        }

        let bytes = fetch_with_retry(self.fetcher.as_ref(), url, self.retry)
            .await
            .ok()?;

        let contents = bytes.clone();
        let stamp = self.clock.now();
        let target = path.clone();
        match spawn_blocking(move || disk::write_atomic(&target, &contents, stamp)).await {
            Ok(Ok(())) => debug!(
                target = "cache::assets",
                op = "fetch",
                url,
                path = %path.display(),
                bytes = bytes.len(),
                "Asset cached"
            ),
            Ok(Err(err)) => warn!(
                target = "cache::assets",
                op = "fetch",
                path = %path.display(),
                error = %err,
                "Failed to persist downloaded asset; serving it uncached"
            ),
            Err(err) => warn!(
                target = "cache::assets",
                op = "fetch",
                error = %err,
                "Asset write task failed; serving it uncached"
            ),
        }

        Some(bytes)
    }

    /// Try `url` (when original downloads are enabled), then `fallback_url`.
    /// `None` means the caller draws its placeholder.
    pub async fn fetch_or_fallback(
        &self,
        url: &str,
        fallback_url: &str,
        category: CacheCategory,
    ) -> Option<Bytes> {
        if self.download_original {
            if let Some(bytes) = self.fetch(url, category).await {
                return Some(bytes);
            }
        }
        self.fetch(fallback_url, category).await
    }

    /// Persist a finished artifact at `relative_path` inside `category`,
    /// creating nested directories. Returns the absolute file path.
    pub async fn store(
        &self,
        category: CacheCategory,
        relative_path: &str,
        contents: Bytes,
    ) -> Result<PathBuf, CacheError> {
        let relative = validate_relative(relative_path)?;
        let path = self.category_dir(category).join(relative);
        let stamp = self.clock.now();

        let target = path.clone();
        spawn_blocking(move || disk::write_atomic(&target, &contents, stamp))
            .await?
            .map_err(|err| CacheError::io(&path, err))?;

        counter!("feedcard_asset_cache_stored_total", "category" => category.as_str())
            .increment(1);
        Ok(std::path::absolute(&path).unwrap_or(path))
    }
}

fn lookup(
    root: &Path,
    category: CacheCategory,
    name: &str,
    now: SystemTime,
) -> std::io::Result<Lookup> {
    let path = match category {
        CacheCategory::Unknown => disk::find_file(root, name)
            .unwrap_or_else(|| root.join(CacheCategory::Other.path()).join(name)),
        category => root.join(category.path()).join(name),
    };

    Ok(match disk::read_and_touch(&path, now)? {
        Some(contents) => Lookup::Hit(contents),
        None => Lookup::Miss(path),
    })
}

fn validate_relative(relative_path: &str) -> Result<PathBuf, CacheError> {
    let relative = Path::new(relative_path);
    let valid = !relative_path.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if !valid || relative.file_name().is_none() {
        return Err(CacheError::InvalidPath(relative_path.to_string()));
    }
    Ok(relative.to_path_buf())
}
