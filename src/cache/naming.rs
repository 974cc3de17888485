//! File naming for both caches.

use sha2::{Digest, Sha256};

const MAX_ASSET_NAME_CHARS: usize = 200;
const OUTPUT_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "bmp"];
const DEFAULT_OUTPUT_EXTENSION: &str = "png";

/// Derive the on-disk name of a source asset from its URL.
///
/// The last path segment is kept after dropping any `?query` and any
/// `@transform` suffix. Traversal sequences, separators and NUL are removed;
/// an empty result becomes `file_<unix millis>`; overlong names keep their
/// last 200 characters so the extension survives.
pub fn asset_file_name(url: &str, now_millis: u64) -> String {
    let without_query = url.split('?').next().unwrap_or_default();
    let without_transform = without_query.split('@').next().unwrap_or_default();
    let segment = without_transform.rsplit('/').next().unwrap_or_default();

    let sanitized = segment
        .replace("..", "")
        .replace(['/', '\\', '\0'], "");
    if sanitized.trim().is_empty() {
        return format!("file_{now_millis}");
    }

    let length = sanitized.chars().count();
    if length > MAX_ASSET_NAME_CHARS {
        sanitized.chars().skip(length - MAX_ASSET_NAME_CHARS).collect()
    } else {
        sanitized
    }
}

/// `<sha256(url)>.<ext>` where `ext` comes from the URL path when allow-listed.
pub fn output_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let segment = path.rsplit('/').next().unwrap_or_default();
    let extension = segment
        .rsplit_once('.')
        .map(|(_, extension)| extension)
        .unwrap_or_default();
    hashed_file_name(url, extension)
}

/// `<sha256(key)>.<ext>`, with `ext` forced onto the image allow-list.
pub fn hashed_file_name(key: &str, extension: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{}.{}", hex::encode(hasher.finalize()), allowed_extension(extension))
}

fn allowed_extension(extension: &str) -> &'static str {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();
    OUTPUT_EXTENSIONS
        .into_iter()
        .find(|allowed| *allowed == extension)
        .unwrap_or(DEFAULT_OUTPUT_EXTENSION)
}
