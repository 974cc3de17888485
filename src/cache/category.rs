use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Partition of the source asset cache. Each category owns a directory under
/// the cache root; the drawing categories nest under `draw/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Draw,
    DrawDynamic,
    DrawLive,
    DrawSearch,
    Images,
    Emoji,
    User,
    Other,
    /// No fixed directory: lookups search the whole cache tree.
    Unknown,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 9] = [
        CacheCategory::Draw,
        CacheCategory::DrawDynamic,
        CacheCategory::DrawLive,
        CacheCategory::DrawSearch,
        CacheCategory::Images,
        CacheCategory::Emoji,
        CacheCategory::User,
        CacheCategory::Other,
        CacheCategory::Unknown,
    ];

    /// Categories swept by default, with their retention in days.
    pub const DEFAULT_EXPIRING: [CacheCategory; 5] = [
        CacheCategory::Draw,
        CacheCategory::Images,
        CacheCategory::Emoji,
        CacheCategory::User,
        CacheCategory::Other,
    ];

    /// Directory relative to the cache root. Empty for [`CacheCategory::Unknown`].
    pub fn path(self) -> &'static str {
        match self {
            CacheCategory::Draw => "draw",
            CacheCategory::DrawDynamic => "draw/dynamic",
            CacheCategory::DrawLive => "draw/live",
            CacheCategory::DrawSearch => "draw/search",
            CacheCategory::Images => "images",
            CacheCategory::Emoji => "emoji",
            CacheCategory::User => "user",
            CacheCategory::Other => "other",
            CacheCategory::Unknown => "",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheCategory::Draw => "draw",
            CacheCategory::DrawDynamic => "draw_dynamic",
            CacheCategory::DrawLive => "draw_live",
            CacheCategory::DrawSearch => "draw_search",
            CacheCategory::Images => "images",
            CacheCategory::Emoji => "emoji",
            CacheCategory::User => "user",
            CacheCategory::Other => "other",
            CacheCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown cache category `{0}`")]
pub struct ParseCategoryError(pub String);

impl FromStr for CacheCategory {
    type Err = ParseCategoryError;

    /// Accepts the snake-case name (`draw_live`) or the directory (`draw/live`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        CacheCategory::ALL
            .into_iter()
            .find(|category| {
                category.as_str() == normalized
                    || (!category.path().is_empty() && category.path() == normalized)
            })
            .ok_or_else(|| ParseCategoryError(value.to_string()))
    }
}
