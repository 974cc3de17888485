//! Disk caches feeding and storing drawings.
//!
//! - [`AssetCache`]: downloaded source assets, partitioned by
//!   [`CacheCategory`], with sliding (access-refreshed) retention enforced by
//!   [`AssetSweeper`].
//! - [`OutputCache`]: finished artifacts keyed by URL hash, with a fixed
//!   freshness window, age expiry and a size budget.
//!
//! Lookups degrade to `None` on any failure; only explicit maintenance and
//! store operations return [`CacheError`].

mod assets;
mod category;
mod clock;
mod disk;
mod error;
mod naming;
mod output;
mod sweep;

pub use assets::AssetCache;
pub use category::{CacheCategory, ParseCategoryError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CacheError;
pub use naming::{asset_file_name, hashed_file_name, output_file_name};
pub use output::{CacheStats, CleanReport, LocalReference, OutputCache, OutputPolicy};
pub use sweep::{AssetSweeper, ExpiryTable, SweepReport, default_expiries};
