//! attune-store — content-addressed persistence: asset file blobs,
//! appearance components, and the recipes that tie them together.

pub mod component_store;
pub mod file_cache;
pub mod types;

pub use component_store::ComponentStore;
pub use file_cache::{is_allowed_extension, FileCache, ALLOWED_EXTENSIONS};
pub use types::{Component, DedupStats, FileEntry, Recipe, StoreStats};
