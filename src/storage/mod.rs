//! Time-series storage for observations
//!
//! Observations are kept as one JSON array per target and calendar day.
//! Young days stay as plain JSON so appends are cheap; days past the
//! compression threshold are gzipped; days past the retention horizon are
//! deleted.
//!
//! ## Design
//!
//! - **Trait-based**: `TimeSeriesStore` is what the coordinator depends on
//! - **Per-target, per-day files**: no cross-target contention, reads load
//!   only the requested days, maintenance is a matter of file age
//! - **Atomic rewrites**: a day log is written to a temp file and renamed
//!
//! ## Usage
//!
//! ```no_run
//! use sitewatch::storage::{FileStore, TimeSeriesStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = FileStore::new("./data").await?;
//!     let stats = store.stats("example", 7).await?;
//!     println!("{} observations", stats.count);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod file;
pub mod schema;
pub mod stats;

pub use backend::{History, TimeSeriesStore};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use stats::AggregateStats;
