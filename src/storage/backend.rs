//! Storage backend trait definition
//!
//! This module defines the `TimeSeriesStore` trait the run coordinator
//! talks to. The only implementation shipped is the file-based
//! [`FileStore`](super::file::FileStore).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::error::StorageResult;
use super::stats::AggregateStats;
use crate::observation::Observation;

/// Observations of one target grouped by calendar day, oldest day first
pub type History = BTreeMap<NaiveDate, Vec<Observation>>;

/// Append-only, per-target, per-day observation store
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; different targets may be written
/// concurrently, while writes to the same day log are serialized.
///
/// ## Error Handling
///
/// Errors are scoped to the file they concern. Maintenance operations skip
/// files that fail and report how many files they did process.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Append an observation to the log of its target and calendar day
    ///
    /// Creates the target's namespace when missing. The day log is either
    /// fully rewritten or left untouched.
    async fn append(&self, observation: &Observation) -> StorageResult<()>;

    /// Observations of the most recent `days` calendar days (today included)
    ///
    /// Open and compressed logs are merged transparently; days without data
    /// are absent from the map.
    async fn history(&self, target: &str, days: u32) -> StorageResult<History>;

    /// Aggregate statistics over [`history`](Self::history)
    ///
    /// Returns the zero-valued statistics when there is no data.
    async fn stats(&self, target: &str, days: u32) -> StorageResult<AggregateStats> {
        let history = self.history(target, days).await?;
        Ok(AggregateStats::from_observations(history.values().flatten()))
    }

    /// Compress every open day log older than `days`
    ///
    /// Returns the number of day logs compressed by this call; already
    /// compressed days are not counted.
    async fn compress_older_than(&self, days: u32) -> StorageResult<usize>;

    /// Delete every day log (open or compressed) older than `days`
    ///
    /// Returns the number of files removed.
    async fn delete_older_than(&self, days: u32) -> StorageResult<usize>;

    /// All namespaces that have ever stored data
    async fn list_targets(&self) -> StorageResult<Vec<String>>;
}
