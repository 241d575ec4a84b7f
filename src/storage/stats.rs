//! Aggregate statistics over a history window

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::observation::Observation;

/// Summary of a target's observations over a window of days
///
/// Derived on demand from the day logs, never stored. Response times and
/// sizes are averaged over successful observations only; an empty window
/// yields the all-zero default.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    /// Number of observations in the window
    pub count: usize,

    /// Number of successful observations (the sample size of the averages)
    pub successful: usize,

    /// Share of successful observations in percent (0-100)
    pub success_rate: f64,

    pub min_response_time: f64,
    pub avg_response_time: f64,
    pub max_response_time: f64,

    /// Average downloaded size in bytes
    pub avg_size: f64,

    /// How often each received status code occurred
    pub status_codes: BTreeMap<u16, usize>,

    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl AggregateStats {
    pub fn from_observations<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> Self {
        let mut stats = AggregateStats::default();
        let mut response_time_sum = 0.0;
        let mut size_sum = 0.0;

        for observation in observations {
            stats.count += 1;

            if observation.responded() {
                *stats.status_codes.entry(observation.http_code).or_default() += 1;
            }

            stats.first = Some(match stats.first {
                Some(first) => first.min(observation.timestamp),
                None => observation.timestamp,
            });
            stats.last = Some(match stats.last {
                Some(last) => last.max(observation.timestamp),
                None => observation.timestamp,
            });

            if !observation.success {
                continue;
            }

            if stats.successful == 0 {
                stats.min_response_time = observation.response_time;
                stats.max_response_time = observation.response_time;
            } else {
                stats.min_response_time = stats.min_response_time.min(observation.response_time);
                stats.max_response_time = stats.max_response_time.max(observation.response_time);
            }

            stats.successful += 1;
            response_time_sum += observation.response_time;
            size_sum += observation.size_download as f64;
        }

        if stats.count > 0 {
            stats.success_rate = stats.successful as f64 / stats.count as f64 * 100.0;
        }

        if stats.successful > 0 {
            stats.avg_response_time = response_time_sum / stats.successful as f64;
            stats.avg_size = size_sum / stats.successful as f64;
        }

        stats
    }
}
