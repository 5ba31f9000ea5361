//! Rotation policies and the decision of when to rotate

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the active file must be replaced by a fresh one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RotationPolicy {
    /// The file grows until the sink is stopped
    #[default]
    Never,
    /// Rotate once the next write would push the file past `bytes`
    Size { bytes: u64 },
    /// Rotate once the file is older than `seconds`
    Interval { seconds: u64 },
    /// Rotate at the first top of the hour after the file was opened
    Hourly,
    /// Rotate at the first UTC midnight after the file was opened
    Daily,
}

impl RotationPolicy {
    /// Interval policy from a [`Duration`]
    pub fn every(interval: Duration) -> Self {
        RotationPolicy::Interval {
            seconds: interval.as_secs(),
        }
    }

    /// Whether any rotation can ever happen under this policy
    pub fn is_enabled(&self) -> bool {
        !matches!(self, RotationPolicy::Never)
    }
}

/// What the trigger needs to know about the active file
#[derive(Debug, Clone, Copy)]
pub struct FileState {
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Decide whether the active file must be rotated before accepting a write
/// of `incoming` bytes at `now`
pub fn should_rotate(
    state: &FileState,
    policy: &RotationPolicy,
    incoming: u64,
    now: DateTime<Utc>,
) -> bool {
    match *policy {
        RotationPolicy::Never => false,
        RotationPolicy::Size { bytes } => state.size.saturating_add(incoming) > bytes,
        RotationPolicy::Interval { seconds } => {
            match ChronoDuration::from_std(Duration::from_secs(seconds)) {
                Ok(interval) => now.signed_duration_since(state.created_at) >= interval,
                Err(_) => false,
            }
        }
        RotationPolicy::Hourly => next_boundary(state.created_at, BoundaryUnit::Hour)
            .map(|boundary| now >= boundary)
            .unwrap_or(false),
        RotationPolicy::Daily => next_boundary(state.created_at, BoundaryUnit::Day)
            .map(|boundary| now >= boundary)
            .unwrap_or(false),
    }
}

#[derive(Debug, Clone, Copy)]
enum BoundaryUnit {
    Hour,
    Day,
}

fn next_boundary(created_at: DateTime<Utc>, unit: BoundaryUnit) -> Option<DateTime<Utc>> {
    match unit {
        BoundaryUnit::Hour => {
            let start = created_at
                .date_naive()
                .and_hms_opt(created_at.hour(), 0, 0)?
                .and_utc();
            Some(start + ChronoDuration::hours(1))
        }
        BoundaryUnit::Day => Some(
            created_at
                .date_naive()
                .succ_opt()?
                .and_hms_opt(0, 0, 0)?
                .and_utc(),
        ),
    }
}
