//! Progress snapshots and the download aggregation timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kapstan_artifact::FetchProgress;

/// A point-in-time progress snapshot for the frontend.
///
/// `max == -1` means indeterminate; `0/1` means nothing happening; `1/1`
/// means done. During downloads both fields carry byte counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub current: i64,
    pub max: i64,
    pub description: Option<String>,
    /// Set when a described phase began, so the frontend can show how long
    /// the current phase has been running.
    pub transition_time: Option<DateTime<Utc>>,
}

impl Progress {
    #[must_use]
    pub fn indeterminate() -> Self {
        Self {
            current: 0,
            max: -1,
            description: None,
            transition_time: None,
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            current: 0,
            max: 1,
            description: None,
            transition_time: None,
        }
    }

    #[must_use]
    pub fn done() -> Self {
        Self {
            current: 1,
            max: 1,
            description: None,
            transition_time: None,
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self.transition_time = Some(Utc::now());
        self
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::empty()
    }
}

/// Periodically folds the fetcher's per-artifact byte counters into a single
/// progress snapshot. Dropped (stopped and joined) before the controller
/// moves on to the next phase.
pub(crate) struct ProgressTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTimer {
    const INTERVAL: Duration = Duration::from_millis(250);

    pub(crate) fn new(
        fetch: Arc<FetchProgress>,
        update: impl Fn(Progress) + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                let (current, max) = fetch.totals();
                if max > 0 {
                    update(Progress {
                        current: i64::try_from(current).unwrap_or(i64::MAX),
                        max: i64::try_from(max).unwrap_or(i64::MAX),
                        description: None,
                        transition_time: None,
                    });
                }
                thread::park_timeout(Self::INTERVAL);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            drop(handle.join());
        }
    }
}
