//! Oldest-first fetch windows.
//!
//! The orchestrator advances a checkpoint to the newest
//! [`position`](PlatformEvent::position) in a batch. That is only safe when
//! the batch is a prefix in time: nothing at or after `since` that was left
//! out may sit at an earlier position than something that was returned.
//!
//! Connectors read several sub-streams per fetch (pull requests, issues,
//! and commits per repository; history per channel) and each one may be
//! cut short by a ceiling. [`FetchWindow`] tracks the earliest point where
//! any sub-stream was cut (the horizon) and drops everything past it, so a
//! truncated stream never lets another stream drag the checkpoint forward.
//!
//! ```text
//!   pulls    ●●●●●●●●│○○○○○      cut at ceiling ─┐
//!   issues   ●●●  ●●●●●●●●●●                     │
//!   commits  ●●●●●●●●●●●●●●●                     ▼
//!                    ▲ horizon: later events wait for the next cycle
//! ```
//!
//! A cut lands on an event's position, and `since` is inclusive, so events
//! tied with the last one kept are re-read by the next cycle and absorbed by
//! upsert.

use chrono::{DateTime, Utc};

use crate::models::PlatformEvent;

/// Collects sub-streams for one `fetch_events` call.
#[derive(Debug)]
pub struct FetchWindow {
    since: DateTime<Utc>,
    horizon: Option<DateTime<Utc>>,
    events: Vec<PlatformEvent>,
}

impl FetchWindow {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self {
            since,
            horizon: None,
            events: Vec::new(),
        }
    }

    /// Latest position every sub-stream is known to be complete through.
    /// `None` while nothing has been cut.
    pub fn horizon(&self) -> Option<DateTime<Utc>> {
        self.horizon
    }

    /// Add one sub-stream, keeping its oldest `cap` events.
    ///
    /// `complete` is false when the source still holds unread events past
    /// the last one in `events`.
    pub fn add(&mut self, mut events: Vec<PlatformEvent>, cap: usize, complete: bool) {
        events.retain(|e| e.position() >= self.since);
        sort_oldest_first(&mut events);
        let cut = events.len() > cap || !complete;
        events.truncate(cap);
        if cut {
            let bound = events.last().map(|e| e.position()).unwrap_or(self.since);
            self.bound(bound);
        }
        self.events.extend(events);
    }

    /// Fold a nested window in as one sub-stream capped at `cap`. Used when
    /// a ceiling applies across several sources, such as all repositories.
    pub fn absorb(&mut self, other: FetchWindow, cap: usize) {
        if let Some(h) = other.horizon {
            self.bound(h);
        }
        let events = other.into_events();
        self.add(events, cap, true);
    }

    /// The oldest `limit` events inside the horizon, oldest first.
    pub fn finish(self, limit: usize) -> Vec<PlatformEvent> {
        let mut events = self.into_events();
        trim_to_limit(&mut events, limit);
        events
    }

    fn bound(&mut self, at: DateTime<Utc>) {
        self.horizon = Some(match self.horizon {
            Some(h) => h.min(at),
            None => at,
        });
    }

    fn into_events(self) -> Vec<PlatformEvent> {
        let mut events = self.events;
        if let Some(h) = self.horizon {
            events.retain(|e| e.position() <= h);
        }
        events
    }
}

/// Order by position, then by timestamp, so replies follow their parent.
pub fn sort_oldest_first(events: &mut [PlatformEvent]) {
    events.sort_by_key(|e| (e.position(), e.timestamp));
}

/// Keep the oldest `limit` events.
pub fn trim_to_limit(events: &mut Vec<PlatformEvent>, limit: usize) {
    sort_oldest_first(events);
    events.truncate(limit);
}
