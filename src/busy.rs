//! Busy time from external calendars.
//!
//! The calendar-sync subsystem (outside this crate) publishes one snapshot of
//! busy UTC spans per connection into a [`SyncCache`]. The engine only reads it,
//! through the [`BusyIntervalProvider`] it was constructed with.

use std::sync::Arc;

use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::{EngineError, merge_overlapping};
use crate::limits::{MAX_BUSY_SPANS_PER_SNAPSHOT, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::{CalendarConnection, Ms, Span, SyncStatus};

/// Busy spans for one connection, clipped to the query window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusyIntervals {
    pub spans: Vec<Span>,
    /// The data is not known to reflect the remote calendar right now
    /// (last sync failed, or the connection never synced).
    pub stale: bool,
}

/// Source of external busy time.
pub trait BusyIntervalProvider: Send + Sync {
    fn busy_intervals(&self, connection: &CalendarConnection, query: &Span) -> BusyIntervals;
}

/// The last successful sync of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusySnapshot {
    pub synced_at: Ms,
    /// Sorted, merged.
    pub spans: Vec<Span>,
}

/// Per-connection snapshots, replaced wholesale by each successful sync.
#[derive(Default)]
pub struct SyncCache {
    snapshots: DashMap<Ulid, Arc<BusySnapshot>>,
}

impl SyncCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a successful sync. Snapshots only move forward: one older than
    /// the stored snapshot is ignored and `false` is returned.
    pub fn publish(&self, connection_id: Ulid, synced_at: Ms, mut spans: Vec<Span>) -> bool {
        spans.truncate(MAX_BUSY_SPANS_PER_SNAPSHOT);
        spans.sort_by_key(|s| s.start);
        let snapshot = Arc::new(BusySnapshot {
            synced_at,
            spans: merge_overlapping(&spans),
        });

        let mut entry = self.snapshots.entry(connection_id).or_insert_with(|| snapshot.clone());
        if Arc::ptr_eq(entry.value(), &snapshot) {
            return true;
        }
        if entry.synced_at > synced_at {
            return false;
        }
        *entry.value_mut() = snapshot;
        true
    }

    pub fn snapshot(&self, connection_id: &Ulid) -> Option<Arc<BusySnapshot>> {
        self.snapshots.get(connection_id).map(|e| e.value().clone())
    }

    /// Drop a connection's data, e.g. after the host disconnects the calendar.
    pub fn forget(&self, connection_id: &Ulid) {
        self.snapshots.remove(connection_id);
    }
}

/// Checks for a snapshot arriving from the sync subsystem, before it is published.
pub fn validate_snapshot(synced_at: Ms, spans: &[Span]) -> Result<(), EngineError> {
    let in_range = |t: Ms| (MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t);
    if !in_range(synced_at) {
        return Err(EngineError::InvalidInput(format!("synced_at {synced_at} out of range")));
    }
    if spans.len() > MAX_BUSY_SPANS_PER_SNAPSHOT {
        return Err(EngineError::LimitExceeded("too many busy spans in one snapshot"));
    }
    if let Some(s) = spans.iter().find(|s| !in_range(s.start) || !in_range(s.end)) {
        return Err(EngineError::InvalidInput(format!(
            "busy span {}..{} out of range",
            s.start, s.end
        )));
    }
    Ok(())
}

impl BusyIntervalProvider for SyncCache {
    fn busy_intervals(&self, connection: &CalendarConnection, query: &Span) -> BusyIntervals {
        let Some(snapshot) = self.snapshot(&connection.id) else {
            // Nothing synced yet: empty, but never presented as fresh.
            return BusyIntervals {
                spans: Vec::new(),
                stale: true,
            };
        };

        let right_bound = snapshot.spans.partition_point(|s| s.start < query.end);
        let spans = snapshot.spans[..right_bound]
            .iter()
            .filter_map(|s| s.intersect(query))
            .collect();

        BusyIntervals {
            spans,
            stale: connection.sync_status != SyncStatus::Synced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(status: SyncStatus) -> CalendarConnection {
        CalendarConnection {
            id: Ulid::new(),
            host_id: Ulid::new(),
            provider: "google".into(),
            sync_status: status,
            last_synced_at: None,
        }
    }

    #[test]
    fn unsynced_connection_is_empty_and_stale() {
        let cache = SyncCache::new();
        let conn = connection(SyncStatus::Unknown);
        let busy = cache.busy_intervals(&conn, &Span::new(0, 1000));
        assert!(busy.spans.is_empty());
        assert!(busy.stale);
    }

    #[test]
    fn synced_snapshot_is_clipped_to_query() {
        let cache = SyncCache::new();
        let conn = connection(SyncStatus::Synced);
        cache.publish(
            conn.id,
            10,
            vec![Span::new(500, 700), Span::new(0, 200), Span::new(150, 300), Span::new(900, 950)],
        );
        let busy = cache.busy_intervals(&conn, &Span::new(100, 600));
        assert_eq!(busy.spans, vec![Span::new(100, 300), Span::new(500, 600)]);
        assert!(!busy.stale);
    }

    #[test]
    fn failed_sync_serves_last_snapshot_as_stale() {
        let cache = SyncCache::new();
        let conn = connection(SyncStatus::Failed);
        cache.publish(conn.id, 10, vec![Span::new(100, 200)]);
        let busy = cache.busy_intervals(&conn, &Span::new(0, 1000));
        assert_eq!(busy.spans, vec![Span::new(100, 200)]);
        assert!(busy.stale);
    }

    #[test]
    fn older_snapshot_does_not_replace_newer() {
        let cache = SyncCache::new();
        let id = Ulid::new();
        assert!(cache.publish(id, 20, vec![Span::new(100, 200)]));
        assert!(!cache.publish(id, 10, vec![Span::new(300, 400)]));
        assert_eq!(cache.snapshot(&id).unwrap().spans, vec![Span::new(100, 200)]);
        assert!(cache.publish(id, 30, vec![]));
        assert!(cache.snapshot(&id).unwrap().spans.is_empty());
    }

    #[test]
    fn snapshot_bounds_are_checked() {
        assert!(validate_snapshot(10, &[Span::new(0, 100)]).is_ok());
        assert!(validate_snapshot(10, &[]).is_ok());
        assert!(matches!(validate_snapshot(-1, &[]), Err(EngineError::InvalidInput(_))));
        assert!(matches!(
            validate_snapshot(10, &[Span::new(0, Ms::MAX)]),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_snapshot(10, &[Span::new(Ms::MIN, 0)]),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn forget_removes_snapshot() {
        let cache = SyncCache::new();
        let id = Ulid::new();
        cache.publish(id, 1, vec![Span::new(0, 10)]);
        cache.forget(&id);
        assert!(cache.snapshot(&id).is_none());
    }
}
