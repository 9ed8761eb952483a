/// Per-Node In-Memory State
///
/// Each node owns a bounded ring of recent traffic events (trimmed to the
/// sliding stats window), the map of in-flight hashstore compactions, and a
/// dirty bit the stats ticker consults. Single writer (the node's ingest
/// worker), multiple readers.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{CompactionKey, TrafficEvent};

/// Hard length bound on the ring, independent of the time horizon
const MAX_RING_LEN: usize = 200_000;

struct NodeStateInner {
    live_events: VecDeque<(u64, Arc<TrafficEvent>)>,
    next_seq: u64,
    active_compactions: HashMap<CompactionKey, DateTime<Utc>>,
    has_new_events: bool,
    perf_pending: Vec<Arc<TrafficEvent>>,
}

pub struct NodeState {
    pub name: String,
    window_minutes: i64,
    inner: RwLock<NodeStateInner>,
}

impl NodeState {
    pub fn new(name: impl Into<String>, window_minutes: i64) -> Self {
        Self {
            name: name.into(),
            window_minutes,
            inner: RwLock::new(NodeStateInner {
                live_events: VecDeque::new(),
                next_seq: 0,
                active_compactions: HashMap::new(),
                has_new_events: false,
                perf_pending: Vec::new(),
            }),
        }
    }

    fn trim(window_minutes: i64, inner: &mut NodeStateInner) {
        let cutoff = Utc::now() - Duration::minutes(window_minutes);
        while let Some((_, front)) = inner.live_events.front() {
            if front.timestamp < cutoff || inner.live_events.len() > MAX_RING_LEN {
                inner.live_events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Append one event to the ring tail, trim the head, mark dirty.
    pub async fn append_event(&self, event: Arc<TrafficEvent>) {
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.live_events.push_back((seq, Arc::clone(&event)));
        inner.perf_pending.push(event);
        inner.has_new_events = true;
        Self::trim(self.window_minutes, &mut inner);
    }

    /// Reload the ring from persisted rows on startup (oldest first).
    pub async fn rehydrate(&self, events: Vec<TrafficEvent>) {
        let mut inner = self.inner.write().await;
        for event in events {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.live_events.push_back((seq, Arc::new(event)));
        }
        inner.has_new_events = !inner.live_events.is_empty();
        Self::trim(self.window_minutes, &mut inner);
    }

    pub async fn begin_compaction(&self, key: CompactionKey, started: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        inner.active_compactions.insert(key, started);
    }

    /// Drain a begun compaction, returning its start time if known.
    pub async fn end_compaction(&self, key: &CompactionKey) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.write().await;
        inner.active_compactions.remove(key)
    }

    pub async fn active_compactions(&self) -> Vec<(CompactionKey, DateTime<Utc>)> {
        let inner = self.inner.read().await;
        inner
            .active_compactions
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Events appended after `since_seq`, plus the new high-water mark.
    pub async fn events_since(&self, since_seq: u64) -> (Vec<Arc<TrafficEvent>>, u64) {
        let inner = self.inner.read().await;
        let latest = inner.next_seq;
        let events = inner
            .live_events
            .iter()
            .filter(|(seq, _)| *seq >= since_seq)
            .map(|(_, e)| Arc::clone(e))
            .collect();
        (events, latest)
    }

    /// Consistent copy of the full live window
    pub async fn snapshot(&self) -> Vec<Arc<TrafficEvent>> {
        let inner = self.inner.read().await;
        inner.live_events.iter().map(|(_, e)| Arc::clone(e)).collect()
    }

    /// Events newer than `minutes` ago
    pub async fn snapshot_recent(&self, minutes: i64) -> Vec<Arc<TrafficEvent>> {
        let cutoff = (Utc::now() - Duration::minutes(minutes)).timestamp_micros() as f64 / 1e6;
        let inner = self.inner.read().await;
        inner
            .live_events
            .iter()
            .filter(|(_, e)| e.ts_unix >= cutoff)
            .map(|(_, e)| Arc::clone(e))
            .collect()
    }

    /// Clear and return the dirty bit
    pub async fn take_dirty(&self) -> bool {
        let mut inner = self.inner.write().await;
        std::mem::take(&mut inner.has_new_events)
    }

    pub async fn is_dirty(&self) -> bool {
        self.inner.read().await.has_new_events
    }

    /// Drain events queued for the performance ticker
    pub async fn drain_perf_pending(&self) -> Vec<Arc<TrafficEvent>> {
        let mut inner = self.inner.write().await;
        std::mem::take(&mut inner.perf_pending)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.live_events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// All nodes, keyed by operator-chosen name. Built once at startup; nodes
/// are never destroyed during a run.
pub type NodeRegistry = HashMap<String, Arc<NodeState>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventStatus, Location, TrafficCategory};

    fn test_event(age_minutes: i64) -> Arc<TrafficEvent> {
        let ts = Utc::now() - Duration::minutes(age_minutes);
        Arc::new(TrafficEvent {
            timestamp: ts,
            ts_unix: ts.timestamp_micros() as f64 / 1e6,
            action: "GET".to_string(),
            status: EventStatus::Success,
            size: 1024,
            piece_id: Some("piece".to_string()),
            satellite_id: "sat".to_string(),
            remote_ip: None,
            location: Location::default(),
            error_reason: None,
            node_name: "n".to_string(),
            duration_ms: None,
            category: TrafficCategory::Get,
        })
    }

    #[tokio::test]
    async fn test_append_sets_dirty_and_trims_old() {
        let state = NodeState::new("n", 60);
        state.append_event(test_event(90)).await;
        state.append_event(test_event(0)).await;
        // The 90 minute old event is outside the 60 minute window
        assert_eq!(state.len().await, 1);
        assert!(state.take_dirty().await);
        assert!(!state.take_dirty().await);
    }

    #[tokio::test]
    async fn test_events_since_tracks_sequence() {
        let state = NodeState::new("n", 60);
        state.append_event(test_event(1)).await;
        let (all, mark) = state.events_since(0).await;
        assert_eq!(all.len(), 1);
        state.append_event(test_event(0)).await;
        let (new, mark2) = state.events_since(mark).await;
        assert_eq!(new.len(), 1);
        assert_eq!(mark2, 2);
        let (none, _) = state.events_since(mark2).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_compaction_pairing() {
        let state = NodeState::new("n", 60);
        let key = CompactionKey {
            node_name: "n".to_string(),
            satellite: "sat".to_string(),
            store: "s0".to_string(),
        };
        let started = Utc::now();
        state.begin_compaction(key.clone(), started).await;
        assert_eq!(state.active_compactions().await.len(), 1);
        assert_eq!(state.end_compaction(&key).await, Some(started));
        assert_eq!(state.end_compaction(&key).await, None);
    }

    #[tokio::test]
    async fn test_perf_pending_drains_once() {
        let state = NodeState::new("n", 60);
        state.append_event(test_event(0)).await;
        assert_eq!(state.drain_perf_pending().await.len(), 1);
        assert!(state.drain_perf_pending().await.is_empty());
    }
}
