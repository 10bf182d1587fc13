//! Open/close tracking for mappings handed out by the buffer provider.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Identity of one mapping as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmaInfo {
    pub id: u64,
    pub start: u64,
    pub len: usize,
}

/// Receives mapping lifecycle events.
pub trait VmaObserver {
    fn opened(&self, vma: &VmaInfo);
    fn closed(&self, vma: &VmaInfo);
}

/// Logs every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl VmaObserver for TracingObserver {
    fn opened(&self, vma: &VmaInfo) {
        info!(id = vma.id, start = %format!("{:#x}", vma.start), len = vma.len, "open vma");
    }

    fn closed(&self, vma: &VmaInfo) {
        info!(id = vma.id, start = %format!("{:#x}", vma.start), len = vma.len, "close vma");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaEvent {
    Opened(VmaInfo),
    Closed(VmaInfo),
}

/// Keeps every event in order; clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<VmaEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<VmaEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: VmaEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl VmaObserver for RecordingObserver {
    fn opened(&self, vma: &VmaInfo) {
        self.push(VmaEvent::Opened(*vma));
    }

    fn closed(&self, vma: &VmaInfo) {
        self.push(VmaEvent::Closed(*vma));
    }
}

/// Guarantees one `opened` and one `closed` per mapping, in that order.
///
/// Mapping ids must be handed out in increasing order. Only open mappings
/// are kept; an id at or below the highest one seen can never open again.
pub struct LifecycleTracker {
    observer: Box<dyn VmaObserver>,
    live: HashSet<u64>,
    high_water: u64,
}

impl LifecycleTracker {
    pub fn new(observer: Box<dyn VmaObserver>) -> Self {
        Self { observer, live: HashSet::new(), high_water: 0 }
    }

    /// Mark `vma` active. Returns false (and fires nothing) if it was seen before.
    pub fn open(&mut self, vma: &VmaInfo) -> bool {
        if vma.id <= self.high_water {
            warn!(id = vma.id, high_water = self.high_water, "Duplicate open ignored");
            return false;
        }
        self.high_water = vma.id;
        self.live.insert(vma.id);
        self.observer.opened(vma);
        true
    }

    /// Mark `vma` torn down. Returns false unless it is currently open.
    pub fn close(&mut self, vma: &VmaInfo) -> bool {
        if !self.live.remove(&vma.id) {
            warn!(id = vma.id, "Close of inactive mapping ignored");
            return false;
        }
        self.observer.closed(vma);
        true
    }

    /// Number of mappings currently open.
    pub fn open_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VMA: VmaInfo = VmaInfo { id: 1, start: 0x9_0000_0000, len: 0x20_0000 };

    #[test]
    fn test_open_then_close_fires_once_each() {
        let observer = RecordingObserver::new();
        let mut tracker = LifecycleTracker::new(Box::new(observer.clone()));

        assert!(tracker.open(&VMA));
        assert!(!tracker.open(&VMA));
        assert_eq!(tracker.open_count(), 1);
        assert!(tracker.close(&VMA));
        assert!(!tracker.close(&VMA));
        assert!(!tracker.open(&VMA));

        assert_eq!(observer.events(), vec![VmaEvent::Opened(VMA), VmaEvent::Closed(VMA)]);
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_close_without_open_is_ignored() {
        let observer = RecordingObserver::new();
        let mut tracker = LifecycleTracker::new(Box::new(observer.clone()));
        assert!(!tracker.close(&VMA));
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_closed_mappings_are_forgotten() {
        let observer = RecordingObserver::new();
        let mut tracker = LifecycleTracker::new(Box::new(observer.clone()));

        for id in 1..=64 {
            let vma = VmaInfo { id, ..VMA };
            assert!(tracker.open(&vma));
            assert!(tracker.close(&vma));
        }
        assert!(tracker.live.is_empty());
        assert_eq!(tracker.high_water, 64);

        // Ids below the mark stay rejected after their entry is gone
        assert!(!tracker.open(&VmaInfo { id: 3, ..VMA }));
        assert!(tracker.open(&VmaInfo { id: 65, ..VMA }));
        assert_eq!(tracker.open_count(), 1);
        assert_eq!(observer.events().len(), 129);
    }
}
