//! In-flight campaign tracking

use bulkline_common::types::CampaignId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of campaigns currently being processed by this process.
///
/// Entering returns a guard; dropping the guard leaves the set, including on
/// early return, error or panic unwinding.
#[derive(Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<Mutex<HashSet<CampaignId>>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) -> MutexGuard<'_, HashSet<CampaignId>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `id` in flight. `None` when it already is.
    pub fn try_enter(&self, id: CampaignId) -> Option<InFlightGuard> {
        if !self.set().insert(id) {
            return None;
        }
        Some(InFlightGuard {
            tracker: self.clone(),
            id,
        })
    }

    pub fn contains(&self, id: CampaignId) -> bool {
        self.set().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.set().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set().is_empty()
    }
}

/// Removes its campaign from the tracker when dropped
pub struct InFlightGuard {
    tracker: InFlightTracker,
    id: CampaignId,
}

impl InFlightGuard {
    pub fn campaign_id(&self) -> CampaignId {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.set().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_second_enter_is_rejected() {
        let tracker = InFlightTracker::new();
        let id = Uuid::new_v4();

        let guard = tracker.try_enter(id).unwrap();
        assert!(tracker.try_enter(id).is_none());
        assert!(tracker.try_enter(Uuid::new_v4()).is_some());

        drop(guard);
        assert!(!tracker.contains(id));
        assert!(tracker.try_enter(id).is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let tracker = InFlightTracker::new();
        let id = Uuid::new_v4();

        let cloned = tracker.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_enter(id).unwrap();
            panic!("worker crashed");
        });

        assert!(result.is_err());
        assert!(tracker.is_empty());
    }
}
