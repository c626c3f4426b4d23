//! Region lifecycle: snapshots, change detection, task tracking.
//!
//! Long-running tasks snapshot a region's state and keep checking that
//! the live state still equals the snapshot; any mutation bumps a
//! generation counter and flips the changed flag. Destruction waits on
//! the active-task lock: tasks hold it shared, removal takes it
//! exclusively after flipping the one-way connected flag.

use crate::state::{RegionState, RegionStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// One region owned by the handler.
pub struct Region {
    state: Mutex<RegionState>,
    style: Mutex<RegionStyle>,
    generation: AtomicU64,
    changed: AtomicBool,
    connected: AtomicBool,
    active_task_lock: RwLock<()>,
}

impl Region {
    /// Creates a region from its initial state and style.
    pub fn new(state: RegionState, style: RegionStyle) -> Self {
        Self {
            state: Mutex::new(state),
            style: Mutex::new(style),
            generation: AtomicU64::new(0),
            changed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            active_task_lock: RwLock::new(()),
        }
    }

    /// Snapshot of the current geometry.
    pub fn state(&self) -> RegionState {
        self.state.lock().expect("region state lock").clone()
    }

    /// Snapshot of the current style.
    pub fn style(&self) -> RegionStyle {
        self.style.lock().expect("region style lock").clone()
    }

    /// Replaces the geometry. Returns `true` when it actually changed,
    /// in which case caches keyed on this region are stale.
    pub fn set_state(&self, new_state: RegionState) -> bool {
        let mut state = self.state.lock().expect("region state lock");
        if *state == new_state {
            return false;
        }
        *state = new_state;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.changed.store(true, Ordering::Release);
        true
    }

    /// Replaces the style; styles never invalidate compute caches.
    pub fn set_style(&self, new_style: RegionStyle) {
        *self.style.lock().expect("region style lock") = new_style;
    }

    /// Monotone state generation; bumped by every geometry change.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the geometry changed since the flag was last cleared.
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Clears the changed flag after caches have been rebuilt.
    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::Release);
    }

    /// `false` once removal has begun; long loops poll this.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Shared lock held by long-running tasks referencing this region.
    pub fn active_task_lock(&self) -> &RwLock<()> {
        &self.active_task_lock
    }

    /// Flags disconnection and blocks until every task referencing the
    /// region has released the active-task lock.
    pub fn wait_for_task_cancellation(&self) {
        self.connected.store(false, Ordering::Release);
        // taking the lock exclusively drains all shared holders
        drop(self.active_task_lock.write().expect("active task lock"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RegionType;
    use glam::DVec2;
    use std::sync::Arc;

    fn point_state(x: f64) -> RegionState {
        RegionState::new(0, RegionType::Point, vec![DVec2::new(x, 0.0)], 0.0)
    }

    #[test]
    fn test_set_state_detects_change() {
        let region = Region::new(point_state(1.0), RegionStyle::default());
        assert!(!region.is_changed());
        assert_eq!(region.generation(), 0);

        assert!(!region.set_state(point_state(1.0)));
        assert_eq!(region.generation(), 0);

        assert!(region.set_state(point_state(2.0)));
        assert!(region.is_changed());
        assert_eq!(region.generation(), 1);

        region.clear_changed();
        assert!(!region.is_changed());
    }

    #[test]
    fn test_style_does_not_bump_generation() {
        let region = Region::new(point_state(1.0), RegionStyle::default());
        region.set_style(RegionStyle {
            color: "#AA0000".to_string(),
            ..Default::default()
        });
        assert_eq!(region.generation(), 0);
        assert!(!region.is_changed());
    }

    #[test]
    fn test_wait_for_task_cancellation_blocks_until_release() {
        let region = Arc::new(Region::new(point_state(0.0), RegionStyle::default()));

        let task_region = Arc::clone(&region);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            let _guard = task_region.active_task_lock().read().unwrap();
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        started_rx.recv().unwrap();
        let cancel_region = Arc::clone(&region);
        let canceller = std::thread::spawn(move || {
            cancel_region.wait_for_task_cancellation();
        });

        // the task still holds the shared lock, so the region must already
        // read as disconnected but the canceller must not have finished
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!region.is_connected());
        assert!(!canceller.is_finished());

        release_tx.send(()).unwrap();
        worker.join().unwrap();
        canceller.join().unwrap();
    }
}
