//! Observers of terrain geometry changes.

use std::sync::Arc;

use glam::Affine3A;
use tessera_common::Region;

/// Notified after the terrain rewrote regions from the mailbox.
///
/// Useful for anything that caches data derived from the geometry, such as
/// physics heightfields or decal placement.
pub trait RegionUpdateListener: Send + Sync {
    /// Called on the main thread with the regions applied this frame,
    /// sorted by level, and the terrain's world transform.
    fn on_regions_updated(&self, regions: &[Region], world_transform: &Affine3A);
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of listeners.
#[derive(Default)]
pub struct Listeners {
    entries: Vec<(ListenerId, Arc<dyn RegionUpdateListener>)>,
    next_id: u64,
}

impl Listeners {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add(&mut self, listener: Arc<dyn RegionUpdateListener>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nobody listens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Calls every listener in registration order.
    pub fn notify(&self, regions: &[Region], world_transform: &Affine3A) {
        for (_, listener) in &self.entries {
            listener.on_regions_updated(regions, world_transform);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}
