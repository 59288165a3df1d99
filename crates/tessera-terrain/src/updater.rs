//! Background thread polling the tile caches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tessera_common::{TerrainError, TerrainResult};
use tracing::{debug, info, trace};

use crate::cache::TerrainCache;
use crate::texture_cache::TextureCache;

/// Caches of one texture clipmap as seen by the background thread.
#[derive(Clone)]
pub struct TextureCachePoll {
    /// Clipmap name
    pub name: String,
    /// Cleared while the clipmap is disabled
    pub enabled: Arc<AtomicBool>,
    /// Caches of the clipmap, finest first
    pub caches: Vec<Arc<dyn TextureCache>>,
}

impl std::fmt::Debug for TextureCachePoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureCachePoll")
            .field("name", &self.name)
            .field("levels", &self.caches.len())
            .finish_non_exhaustive()
    }
}

/// Texture cache lists shared with the background thread.
pub type SharedTexturePolls = Arc<Mutex<Vec<TextureCachePoll>>>;

/// Runs one polling cycle: geometry caches coarsest first, then textures.
///
/// Returns the number of tiles that became resident.
pub fn poll_once(caches: &[Arc<dyn TerrainCache>], textures: &Mutex<Vec<TextureCachePoll>>) -> usize {
    let mut promoted = 0;
    for cache in caches.iter().rev() {
        promoted += cache.check_for_updates();
    }
    let polls: Vec<TextureCachePoll> = textures
        .lock()
        .iter()
        .filter(|p| p.enabled.load(Ordering::Acquire))
        .cloned()
        .collect();
    for poll in &polls {
        for cache in poll.caches.iter().rev() {
            promoted += cache.check_for_updates();
        }
    }
    promoted
}

/// Owner of the `terrain-cache-updater` thread.
pub struct CacheUpdater {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CacheUpdater {
    /// Name of the background thread.
    pub const THREAD_NAME: &'static str = "terrain-cache-updater";

    /// Starts polling `caches` and `textures` every `interval`.
    pub fn spawn(
        caches: Vec<Arc<dyn TerrainCache>>,
        textures: SharedTexturePolls,
        interval: Duration,
    ) -> TerrainResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || {
                debug!("Cache updater polling every {interval:?}");
                while flag.load(Ordering::Acquire) {
                    let promoted = poll_once(&caches, &textures);
                    if promoted > 0 {
                        trace!("Cache updater promoted {promoted} tiles");
                    }
                    // Early or spurious wake-ups just start the next cycle.
                    std::thread::park_timeout(interval);
                }
                debug!("Cache updater exiting");
            })
            .map_err(|e| TerrainError::ThreadSpawn {
                name: Self::THREAD_NAME.to_string(),
                reason: e.to_string(),
            })?;

        info!("Started {}", Self::THREAD_NAME);
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Returns `true` until [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the thread, wakes it and waits for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
            info!("Stopped {}", Self::THREAD_NAME);
        }
    }
}

impl Drop for CacheUpdater {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CacheUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheUpdater")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipmap_level::tests::flat_cache;
    use std::time::Instant;

    #[test]
    fn test_poll_once_promotes_tiles() {
        let cache = flat_cache(0, 8, 17);
        cache.set_current_position(0, 0);
        let caches: Vec<Arc<dyn TerrainCache>> = vec![cache.clone() as Arc<dyn TerrainCache>];
        let textures = Mutex::new(Vec::new());
        assert!(poll_once(&caches, &textures) > 0);
        assert!(cache.is_valid());
        assert_eq!(poll_once(&caches, &textures), 0);
    }

    #[test]
    fn test_updater_polls_in_background_and_stops() {
        let cache = flat_cache(0, 8, 17);
        cache.set_current_position(0, 0);
        let caches: Vec<Arc<dyn TerrainCache>> = vec![cache.clone() as Arc<dyn TerrainCache>];
        let mut updater =
            CacheUpdater::spawn(caches, Arc::new(Mutex::new(Vec::new())), Duration::from_millis(5))
                .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !cache.is_valid() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(cache.is_valid());

        let started = Instant::now();
        updater.stop();
        assert!(!updater.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
