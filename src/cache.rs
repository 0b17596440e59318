// Reference counted device-data cache
//
// Asset registries keep their per-asset GPU resources in one of these.
// The first handle for an id triggers the load, the last handle dropped
// queues the unload. Unloads are never executed synchronously: the data
// lands in a pending bucket that the owning registry drains during its
// per-frame update, between the fence wait and command recording, so
// resources referenced by frames still in flight are never destroyed
// while the GPU may read them.

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use crate::util::IndexMap;
use crate::Result;

struct CacheEntry<T> {
    ce_data: Arc<T>,
    ce_refcount: u32,
}

struct CacheInternal<T> {
    ci_entries: IndexMap<CacheEntry<T>>,
    /// Data whose refcount hit zero, waiting for the registry to pick
    /// it up at the next update.
    ci_pending_unloads: Vec<Arc<T>>,
}

/// A refcounted loader keyed by dense asset ids.
///
/// `get_with` may be called from any thread; one mutex protects both the
/// refcount table and the pending-unloads bucket.
pub struct DeviceDataCache<T> {
    c_shared: Arc<Mutex<CacheInternal<T>>>,
}

impl<T> DeviceDataCache<T> {
    pub fn new() -> Self {
        Self {
            c_shared: Arc::new(Mutex::new(CacheInternal {
                ci_entries: IndexMap::new(),
                ci_pending_unloads: Vec::new(),
            })),
        }
    }

    /// Get a handle to the data for `id`, invoking `loader` if this is
    /// the first outstanding reference.
    ///
    /// The load runs under the cache lock: a concurrent `get_with` for
    /// the same id observes either no entry or the fully loaded one.
    pub fn get_with<F>(&self, id: u32, loader: F) -> Result<DataHandle<T>>
    where
        F: FnOnce(u32) -> Result<T>,
    {
        let mut internal = self.c_shared.lock().unwrap();

        if let Some(entry) = internal.ci_entries.get_mut(id) {
            entry.ce_refcount += 1;
            let data = entry.ce_data.clone();
            return Ok(DataHandle {
                h_id: id,
                h_data: data,
                h_cache: self.c_shared.clone(),
            });
        }

        let data = Arc::new(loader(id)?);
        internal.ci_entries.insert(
            id,
            CacheEntry {
                ce_data: data.clone(),
                ce_refcount: 1,
            },
        );

        Ok(DataHandle {
            h_id: id,
            h_data: data,
            h_cache: self.c_shared.clone(),
        })
    }

    pub fn is_loaded(&self, id: u32) -> bool {
        self.c_shared.lock().unwrap().ci_entries.contains(id)
    }

    /// Take everything that has been queued for unload. The registry
    /// owns the returned data and is responsible for destroying the
    /// device resources once no in-flight frame references them.
    pub fn drain_pending_unloads(&self) -> Vec<Arc<T>> {
        let mut internal = self.c_shared.lock().unwrap();
        std::mem::replace(&mut internal.ci_pending_unloads, Vec::new())
    }
}

/// Shared handle to a loaded device resource.
///
/// Clones share the refcount. Dropping the last handle removes the entry
/// from the cache and queues the data for unload.
pub struct DataHandle<T> {
    h_id: u32,
    h_data: Arc<T>,
    h_cache: Arc<Mutex<CacheInternal<T>>>,
}

impl<T> DataHandle<T> {
    pub fn id(&self) -> u32 {
        self.h_id
    }
}

impl<T> Deref for DataHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.h_data
    }
}

impl<T> Clone for DataHandle<T> {
    fn clone(&self) -> Self {
        let mut internal = self.h_cache.lock().unwrap();
        internal
            .ci_entries
            .get_mut(self.h_id)
            .expect("cloned a handle for an entry that is not resident")
            .ce_refcount += 1;

        Self {
            h_id: self.h_id,
            h_data: self.h_data.clone(),
            h_cache: self.h_cache.clone(),
        }
    }
}

impl<T> Drop for DataHandle<T> {
    fn drop(&mut self) {
        let mut internal = self.h_cache.lock().unwrap();

        let emptied = {
            let entry = internal
                .ci_entries
                .get_mut(self.h_id)
                .expect("dropped a handle for an entry that is not resident");
            assert!(entry.ce_refcount > 0);
            entry.ce_refcount -= 1;
            entry.ce_refcount == 0
        };

        if emptied {
            let entry = internal.ci_entries.remove(self.h_id).unwrap();
            internal.ci_pending_unloads.push(entry.ce_data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn loads_once_per_residency() {
        let cache = DeviceDataCache::new();
        let loads = AtomicU32::new(0);

        let h1 = cache
            .get_with(4, |id| {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(id * 2)
            })
            .unwrap();
        let h2 = cache.get_with(4, |_| panic!("already loaded")).unwrap();

        assert_eq!(*h1, 8);
        assert_eq!(*h2, 8);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(cache.is_loaded(4));
    }

    #[test]
    fn unload_is_deferred_until_drained() {
        let cache = DeviceDataCache::new();

        let h1 = cache.get_with(0, |_| Ok("resident")).unwrap();
        let h2 = h1.clone();

        drop(h1);
        // A reference is still live, nothing may be pending
        assert!(cache.drain_pending_unloads().is_empty());
        assert!(cache.is_loaded(0));

        drop(h2);
        // Now the entry is gone but the data is only queued, not freed
        assert!(!cache.is_loaded(0));
        let pending = cache.drain_pending_unloads();
        assert_eq!(pending.len(), 1);
        assert_eq!(*pending[0], "resident");
        assert!(cache.drain_pending_unloads().is_empty());
    }

    #[test]
    fn reload_after_unload_invokes_loader() {
        let cache = DeviceDataCache::new();
        let loads = AtomicU32::new(0);
        let mut load = |_| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(7u32)
        };

        drop(cache.get_with(1, &mut load).unwrap());
        drop(cache.get_with(1, &mut load).unwrap());

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.drain_pending_unloads().len(), 2);
    }
}
