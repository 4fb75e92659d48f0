//! Enrollment descriptor cache.
//!
//! Encoding an enrollment photo means decode + enhance + detect + encode,
//! which dominates a gallery scan. Descriptors are cached per identity and
//! tagged with the SHA-256 of the photo bytes they came from, so replacing
//! an enrollment photo makes the old entry unreachable without any
//! explicit invalidation.
//!
//! Readers share a read lock. The first caller for an identity computes
//! the descriptor; concurrent callers for the same identity and photo wait
//! on the same cell and get the same value.

use crate::types::FaceDescriptor;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

type PhotoDigest = [u8; 32];

struct Slot {
    digest: PhotoDigest,
    cell: OnceCell<FaceDescriptor>,
}

#[derive(Default)]
pub struct EnrollmentDescriptorCache {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl EnrollmentDescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached descriptor for `identity_id` computed from exactly
    /// these photo bytes, computing it with `compute` on a miss.
    ///
    /// Errors are not cached; the next call retries.
    pub fn get_or_try_insert_with<E, F>(
        &self,
        identity_id: &str,
        photo: &[u8],
        compute: F,
    ) -> Result<FaceDescriptor, E>
    where
        F: FnOnce() -> Result<FaceDescriptor, E>,
    {
        let digest: PhotoDigest = Sha256::digest(photo).into();
        let slot = self.slot_for(identity_id, digest);
        if slot.cell.get().is_some() {
            tracing::trace!(identity = identity_id, "descriptor cache hit");
        }
        slot.cell.get_or_try_init(compute).cloned()
    }

    fn slot_for(&self, identity_id: &str, digest: PhotoDigest) -> Arc<Slot> {
        {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = slots.get(identity_id) {
                if slot.digest == digest {
                    return Arc::clone(slot);
                }
            }
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let replacing = match slots.get(identity_id) {
            // Another writer got here first with the same photo.
            Some(slot) if slot.digest == digest => return Arc::clone(slot),
            Some(_) => true,
            None => false,
        };
        if replacing {
            tracing::debug!(
                identity = identity_id,
                "enrollment photo changed; replacing cached descriptor"
            );
        }
        let slot = Arc::new(Slot {
            digest,
            cell: OnceCell::new(),
        });
        slots.insert(identity_id.to_string(), Arc::clone(&slot));
        slot
    }

    /// Cached descriptor for an identity, regardless of photo.
    pub fn get(&self, identity_id: &str) -> Option<FaceDescriptor> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(identity_id).and_then(|s| s.cell.get().cloned())
    }

    /// Drop the entry for one identity.
    pub fn invalidate(&self, identity_id: &str) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.remove(identity_id).is_some()
    }

    pub fn clear(&self) {
        self.slots.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of identities with a computed descriptor.
    pub fn len(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|s| s.cell.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EnrollmentDescriptorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentDescriptorCache")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(v: f32) -> FaceDescriptor {
        FaceDescriptor::new(vec![v, v])
    }

    #[test]
    fn test_computes_once() {
        let cache = EnrollmentDescriptorCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let d: Result<_, ()> = cache.get_or_try_insert_with("ana", b"photo", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(descriptor(0.1))
            });
            assert_eq!(d.unwrap(), descriptor(0.1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_photo_change_recomputes() {
        let cache = EnrollmentDescriptorCache::new();
        let first: Result<_, ()> =
            cache.get_or_try_insert_with("ana", b"old", || Ok(descriptor(0.1)));
        let second: Result<_, ()> =
            cache.get_or_try_insert_with("ana", b"new", || Ok(descriptor(0.9)));
        assert_eq!(first.unwrap(), descriptor(0.1));
        assert_eq!(second.unwrap(), descriptor(0.9));
        assert_eq!(cache.get("ana"), Some(descriptor(0.9)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = EnrollmentDescriptorCache::new();
        let failed: Result<FaceDescriptor, &str> =
            cache.get_or_try_insert_with("ana", b"p", || Err("no face"));
        assert!(failed.is_err());
        assert!(cache.is_empty());
        let ok: Result<_, &str> = cache.get_or_try_insert_with("ana", b"p", || Ok(descriptor(0.2)));
        assert_eq!(ok.unwrap(), descriptor(0.2));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = EnrollmentDescriptorCache::new();
        let _: Result<_, ()> = cache.get_or_try_insert_with("a", b"1", || Ok(descriptor(0.1)));
        let _: Result<_, ()> = cache.get_or_try_insert_with("b", b"2", || Ok(descriptor(0.2)));
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_first_writer_wins() {
        let cache = Arc::new(EnrollmentDescriptorCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    let d: Result<_, ()> = cache.get_or_try_insert_with("ana", b"photo", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        Ok(descriptor(i as f32))
                    });
                    d.unwrap()
                })
            })
            .collect();

        let results: Vec<FaceDescriptor> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|d| d == &results[0]));
    }
}
