//! Fixed-size chunk cache with per-chunk single-flight fetching.

use crate::error::{VfsError, VfsResult};
use crate::resource::Resource;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::OnceCell;

/// Address of one chunk: `(resource identity, chunk index)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub resource: u64,
    pub index: u64,
}

struct ChunkSlot {
    cell: Arc<OnceCell<Bytes>>,
    last_access: Instant,
}

/// Byte-capped chunk store shared by every resource of a VFS.
///
/// Each slot holds a `OnceCell`: the first caller runs the fetch, any
/// concurrent caller for the same key awaits the same outcome, so a byte
/// range read by K tasks costs exactly one round trip per missing chunk.
/// A failed fetch leaves the cell empty and the next caller retries.
pub struct ChunkCache {
    chunk_size: usize,
    max_bytes: usize,
    slots: Mutex<HashMap<ChunkKey, ChunkSlot>>,
    current_bytes: AtomicUsize,
}

impl ChunkCache {
    pub fn new(chunk_size: usize, max_bytes: usize) -> Self {
        Self {
            chunk_size,
            max_bytes,
            slots: Mutex::new(HashMap::new()),
            current_bytes: AtomicUsize::new(0),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Get the chunk at `index`, fetching it from the resource on a miss.
    pub async fn fetch(&self, resource: &Resource, index: u64) -> VfsResult<Bytes> {
        let key = ChunkKey {
            resource: resource.id(),
            index,
        };

        // The map lock guards bookkeeping only; the fetch happens outside it.
        let cell = {
            let mut slots = self.slots.lock().expect("chunk cache lock poisoned");
            if self.current_bytes.load(Ordering::Relaxed) > self.max_bytes {
                self.evict_locked(&mut slots);
            }
            let slot = slots.entry(key).or_insert_with(|| ChunkSlot {
                cell: Arc::new(OnceCell::new()),
                last_access: Instant::now(),
            });
            slot.last_access = Instant::now();
            slot.cell.clone()
        };

        let chunk_size = self.chunk_size as u64;
        let offset = index * chunk_size;
        let bytes = cell
            .get_or_try_init(|| async {
                let size = resource.size();
                if offset >= size {
                    return Err(VfsError::Corrupted(format!(
                        "chunk {index} starts at {offset}, resource size {size}"
                    )));
                }
                let length = chunk_size.min(size - offset);
                let bytes = resource.read_range(offset, length).await?;
                self.current_bytes.fetch_add(bytes.len(), Ordering::Relaxed);
                Ok::<_, VfsError>(bytes)
            })
            .await?
            .clone();

        Ok(bytes)
    }

    /// Drop every chunk belonging to a resource; called when its archive is
    /// evicted.
    pub fn drop_resource(&self, resource_id: u64) {
        let mut slots = self.slots.lock().expect("chunk cache lock poisoned");
        slots.retain(|key, slot| {
            if key.resource != resource_id {
                return true;
            }
            if let Some(bytes) = slot.cell.get() {
                self.current_bytes.fetch_sub(bytes.len(), Ordering::Relaxed);
            }
            false
        });
    }

    /// Evict least recently used populated slots until usage drops below
    /// ~90% of the cap. Empty slots older than a minute are abandoned
    /// fetches and dropped too.
    fn evict_locked(&self, slots: &mut HashMap<ChunkKey, ChunkSlot>) {
        let target = self.max_bytes - self.max_bytes / 10;

        let mut candidates: Vec<(ChunkKey, Instant, usize)> = slots
            .iter()
            .filter_map(|(key, slot)| {
                slot.cell.get().map(|b| (*key, slot.last_access, b.len()))
            })
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let mut current = self.current_bytes.load(Ordering::Relaxed);
        let mut evicted = 0usize;
        for (key, _, len) in candidates {
            if current <= target {
                break;
            }
            slots.remove(&key);
            current = current.saturating_sub(len);
            evicted += 1;
        }
        self.current_bytes.store(current, Ordering::Relaxed);

        let stale = Instant::now() - std::time::Duration::from_secs(60);
        slots.retain(|_, slot| slot.cell.get().is_some() || slot.last_access > stale);

        if evicted > 0 {
            tracing::debug!(evicted, remaining = slots.len(), "chunk cache eviction");
        }
    }
}
