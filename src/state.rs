//! Mutable state shared between handlers and background tasks.
//!
//! Everything here sits behind one coarse lock. Hold it only for map
//! lookups and updates; never across an `.await`.

use crate::channels::DestinationHandle;
use crate::commands::weather::Weather;
use crate::concurrency::cooldown::CooldownTable;
use crate::concurrency::ttl_cache::CacheMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type SharedHandle = Arc<Mutex<SharedState>>;

#[derive(Default)]
pub struct SharedState {
    /// Weather by `City,CC`
    pub weather: CacheMap<Weather>,
    /// USD price by lower-case currency ticker
    pub prices: CacheMap<String>,
    pub cooldowns: CooldownTable,
    pub destinations: DestinationRegistry,
}

impl SharedState {
    pub fn shared() -> SharedHandle {
        Arc::new(Mutex::new(Self::default()))
    }
}

/// Joined public destinations by name.
#[derive(Debug, Default)]
pub struct DestinationRegistry {
    handles: BTreeMap<String, DestinationHandle>,
}

impl DestinationRegistry {
    /// Returns the handle this one replaced, if the destination was rejoined.
    pub fn insert(&mut self, handle: DestinationHandle) -> Option<DestinationHandle> {
        self.handles.insert(handle.name().to_string(), handle)
    }

    pub fn get(&self, name: &str) -> Option<DestinationHandle> {
        self.handles.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> Option<DestinationHandle> {
        self.handles.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Read-only lookup; the lock is released before the handle is returned.
pub fn lookup_destination(state: &SharedHandle, name: &str) -> Option<DestinationHandle> {
    state.lock().destinations.get(name)
}
