//! Per-connection memo of resolved characteristics

use std::collections::HashMap;
use std::sync::Mutex;

use robohub_proto::CharacteristicKey;

use crate::error::{BleError, Result};
use crate::transport::{CharacteristicHandle, GattTransport, PeripheralId};

#[derive(Default)]
struct Entries {
    /// Bumped on every invalidation; a discovery that started under an older
    /// generation must not store its result.
    generation: u64,
    handles: HashMap<CharacteristicKey, CharacteristicHandle>,
}

#[derive(Default)]
pub struct CharacteristicCache {
    entries: Mutex<Entries>,
}

impl CharacteristicCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CharacteristicKey) -> Option<CharacteristicHandle> {
        self.lock().handles.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Store a handle unless the cache was invalidated since `generation`
    pub fn insert(&self, generation: u64, handle: CharacteristicHandle) -> bool {
        let mut entries = self.lock();
        if entries.generation != generation {
            return false;
        }
        entries.handles.insert(handle.key, handle);
        true
    }

    /// Drop everything; called on every transition out of Connected
    pub fn invalidate(&self) {
        let mut entries = self.lock();
        entries.generation += 1;
        if !entries.handles.is_empty() {
            tracing::debug!(count = entries.handles.len(), "characteristic cache cleared");
        }
        entries.handles.clear();
    }

    /// Cached handle, or connect if needed and discover service then characteristic
    pub async fn resolve(
        &self,
        transport: &dyn GattTransport,
        peripheral: Option<&PeripheralId>,
        key: CharacteristicKey,
    ) -> Result<CharacteristicHandle> {
        if let Some(handle) = self.get(&key) {
            return Ok(handle);
        }

        let peripheral =
            peripheral.ok_or_else(|| BleError::LinkUnavailable("no device selected".to_string()))?;
        let generation = self.generation();

        if !transport.is_connected(peripheral).await {
            tracing::debug!(%peripheral, "connecting before discovery");
            transport
                .connect(peripheral)
                .await
                .map_err(|e| BleError::LinkUnavailable(e.to_string()))?;
        }

        let service = transport
            .discover_service(peripheral, key.service)
            .await
            .map_err(|e| match e {
                BleError::DiscoveryFailed { .. } | BleError::LinkUnavailable(_) => e,
                _ => BleError::DiscoveryFailed {
                    service: key.service,
                    characteristic: None,
                },
            })?;
        let handle = transport
            .discover_characteristic(peripheral, &service, key.characteristic)
            .await
            .map_err(|e| match e {
                BleError::DiscoveryFailed { .. } | BleError::LinkUnavailable(_) => e,
                _ => BleError::DiscoveryFailed {
                    service: key.service,
                    characteristic: Some(key.characteristic),
                },
            })?;

        if !self.insert(generation, handle.clone()) {
            tracing::debug!(%key, "discarding discovery from a previous connection");
        }
        Ok(handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        // poisoning leaves the map coherent
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CharacteristicFlags;
    use uuid::Uuid;

    fn handle(n: u128) -> CharacteristicHandle {
        CharacteristicHandle {
            key: CharacteristicKey::new(Uuid::from_u128(1), Uuid::from_u128(n)),
            flags: CharacteristicFlags::default(),
        }
    }

    #[test]
    fn stale_generation_is_not_stored() {
        let cache = CharacteristicCache::new();
        let generation = cache.generation();
        cache.invalidate();
        assert!(!cache.insert(generation, handle(2)));
        assert!(cache.is_empty());

        assert!(cache.insert(cache.generation(), handle(2)));
        assert_eq!(cache.len(), 1);
        cache.invalidate();
        assert!(cache.get(&handle(2).key).is_none());
    }
}
