//! Registry of active notification subscriptions
//!
//! One handler per [`CharacteristicKey`]. Replacing or tearing down a
//! subscription always stops platform notifications for it first, so a
//! reconnect never ends up delivering the same value twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use robohub_proto::{CharacteristicKey, Payload};
use uuid::Uuid;

use crate::error::Result;
use crate::transport::{CharacteristicHandle, GattTransport, PeripheralId};

pub type Handler = Arc<dyn Fn(CharacteristicKey, Payload) + Send + Sync>;

struct Subscription {
    handle: CharacteristicHandle,
    handler: Handler,
}

#[derive(Default)]
pub struct NotificationRouter {
    subscriptions: Mutex<HashMap<CharacteristicKey, Subscription>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        transport: &dyn GattTransport,
        peripheral: &PeripheralId,
        handle: CharacteristicHandle,
        handler: Handler,
    ) -> Result<()> {
        let key = handle.key;
        if let Some(stale) = self.remove(&key) {
            tracing::debug!(%key, "replacing notification subscription");
            if let Err(e) = transport.unsubscribe(peripheral, &stale.handle).await {
                tracing::debug!(%key, "stopping stale notifications failed: {e}");
            }
        }

        transport.subscribe(peripheral, &handle).await?;
        self.lock().insert(key, Subscription { handle, handler });
        tracing::debug!(%key, "notifications started");
        Ok(())
    }

    /// Route a value change to its handler. Returns `false` when nothing is
    /// subscribed to `characteristic`.
    pub fn dispatch(&self, characteristic: Uuid, value: &[u8]) -> bool {
        let found = self
            .lock()
            .iter()
            .find(|(key, _)| key.characteristic == characteristic)
            .map(|(key, sub)| (*key, sub.handler.clone()));

        match found {
            Some((key, handler)) => {
                handler(key, Payload::decode(value));
                true
            }
            None => false,
        }
    }

    /// Remove every handler and stop notifications, ignoring failures from a
    /// link that is already gone. With no peripheral only the handlers go.
    pub async fn teardown(&self, transport: &dyn GattTransport, peripheral: Option<&PeripheralId>) {
        let drained: Vec<Subscription> = self.lock().drain().map(|(_, sub)| sub).collect();
        let Some(peripheral) = peripheral else {
            return;
        };
        for sub in drained {
            if let Err(e) = transport.unsubscribe(peripheral, &sub.handle).await {
                tracing::debug!(key = %sub.handle.key, "stop notifications failed: {e}");
            }
        }
    }

    pub fn keys(&self) -> Vec<CharacteristicKey> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, key: &CharacteristicKey) -> Option<Subscription> {
        self.lock().remove(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CharacteristicKey, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
