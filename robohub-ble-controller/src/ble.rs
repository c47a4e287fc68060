//! btleplug backend
//!
//! Desktop platforms have no device chooser, so selection is a timed scan:
//! the first peripheral matching the configured name/address fragment wins,
//! or, without one, the first peripheral advertising a service of the
//! active protocol.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use robohub_proto::{CharacteristicKey, ProtocolVersion};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{BleError, Result};
use crate::transport::{
    CharacteristicFlags, CharacteristicHandle, DiscoveryFilter, GattTransport, LinkEvent, PeripheralId,
    PeripheralInfo, ServiceHandle,
};

#[derive(Debug, Clone)]
pub struct BtleplugConfig {
    pub scan_duration: Duration,
}

impl Default for BtleplugConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(5),
        }
    }
}

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct HubDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises a service of the protocol being scanned for
    pub is_hub: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| BleError::Unsupported("no bluetooth adapter found".to_string()))
}

/// Scan for BLE devices, marking the ones that look like hubs
pub async fn scan(duration: Duration, protocol: ProtocolVersion) -> Result<Vec<HubDevice>> {
    let adapter = get_adapter().await?;

    let devices = advertisements(&adapter, duration)
        .await?
        .into_iter()
        .map(|(peripheral, props)| HubDevice {
            is_hub: props.services.iter().any(|s| protocol.services().contains(s)),
            name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
            address: peripheral.address().to_string(),
            rssi: props.rssi,
        })
        .collect();
    Ok(devices)
}

/// Scan for `duration` and return every peripheral that reported its
/// properties. The scan is stopped whatever happens in between.
async fn advertisements(adapter: &Adapter, duration: Duration) -> Result<Vec<(Peripheral, PeripheralProperties)>> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let found = match adapter.peripherals().await {
        Ok(peripherals) => {
            let mut results = Vec::with_capacity(peripherals.len());
            for peripheral in peripherals {
                let props = peripheral.properties().await;
                results.push((peripheral.address().to_string(), peripheral, props));
            }
            Ok(keep_advertised(results))
        }
        Err(e) => Err(e),
    };

    let stopped = adapter.stop_scan().await;
    let found = found?;
    stopped?;
    Ok(found)
}

/// Drop peripherals without properties; a failed read skips that one device only
fn keep_advertised<P, E: std::fmt::Display>(
    results: Vec<(String, P, std::result::Result<Option<PeripheralProperties>, E>)>,
) -> Vec<(P, PeripheralProperties)> {
    results
        .into_iter()
        .filter_map(|(address, peripheral, props)| match props {
            Ok(Some(props)) => Some((peripheral, props)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%address, "skipping device, reading properties failed: {e}");
                None
            }
        })
        .collect()
}

/// Whether an advertisement satisfies a selection filter
fn matches_filter(filter: &DiscoveryFilter, name: &str, address: &str, services: &[Uuid]) -> bool {
    match &filter.target {
        Some(t) => name.contains(t.as_str()) || address.contains(t.as_str()),
        None => services.iter().any(|s| filter.optional_services.contains(s)),
    }
}

pub struct BtleplugTransport {
    adapter: Option<Adapter>,
    config: BtleplugConfig,
    peripherals: Mutex<HashMap<PeripheralId, Peripheral>>,
    notification_tasks: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
    events: broadcast::Sender<LinkEvent>,
    listener: Option<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Never fails: without an adapter the transport reports itself unavailable
    pub async fn new(config: BtleplugConfig) -> Self {
        let adapter = match get_adapter().await {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                tracing::warn!("bluetooth unavailable: {e}");
                None
            }
        };
        let (events, _) = broadcast::channel(64);
        let listener = adapter
            .clone()
            .map(|adapter| tokio::spawn(forward_adapter_events(adapter, events.clone())));

        Self {
            adapter,
            config,
            peripherals: Mutex::new(HashMap::new()),
            notification_tasks: Mutex::new(HashMap::new()),
            events,
            listener,
        }
    }

    fn adapter(&self) -> Result<&Adapter> {
        self.adapter
            .as_ref()
            .ok_or_else(|| BleError::Unsupported("no bluetooth adapter found".to_string()))
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        lock(&self.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| BleError::LinkUnavailable(format!("unknown device {id}")))
    }

    fn characteristic(peripheral: &Peripheral, key: &CharacteristicKey) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == key.characteristic && c.service_uuid == key.service)
            .ok_or(BleError::DiscoveryFailed {
                service: key.service,
                characteristic: Some(key.characteristic),
            })
    }

    /// One task per peripheral forwards every notification it receives
    async fn ensure_notification_task(&self, id: &PeripheralId, peripheral: &Peripheral) -> Result<()> {
        if lock(&self.notification_tasks).get(id).is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let mut stream = peripheral.notifications().await?;
        let events = self.events.clone();
        let peripheral_id = id.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let _ = events.send(LinkEvent::ValueChanged {
                    peripheral: peripheral_id.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
        });
        if let Some(old) = lock(&self.notification_tasks).insert(id.clone(), task) {
            old.abort();
        }
        Ok(())
    }

    fn stop_notification_task(&self, id: &PeripheralId) {
        if let Some(task) = lock(&self.notification_tasks).remove(id) {
            task.abort();
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        for (_, task) in lock(&self.notification_tasks).drain() {
            task.abort();
        }
    }
}

async fn forward_adapter_events(adapter: Adapter, events: broadcast::Sender<LinkEvent>) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("failed to subscribe to adapter events: {e}");
            return;
        }
    };
    while let Some(event) = stream.next().await {
        let event = match event {
            CentralEvent::DeviceConnected(id) => LinkEvent::Connected(PeripheralId(id.to_string())),
            CentralEvent::DeviceDisconnected(id) => LinkEvent::Disconnected(PeripheralId(id.to_string())),
            _ => continue,
        };
        tracing::debug!(?event, "adapter event");
        let _ = events.send(event);
    }
}

fn flags(properties: CharPropFlags) -> CharacteristicFlags {
    CharacteristicFlags {
        read: properties.contains(CharPropFlags::READ),
        write: properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn is_available(&self) -> bool {
        self.adapter.is_some()
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn request_peripheral(&self, filter: &DiscoveryFilter) -> Result<PeripheralInfo> {
        let adapter = self.adapter()?;

        let chosen = advertisements(adapter, self.config.scan_duration)
            .await?
            .into_iter()
            .find_map(|(peripheral, props)| {
                let address = peripheral.address().to_string();
                let name = props.local_name.as_deref().unwrap_or_default();
                matches_filter(filter, name, &address, &props.services)
                    .then(|| (peripheral, props.local_name.clone(), address))
            });

        let (peripheral, name, address) = chosen.ok_or(BleError::SelectionCancelled)?;
        let id = PeripheralId(peripheral.id().to_string());
        tracing::info!(%id, ?name, %address, "found device");
        lock(&self.peripherals).insert(id.clone(), peripheral);
        Ok(PeripheralInfo { id, name, address })
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        self.stop_notification_task(id);
        let peripheral = self.peripheral(id)?;
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn is_connected(&self, id: &PeripheralId) -> bool {
        match self.peripheral(id) {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn discover_service(&self, id: &PeripheralId, service: Uuid) -> Result<ServiceHandle> {
        let peripheral = self.peripheral(id)?;
        peripheral.discover_services().await?;
        if peripheral.services().iter().any(|s| s.uuid == service) {
            Ok(ServiceHandle { uuid: service })
        } else {
            Err(BleError::DiscoveryFailed {
                service,
                characteristic: None,
            })
        }
    }

    async fn discover_characteristic(
        &self,
        id: &PeripheralId,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle> {
        let peripheral = self.peripheral(id)?;
        let key = CharacteristicKey::new(service.uuid, characteristic);
        let found = Self::characteristic(&peripheral, &key)?;
        Ok(CharacteristicHandle {
            key,
            flags: flags(found.properties),
        })
    }

    async fn read_value(&self, id: &PeripheralId, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(id)?;
        let characteristic = Self::characteristic(&peripheral, &handle.key)?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write_value(&self, id: &PeripheralId, handle: &CharacteristicHandle, value: &[u8]) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let characteristic = Self::characteristic(&peripheral, &handle.key)?;
        peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, id: &PeripheralId, handle: &CharacteristicHandle) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let characteristic = Self::characteristic(&peripheral, &handle.key)?;
        self.ensure_notification_task(id, &peripheral).await?;
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn unsubscribe(&self, id: &PeripheralId, handle: &CharacteristicHandle) -> Result<()> {
        let peripheral = self.peripheral(id)?;
        let characteristic = Self::characteristic(&peripheral, &handle.key)?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }
}
