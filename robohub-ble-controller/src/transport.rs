//! The platform BLE stack as seen by a session
//!
//! [`GattTransport`] is the seam between the session core and a concrete
//! stack. [`crate::ble::BtleplugTransport`] talks to real adapters,
//! [`crate::mock::MockTransport`] emulates a hub in memory.

use async_trait::async_trait;
use robohub_proto::CharacteristicKey;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Stable identifier of a selected peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub address: String,
}

impl PeripheralInfo {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address.clone())
    }
}

/// Which devices a selection may return
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Services the session needs access to. Devices are not required to
    /// advertise them.
    pub optional_services: Vec<Uuid>,
    /// Name or address fragment picked by the user, if any
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub key: CharacteristicKey,
    pub flags: CharacteristicFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicFlags {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// Link level happenings, delivered to every receiver of [`GattTransport::events`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected(PeripheralId),
    Disconnected(PeripheralId),
    ValueChanged {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

#[async_trait]
pub trait GattTransport: Send + Sync {
    /// `false` when the platform has no usable BLE adapter
    async fn is_available(&self) -> bool;

    fn events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Let the user (or a scan) pick one peripheral
    async fn request_peripheral(&self, filter: &DiscoveryFilter) -> Result<PeripheralInfo>;

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn is_connected(&self, peripheral: &PeripheralId) -> bool;

    async fn discover_service(&self, peripheral: &PeripheralId, service: Uuid) -> Result<ServiceHandle>;

    async fn discover_characteristic(
        &self,
        peripheral: &PeripheralId,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle>;

    async fn read_value(&self, peripheral: &PeripheralId, characteristic: &CharacteristicHandle) -> Result<Vec<u8>>;

    async fn write_value(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()>;

    /// Start notifications; values arrive as [`LinkEvent::ValueChanged`]
    async fn subscribe(&self, peripheral: &PeripheralId, characteristic: &CharacteristicHandle) -> Result<()>;

    async fn unsubscribe(&self, peripheral: &PeripheralId, characteristic: &CharacteristicHandle) -> Result<()>;
}
