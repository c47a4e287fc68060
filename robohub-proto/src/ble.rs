//! BLE GATT service registry for Robohub controllers
//!
//! Hubs in the field expose one of two incompatible UUID assignments. Each is
//! modelled as a [`ProtocolVersion`]; a session picks one and never mixes
//! characteristics from both.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheme A, shipped with the first hub firmware
pub mod legacy {
    use uuid::Uuid;

    /// Wi-Fi service: 22345678-1234-5678-1234-56789abcde00
    pub const WIFI_SERVICE_UUID: Uuid = Uuid::from_u128(0x22345678_1234_5678_1234_56789abcde00);
    /// SSID text (write)
    pub const WIFI_SSID_UUID: Uuid = Uuid::from_u128(0x22345678_1234_5678_1234_56789abcde01);
    /// Password text (write)
    pub const WIFI_PASS_UUID: Uuid = Uuid::from_u128(0x22345678_1234_5678_1234_56789abcde02);
    /// Connection status (read/notify)
    pub const WIFI_STATUS_UUID: Uuid = Uuid::from_u128(0x22345678_1234_5678_1234_56789abcde03);

    /// Script service: 32345678-1234-5678-1234-56789abcde00
    pub const SCRIPT_SERVICE_UUID: Uuid = Uuid::from_u128(0x32345678_1234_5678_1234_56789abcde00);
    pub const SCRIPT_WRITE_UUID: Uuid = Uuid::from_u128(0x32345678_1234_5678_1234_56789abcde01);
    pub const SCRIPT_STATUS_UUID: Uuid = Uuid::from_u128(0x32345678_1234_5678_1234_56789abcde02);
    pub const SCRIPT_RUN_UUID: Uuid = Uuid::from_u128(0x32345678_1234_5678_1234_56789abcde03);

    /// Filesystem service: 42345678-1234-5678-1234-56789abcde00
    pub const FS_SERVICE_UUID: Uuid = Uuid::from_u128(0x42345678_1234_5678_1234_56789abcde00);
    pub const FS_LIST_UUID: Uuid = Uuid::from_u128(0x42345678_1234_5678_1234_56789abcde01);
    pub const FS_READ_UUID: Uuid = Uuid::from_u128(0x42345678_1234_5678_1234_56789abcde02);
    pub const FS_WRITE_UUID: Uuid = Uuid::from_u128(0x42345678_1234_5678_1234_56789abcde03);
    pub const FS_DELETE_UUID: Uuid = Uuid::from_u128(0x42345678_1234_5678_1234_56789abcde04);
    pub const FS_MKDIR_UUID: Uuid = Uuid::from_u128(0x42345678_1234_5678_1234_56789abcde05);
}

/// Scheme B, the current hub firmware. There is no script service.
pub mod current {
    use uuid::Uuid;

    /// Wi-Fi service: 87654321-4321-6789-4321-0fedcba98765
    pub const WIFI_SERVICE_UUID: Uuid = Uuid::from_u128(0x87654321_4321_6789_4321_0fedcba98765);
    /// Visible networks (read)
    pub const WIFI_SCAN_UUID: Uuid = Uuid::from_u128(0x87654321_4321_6789_4321_0fedcba98766);
    /// Connection status (read/notify)
    pub const WIFI_STATUS_UUID: Uuid = Uuid::from_u128(0x87654321_4321_6789_4321_0fedcba98767);
    /// JSON `{ssid, psk}` (write)
    pub const WIFI_SET_NETWORK_UUID: Uuid = Uuid::from_u128(0x87654321_4321_6789_4321_0fedcba98768);
    /// Optional SSID text (write)
    pub const WIFI_DISCONNECT_UUID: Uuid = Uuid::from_u128(0x87654321_4321_6789_4321_0fedcba98769);

    /// Filesystem service: 12345678-1234-5678-1234-56789abcdef0
    pub const FS_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);
    pub const FS_LIST_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);
    pub const FS_CREATE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef2);
    pub const FS_DELETE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef3);
    pub const FS_READ_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef4);
    pub const FS_WRITE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef5);
}

/// A (service, characteristic) pair addressing one GATT value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicKey {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }
}

impl std::fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Logical hub endpoints, independent of the UUID scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    WifiSsid,
    WifiPass,
    WifiStatus,
    WifiScan,
    WifiSetNetwork,
    WifiDisconnect,
    ScriptWrite,
    ScriptStatus,
    ScriptRun,
    FsList,
    FsRead,
    FsWrite,
    FsDelete,
    FsMkdir,
    FsCreate,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Endpoint::WifiSsid => "wifi-ssid",
            Endpoint::WifiPass => "wifi-pass",
            Endpoint::WifiStatus => "wifi-status",
            Endpoint::WifiScan => "wifi-scan",
            Endpoint::WifiSetNetwork => "wifi-set-network",
            Endpoint::WifiDisconnect => "wifi-disconnect",
            Endpoint::ScriptWrite => "script-write",
            Endpoint::ScriptStatus => "script-status",
            Endpoint::ScriptRun => "script-run",
            Endpoint::FsList => "fs-list",
            Endpoint::FsRead => "fs-read",
            Endpoint::FsWrite => "fs-write",
            Endpoint::FsDelete => "fs-delete",
            Endpoint::FsMkdir => "fs-mkdir",
            Endpoint::FsCreate => "fs-create",
        };
        f.write_str(name)
    }
}

const LEGACY_TABLE: &[(Endpoint, CharacteristicKey)] = {
    use legacy::*;
    &[
        (Endpoint::WifiSsid, CharacteristicKey::new(WIFI_SERVICE_UUID, WIFI_SSID_UUID)),
        (Endpoint::WifiPass, CharacteristicKey::new(WIFI_SERVICE_UUID, WIFI_PASS_UUID)),
        (Endpoint::WifiStatus, CharacteristicKey::new(WIFI_SERVICE_UUID, WIFI_STATUS_UUID)),
        (Endpoint::ScriptWrite, CharacteristicKey::new(SCRIPT_SERVICE_UUID, SCRIPT_WRITE_UUID)),
        (Endpoint::ScriptStatus, CharacteristicKey::new(SCRIPT_SERVICE_UUID, SCRIPT_STATUS_UUID)),
        (Endpoint::ScriptRun, CharacteristicKey::new(SCRIPT_SERVICE_UUID, SCRIPT_RUN_UUID)),
        (Endpoint::FsList, CharacteristicKey::new(FS_SERVICE_UUID, FS_LIST_UUID)),
        (Endpoint::FsRead, CharacteristicKey::new(FS_SERVICE_UUID, FS_READ_UUID)),
        (Endpoint::FsWrite, CharacteristicKey::new(FS_SERVICE_UUID, FS_WRITE_UUID)),
        (Endpoint::FsDelete, CharacteristicKey::new(FS_SERVICE_UUID, FS_DELETE_UUID)),
        (Endpoint::FsMkdir, CharacteristicKey::new(FS_SERVICE_UUID, FS_MKDIR_UUID)),
    ]
};

const CURRENT_TABLE: &[(Endpoint, CharacteristicKey)] = {
    use current::*;
    &[
        (Endpoint::WifiScan, CharacteristicKey::new(WIFI_SERVICE_UUID, WIFI_SCAN_UUID)),
        (Endpoint::WifiStatus, CharacteristicKey::new(WIFI_SERVICE_UUID, WIFI_STATUS_UUID)),
        (Endpoint::WifiSetNetwork, CharacteristicKey::new(WIFI_SERVICE_UUID, WIFI_SET_NETWORK_UUID)),
        (Endpoint::WifiDisconnect, CharacteristicKey::new(WIFI_SERVICE_UUID, WIFI_DISCONNECT_UUID)),
        (Endpoint::FsList, CharacteristicKey::new(FS_SERVICE_UUID, FS_LIST_UUID)),
        (Endpoint::FsCreate, CharacteristicKey::new(FS_SERVICE_UUID, FS_CREATE_UUID)),
        (Endpoint::FsDelete, CharacteristicKey::new(FS_SERVICE_UUID, FS_DELETE_UUID)),
        (Endpoint::FsRead, CharacteristicKey::new(FS_SERVICE_UUID, FS_READ_UUID)),
        (Endpoint::FsWrite, CharacteristicKey::new(FS_SERVICE_UUID, FS_WRITE_UUID)),
    ]
};

const LEGACY_SERVICES: &[Uuid] = &[
    legacy::WIFI_SERVICE_UUID,
    legacy::SCRIPT_SERVICE_UUID,
    legacy::FS_SERVICE_UUID,
];

const CURRENT_SERVICES: &[Uuid] = &[current::WIFI_SERVICE_UUID, current::FS_SERVICE_UUID];

/// Which UUID assignment the hub speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Scheme A: SSID/PASS text writes, script service present
    Legacy,
    /// Scheme B: JSON SetNetwork, scan/disconnect, no script service
    #[default]
    Current,
}

impl ProtocolVersion {
    fn table(self) -> &'static [(Endpoint, CharacteristicKey)] {
        match self {
            ProtocolVersion::Legacy => LEGACY_TABLE,
            ProtocolVersion::Current => CURRENT_TABLE,
        }
    }

    /// Service UUIDs the hub advertises under this scheme
    pub fn services(self) -> &'static [Uuid] {
        match self {
            ProtocolVersion::Legacy => LEGACY_SERVICES,
            ProtocolVersion::Current => CURRENT_SERVICES,
        }
    }

    /// Resolve a logical endpoint, `None` if this scheme does not define it
    pub fn key(self, endpoint: Endpoint) -> Option<CharacteristicKey> {
        self.table()
            .iter()
            .find(|(e, _)| *e == endpoint)
            .map(|(_, key)| *key)
    }

    /// Reverse lookup used when routing notifications
    pub fn endpoint(self, key: &CharacteristicKey) -> Option<Endpoint> {
        self.table()
            .iter()
            .find(|(_, k)| k == key)
            .map(|(e, _)| *e)
    }

    /// Find the key for a bare characteristic UUID
    pub fn key_for_characteristic(self, characteristic: Uuid) -> Option<CharacteristicKey> {
        self.table()
            .iter()
            .find(|(_, k)| k.characteristic == characteristic)
            .map(|(_, key)| *key)
    }

    pub fn endpoints(self) -> impl Iterator<Item = Endpoint> {
        self.table().iter().map(|(e, _)| *e)
    }

    /// Endpoints that push status notifications, subscribed once per connection
    pub fn status_endpoints(self) -> &'static [Endpoint] {
        &[Endpoint::WifiStatus]
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::Legacy => f.write_str("legacy"),
            ProtocolVersion::Current => f.write_str("current"),
        }
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = crate::CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "a" => Ok(ProtocolVersion::Legacy),
            "current" | "b" => Ok(ProtocolVersion::Current),
            _ => Err(crate::CodecError::UnknownProtocol(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemes_do_not_share_uuids() {
        for endpoint in ProtocolVersion::Legacy.endpoints() {
            let key = ProtocolVersion::Legacy.key(endpoint).unwrap();
            assert_eq!(ProtocolVersion::Current.endpoint(&key), None);
        }
    }

    #[test]
    fn script_service_is_legacy_only() {
        assert!(ProtocolVersion::Legacy.key(Endpoint::ScriptRun).is_some());
        assert!(ProtocolVersion::Current.key(Endpoint::ScriptRun).is_none());
        assert!(ProtocolVersion::Current.key(Endpoint::FsMkdir).is_none());
        assert!(ProtocolVersion::Legacy.key(Endpoint::FsCreate).is_none());
    }

    #[test]
    fn uuids_render_as_registered() {
        let key = ProtocolVersion::Current.key(Endpoint::WifiSetNetwork).unwrap();
        assert_eq!(key.service.to_string(), "87654321-4321-6789-4321-0fedcba98765");
        assert_eq!(key.characteristic.to_string(), "87654321-4321-6789-4321-0fedcba98768");

        let key = ProtocolVersion::Legacy.key(Endpoint::FsMkdir).unwrap();
        assert_eq!(key.characteristic.to_string(), "42345678-1234-5678-1234-56789abcde05");
    }

    #[test]
    fn every_key_belongs_to_an_advertised_service() {
        for version in [ProtocolVersion::Legacy, ProtocolVersion::Current] {
            for endpoint in version.endpoints() {
                let key = version.key(endpoint).unwrap();
                assert!(version.services().contains(&key.service), "{endpoint}");
                assert_eq!(version.endpoint(&key), Some(endpoint));
            }
        }
    }

    #[test]
    fn parse_protocol() {
        assert_eq!("Legacy".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Legacy);
        assert_eq!("b".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Current);
        assert!("c".parse::<ProtocolVersion>().is_err());
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::Current);
    }
}
