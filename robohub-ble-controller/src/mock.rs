//! In-memory hub for tests and offline development
//!
//! [`MockTransport`] implements [`GattTransport`] and plays the hub side of
//! the wire contract for one [`ProtocolVersion`]: a small filesystem, Wi-Fi
//! state and (legacy) script uploads. Every call is recorded so tests can
//! assert on exact traffic, and link behaviour can be scripted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use robohub_proto::{
    CharacteristicKey, Endpoint, FileCreate, FileWrite, PathRequest, ProtocolVersion, ScriptStart,
    WifiCredentials, decode_base64,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BleError, Result};
use crate::transport::{
    CharacteristicFlags, CharacteristicHandle, DiscoveryFilter, GattTransport, LinkEvent, PeripheralId,
    PeripheralInfo, ServiceHandle,
};

/// How the next selection resolves
#[derive(Debug, Clone)]
pub enum Selection {
    Device(PeripheralInfo),
    Cancelled,
    Denied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RequestPeripheral,
    Connect,
    Disconnect,
    DiscoverService(Uuid),
    DiscoverCharacteristic(Uuid),
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

struct Hub {
    available: bool,
    selection: Selection,
    connected: bool,
    connected_on_select: bool,
    refuse_connects: bool,
    scripted_connects: VecDeque<bool>,
    missing: HashSet<Uuid>,
    failing_reads: HashSet<Uuid>,
    no_notify: HashSet<Uuid>,
    overrides: HashMap<Uuid, Vec<u8>>,
    subscriptions: HashSet<Uuid>,
    calls: Vec<Call>,
    connect_times: Vec<Instant>,
    last_filter: Option<DiscoveryFilter>,

    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    selected_path: Option<String>,
    wifi_ssid: Option<String>,
    wifi_psk: Option<String>,
    scan: String,
    script: Option<(String, Vec<u8>)>,
    script_status: String,
    last_run: Option<String>,
}

pub struct MockTransport {
    protocol: ProtocolVersion,
    hub: Mutex<Hub>,
    events: broadcast::Sender<LinkEvent>,
}

impl MockTransport {
    pub fn new(protocol: ProtocolVersion) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            protocol,
            events,
            hub: Mutex::new(Hub {
                available: true,
                selection: Selection::Device(Self::default_peripheral()),
                connected: false,
                connected_on_select: false,
                refuse_connects: false,
                scripted_connects: VecDeque::new(),
                missing: HashSet::new(),
                failing_reads: HashSet::new(),
                no_notify: HashSet::new(),
                overrides: HashMap::new(),
                subscriptions: HashSet::new(),
                calls: Vec::new(),
                connect_times: Vec::new(),
                last_filter: None,
                files: BTreeMap::new(),
                dirs: BTreeSet::from(["/".to_string()]),
                selected_path: None,
                wifi_ssid: None,
                wifi_psk: None,
                scan: "[]".to_string(),
                script: None,
                script_status: "IDLE".to_string(),
                last_run: None,
            }),
        }
    }

    pub fn default_peripheral() -> PeripheralInfo {
        PeripheralInfo {
            id: PeripheralId("hub-1".to_string()),
            name: Some("Robohub-1".to_string()),
            address: "AA:BB:CC:DD:EE:01".to_string(),
        }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn set_available(&self, available: bool) {
        self.hub().available = available;
    }

    pub fn set_selection(&self, selection: Selection) {
        self.hub().selection = selection;
    }

    /// The peer reports an open link as soon as it is selected
    pub fn set_connected_on_select(&self, connected: bool) {
        self.hub().connected_on_select = connected;
    }

    /// Fail every connect until turned off again
    pub fn refuse_connects(&self, refuse: bool) {
        self.hub().refuse_connects = refuse;
    }

    /// Outcomes for the next connect calls, consumed in order
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.hub().scripted_connects.extend(outcomes);
    }

    /// Hide an endpoint from discovery
    pub fn remove_endpoint(&self, endpoint: Endpoint) {
        if let Some(key) = self.protocol.key(endpoint) {
            self.hub().missing.insert(key.characteristic);
        }
    }

    pub fn fail_reads(&self, endpoint: Endpoint) {
        if let Some(key) = self.protocol.key(endpoint) {
            self.hub().failing_reads.insert(key.characteristic);
        }
    }

    /// Report `endpoint` as a characteristic without the notify property
    pub fn without_notify(&self, endpoint: Endpoint) {
        if let Some(key) = self.protocol.key(endpoint) {
            self.hub().no_notify.insert(key.characteristic);
        }
    }

    /// Return `value` for every read of `endpoint` instead of the emulated state
    pub fn set_value(&self, endpoint: Endpoint, value: impl Into<Vec<u8>>) {
        if let Some(key) = self.protocol.key(endpoint) {
            self.hub().overrides.insert(key.characteristic, value.into());
        }
    }

    pub fn set_scan_result(&self, json: &str) {
        self.hub().scan = json.to_string();
    }

    /// Simulate the peer going out of range
    pub fn drop_link(&self) {
        let was_connected = {
            let mut hub = self.hub();
            hub.subscriptions.clear();
            std::mem::replace(&mut hub.connected, false)
        };
        if was_connected {
            let _ = self.events.send(LinkEvent::Disconnected(self.selected_id()));
        }
    }

    /// Push a value change; delivered only if the endpoint is subscribed
    pub fn notify(&self, endpoint: Endpoint, value: impl Into<Vec<u8>>) -> bool {
        let Some(key) = self.protocol.key(endpoint) else {
            return false;
        };
        if !self.hub().subscriptions.contains(&key.characteristic) {
            return false;
        }
        let _ = self.events.send(LinkEvent::ValueChanged {
            peripheral: self.selected_id(),
            characteristic: key.characteristic,
            value: value.into(),
        });
        true
    }

    pub fn put_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.hub().files.insert(path.to_string(), contents.into());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.hub().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.hub().dirs.contains(path)
    }

    pub fn wifi_ssid(&self) -> Option<String> {
        self.hub().wifi_ssid.clone()
    }

    pub fn wifi_psk(&self) -> Option<String> {
        self.hub().wifi_psk.clone()
    }

    /// Filename and bytes of the current script upload
    pub fn script_upload(&self) -> Option<(String, Vec<u8>)> {
        self.hub().script.clone()
    }

    pub fn last_run(&self) -> Option<String> {
        self.hub().last_run.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.hub().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.hub().calls.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Connect))
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.hub().connect_times.clone()
    }

    pub fn discovery_count(&self) -> usize {
        self.count(|c| matches!(c, Call::DiscoverCharacteristic(_)))
    }

    pub fn writes_to(&self, endpoint: Endpoint) -> Vec<Vec<u8>> {
        let Some(key) = self.protocol.key(endpoint) else {
            return Vec::new();
        };
        self.hub()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Write(uuid, value) if *uuid == key.characteristic => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn reads_of(&self, endpoint: Endpoint) -> usize {
        let Some(key) = self.protocol.key(endpoint) else {
            return 0;
        };
        self.count(|c| *c == Call::Read(key.characteristic))
    }

    pub fn is_subscribed(&self, endpoint: Endpoint) -> bool {
        self.protocol
            .key(endpoint)
            .is_some_and(|key| self.hub().subscriptions.contains(&key.characteristic))
    }

    pub fn last_filter(&self) -> Option<DiscoveryFilter> {
        self.hub().last_filter.clone()
    }

    fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.hub().calls.iter().filter(|c| f(c)).count()
    }

    fn selected_id(&self) -> PeripheralId {
        match &self.hub().selection {
            Selection::Device(info) => info.id.clone(),
            _ => Self::default_peripheral().id,
        }
    }

    fn hub(&self) -> std::sync::MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint_of(&self, characteristic: Uuid) -> Option<Endpoint> {
        let key = self.protocol.key_for_characteristic(characteristic)?;
        self.protocol.endpoint(&key)
    }

    fn require_link(hub: &Hub) -> Result<()> {
        if hub.connected {
            Ok(())
        } else {
            Err(BleError::LinkUnavailable("not connected".to_string()))
        }
    }
}

impl Hub {
    fn read(&mut self, endpoint: Endpoint) -> Vec<u8> {
        match endpoint {
            Endpoint::WifiStatus => match &self.wifi_ssid {
                Some(ssid) => serde_json::json!({"connected": true, "ssid": ssid}).to_string().into_bytes(),
                None => br#"{"connected":false}"#.to_vec(),
            },
            Endpoint::WifiScan => self.scan.clone().into_bytes(),
            Endpoint::FsList => {
                let dir = self
                    .selected_path
                    .clone()
                    .filter(|p| self.dirs.contains(p))
                    .unwrap_or_else(|| "/".to_string());
                let names: Vec<&str> = self
                    .files
                    .keys()
                    .chain(self.dirs.iter())
                    .filter(|p| parent_of(p.as_str()) == Some(dir.as_str()))
                    .map(|p| p.rsplit('/').next().unwrap_or(p.as_str()))
                    .collect();
                serde_json::to_vec(&names).unwrap_or_default()
            }
            Endpoint::FsRead => self
                .selected_path
                .as_ref()
                .and_then(|p| self.files.get(p).cloned())
                .unwrap_or_default(),
            Endpoint::ScriptStatus => self.script_status.clone().into_bytes(),
            _ => Vec::new(),
        }
    }

    fn write(&mut self, endpoint: Endpoint, value: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(value).to_string();
        match endpoint {
            Endpoint::WifiSetNetwork => {
                let creds: WifiCredentials = parse(value)?;
                self.wifi_ssid = Some(creds.ssid);
                self.wifi_psk = creds.psk;
            }
            // an SSID alone joins an open network; PASS follows for secured ones
            Endpoint::WifiSsid => {
                self.wifi_ssid = Some(text);
                self.wifi_psk = None;
            }
            Endpoint::WifiPass => self.wifi_psk = Some(text),
            Endpoint::WifiDisconnect => {
                if text.is_empty() || self.wifi_ssid.as_deref() == Some(text.as_str()) {
                    self.wifi_ssid = None;
                    self.wifi_psk = None;
                }
            }
            Endpoint::FsRead => {
                let path = match serde_json::from_slice::<PathRequest>(value) {
                    Ok(req) => req.path,
                    Err(_) => text,
                };
                self.selected_path = Some(path);
            }
            Endpoint::FsWrite => {
                let req: FileWrite = parse(value)?;
                if req.overwrite || !self.files.contains_key(&req.path) {
                    let contents = decode_base64(&req.data)?;
                    self.files.insert(req.path, contents);
                }
            }
            Endpoint::FsCreate => {
                let req: FileCreate = parse(value)?;
                let contents = match req.data {
                    Some(data) => decode_base64(&data)?,
                    None => Vec::new(),
                };
                self.files.insert(req.path, contents);
            }
            Endpoint::FsDelete => {
                let req: PathRequest = parse(value)?;
                self.files.remove(&req.path);
                self.dirs.remove(&req.path);
            }
            Endpoint::FsMkdir => {
                let req: PathRequest = parse(value)?;
                self.dirs.insert(req.path);
            }
            Endpoint::ScriptWrite => match serde_json::from_slice::<ScriptStart>(value) {
                Ok(start) if start.kind == "start" => {
                    self.script_status = "READY".to_string();
                    self.script = Some((start.filename, Vec::new()));
                }
                _ => match &mut self.script {
                    Some((_, received)) => {
                        received.extend_from_slice(value);
                        self.script_status = format!("RECEIVED {}", received.len());
                    }
                    None => self.script_status = "ERROR no upload in progress".to_string(),
                },
            },
            Endpoint::ScriptRun => {
                self.script_status = format!("RUNNING {text}");
                self.last_run = Some(text);
            }
            other => {
                return Err(BleError::TransportFailure(format!("{other} is not writable")));
            }
        }
        Ok(())
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|e| BleError::TransportFailure(format!("hub rejected payload: {e}")))
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&trimmed[..i]),
        None => Some("/"),
    }
}

#[async_trait]
impl GattTransport for MockTransport {
    async fn is_available(&self) -> bool {
        self.hub().available
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn request_peripheral(&self, filter: &DiscoveryFilter) -> Result<PeripheralInfo> {
        let mut hub = self.hub();
        hub.calls.push(Call::RequestPeripheral);
        hub.last_filter = Some(filter.clone());
        match hub.selection.clone() {
            Selection::Device(info) => {
                if hub.connected_on_select {
                    hub.connected = true;
                }
                Ok(info)
            }
            Selection::Cancelled => Err(BleError::SelectionCancelled),
            Selection::Denied => Err(BleError::PermissionDenied),
            Selection::Failed(reason) => Err(BleError::TransportFailure(reason)),
        }
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let came_up = {
            let mut hub = self.hub();
            hub.calls.push(Call::Connect);
            hub.connect_times.push(Instant::now());
            let ok = match hub.scripted_connects.pop_front() {
                Some(ok) => ok,
                None => !hub.refuse_connects,
            };
            if !ok {
                return Err(BleError::TransportFailure("connection refused".to_string()));
            }
            !std::mem::replace(&mut hub.connected, true)
        };
        if came_up {
            let _ = self.events.send(LinkEvent::Connected(peripheral.clone()));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        let was_connected = {
            let mut hub = self.hub();
            hub.calls.push(Call::Disconnect);
            hub.subscriptions.clear();
            std::mem::replace(&mut hub.connected, false)
        };
        if was_connected {
            let _ = self.events.send(LinkEvent::Disconnected(peripheral.clone()));
        }
        Ok(())
    }

    async fn is_connected(&self, _peripheral: &PeripheralId) -> bool {
        self.hub().connected
    }

    async fn discover_service(&self, _peripheral: &PeripheralId, service: Uuid) -> Result<ServiceHandle> {
        let mut hub = self.hub();
        hub.calls.push(Call::DiscoverService(service));
        Self::require_link(&hub)?;
        if !self.protocol.services().contains(&service) {
            return Err(BleError::DiscoveryFailed {
                service,
                characteristic: None,
            });
        }
        Ok(ServiceHandle { uuid: service })
    }

    async fn discover_characteristic(
        &self,
        _peripheral: &PeripheralId,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle> {
        let mut hub = self.hub();
        hub.calls.push(Call::DiscoverCharacteristic(characteristic));
        Self::require_link(&hub)?;
        let key = CharacteristicKey::new(service.uuid, characteristic);
        let endpoint = self.protocol.endpoint(&key);
        if endpoint.is_none() || hub.missing.contains(&characteristic) {
            return Err(BleError::DiscoveryFailed {
                service: service.uuid,
                characteristic: Some(characteristic),
            });
        }
        let notify = endpoint.is_some_and(|e| self.protocol.status_endpoints().contains(&e))
            && !hub.no_notify.contains(&characteristic);
        Ok(CharacteristicHandle {
            key,
            flags: CharacteristicFlags {
                read: true,
                write: true,
                notify,
            },
        })
    }

    async fn read_value(&self, _peripheral: &PeripheralId, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        let uuid = characteristic.key.characteristic;
        let endpoint = self.endpoint_of(uuid);
        let mut hub = self.hub();
        hub.calls.push(Call::Read(uuid));
        Self::require_link(&hub)?;
        if hub.failing_reads.contains(&uuid) {
            return Err(BleError::TransportFailure("read rejected".to_string()));
        }
        if let Some(value) = hub.overrides.get(&uuid) {
            return Ok(value.clone());
        }
        Ok(endpoint.map(|e| hub.read(e)).unwrap_or_default())
    }

    async fn write_value(
        &self,
        _peripheral: &PeripheralId,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()> {
        let uuid = characteristic.key.characteristic;
        let endpoint = self.endpoint_of(uuid);
        let mut hub = self.hub();
        hub.calls.push(Call::Write(uuid, value.to_vec()));
        Self::require_link(&hub)?;
        match endpoint {
            Some(endpoint) => hub.write(endpoint, value),
            None => Err(BleError::TransportFailure(format!("unknown characteristic {uuid}"))),
        }
    }

    async fn subscribe(&self, _peripheral: &PeripheralId, characteristic: &CharacteristicHandle) -> Result<()> {
        let uuid = characteristic.key.characteristic;
        let mut hub = self.hub();
        hub.calls.push(Call::Subscribe(uuid));
        Self::require_link(&hub)?;
        hub.subscriptions.insert(uuid);
        Ok(())
    }

    async fn unsubscribe(&self, _peripheral: &PeripheralId, characteristic: &CharacteristicHandle) -> Result<()> {
        let uuid = characteristic.key.characteristic;
        let mut hub = self.hub();
        hub.calls.push(Call::Unsubscribe(uuid));
        Self::require_link(&hub)?;
        hub.subscriptions.remove(&uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents() {
        assert_eq!(parent_of("/main.py"), Some("/"));
        assert_eq!(parent_of("/lib/motor.py"), Some("/lib"));
        assert_eq!(parent_of("/lib/"), Some("/"));
        assert_eq!(parent_of("/"), None);
    }

    #[test]
    fn listing_shows_direct_children() {
        let mock = MockTransport::new(ProtocolVersion::Legacy);
        mock.put_file("/main.py", "x");
        mock.put_file("/lib/motor.py", "y");
        let mut hub = mock.hub();
        hub.dirs.insert("/lib".to_string());
        let listing: Vec<String> = serde_json::from_slice(&hub.read(Endpoint::FsList)).unwrap();
        assert_eq!(listing, vec!["main.py", "lib"]);

        hub.selected_path = Some("/lib".to_string());
        let listing: Vec<String> = serde_json::from_slice(&hub.read(Endpoint::FsList)).unwrap();
        assert_eq!(listing, vec!["motor.py"]);
    }
}
