use robohub_proto::{CodecError, Endpoint, ProtocolVersion};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BleError {
    /// The chooser closed without a device. Informational, not a failure.
    #[error("no device selected")]
    SelectionCancelled,
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("bluetooth is not available: {0}")]
    Unsupported(String),
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),
    #[error("{}", discovery_message(.service, .characteristic))]
    DiscoveryFailed {
        service: Uuid,
        characteristic: Option<Uuid>,
    },
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("failed to reconnect to the device after several attempts")]
    ReconnectExhausted,
    #[error("{endpoint} is not part of the {version} protocol")]
    EndpointUnavailable {
        endpoint: Endpoint,
        version: ProtocolVersion,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

fn discovery_message(service: &Uuid, characteristic: &Option<Uuid>) -> String {
    match characteristic {
        Some(c) => format!("characteristic {c} not found in service {service}"),
        None => format!("service {service} not found"),
    }
}

impl From<btleplug::Error> for BleError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => BleError::PermissionDenied,
            btleplug::Error::DeviceNotFound => BleError::LinkUnavailable("device not found".to_string()),
            btleplug::Error::NotConnected => BleError::LinkUnavailable("not connected".to_string()),
            btleplug::Error::NotSupported(what) => BleError::Unsupported(what),
            other => BleError::TransportFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BleError>;
