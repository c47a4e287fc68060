//! Robohub BLE Controller
//!
//! Session and protocol client for Robohub robot controllers over BLE.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use robohub_ble_controller::{BtleplugConfig, BtleplugTransport, HubClient, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::new(BtleplugConfig::default()).await);
//!     let session = Session::new(transport, SessionConfig::default());
//!
//!     // Select a hub and open the link
//!     println!("{}", session.connect().await);
//!
//!     // Join a network and list the hub's files
//!     let client = HubClient::new(session.clone());
//!     client.wifi_set("MySSID", Some("MyPassword")).await?;
//!     println!("{:?}", client.storage_list(None).await?.file_names());
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod mock;
pub mod notify;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use ble::{BtleplugConfig, BtleplugTransport, HubDevice};
pub use client::HubClient;
pub use config::{ConfigError, SessionConfig};
pub use error::BleError;
pub use robohub_proto::{Endpoint, Payload, ProtocolVersion, Reply};
pub use session::{ConnectionState, NoticeLevel, Session, SessionEvent, SessionSnapshot};
pub use transport::{GattTransport, LinkEvent, PeripheralId, PeripheralInfo};
