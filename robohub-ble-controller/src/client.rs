//! Wi-Fi, storage and script operations on top of a [`Session`]
//!
//! Every operation is one or more writes followed by at most one read. Each
//! call re-resolves its characteristics through the session cache, so a
//! reconnect heals later calls without the caller doing anything. Calls are
//! serialised per session: two tasks sharing a client never interleave their
//! write/read pairs.

use robohub_proto::{
    Ack, Endpoint, FileCreate, FileWrite, PathRequest, Payload, ProtocolVersion, Reply, ScriptStart,
    WifiCredentials, decode_base64, encode_json,
};

use crate::error::Result;
use crate::session::Session;

#[derive(Clone)]
pub struct HubClient {
    session: Session,
}

impl HubClient {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Join a network, then read back the Wi-Fi status. The status read is
    /// advisory: if it fails the call still succeeds with `None`.
    pub async fn wifi_set(&self, ssid: &str, psk: Option<&str>) -> Result<Option<Reply>> {
        let _op = self.session.lock_operations().await;
        match self.session.protocol() {
            ProtocolVersion::Current => {
                let body = encode_json(&WifiCredentials {
                    ssid: ssid.to_string(),
                    psk: psk.map(String::from),
                })?;
                self.session.write_endpoint(Endpoint::WifiSetNetwork, &body).await?;
            }
            ProtocolVersion::Legacy => {
                self.session.write_endpoint(Endpoint::WifiSsid, ssid.as_bytes()).await?;
                // open networks get no PASS write
                if let Some(psk) = psk {
                    self.session.write_endpoint(Endpoint::WifiPass, psk.as_bytes()).await?;
                }
            }
        }

        match self.session.read_endpoint(Endpoint::WifiStatus).await {
            Ok(payload) => Ok(Some(Reply::from_payload(payload))),
            Err(e) => {
                tracing::warn!("wifi status after set unavailable: {e}");
                Ok(None)
            }
        }
    }

    pub async fn wifi_status(&self) -> Result<Reply> {
        let _op = self.session.lock_operations().await;
        self.read_reply(Endpoint::WifiStatus).await
    }

    /// Networks the hub can see
    pub async fn wifi_scan(&self) -> Result<Reply> {
        let _op = self.session.lock_operations().await;
        self.read_reply(Endpoint::WifiScan).await
    }

    /// Leave the current network, or only `ssid` when given
    pub async fn wifi_disconnect(&self, ssid: Option<&str>) -> Result<Ack> {
        let _op = self.session.lock_operations().await;
        self.session
            .write_endpoint(Endpoint::WifiDisconnect, ssid.unwrap_or_default().as_bytes())
            .await?;
        Ok(Ack { ok: true })
    }

    /// List a directory. Without a path the hub lists its current directory.
    pub async fn storage_list(&self, path: Option<&str>) -> Result<Reply> {
        let _op = self.session.lock_operations().await;
        if let Some(path) = path {
            self.write_json(Endpoint::FsRead, &PathRequest { path: path.to_string() })
                .await?;
        }
        self.read_reply(Endpoint::FsList).await
    }

    /// File contents. Binary files come back as [`Payload::Base64`].
    pub async fn storage_read(&self, path: &str) -> Result<Payload> {
        let _op = self.session.lock_operations().await;
        self.write_json(Endpoint::FsRead, &PathRequest { path: path.to_string() })
            .await?;
        self.session.read_endpoint(Endpoint::FsRead).await
    }

    /// Upload base64 encoded contents
    pub async fn storage_write(&self, path: &str, data: &str, overwrite: bool) -> Result<Ack> {
        let _op = self.session.lock_operations().await;
        self.write_json(
            Endpoint::FsWrite,
            &FileWrite {
                path: path.to_string(),
                data: data.to_string(),
                overwrite,
            },
        )
        .await?;
        Ok(Ack { ok: true })
    }

    pub async fn storage_delete(&self, path: &str) -> Result<Ack> {
        let _op = self.session.lock_operations().await;
        self.write_json(Endpoint::FsDelete, &PathRequest { path: path.to_string() })
            .await?;
        Ok(Ack { ok: true })
    }

    /// Legacy hubs only
    pub async fn storage_mkdir(&self, path: &str) -> Result<Ack> {
        let _op = self.session.lock_operations().await;
        self.write_json(Endpoint::FsMkdir, &PathRequest { path: path.to_string() })
            .await?;
        Ok(Ack { ok: true })
    }

    /// Create a file, optionally with base64 contents. Current hubs only.
    pub async fn storage_create(&self, path: &str, data: Option<&str>) -> Result<Ack> {
        let _op = self.session.lock_operations().await;
        self.write_json(
            Endpoint::FsCreate,
            &FileCreate {
                path: path.to_string(),
                data: data.map(String::from),
            },
        )
        .await?;
        Ok(Ack { ok: true })
    }

    /// Open a script upload session for `filename`
    pub async fn script_start(&self, filename: &str) -> Result<Reply> {
        let _op = self.session.lock_operations().await;
        self.start_script(filename).await
    }

    /// Send one base64 chunk; the hub receives the decoded bytes
    pub async fn script_chunk(&self, data: &str) -> Result<Reply> {
        let bytes = decode_base64(data)?;
        let _op = self.session.lock_operations().await;
        self.send_chunk(&bytes).await
    }

    pub async fn script_run(&self, path: &str) -> Result<Reply> {
        let _op = self.session.lock_operations().await;
        self.session.write_endpoint(Endpoint::ScriptRun, path.as_bytes()).await?;
        self.read_reply(Endpoint::ScriptStatus).await
    }

    /// Start a session and stream `contents` in `chunk_size` pieces. Returns
    /// the status after the last chunk.
    pub async fn script_upload(&self, filename: &str, contents: &[u8]) -> Result<Reply> {
        let _op = self.session.lock_operations().await;
        let mut status = self.start_script(filename).await?;
        let chunk_size = self.session.config().chunk_size.max(1);
        for (i, chunk) in contents.chunks(chunk_size).enumerate() {
            tracing::debug!(filename, chunk = i, len = chunk.len(), "script chunk");
            status = self.send_chunk(chunk).await?;
        }
        Ok(status)
    }

    async fn start_script(&self, filename: &str) -> Result<Reply> {
        self.write_json(Endpoint::ScriptWrite, &ScriptStart::new(filename))
            .await?;
        self.read_reply(Endpoint::ScriptStatus).await
    }

    async fn send_chunk(&self, bytes: &[u8]) -> Result<Reply> {
        self.session.write_endpoint(Endpoint::ScriptWrite, bytes).await?;
        self.read_reply(Endpoint::ScriptStatus).await
    }

    async fn write_json<T: serde::Serialize>(&self, endpoint: Endpoint, value: &T) -> Result<()> {
        let body = encode_json(value)?;
        self.session.write_endpoint(endpoint, &body).await
    }

    async fn read_reply(&self, endpoint: Endpoint) -> Result<Reply> {
        let payload = self.session.read_endpoint(endpoint).await?;
        Ok(Reply::from_payload(payload))
    }
}
