use std::sync::Arc;
use std::time::Duration;

use robohub_ble_controller::mock::{Call, MockTransport};
use robohub_ble_controller::{
    BleError, ConnectionState, Endpoint, HubClient, Payload, ProtocolVersion, Reply, Session, SessionConfig,
};
use robohub_proto::{decode_base64, encode_base64};
use serde_json::json;

async fn connected(protocol: ProtocolVersion, config: SessionConfig) -> (Arc<MockTransport>, HubClient) {
    let mock = Arc::new(MockTransport::new(protocol));
    let session = Session::new(mock.clone(), SessionConfig { protocol, ..config });
    assert_eq!(session.connect().await, ConnectionState::Connected);
    mock.clear_calls();
    (mock, HubClient::new(session))
}

fn write_uuid(protocol: ProtocolVersion, endpoint: Endpoint) -> uuid::Uuid {
    protocol.key(endpoint).unwrap().characteristic
}

#[tokio::test]
async fn wifi_set_writes_json_then_reads_status() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    mock.set_value(Endpoint::WifiStatus, "OK");

    let reply = client.wifi_set("home", Some("secret")).await.unwrap();
    assert_eq!(reply, Some(Reply::Text("OK".to_string())));

    let set_network = write_uuid(ProtocolVersion::Current, Endpoint::WifiSetNetwork);
    let status = write_uuid(ProtocolVersion::Current, Endpoint::WifiStatus);
    let io: Vec<Call> = mock
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Read(_) | Call::Write(..)))
        .collect();
    assert_eq!(
        io,
        vec![
            Call::Write(set_network, br#"{"ssid":"home","psk":"secret"}"#.to_vec()),
            Call::Read(status),
        ]
    );
    assert_eq!(mock.wifi_ssid().as_deref(), Some("home"));
}

#[tokio::test]
async fn wifi_set_without_psk_omits_it() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    let reply = client.wifi_set("cafe", None).await.unwrap().unwrap();
    assert_eq!(reply, Reply::Json(json!({"connected": true, "ssid": "cafe"})));
    assert_eq!(mock.writes_to(Endpoint::WifiSetNetwork), vec![br#"{"ssid":"cafe"}"#.to_vec()]);
}

#[tokio::test]
async fn legacy_wifi_set_writes_ssid_then_password() {
    let (mock, client) = connected(ProtocolVersion::Legacy, SessionConfig::default()).await;
    let reply = client.wifi_set("home", Some("secret")).await.unwrap();

    assert_eq!(mock.writes_to(Endpoint::WifiSsid), vec![b"home".to_vec()]);
    assert_eq!(mock.writes_to(Endpoint::WifiPass), vec![b"secret".to_vec()]);
    assert_eq!(mock.wifi_psk().as_deref(), Some("secret"));
    assert_eq!(reply, Some(Reply::Json(json!({"connected": true, "ssid": "home"}))));
}

#[tokio::test]
async fn legacy_open_network_writes_no_password() {
    let (mock, client) = connected(ProtocolVersion::Legacy, SessionConfig::default()).await;
    let reply = client.wifi_set("cafe", None).await.unwrap();

    assert_eq!(mock.writes_to(Endpoint::WifiSsid), vec![b"cafe".to_vec()]);
    assert!(mock.writes_to(Endpoint::WifiPass).is_empty());
    assert_eq!(mock.wifi_ssid().as_deref(), Some("cafe"));
    assert_eq!(mock.wifi_psk(), None);
    assert_eq!(reply, Some(Reply::Json(json!({"connected": true, "ssid": "cafe"}))));
}

#[tokio::test]
async fn wifi_set_survives_a_failed_status_read() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    mock.fail_reads(Endpoint::WifiStatus);

    assert_eq!(client.wifi_set("home", Some("secret")).await.unwrap(), None);
    assert_eq!(mock.wifi_ssid().as_deref(), Some("home"));
    assert!(client.wifi_status().await.is_err());
}

#[tokio::test]
async fn wifi_scan_and_disconnect() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    mock.set_scan_result(r#"[{"ssid":"home","rssi":-40}]"#);
    let networks = client.wifi_scan().await.unwrap();
    assert_eq!(networks, Reply::Json(json!([{"ssid": "home", "rssi": -40}])));

    client.wifi_set("home", None).await.unwrap();
    assert!(client.wifi_disconnect(None).await.unwrap().ok);
    assert_eq!(mock.wifi_ssid(), None);
    assert_eq!(client.wifi_status().await.unwrap(), Reply::Json(json!({"connected": false})));
}

#[tokio::test]
async fn storage_write_then_read_round_trips_binary() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    let bytes = vec![0x00, 0x9f, 0x92, 0x96, 0xff, 0x10];

    let ack = client.storage_write("/data.bin", &encode_base64(&bytes), true).await.unwrap();
    assert!(ack.ok);
    assert_eq!(mock.file("/data.bin"), Some(bytes.clone()));

    let payload = client.storage_read("/data.bin").await.unwrap();
    assert!(!payload.is_text());
    assert_eq!(payload.to_bytes().unwrap(), bytes);
    assert_eq!(decode_base64(payload.as_str()).unwrap(), bytes);
}

#[tokio::test]
async fn storage_write_then_read_round_trips_text() {
    let (mock, client) = connected(ProtocolVersion::Legacy, SessionConfig::default()).await;
    let source = "from robohub import motor\nmotor.run(100)\n";

    client
        .storage_write("/main.py", &encode_base64(source.as_bytes()), true)
        .await
        .unwrap();
    let fs_write = mock.writes_to(Endpoint::FsWrite);
    let envelope: serde_json::Value = serde_json::from_slice(&fs_write[0]).unwrap();
    assert_eq!(envelope["path"], "/main.py");
    assert_eq!(envelope["overwrite"], true);

    assert_eq!(
        client.storage_read("/main.py").await.unwrap(),
        Payload::Utf8(source.to_string())
    );
}

#[tokio::test]
async fn storage_write_without_overwrite_keeps_existing_file() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    mock.put_file("/keep.txt", "original");
    client
        .storage_write("/keep.txt", &encode_base64(b"replacement"), false)
        .await
        .unwrap();
    assert_eq!(mock.file("/keep.txt"), Some(b"original".to_vec()));
}

#[tokio::test]
async fn storage_list_selects_path_first() {
    let (mock, client) = connected(ProtocolVersion::Legacy, SessionConfig::default()).await;
    mock.put_file("/main.py", "x");
    client.storage_mkdir("/lib").await.unwrap();
    mock.put_file("/lib/motor.py", "y");

    let root = client.storage_list(None).await.unwrap();
    assert_eq!(root.file_names(), vec!["main.py", "lib"]);
    assert!(mock.writes_to(Endpoint::FsRead).is_empty());

    let lib = client.storage_list(Some("/lib")).await.unwrap();
    assert_eq!(lib.file_names(), vec!["motor.py"]);
    assert_eq!(mock.writes_to(Endpoint::FsRead), vec![br#"{"path":"/lib"}"#.to_vec()]);
    assert!(mock.has_dir("/lib"));
}

#[tokio::test]
async fn storage_create_and_delete() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    client.storage_create("/empty.txt", None).await.unwrap();
    client
        .storage_create("/hello.txt", Some(&encode_base64(b"hello")))
        .await
        .unwrap();
    assert_eq!(mock.file("/empty.txt"), Some(Vec::new()));
    assert_eq!(mock.file("/hello.txt"), Some(b"hello".to_vec()));

    client.storage_delete("/hello.txt").await.unwrap();
    assert_eq!(mock.file("/hello.txt"), None);
    assert_eq!(mock.writes_to(Endpoint::FsDelete), vec![br#"{"path":"/hello.txt"}"#.to_vec()]);
}

#[tokio::test]
async fn scheme_specific_operations_are_rejected_up_front() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    for result in [
        client.script_start("main.py").await,
        client.script_run("/main.py").await,
        client.script_chunk("AAAA").await,
    ] {
        assert!(matches!(
            result,
            Err(BleError::EndpointUnavailable {
                version: ProtocolVersion::Current,
                ..
            })
        ));
    }
    assert!(matches!(
        client.storage_mkdir("/lib").await,
        Err(BleError::EndpointUnavailable { endpoint: Endpoint::FsMkdir, .. })
    ));
    assert!(mock.calls().is_empty());

    let (_, legacy) = connected(ProtocolVersion::Legacy, SessionConfig::default()).await;
    assert!(matches!(
        legacy.wifi_scan().await,
        Err(BleError::EndpointUnavailable { .. })
    ));
}

#[tokio::test]
async fn script_chunks_are_sent_as_raw_bytes() {
    let (mock, client) = connected(ProtocolVersion::Legacy, SessionConfig::default()).await;

    let ready = client.script_start("main.py").await.unwrap();
    assert_eq!(ready, Reply::Text("READY".to_string()));
    assert_eq!(
        mock.writes_to(Endpoint::ScriptWrite)[0],
        br#"{"type":"start","filename":"main.py"}"#.to_vec()
    );

    let status = client.script_chunk(&encode_base64(b"print(1)\n")).await.unwrap();
    assert_eq!(status, Reply::Text("RECEIVED 9".to_string()));
    assert_eq!(mock.writes_to(Endpoint::ScriptWrite)[1], b"print(1)\n".to_vec());

    assert!(matches!(client.script_chunk("%%%").await, Err(BleError::Codec(_))));

    let running = client.script_run("/main.py").await.unwrap();
    assert_eq!(running, Reply::Text("RUNNING /main.py".to_string()));
    assert_eq!(mock.last_run().as_deref(), Some("/main.py"));
}

#[tokio::test]
async fn script_upload_streams_chunks() {
    let config = SessionConfig {
        chunk_size: 4,
        ..SessionConfig::default()
    };
    let (mock, client) = connected(ProtocolVersion::Legacy, config).await;
    let source = b"print('hi')";

    let status = client.script_upload("main.py", source).await.unwrap();
    assert_eq!(status, Reply::Text("RECEIVED 11".to_string()));
    assert_eq!(mock.script_upload(), Some(("main.py".to_string(), source.to_vec())));
    // start plus three chunks
    assert_eq!(mock.writes_to(Endpoint::ScriptWrite).len(), 4);
    assert_eq!(mock.reads_of(Endpoint::ScriptStatus), 4);
}

#[tokio::test]
async fn operations_without_a_device_fail() {
    let mock = Arc::new(MockTransport::new(ProtocolVersion::Current));
    let client = HubClient::new(Session::new(mock.clone(), SessionConfig::default()));
    assert!(matches!(
        client.storage_read("/main.py").await,
        Err(BleError::LinkUnavailable(_))
    ));
    assert!(mock.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn operations_heal_after_reconnect() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    mock.put_file("/a.txt", "a");
    client.storage_read("/a.txt").await.unwrap();

    mock.script_connects([false, true]);
    mock.drop_link();
    let mut rx = client.session().watch();
    for target in [ConnectionState::Reconnecting, ConnectionState::Connected] {
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.state == target))
            .await
            .unwrap()
            .unwrap();
    }

    mock.clear_calls();
    assert_eq!(
        client.storage_read("/a.txt").await.unwrap(),
        Payload::Utf8("a".to_string())
    );
    // the cache was dropped with the old link
    let fs_read = write_uuid(ProtocolVersion::Current, Endpoint::FsRead);
    assert!(mock.calls().contains(&Call::DiscoverCharacteristic(fs_read)));
}

#[tokio::test]
async fn concurrent_operations_each_get_their_own_reply() {
    let (mock, client) = connected(ProtocolVersion::Current, SessionConfig::default()).await;
    mock.put_file("/a.txt", "alpha");
    mock.put_file("/b.txt", "beta");

    let (a, b) = tokio::join!(
        {
            let client = client.clone();
            tokio::spawn(async move { client.storage_read("/a.txt").await })
        },
        {
            let client = client.clone();
            tokio::spawn(async move { client.storage_read("/b.txt").await })
        }
    );
    assert_eq!(a.unwrap().unwrap(), Payload::Utf8("alpha".to_string()));
    assert_eq!(b.unwrap().unwrap(), Payload::Utf8("beta".to_string()));
}
