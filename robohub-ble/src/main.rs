//! Command line tool for Robohub controllers
//!
//! Selects a hub over BLE and drives its Wi-Fi, filesystem and script
//! services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use robohub_ble_controller::{
    BtleplugConfig, BtleplugTransport, ConnectionState, HubClient, ProtocolVersion, Reply, Session, SessionConfig,
    SessionEvent,
};
use robohub_proto::encode_base64;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "robohub-ble")]
#[command(about = "Talk to Robohub controllers over BLE")]
struct Cli {
    /// Device name or address to connect to
    #[arg(short, long, global = true)]
    device: Option<String>,
    /// UUID scheme of the hub firmware (current or legacy)
    #[arg(short, long, global = true)]
    protocol: Option<ProtocolVersion>,
    /// Scan duration in seconds
    #[arg(long, global = true, default_value = "5")]
    scan_secs: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Robohub devices
    Scan,
    /// Wi-Fi provisioning
    Wifi {
        #[command(subcommand)]
        command: WifiCommand,
    },
    /// Hub filesystem
    Fs {
        #[command(subcommand)]
        command: FsCommand,
    },
    /// Script upload and execution (legacy hubs)
    Script {
        #[command(subcommand)]
        command: ScriptCommand,
    },
    /// Print session events and notifications until interrupted
    Watch,
}

#[derive(Subcommand)]
enum WifiCommand {
    /// Join a network
    Set {
        ssid: Option<String>,
        psk: Option<String>,
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, conflicts_with = "ssid")]
        file: Option<PathBuf>,
    },
    Status,
    /// Networks visible to the hub
    Scan,
    Disconnect {
        ssid: Option<String>,
    },
}

#[derive(Subcommand)]
enum FsCommand {
    Ls {
        path: Option<String>,
    },
    Cat {
        path: String,
        /// Write the file here instead of printing it
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Upload a local file
    Put {
        local: PathBuf,
        remote: String,
        /// Keep the remote file if it already exists
        #[arg(long)]
        no_overwrite: bool,
    },
    Rm {
        path: String,
    },
    Mkdir {
        path: String,
    },
    /// Create a file, empty or with the contents of a local file
    Touch {
        path: String,
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ScriptCommand {
    /// Upload a script in chunks
    Upload {
        local: PathBuf,
        /// Name on the hub, defaults to the local file name
        #[arg(long)]
        name: Option<String>,
    },
    Run {
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    let home = robohub_home()?;
    let mut config = SessionConfig::load_or_init(&home.join("config.json"))?;
    if let Some(protocol) = cli.protocol {
        config.protocol = protocol;
    }
    if cli.device.is_some() {
        config.device = cli.device;
    }
    let scan_duration = Duration::from_secs(cli.scan_secs);

    if let Commands::Scan = cli.command {
        return scan_devices(scan_duration, config.protocol).await;
    }

    let transport = Arc::new(BtleplugTransport::new(BtleplugConfig { scan_duration }).await);
    let session = Session::new(transport, config);

    println!("Scanning for Robohub devices ({} seconds)...", cli.scan_secs);
    let state = session.connect().await;
    if session.peripheral().is_none() || matches!(state, ConnectionState::Error(_) | ConnectionState::Unsupported) {
        let reason = session.error().unwrap_or_else(|| "No Robohub device found".to_string());
        session.shutdown().await;
        return Err(reason.into());
    }
    println!(
        "Found device: {} ({state})",
        session.device_name().unwrap_or_else(|| "Unknown".to_string())
    );

    let client = HubClient::new(session.clone());
    let result = run(&client, cli.command).await;
    session.shutdown().await;
    result
}

fn robohub_home() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(home) = std::env::var("ROBOHUB_HOME") {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().ok_or("Could not determine home directory")?;
    Ok(home.join(".robohub"))
}

async fn scan_devices(duration: Duration, protocol: ProtocolVersion) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for Robohub devices ({} seconds)...", duration.as_secs());

    let devices = robohub_ble_controller::ble::scan(duration, protocol).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_hub { " [ROBOHUB]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }
    Ok(())
}

async fn run(client: &HubClient, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Scan => {}
        Commands::Wifi { command } => wifi(client, command).await?,
        Commands::Fs { command } => fs(client, command).await?,
        Commands::Script { command } => script(client, command).await?,
        Commands::Watch => watch(client.session()).await,
    }
    Ok(())
}

async fn wifi(client: &HubClient, command: WifiCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        WifiCommand::Set { ssid, psk, file } => {
            let (ssid, psk) = match (ssid, file) {
                (_, Some(file)) => read_wifi_credentials(&file)?,
                (Some(ssid), None) => (ssid, psk),
                (None, None) => return Err("Either an SSID or --file is required".into()),
            };
            println!("Sending WiFi credentials...");
            println!("  SSID: {ssid}");
            match client.wifi_set(&ssid, psk.as_deref()).await? {
                Some(status) => print_reply(&status),
                None => println!("WiFi credentials sent, status not available yet."),
            }
        }
        WifiCommand::Status => print_reply(&client.wifi_status().await?),
        WifiCommand::Scan => print_reply(&client.wifi_scan().await?),
        WifiCommand::Disconnect { ssid } => {
            client.wifi_disconnect(ssid.as_deref()).await?;
            println!("Disconnect requested.");
        }
    }
    Ok(())
}

async fn fs(client: &HubClient, command: FsCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        FsCommand::Ls { path } => {
            let listing = client.storage_list(path.as_deref()).await?;
            let names = listing.file_names();
            if names.is_empty() {
                print_reply(&listing);
            }
            for name in names {
                println!("{name}");
            }
        }
        FsCommand::Cat { path, out } => {
            let payload = client.storage_read(&path).await?;
            match out {
                Some(out) => {
                    let bytes = payload.to_bytes()?;
                    std::fs::write(&out, &bytes)?;
                    println!("Wrote {} bytes to {}", bytes.len(), out.display());
                }
                None if payload.is_text() => print!("{}", payload.as_str()),
                None => {
                    eprintln!("{path} is binary, showing base64");
                    println!("{}", payload.as_str());
                }
            }
        }
        FsCommand::Put {
            local,
            remote,
            no_overwrite,
        } => {
            let bytes = std::fs::read(&local)?;
            client.storage_write(&remote, &encode_base64(&bytes), !no_overwrite).await?;
            println!("Uploaded {} bytes to {remote}", bytes.len());
        }
        FsCommand::Rm { path } => {
            client.storage_delete(&path).await?;
            println!("Deleted {path}");
        }
        FsCommand::Mkdir { path } => {
            client.storage_mkdir(&path).await?;
            println!("Created {path}/");
        }
        FsCommand::Touch { path, from } => {
            let data = match from {
                Some(local) => Some(encode_base64(&std::fs::read(local)?)),
                None => None,
            };
            client.storage_create(&path, data.as_deref()).await?;
            println!("Created {path}");
        }
    }
    Ok(())
}

async fn script(client: &HubClient, command: ScriptCommand) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ScriptCommand::Upload { local, name } => {
            let name = match name {
                Some(name) => name,
                None => file_name(&local)?,
            };
            let bytes = std::fs::read(&local)?;
            println!("Uploading {name} ({} bytes)...", bytes.len());
            let status = client.script_upload(&name, &bytes).await?;
            print_reply(&status);
        }
        ScriptCommand::Run { path } => print_reply(&client.script_run(&path).await?),
    }
    Ok(())
}

async fn watch(session: &Session) {
    let mut events = session.subscribe();
    println!("Watching {} (Ctrl-C to stop)", session.status());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged(state)) => println!("state: {state}"),
                Ok(SessionEvent::Notice { level, message }) => println!("{level:?}: {message}"),
                Ok(SessionEvent::Notification { endpoint, payload, .. }) => {
                    let endpoint = endpoint.map(|e| e.to_string()).unwrap_or_else(|| "unknown".to_string());
                    println!("{endpoint}: {payload}");
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("dropped {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn print_reply(reply: &Reply) {
    match reply.as_json() {
        Some(value) => match serde_json::to_string_pretty(value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        None => println!("{reply}"),
    }
}

fn file_name(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| format!("{} has no file name", path.display()).into())
}

/// SSID on line 1, optional password on line 2
fn read_wifi_credentials(file: &Path) -> Result<(String, Option<String>), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)?;
    let mut lines = content.lines();
    let ssid = lines.next().map(str::trim).filter(|s| !s.is_empty());
    let ssid = ssid.ok_or("Missing SSID in credentials file")?.to_string();
    let password = lines.next().map(str::trim).filter(|p| !p.is_empty()).map(String::from);
    Ok((ssid, password))
}
