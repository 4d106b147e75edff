use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use clap::{Parser, ValueEnum};
use scriptcast_protocol::{ArtifactCipher, WireFormat};
use scriptcast_server::{
    EndpointRegistry, HandshakeConfig, HttpServer, HttpState, PacketHandler, ScriptStore,
    SessionRegistry, TcpServer, SWEEP_INTERVAL,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scriptcast-server", about = "Script distribution server")]
struct Cli {
    /// Config directory containing config.json.
    #[arg(long, env = "SCRIPTCAST_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Bind address for the binary protocol ingress.
    #[arg(long, default_value = "127.0.0.1:6699")]
    tcp_addr: String,

    /// Bind address for artifact downloads.
    #[arg(long, default_value = "127.0.0.1:6700")]
    http_addr: String,

    /// Wire generation served on the TCP ingress.
    #[arg(long, value_enum, default_value_t = WireArg::Current)]
    wire: WireArg,

    /// Shared secret clients must present at login.
    #[arg(long, env = "SCRIPTCAST_SHARED_SECRET", default_value = "local-dev-secret")]
    shared_secret: String,

    /// Base64 AES-256 key for artifact encryption. All zero bytes if unset.
    #[arg(long, env = "SCRIPTCAST_AES_KEY")]
    aes_key_base64: Option<String>,

    /// Base64 AES IV. All zero bytes if unset.
    #[arg(long, env = "SCRIPTCAST_AES_IV")]
    aes_iv_base64: Option<String>,

    /// Idle sessions older than this are dropped.
    #[arg(long, default_value_t = 60)]
    session_timeout_mins: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WireArg {
    Legacy,
    Current,
}

impl From<WireArg> for WireFormat {
    fn from(arg: WireArg) -> Self {
        match arg {
            WireArg::Legacy => WireFormat::Legacy,
            WireArg::Current => WireFormat::Current,
        }
    }
}

fn build_cipher(cli: &Cli) -> anyhow::Result<ArtifactCipher> {
    let key = match &cli.aes_key_base64 {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .context("invalid base64 in AES key")?,
        None => vec![0u8; 32],
    };
    let iv = match &cli.aes_iv_base64 {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .context("invalid base64 in AES IV")?,
        None => vec![0u8; 16],
    };
    ArtifactCipher::from_slices(&key, &iv).context("bad AES key/IV")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cipher = build_cipher(&cli)?;

    let store = Arc::new(
        ScriptStore::open(&cli.config_dir)
            .with_context(|| format!("loading config from {}", cli.config_dir.display()))?,
    );
    let endpoints = Arc::new(EndpointRegistry::new(store.clone(), cipher));
    let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(
        cli.session_timeout_mins * 60,
    )));
    let _sweeper = sessions.spawn_sweeper(SWEEP_INTERVAL);

    let handler = Arc::new(PacketHandler::new(
        store.clone(),
        endpoints.clone(),
        sessions,
        HandshakeConfig {
            shared_secret: cli.shared_secret.clone(),
            ..HandshakeConfig::default()
        },
    ));

    let tcp = TcpServer::bind(&cli.tcp_addr, cli.wire.into(), handler).await?;
    let http = HttpServer::bind(&cli.http_addr, HttpState { endpoints }).await?;

    spawn_reload_on_hangup(store, cli.config_dir.clone());

    tokio::select! {
        result = tcp.run() => result.context("tcp ingress failed")?,
        result = http.run() => result.context("http ingress failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

/// SIGHUP republishes the config directory as a fresh generation.
#[cfg(unix)]
fn spawn_reload_on_hangup(store: Arc<ScriptStore>, config_dir: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "cannot listen for SIGHUP, reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match store.reload(&config_dir) {
                Ok(count) => info!(scripts = count, "reloaded config"),
                Err(e) => error!(error = %e, "reload failed, keeping old generation"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_store: Arc<ScriptStore>, _config_dir: PathBuf) {}
