use std::path::PathBuf;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use clap::{Parser, ValueEnum};
use scriptcast_client::{harvest, HarvestConfig};
use scriptcast_protocol::WireFormat;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scriptcast-client", about = "Script harvest client")]
struct Cli {
    /// Server address for the binary protocol.
    #[arg(long, default_value = "127.0.0.1:6699")]
    server_addr: String,

    /// Wire generation to speak.
    #[arg(long, value_enum, default_value_t = WireArg::Current)]
    wire: WireArg,

    #[arg(long, default_value = "harvester")]
    username: String,

    #[arg(long, env = "SCRIPTCAST_PASSWORD", default_value = "")]
    password: String,

    /// Shared secret the server expects at login.
    #[arg(long, env = "SCRIPTCAST_SHARED_SECRET", default_value = "local-dev-secret")]
    shared_secret: String,

    #[arg(long, default_value = "HW-LOCAL")]
    hardware_id: String,

    #[arg(long, default_value = "agent")]
    agent_flags: String,

    /// Base64 AES IV matching the server. All zero bytes if unset.
    #[arg(long, env = "SCRIPTCAST_AES_IV")]
    aes_iv_base64: Option<String>,

    /// Where to write harvested artifacts.
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WireArg {
    Legacy,
    Current,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let iv: [u8; 16] = match &cli.aes_iv_base64 {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .context("invalid base64 in AES IV")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("AES IV must be 16 bytes"))?,
        None => [0u8; 16],
    };

    let config = HarvestConfig {
        server_addr: cli.server_addr,
        format: match cli.wire {
            WireArg::Legacy => WireFormat::Legacy,
            WireArg::Current => WireFormat::Current,
        },
        username: cli.username,
        password: cli.password,
        shared_secret: cli.shared_secret,
        hardware_id: cli.hardware_id,
        agent_flags: cli.agent_flags,
        iv,
        output_dir: cli.output_dir,
    };

    let report = harvest(&config).await.context("harvest failed")?;
    info!(
        listed = report.scripts_listed,
        jars = report.jars_written,
        options = report.options_written,
        skipped = report.skipped,
        "harvest complete"
    );
    Ok(())
}
