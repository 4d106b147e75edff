//! # scriptcast-client
//!
//! Harvest client: runs the full handshake against a distribution server,
//! downloads every purchasable script artifact over HTTP, decrypts and
//! verifies it, and writes the results to an output directory:
//!
//! ```text
//! <output>/
//!   revision.txt           revision blob from the handshake
//!   configs/<name>.json    per-script metadata
//!   jars/<name>.jar        decrypted artifacts
//!   options/<name>.txt     de-obfuscated key=value options
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bytes::BytesMut;
use scriptcast_protocol::compat::{obfuscate_option_value, revision_checksum, sanitize_name};
use scriptcast_protocol::{
    checksum_hex, ArtifactCipher, CipherError, FramingError, Packet, ScriptMetadata, WireCodec,
    WireFormat,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// How long to wait for any single response or download.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Auth flags that mean the account must not run scripts.
pub const BANNED_FLAGS: [i32; 2] = [5, 42];

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server closed the connection mid-handshake")]
    Disconnected,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("expected {expected}, server sent {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    #[error("login rejected (user id {user_id})")]
    LoginRejected { user_id: i32 },

    #[error("account carries banned auth flag {flag}")]
    Banned { flag: i32 },

    #[error("undecodable artifact key: {0}")]
    BadKey(String),
}

pub type HarvestResult<T> = Result<T, HarvestError>;

/// Everything the harvester needs to know up front.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub server_addr: String,
    pub format: WireFormat,
    pub username: String,
    pub password: String,
    pub shared_secret: String,
    pub hardware_id: String,
    pub agent_flags: String,
    /// IV matching the server's artifact cipher; the wire only carries the
    /// key.
    pub iv: [u8; 16],
    pub output_dir: PathBuf,
}

/// What one harvest run produced.
#[derive(Debug, Default)]
pub struct HarvestReport {
    pub scripts_listed: usize,
    pub jars_written: usize,
    pub options_written: usize,
    pub skipped: usize,
}

/// One framed connection to the server. Counters increase per send; the
/// legacy generation simply never puts them on the wire.
pub struct Connection {
    socket: TcpStream,
    codec: WireCodec,
    buf: BytesMut,
    counter: i32,
}

impl Connection {
    pub async fn connect(addr: &str, format: WireFormat) -> HarvestResult<Self> {
        let socket = TcpStream::connect(addr).await?;
        Ok(Self {
            socket,
            codec: WireCodec::new(format),
            buf: BytesMut::with_capacity(8 * 1024),
            counter: 0,
        })
    }

    pub async fn send(&mut self, packet: &Packet) -> HarvestResult<()> {
        let frame = self.codec.encode(packet, self.counter)?;
        self.counter = self.counter.wrapping_add(1);
        self.socket.write_all(&frame).await?;
        Ok(())
    }

    /// Receives the next packet, transparently unwrapping envelopes.
    pub async fn recv(&mut self) -> HarvestResult<Packet> {
        let packet = tokio::time::timeout(RESPONSE_TIMEOUT, self.recv_inner())
            .await
            .map_err(|_| HarvestError::Timeout("response"))??;
        let mut packet = packet;
        while let Packet::Wrapped { inner, .. } = packet {
            packet = *inner;
        }
        Ok(packet)
    }

    async fn recv_inner(&mut self) -> HarvestResult<Packet> {
        loop {
            if let Some((packet, _counter)) = self.codec.decode(&mut self.buf)? {
                return Ok(packet);
            }
            if self.socket.read_buf(&mut self.buf).await? == 0 {
                return Err(HarvestError::Disconnected);
            }
        }
    }

    pub async fn round_trip(&mut self, packet: &Packet) -> HarvestResult<Packet> {
        self.send(packet).await?;
        self.recv().await
    }
}

/// Returns the first banned flag present, if any.
pub fn banned_flag(auth_flags: &[i32]) -> Option<i32> {
    auth_flags
        .iter()
        .copied()
        .find(|flag| BANNED_FLAGS.contains(flag))
}

/// Splits an obfuscated `k=v,k=v` option string back into plain pairs.
/// Malformed pairs are dropped with a warning, mirroring how the server
/// treats its own option files.
pub fn decode_options(csv: &str, script_session: &str, user_id: i32) -> Vec<(String, i32)> {
    csv.split(',')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let Some((key, masked)) = pair.split_once('=') else {
                warn!(pair, "dropping option without '='");
                return None;
            };
            let Ok(masked) = masked.parse::<i32>() else {
                warn!(pair, "dropping option with non-numeric value");
                return None;
            };
            Some((
                key.to_string(),
                obfuscate_option_value(masked, script_session, user_id),
            ))
        })
        .collect()
}

/// Runs a complete harvest: handshake, listing, then download, decrypt, and
/// dump of every script the account can see.
pub async fn harvest(config: &HarvestConfig) -> HarvestResult<HarvestReport> {
    let mut conn = Connection::connect(&config.server_addr, config.format).await?;

    let (user_id, account_session) = login(&mut conn, config).await?;
    info!(user_id, "logged in");

    let revision = negotiate_revision(&mut conn, config, user_id).await?;
    let script_session = establish_script_session(&mut conn, config, &account_session).await?;
    let scripts = list_scripts(&mut conn, &account_session).await?;
    info!(scripts = scripts.len(), "listing complete");

    prepare_output(&config.output_dir).await?;
    tokio::fs::write(config.output_dir.join("revision.txt"), &revision).await?;

    let http = reqwest::Client::builder()
        .timeout(RESPONSE_TIMEOUT)
        .build()?;

    let mut report = HarvestReport {
        scripts_listed: scripts.len(),
        ..HarvestReport::default()
    };
    for script in &scripts {
        match harvest_one(
            &mut conn,
            &http,
            config,
            script,
            &account_session,
            &script_session,
            user_id,
        )
        .await
        {
            Ok(()) => {
                report.jars_written += 1;
                report.options_written += 1;
            }
            Err(e) => {
                warn!(script_id = script.script_id, name = %script.name, error = %e, "skipping script");
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

async fn login(conn: &mut Connection, config: &HarvestConfig) -> HarvestResult<(i32, String)> {
    let response = conn
        .round_trip(&Packet::LoginRequest {
            username: config.username.clone(),
            password: config.password.clone(),
            shared_secret: config.shared_secret.clone(),
        })
        .await?;
    let Packet::LoginResponse {
        user_id,
        account_session,
        auth_flags,
        ..
    } = response
    else {
        return Err(unexpected("LoginResponse", &response));
    };

    if user_id <= 0 {
        return Err(HarvestError::LoginRejected { user_id });
    }
    if let Some(flag) = banned_flag(&auth_flags) {
        return Err(HarvestError::Banned { flag });
    }
    Ok((user_id, account_session))
}

async fn negotiate_revision(
    conn: &mut Connection,
    config: &HarvestConfig,
    user_id: i32,
) -> HarvestResult<String> {
    let response = conn
        .round_trip(&Packet::RevisionInfoRequest {
            hardware_id: config.hardware_id.clone(),
            agent_flags: config.agent_flags.clone(),
        })
        .await?;
    let Packet::RevisionInfoResponse {
        revision_data,
        checksum,
    } = response
    else {
        return Err(unexpected("RevisionInfoResponse", &response));
    };

    let expected = revision_checksum(&config.agent_flags, user_id);
    if checksum != expected {
        warn!(checksum, expected, "revision checksum mismatch, continuing");
    }
    Ok(revision_data)
}

async fn establish_script_session(
    conn: &mut Connection,
    config: &HarvestConfig,
    account_session: &str,
) -> HarvestResult<String> {
    let response = conn
        .round_trip(&Packet::ScriptSessionRequest {
            session_key: format!("{account_session}:{}", config.hardware_id),
        })
        .await?;
    let Packet::ScriptSessionResponse { script_session, .. } = response else {
        return Err(unexpected("ScriptSessionResponse", &response));
    };
    Ok(script_session)
}

async fn list_scripts(
    conn: &mut Connection,
    account_session: &str,
) -> HarvestResult<Vec<ScriptMetadata>> {
    let response = conn
        .round_trip(&Packet::PaidScriptListRequest {
            account_session: account_session.to_string(),
        })
        .await?;
    let Packet::ScriptListResponse { scripts } = response else {
        return Err(unexpected("ScriptListResponse", &response));
    };
    Ok(scripts)
}

#[allow(clippy::too_many_arguments)]
async fn harvest_one(
    conn: &mut Connection,
    http: &reqwest::Client,
    config: &HarvestConfig,
    script: &ScriptMetadata,
    account_session: &str,
    script_session: &str,
    user_id: i32,
) -> HarvestResult<()> {
    let response = conn
        .round_trip(&Packet::EncryptedScriptRequest {
            script_id: script.script_id,
            account_session: account_session.to_string(),
            script_session: script_session.to_string(),
        })
        .await?;
    let Packet::EncryptedScriptResponse {
        url,
        sanitized_name,
        checksum,
        key_base64,
        ..
    } = response
    else {
        return Err(unexpected("EncryptedScriptResponse", &response));
    };
    if url.is_empty() {
        return Err(HarvestError::UnexpectedResponse {
            expected: "a download endpoint",
            got: "an empty response",
        });
    }

    let encrypted = http.get(&url).send().await?.error_for_status()?.bytes().await?;
    let actual = checksum_hex(&encrypted);
    if actual != checksum {
        warn!(script_id = script.script_id, %checksum, %actual, "checksum mismatch");
        return Err(HarvestError::UnexpectedResponse {
            expected: "matching checksum",
            got: "corrupt download",
        });
    }

    let key = BASE64_STANDARD
        .decode(&key_base64)
        .map_err(|e| HarvestError::BadKey(e.to_string()))?;
    let cipher = ArtifactCipher::from_slices(&key, &config.iv)?;
    let plaintext = cipher.decrypt(&encrypted)?;

    let name = if sanitized_name.is_empty() {
        sanitize_name(&script.name)
    } else {
        sanitized_name
    };
    write_script_config(&config.output_dir, &name, script).await?;
    tokio::fs::write(
        config.output_dir.join("jars").join(format!("{name}.jar")),
        &plaintext,
    )
    .await?;

    let response = conn
        .round_trip(&Packet::ScriptOptionsRequest {
            account_session: account_session.to_string(),
            script_session: script_session.to_string(),
        })
        .await?;
    let Packet::ScriptOptionsResponse { csv_options } = response else {
        return Err(unexpected("ScriptOptionsResponse", &response));
    };
    let options = decode_options(&csv_options, script_session, user_id);
    let rendered: String = options
        .iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect();
    tokio::fs::write(
        config.output_dir.join("options").join(format!("{name}.txt")),
        rendered,
    )
    .await?;

    info!(script_id = script.script_id, %name, bytes = plaintext.len(), "harvested");
    Ok(())
}

async fn prepare_output(output_dir: &Path) -> HarvestResult<()> {
    for sub in ["configs", "jars", "options"] {
        tokio::fs::create_dir_all(output_dir.join(sub)).await?;
    }
    Ok(())
}

async fn write_script_config(
    output_dir: &Path,
    name: &str,
    script: &ScriptMetadata,
) -> HarvestResult<()> {
    let config = serde_json::json!({
        "script_id": script.script_id,
        "store_id": script.store_id,
        "name": script.name,
        "description": script.description,
        "version": script.version,
        "author": script.author,
        "image_url": script.image_url,
        "thread_url": script.thread_url,
    });
    tokio::fs::write(
        output_dir.join("configs").join(format!("{name}.json")),
        serde_json::to_vec_pretty(&config).map_err(std::io::Error::other)?,
    )
    .await?;
    Ok(())
}

fn unexpected(expected: &'static str, got: &Packet) -> HarvestError {
    HarvestError::UnexpectedResponse {
        expected,
        got: got.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banned_flags_are_detected() {
        assert_eq!(banned_flag(&[10, 3]), None);
        assert_eq!(banned_flag(&[10, 5]), Some(5));
        assert_eq!(banned_flag(&[42]), Some(42));
        assert_eq!(banned_flag(&[]), None);
    }

    #[test]
    fn options_decode_back_to_plain_values() {
        let session = "script-session";
        let user_id = 7;
        let masked_speed = obfuscate_option_value(3, session, user_id);
        let masked_mode = obfuscate_option_value(-1, session, user_id);
        let csv = format!("speed={masked_speed},mode={masked_mode}");

        assert_eq!(
            decode_options(&csv, session, user_id),
            vec![("speed".to_string(), 3), ("mode".to_string(), -1)]
        );
    }

    #[test]
    fn malformed_option_pairs_are_dropped() {
        let masked = obfuscate_option_value(9, "s", 1);
        let csv = format!("good={masked},noequals,bad=xyz");
        assert_eq!(decode_options(&csv, "s", 1), vec![("good".to_string(), 9)]);
    }

    #[test]
    fn empty_option_string_decodes_to_nothing() {
        assert!(decode_options("", "s", 1).is_empty());
    }
}
