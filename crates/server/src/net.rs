//! TCP ingress: accept loop and per-connection frame pump.
//!
//! Each connection gets its own task, session, and codec buffer. A framing
//! error is fail-closed: the connection is dropped without attempting to
//! resync mid-stream, since after a bad length prefix there is no trustworthy
//! frame boundary left.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use scriptcast_protocol::{WireCodec, WireFormat};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::handler::PacketHandler;
use crate::session::ConnectionId;

const READ_BUF_CAPACITY: usize = 8 * 1024;

pub struct TcpServer {
    listener: TcpListener,
    format: WireFormat,
    handler: Arc<PacketHandler>,
}

impl TcpServer {
    pub async fn bind(
        addr: &str,
        format: WireFormat,
        handler: Arc<PacketHandler>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            listener,
            format,
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = %self.listener.local_addr()?, format = ?self.format, "tcp ingress listening");
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let handler = self.handler.clone();
            let format = self.format;
            tokio::spawn(async move {
                serve_connection(socket, peer, format, handler).await;
            });
        }
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    format: WireFormat,
    handler: Arc<PacketHandler>,
) {
    let (conn, close) = handler.sessions().register();
    debug!(connection = conn, %peer, "connection opened");

    let codec = WireCodec::new(format);
    let mut buf = BytesMut::with_capacity(READ_BUF_CAPACITY);

    loop {
        match pump_frames(&mut socket, &mut buf, &codec, conn, &handler).await {
            Ok(()) => {}
            Err(e) => {
                warn!(connection = conn, %peer, error = %e, "closing connection");
                break;
            }
        }

        tokio::select! {
            read = socket.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(connection = conn, %peer, "peer disconnected");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(connection = conn, %peer, error = %e, "read failed");
                    break;
                }
            },
            _ = close.notified() => {
                debug!(connection = conn, %peer, "session expired, hanging up");
                break;
            }
        }
    }

    handler.sessions().remove(conn);
}

/// Drains every complete frame currently buffered, dispatching each and
/// writing the responses back.
async fn pump_frames(
    socket: &mut TcpStream,
    buf: &mut BytesMut,
    codec: &WireCodec,
    conn: ConnectionId,
    handler: &PacketHandler,
) -> Result<(), ServerError> {
    while let Some((packet, counter)) = codec.decode(buf)? {
        debug!(connection = conn, kind = packet.type_name(), counter, "packet in");
        for response in handler.handle(conn, packet) {
            let counter = handler
                .sessions()
                .with(conn, |s| s.next_counter())
                .unwrap_or_default();
            let frame = codec.encode(&response, counter)?;
            socket.write_all(&frame).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testutil::seed_config;
    use crate::endpoints::EndpointRegistry;
    use crate::handler::HandshakeConfig;
    use crate::session::{SessionRegistry, DEFAULT_SESSION_TIMEOUT};
    use crate::store::ScriptStore;
    use scriptcast_protocol::{ArtifactCipher, Packet};
    use tempfile::TempDir;

    async fn spawn_server(format: WireFormat) -> (TempDir, SocketAddr) {
        let (dir, addr, _sessions) =
            spawn_server_with_timeout(format, DEFAULT_SESSION_TIMEOUT).await;
        (dir, addr)
    }

    async fn spawn_server_with_timeout(
        format: WireFormat,
        timeout: std::time::Duration,
    ) -> (TempDir, SocketAddr, Arc<SessionRegistry>) {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        let store = Arc::new(ScriptStore::open(dir.path()).unwrap());
        let endpoints = Arc::new(EndpointRegistry::new(
            store.clone(),
            ArtifactCipher::new([1; 32], [2; 16]),
        ));
        let sessions = Arc::new(SessionRegistry::new(timeout));
        let handler = Arc::new(PacketHandler::new(
            store,
            endpoints,
            sessions.clone(),
            HandshakeConfig::default(),
        ));

        let server = TcpServer::bind("127.0.0.1:0", format, handler)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (dir, addr, sessions)
    }

    async fn request(
        socket: &mut TcpStream,
        codec: &WireCodec,
        packet: &Packet,
    ) -> (Packet, i32) {
        let frame = codec.encode(packet, 0).unwrap();
        socket.write_all(&frame).await.unwrap();

        let mut buf = BytesMut::new();
        loop {
            if let Some(decoded) = codec.decode(&mut buf).unwrap() {
                return decoded;
            }
            let n = socket.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "server hung up mid-response");
        }
    }

    #[tokio::test]
    async fn login_round_trips_over_tcp() {
        let (_dir, addr) = spawn_server(WireFormat::Current).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let codec = WireCodec::new(WireFormat::Current);

        let (response, counter) = request(
            &mut socket,
            &codec,
            &Packet::LoginRequest {
                username: "tester".into(),
                password: "pw".into(),
                shared_secret: HandshakeConfig::default().shared_secret,
            },
        )
        .await;

        assert_eq!(counter, 0);
        match response {
            Packet::LoginResponse { user_id, .. } => assert_eq!(user_id, 1),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn legacy_clients_are_served_too() {
        let (_dir, addr) = spawn_server(WireFormat::Legacy).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let codec = WireCodec::new(WireFormat::Legacy);

        let (response, _) = request(&mut socket, &codec, &Packet::FreeScriptListRequest).await;
        assert_eq!(response, Packet::ScriptListResponse { scripts: vec![] });
    }

    #[tokio::test]
    async fn expired_session_hangs_up_the_connection() {
        use std::time::Duration;

        let (_dir, addr, sessions) =
            spawn_server_with_timeout(WireFormat::Current, Duration::from_millis(10)).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let codec = WireCodec::new(WireFormat::Current);

        // Establish the session, then go idle past the timeout.
        let (response, _) = request(&mut socket, &codec, &Packet::GetTotalInstancesRequest).await;
        assert_eq!(response, Packet::InstanceCountResponse { count: 1 });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sessions.sweep_expired(), 1);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .expect("server never hung up")
            .unwrap();
        assert_eq!(n, 0, "expected EOF after the session was swept");
    }

    #[tokio::test]
    async fn garbage_frame_closes_the_connection() {
        let (_dir, addr) = spawn_server(WireFormat::Current).await;
        let mut socket = TcpStream::connect(addr).await.unwrap();

        // Valid length prefix, invalid zlib payload.
        socket
            .write_all(&[0, 0, 0, 4, 0xde, 0xad, 0xbe, 0xef])
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected the server to hang up");
    }
}
