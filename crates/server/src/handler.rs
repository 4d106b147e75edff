//! Packet dispatch: one request in, zero or one response out.
//!
//! Dispatch is stateless where it can be and lenient where it cannot:
//! requests that arrive out of handshake order still get an answer computed
//! from whatever the session holds, and unknown script ids get an empty
//! response instead of an error or a hangup. Only framing failures (handled
//! upstream in the transport) terminate a connection.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use scriptcast_protocol::compat::{obfuscate_option_value, revision_checksum, sanitize_name};
use scriptcast_protocol::Packet;
use tracing::{debug, warn};

use crate::endpoints::EndpointRegistry;
use crate::session::{ConnectionId, SessionPhase, SessionRegistry};
use crate::store::ScriptStore;

/// Fixed identity material handed out during the handshake. Injected at
/// startup; every connection sees the same values.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Clients must present this in their login request.
    pub shared_secret: String,
    pub account_session: String,
    pub script_session: String,
    pub session_token: String,
    pub user_id: i32,
    pub auth_flags: Vec<i32>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            shared_secret: "local-dev-secret".into(),
            account_session: "acct-session-0001".into(),
            script_session: "script-session-0001".into(),
            session_token: "session-token-0001".into(),
            user_id: 1,
            auth_flags: vec![10],
        }
    }
}

/// Shared, connection-agnostic dispatcher. Transports call
/// [`PacketHandler::handle`] per inbound packet and write back whatever it
/// returns.
pub struct PacketHandler {
    store: Arc<ScriptStore>,
    endpoints: Arc<EndpointRegistry>,
    sessions: Arc<SessionRegistry>,
    handshake: HandshakeConfig,
}

impl PacketHandler {
    pub fn new(
        store: Arc<ScriptStore>,
        endpoints: Arc<EndpointRegistry>,
        sessions: Arc<SessionRegistry>,
        handshake: HandshakeConfig,
    ) -> Self {
        Self {
            store,
            endpoints,
            sessions,
            handshake,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Dispatches one inbound packet for `conn`, returning the responses to
    /// write back in order.
    pub fn handle(&self, conn: ConnectionId, packet: Packet) -> Vec<Packet> {
        // Envelopes only decorate; the inner packet is what gets dispatched.
        let mut packet = packet;
        while let Packet::Wrapped { inner, .. } = packet {
            packet = *inner;
        }

        match packet {
            Packet::LoginRequest {
                username,
                shared_secret,
                ..
            } => self.on_login(conn, username, &shared_secret),
            Packet::RevisionInfoRequest { agent_flags, .. } => {
                self.on_revision_info(conn, &agent_flags)
            }
            Packet::ScriptSessionRequest { .. } => self.on_script_session(conn),
            Packet::FreeScriptListRequest => {
                vec![Packet::ScriptListResponse { scripts: vec![] }]
            }
            Packet::PaidScriptListRequest { .. } => {
                vec![Packet::ScriptListResponse {
                    scripts: self.store.list_metadata(),
                }]
            }
            Packet::EncryptedScriptRequest { script_id, .. } => {
                self.on_encrypted_script(conn, script_id)
            }
            Packet::ScriptOptionsRequest { .. } => self.on_script_options(conn),
            Packet::ScriptStartRequest => {
                self.sessions.with(conn, |s| s.ready = true);
                vec![Packet::ScriptStartResponse { started: false }]
            }
            Packet::GetActiveInstancesRequest => {
                vec![Packet::InstanceCountResponse { count: 0 }]
            }
            Packet::GetTotalInstancesRequest => {
                vec![Packet::InstanceCountResponse { count: 1 }]
            }
            Packet::AuthenticationCodeRequest => {
                vec![Packet::AuthenticationCodeResponse { code: 6 }]
            }
            Packet::PurchasedScriptIdsRequest => {
                let user_id = self
                    .sessions
                    .with(conn, |s| s.user_id)
                    .unwrap_or_default();
                vec![Packet::PurchasedScriptIdsResponse { user_id }]
            }
            Packet::Unrecognized { ref raw } => {
                warn!(connection = conn, len = raw.len(), "ignoring unrecognized packet");
                vec![]
            }
            other => {
                debug!(
                    connection = conn,
                    kind = other.type_name(),
                    "ignoring packet that is not a request"
                );
                vec![]
            }
        }
    }

    fn on_login(&self, conn: ConnectionId, username: String, shared_secret: &str) -> Vec<Packet> {
        if shared_secret != self.handshake.shared_secret {
            warn!(connection = conn, %username, "login rejected: bad shared secret");
            return vec![Packet::LoginResponse {
                username,
                account_session: String::new(),
                session_token: String::new(),
                user_id: -1,
                auth_flags: vec![],
            }];
        }

        let handshake = &self.handshake;
        self.sessions.with(conn, |s| {
            s.user_id = handshake.user_id;
            s.account_session = Some(handshake.account_session.clone());
            s.advance(SessionPhase::Authenticated);
        });
        vec![Packet::LoginResponse {
            username,
            account_session: handshake.account_session.clone(),
            session_token: handshake.session_token.clone(),
            user_id: handshake.user_id,
            auth_flags: handshake.auth_flags.clone(),
        }]
    }

    fn on_revision_info(&self, conn: ConnectionId, agent_flags: &str) -> Vec<Packet> {
        let user_id = self
            .sessions
            .with(conn, |s| {
                s.advance(SessionPhase::RevisionNegotiated);
                s.user_id
            })
            .unwrap_or_default();
        vec![Packet::RevisionInfoResponse {
            revision_data: self.store.revision_data(),
            checksum: revision_checksum(agent_flags, user_id),
        }]
    }

    fn on_script_session(&self, conn: ConnectionId) -> Vec<Packet> {
        let script_session = self.handshake.script_session.clone();
        self.sessions.with(conn, |s| {
            s.script_session = Some(script_session.clone());
            s.advance(SessionPhase::ScriptSessionEstablished);
        });
        vec![Packet::ScriptSessionResponse {
            status: 0,
            script_session,
        }]
    }

    fn on_encrypted_script(&self, conn: ConnectionId, script_id: i32) -> Vec<Packet> {
        let prepared = self
            .endpoints
            .token_for(script_id)
            .and_then(|token| Ok((token, self.endpoints.checksum(script_id)?)))
            .and_then(|(token, checksum)| Ok((token, checksum, self.store.metadata(script_id)?)));

        let (token, checksum, metadata) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(connection = conn, script_id, error = %e, "script request failed");
                // Unknown or unreadable script: answer empty, keep the
                // connection alive.
                return vec![Packet::EncryptedScriptResponse {
                    url: String::new(),
                    sanitized_name: String::new(),
                    checksum: String::new(),
                    key_base64: String::new(),
                    flag: -1,
                }];
            }
        };

        self.sessions.with(conn, |s| {
            s.current_script = Some(script_id);
            s.advance(SessionPhase::ScriptSelected);
        });
        vec![Packet::EncryptedScriptResponse {
            url: format!("{}/{}", self.store.server_url(), token),
            sanitized_name: sanitize_name(&metadata.name),
            checksum,
            key_base64: BASE64_STANDARD.encode(self.endpoints.cipher().key()),
            flag: -1,
        }]
    }

    fn on_script_options(&self, conn: ConnectionId) -> Vec<Packet> {
        let context = self
            .sessions
            .with(conn, |s| {
                (s.current_script, s.script_session.clone(), s.user_id)
            })
            .unwrap_or((None, None, 0));

        let (Some(script_id), Some(script_session), user_id) = context else {
            debug!(connection = conn, "options requested before script selection");
            return vec![Packet::ScriptOptionsResponse {
                csv_options: String::new(),
            }];
        };

        let lines = match self.store.options(script_id) {
            Ok(lines) => lines,
            Err(e) => {
                warn!(connection = conn, script_id, error = %e, "options unavailable");
                return vec![Packet::ScriptOptionsResponse {
                    csv_options: String::new(),
                }];
            }
        };

        let mut masked = Vec::with_capacity(lines.len());
        for line in lines.iter() {
            let Some((key, value)) = line.split_once('=') else {
                warn!(script_id, %line, "skipping option without '='");
                continue;
            };
            let Ok(value) = value.trim().parse::<i32>() else {
                warn!(script_id, %line, "skipping option with non-numeric value");
                continue;
            };
            let obfuscated = obfuscate_option_value(value, &script_session, user_id);
            masked.push(format!("{}={}", key.trim(), obfuscated));
        }

        self.sessions
            .with(conn, |s| s.advance(SessionPhase::OptionsDelivered));
        vec![Packet::ScriptOptionsResponse {
            csv_options: masked.join(","),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testutil::{seed_config, write};
    use crate::session::DEFAULT_SESSION_TIMEOUT;
    use scriptcast_protocol::ArtifactCipher;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        handler: PacketHandler,
        conn: ConnectionId,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        fixture_in(dir)
    }

    fn fixture_in(dir: TempDir) -> Fixture {
        let store = Arc::new(ScriptStore::open(dir.path()).unwrap());
        let endpoints = Arc::new(EndpointRegistry::new(
            store.clone(),
            ArtifactCipher::new([1; 32], [2; 16]),
        ));
        let sessions = Arc::new(SessionRegistry::new(DEFAULT_SESSION_TIMEOUT));
        let (conn, _close) = sessions.register();
        let handler = PacketHandler::new(store, endpoints, sessions, HandshakeConfig::default());
        Fixture {
            _dir: dir,
            handler,
            conn,
        }
    }

    fn login(fx: &Fixture) -> Vec<Packet> {
        fx.handler.handle(
            fx.conn,
            Packet::LoginRequest {
                username: "tester".into(),
                password: "pw".into(),
                shared_secret: HandshakeConfig::default().shared_secret,
            },
        )
    }

    #[test]
    fn login_with_good_secret_authenticates() {
        let fx = fixture();
        let responses = login(&fx);
        match &responses[..] {
            [Packet::LoginResponse {
                username,
                user_id,
                auth_flags,
                ..
            }] => {
                assert_eq!(username, "tester");
                assert_eq!(*user_id, 1);
                assert_eq!(auth_flags, &[10]);
            }
            other => panic!("unexpected responses: {other:?}"),
        }
        assert_eq!(
            fx.handler.sessions().with(fx.conn, |s| s.phase).unwrap(),
            SessionPhase::Authenticated
        );
    }

    #[test]
    fn login_with_bad_secret_is_rejected() {
        let fx = fixture();
        let responses = fx.handler.handle(
            fx.conn,
            Packet::LoginRequest {
                username: "tester".into(),
                password: "pw".into(),
                shared_secret: "wrong".into(),
            },
        );
        match &responses[..] {
            [Packet::LoginResponse {
                user_id,
                account_session,
                auth_flags,
                ..
            }] => {
                assert_eq!(*user_id, -1);
                assert!(account_session.is_empty());
                assert!(auth_flags.is_empty());
            }
            other => panic!("unexpected responses: {other:?}"),
        }
        assert_eq!(
            fx.handler.sessions().with(fx.conn, |s| s.phase).unwrap(),
            SessionPhase::Connected
        );
    }

    #[test]
    fn revision_checksum_binds_flags_and_user() {
        let fx = fixture();
        login(&fx);
        let responses = fx.handler.handle(
            fx.conn,
            Packet::RevisionInfoRequest {
                hardware_id: "HW".into(),
                agent_flags: "flags-abc".into(),
            },
        );
        match &responses[..] {
            [Packet::RevisionInfoResponse {
                revision_data,
                checksum,
            }] => {
                assert_eq!(revision_data, "rev-blob-1");
                assert_eq!(*checksum, revision_checksum("flags-abc", 1));
            }
            other => panic!("unexpected responses: {other:?}"),
        }
    }

    #[test]
    fn free_list_is_empty_and_paid_list_is_full() {
        let fx = fixture();
        let free = fx.handler.handle(fx.conn, Packet::FreeScriptListRequest);
        assert_eq!(free, vec![Packet::ScriptListResponse { scripts: vec![] }]);

        let paid = fx.handler.handle(
            fx.conn,
            Packet::PaidScriptListRequest {
                account_session: "acct".into(),
            },
        );
        match &paid[..] {
            [Packet::ScriptListResponse { scripts }] => {
                assert_eq!(scripts.len(), 1);
                assert_eq!(scripts[0].name, "Fisher Pro");
            }
            other => panic!("unexpected responses: {other:?}"),
        }
    }

    #[test]
    fn script_request_returns_endpoint_and_key() {
        let fx = fixture();
        login(&fx);
        let responses = fx.handler.handle(
            fx.conn,
            Packet::EncryptedScriptRequest {
                script_id: 0,
                account_session: "acct".into(),
                script_session: "sess".into(),
            },
        );
        match &responses[..] {
            [Packet::EncryptedScriptResponse {
                url,
                sanitized_name,
                checksum,
                key_base64,
                flag,
            }] => {
                assert!(url.starts_with("http://127.0.0.1:6700/"));
                assert_eq!(sanitized_name, "Fisher_Pro");
                assert!(!checksum.is_empty());
                assert_eq!(
                    BASE64_STANDARD.decode(key_base64).unwrap(),
                    vec![1u8; 32]
                );
                assert_eq!(*flag, -1);
            }
            other => panic!("unexpected responses: {other:?}"),
        }
    }

    #[test]
    fn unknown_script_id_gets_an_empty_response() {
        let fx = fixture();
        login(&fx);
        let responses = fx.handler.handle(
            fx.conn,
            Packet::EncryptedScriptRequest {
                script_id: 404,
                account_session: "acct".into(),
                script_session: "sess".into(),
            },
        );
        match &responses[..] {
            [Packet::EncryptedScriptResponse { url, checksum, .. }] => {
                assert!(url.is_empty());
                assert!(checksum.is_empty());
            }
            other => panic!("unexpected responses: {other:?}"),
        }
    }

    #[test]
    fn options_are_obfuscated_per_session() {
        let fx = fixture();
        login(&fx);
        fx.handler.handle(
            fx.conn,
            Packet::ScriptSessionRequest {
                session_key: "k".into(),
            },
        );
        fx.handler.handle(
            fx.conn,
            Packet::EncryptedScriptRequest {
                script_id: 0,
                account_session: "acct".into(),
                script_session: "sess".into(),
            },
        );
        let responses = fx.handler.handle(
            fx.conn,
            Packet::ScriptOptionsRequest {
                account_session: "acct".into(),
                script_session: "sess".into(),
            },
        );
        let Packet::ScriptOptionsResponse { csv_options } = &responses[0] else {
            panic!("unexpected responses: {responses:?}");
        };

        let script_session = HandshakeConfig::default().script_session;
        for (pair, (key, plain)) in csv_options.split(',').zip([("speed", 3), ("mode", 1)]) {
            let (k, v) = pair.split_once('=').unwrap();
            assert_eq!(k, key);
            let masked: i32 = v.parse().unwrap();
            assert_eq!(obfuscate_option_value(masked, &script_session, 1), plain);
        }
    }

    #[test]
    fn malformed_option_lines_are_dropped() {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        write(
            dir.path(),
            "artifacts/fisher.opts",
            "speed=3\nnot a pair\nmode=oops\nretries=2\n",
        );
        let fx = fixture_in(dir);
        login(&fx);
        fx.handler.handle(
            fx.conn,
            Packet::ScriptSessionRequest {
                session_key: "k".into(),
            },
        );
        fx.handler.handle(
            fx.conn,
            Packet::EncryptedScriptRequest {
                script_id: 0,
                account_session: "acct".into(),
                script_session: "sess".into(),
            },
        );
        let responses = fx.handler.handle(
            fx.conn,
            Packet::ScriptOptionsRequest {
                account_session: "acct".into(),
                script_session: "sess".into(),
            },
        );
        let Packet::ScriptOptionsResponse { csv_options } = &responses[0] else {
            panic!("unexpected responses: {responses:?}");
        };
        let keys: Vec<&str> = csv_options
            .split(',')
            .map(|pair| pair.split_once('=').unwrap().0)
            .collect();
        assert_eq!(keys, vec!["speed", "retries"]);
    }

    #[test]
    fn options_before_selection_come_back_empty() {
        let fx = fixture();
        let responses = fx.handler.handle(
            fx.conn,
            Packet::ScriptOptionsRequest {
                account_session: "acct".into(),
                script_session: "sess".into(),
            },
        );
        assert_eq!(
            responses,
            vec![Packet::ScriptOptionsResponse {
                csv_options: String::new()
            }]
        );
    }

    #[test]
    fn wrapped_requests_are_unwrapped_before_dispatch() {
        let fx = fixture();
        let responses = fx.handler.handle(
            fx.conn,
            Packet::Wrapped {
                timestamp_ms: 1_700_000_000_000,
                inner: Box::new(Packet::GetTotalInstancesRequest),
            },
        );
        assert_eq!(responses, vec![Packet::InstanceCountResponse { count: 1 }]);
    }

    #[test]
    fn responses_and_unknowns_inbound_are_ignored() {
        let fx = fixture();
        assert!(fx
            .handler
            .handle(fx.conn, Packet::InstanceCountResponse { count: 3 })
            .is_empty());
        assert!(fx
            .handler
            .handle(
                fx.conn,
                Packet::Unrecognized {
                    raw: bytes::Bytes::from_static(b"\x63junk")
                }
            )
            .is_empty());
    }
}
