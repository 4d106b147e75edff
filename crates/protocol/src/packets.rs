//! The fixed packet catalogue.
//!
//! Every request/response the wire can carry is a variant of [`Packet`], so
//! adding a new packet kind is a compile-time exhaustiveness change in the
//! codecs and handlers rather than a silent fallthrough. Bytes that decode to
//! no known kind land in [`Packet::Unrecognized`] and are logged and ignored
//! by handlers.

use bytes::Bytes;

/// Packet ids used by the MessagePack wire generation.
pub mod ids {
    pub const LOGIN_REQUEST: u8 = 1;
    pub const LOGIN_RESPONSE: u8 = 2;
    pub const REVISION_INFO_REQUEST: u8 = 3;
    pub const REVISION_INFO_RESPONSE: u8 = 4;
    pub const SCRIPT_SESSION_REQUEST: u8 = 5;
    pub const SCRIPT_SESSION_RESPONSE: u8 = 6;
    pub const FREE_SCRIPT_LIST_REQUEST: u8 = 7;
    pub const PAID_SCRIPT_LIST_REQUEST: u8 = 8;
    pub const SCRIPT_LIST_RESPONSE: u8 = 9;
    pub const ENCRYPTED_SCRIPT_REQUEST: u8 = 10;
    pub const ENCRYPTED_SCRIPT_RESPONSE: u8 = 11;
    pub const SCRIPT_OPTIONS_REQUEST: u8 = 12;
    pub const SCRIPT_OPTIONS_RESPONSE: u8 = 13;
    pub const SCRIPT_START_REQUEST: u8 = 14;
    pub const SCRIPT_START_RESPONSE: u8 = 15;
    pub const GET_ACTIVE_INSTANCES_REQUEST: u8 = 16;
    pub const GET_TOTAL_INSTANCES_REQUEST: u8 = 17;
    pub const INSTANCE_COUNT_RESPONSE: u8 = 18;
    pub const AUTHENTICATION_CODE_REQUEST: u8 = 19;
    pub const AUTHENTICATION_CODE_RESPONSE: u8 = 20;
    pub const PURCHASED_SCRIPT_IDS_REQUEST: u8 = 21;
    pub const PURCHASED_SCRIPT_IDS_RESPONSE: u8 = 22;

    /// Envelope that wraps another packet together with a capture timestamp.
    /// Used by the newer client generation.
    pub const WRAPPED: u8 = 127;
}

/// Descriptive metadata for one distributable script.
///
/// Owned by the server's artifact store; the wire carries copies inside
/// [`Packet::ScriptListResponse`]. Ids are sequential per configuration
/// generation and must not be assumed stable across reloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMetadata {
    pub script_id: i32,
    pub store_id: i32,
    pub name: String,
    pub description: String,
    pub version: f64,
    pub author: String,
    pub image_url: String,
    pub thread_url: String,
}

/// One wire message, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    LoginRequest {
        username: String,
        password: String,
        shared_secret: String,
    },
    LoginResponse {
        username: String,
        account_session: String,
        session_token: String,
        user_id: i32,
        auth_flags: Vec<i32>,
    },
    RevisionInfoRequest {
        hardware_id: String,
        agent_flags: String,
    },
    RevisionInfoResponse {
        revision_data: String,
        checksum: i32,
    },
    ScriptSessionRequest {
        session_key: String,
    },
    ScriptSessionResponse {
        status: i32,
        script_session: String,
    },
    FreeScriptListRequest,
    PaidScriptListRequest {
        account_session: String,
    },
    ScriptListResponse {
        scripts: Vec<ScriptMetadata>,
    },
    EncryptedScriptRequest {
        script_id: i32,
        account_session: String,
        script_session: String,
    },
    EncryptedScriptResponse {
        url: String,
        sanitized_name: String,
        checksum: String,
        key_base64: String,
        flag: i32,
    },
    ScriptOptionsRequest {
        account_session: String,
        script_session: String,
    },
    ScriptOptionsResponse {
        csv_options: String,
    },
    ScriptStartRequest,
    ScriptStartResponse {
        started: bool,
    },
    GetActiveInstancesRequest,
    GetTotalInstancesRequest,
    InstanceCountResponse {
        count: i32,
    },
    AuthenticationCodeRequest,
    AuthenticationCodeResponse {
        code: i32,
    },
    PurchasedScriptIdsRequest,
    PurchasedScriptIdsResponse {
        user_id: i32,
    },
    /// Timestamped envelope around one inner packet (current generation).
    Wrapped {
        timestamp_ms: i64,
        inner: Box<Packet>,
    },
    /// A body that decoded to no known packet kind. Kept verbatim so callers
    /// can log it; never fatal.
    Unrecognized {
        raw: Bytes,
    },
}

impl Packet {
    /// Packet id for the MessagePack generation.
    pub fn id(&self) -> u8 {
        match self {
            Packet::LoginRequest { .. } => ids::LOGIN_REQUEST,
            Packet::LoginResponse { .. } => ids::LOGIN_RESPONSE,
            Packet::RevisionInfoRequest { .. } => ids::REVISION_INFO_REQUEST,
            Packet::RevisionInfoResponse { .. } => ids::REVISION_INFO_RESPONSE,
            Packet::ScriptSessionRequest { .. } => ids::SCRIPT_SESSION_REQUEST,
            Packet::ScriptSessionResponse { .. } => ids::SCRIPT_SESSION_RESPONSE,
            Packet::FreeScriptListRequest => ids::FREE_SCRIPT_LIST_REQUEST,
            Packet::PaidScriptListRequest { .. } => ids::PAID_SCRIPT_LIST_REQUEST,
            Packet::ScriptListResponse { .. } => ids::SCRIPT_LIST_RESPONSE,
            Packet::EncryptedScriptRequest { .. } => ids::ENCRYPTED_SCRIPT_REQUEST,
            Packet::EncryptedScriptResponse { .. } => ids::ENCRYPTED_SCRIPT_RESPONSE,
            Packet::ScriptOptionsRequest { .. } => ids::SCRIPT_OPTIONS_REQUEST,
            Packet::ScriptOptionsResponse { .. } => ids::SCRIPT_OPTIONS_RESPONSE,
            Packet::ScriptStartRequest => ids::SCRIPT_START_REQUEST,
            Packet::ScriptStartResponse { .. } => ids::SCRIPT_START_RESPONSE,
            Packet::GetActiveInstancesRequest => ids::GET_ACTIVE_INSTANCES_REQUEST,
            Packet::GetTotalInstancesRequest => ids::GET_TOTAL_INSTANCES_REQUEST,
            Packet::InstanceCountResponse { .. } => ids::INSTANCE_COUNT_RESPONSE,
            Packet::AuthenticationCodeRequest => ids::AUTHENTICATION_CODE_REQUEST,
            Packet::AuthenticationCodeResponse { .. } => ids::AUTHENTICATION_CODE_RESPONSE,
            Packet::PurchasedScriptIdsRequest => ids::PURCHASED_SCRIPT_IDS_REQUEST,
            Packet::PurchasedScriptIdsResponse { .. } => ids::PURCHASED_SCRIPT_IDS_RESPONSE,
            Packet::Wrapped { .. } => ids::WRAPPED,
            // Unrecognized packets keep whatever id they arrived with; when
            // re-encoded (tests only) they claim the reserved id 0.
            Packet::Unrecognized { .. } => 0,
        }
    }

    /// Canonical type identifier used by the legacy body encoding.
    pub fn type_name(&self) -> &'static str {
        match self {
            Packet::LoginRequest { .. } => "scriptcast.LoginRequest",
            Packet::LoginResponse { .. } => "scriptcast.LoginResponse",
            Packet::RevisionInfoRequest { .. } => "scriptcast.RevisionInfoRequest",
            Packet::RevisionInfoResponse { .. } => "scriptcast.RevisionInfoResponse",
            Packet::ScriptSessionRequest { .. } => "scriptcast.ScriptSessionRequest",
            Packet::ScriptSessionResponse { .. } => "scriptcast.ScriptSessionResponse",
            Packet::FreeScriptListRequest => "scriptcast.FreeScriptListRequest",
            Packet::PaidScriptListRequest { .. } => "scriptcast.PaidScriptListRequest",
            Packet::ScriptListResponse { .. } => "scriptcast.ScriptListResponse",
            Packet::EncryptedScriptRequest { .. } => "scriptcast.EncryptedScriptRequest",
            Packet::EncryptedScriptResponse { .. } => "scriptcast.EncryptedScriptResponse",
            Packet::ScriptOptionsRequest { .. } => "scriptcast.ScriptOptionsRequest",
            Packet::ScriptOptionsResponse { .. } => "scriptcast.ScriptOptionsResponse",
            Packet::ScriptStartRequest => "scriptcast.ScriptStartRequest",
            Packet::ScriptStartResponse { .. } => "scriptcast.ScriptStartResponse",
            Packet::GetActiveInstancesRequest => "scriptcast.GetActiveInstancesRequest",
            Packet::GetTotalInstancesRequest => "scriptcast.GetTotalInstancesRequest",
            Packet::InstanceCountResponse { .. } => "scriptcast.InstanceCountResponse",
            Packet::AuthenticationCodeRequest => "scriptcast.AuthenticationCodeRequest",
            Packet::AuthenticationCodeResponse { .. } => "scriptcast.AuthenticationCodeResponse",
            Packet::PurchasedScriptIdsRequest => "scriptcast.PurchasedScriptIdsRequest",
            Packet::PurchasedScriptIdsResponse { .. } => "scriptcast.PurchasedScriptIdsResponse",
            Packet::Wrapped { .. } => "scriptcast.Wrapped",
            Packet::Unrecognized { .. } => "scriptcast.Unrecognized",
        }
    }
}
