//! Legacy obfuscated-object body encoding.
//!
//! Layout: one descriptor tag byte (`0` = fat, full canonical identifier
//! follows; `1` = thin, obfuscation-map token follows), a length-prefixed
//! identifier string, then the type-specific field layout. All integers are
//! big-endian; strings are u16-length-prefixed UTF-8; lists are u16-counted.
//!
//! Decoding is token-agnostic: both descriptor forms resolve to the same
//! canonical identifier, and a thin descriptor whose token is absent from the
//! map is taken as the real identifier (the interoperability fallback).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FramingError, FramingResult};
use crate::obfuscation;
use crate::packets::{Packet, ScriptMetadata};

const TAG_FAT: u8 = 0;
const TAG_THIN: u8 = 1;

/// Encodes one packet as a legacy body.
pub fn encode_body(packet: &Packet) -> FramingResult<Bytes> {
    // Unrecognized bodies are carried verbatim, descriptor included.
    if let Packet::Unrecognized { raw } = packet {
        return Ok(raw.clone());
    }

    let mut buf = BytesMut::new();
    let canonical = packet.type_name();
    match obfuscation::token_for(canonical) {
        Some(token) => {
            buf.put_u8(TAG_THIN);
            put_str(&mut buf, token)?;
        }
        None => {
            buf.put_u8(TAG_FAT);
            put_str(&mut buf, canonical)?;
        }
    }
    encode_fields(&mut buf, packet)?;
    Ok(buf.freeze())
}

/// Decodes one legacy body. The body must be consumed exactly; trailing bytes
/// after a known packet are a framing error.
pub fn decode_body(body: Bytes) -> FramingResult<Packet> {
    let mut buf = body.clone();
    let tag = get_u8(&mut buf, "descriptor tag")?;
    let identifier = get_str(&mut buf, "type identifier")?;

    let canonical = match tag {
        TAG_FAT => identifier.as_str(),
        TAG_THIN => obfuscation::canonical_for(&identifier),
        other => {
            return Err(FramingError::malformed(
                "descriptor tag",
                format!("unknown tag {other}"),
            ))
        }
    };

    let packet = match decode_fields(canonical, &mut buf)? {
        Some(packet) => packet,
        // Unknown identifier: keep the whole body so it can be logged or
        // re-encoded verbatim.
        None => return Ok(Packet::Unrecognized { raw: body }),
    };

    if buf.has_remaining() {
        return Err(FramingError::TrailingBytes {
            remaining: buf.remaining(),
        });
    }
    Ok(packet)
}

fn encode_fields(buf: &mut BytesMut, packet: &Packet) -> FramingResult<()> {
    match packet {
        Packet::LoginRequest {
            username,
            password,
            shared_secret,
        } => {
            put_str(buf, username)?;
            put_str(buf, password)?;
            put_str(buf, shared_secret)?;
        }
        Packet::LoginResponse {
            username,
            account_session,
            session_token,
            user_id,
            auth_flags,
        } => {
            put_str(buf, username)?;
            put_str(buf, account_session)?;
            put_str(buf, session_token)?;
            buf.put_i32(*user_id);
            put_list_len(buf, auth_flags.len())?;
            for flag in auth_flags {
                buf.put_i32(*flag);
            }
        }
        Packet::RevisionInfoRequest {
            hardware_id,
            agent_flags,
        } => {
            put_str(buf, hardware_id)?;
            put_str(buf, agent_flags)?;
        }
        Packet::RevisionInfoResponse {
            revision_data,
            checksum,
        } => {
            put_str(buf, revision_data)?;
            buf.put_i32(*checksum);
        }
        Packet::ScriptSessionRequest { session_key } => put_str(buf, session_key)?,
        Packet::ScriptSessionResponse {
            status,
            script_session,
        } => {
            buf.put_i32(*status);
            put_str(buf, script_session)?;
        }
        Packet::FreeScriptListRequest => {}
        Packet::PaidScriptListRequest { account_session } => put_str(buf, account_session)?,
        Packet::ScriptListResponse { scripts } => {
            put_list_len(buf, scripts.len())?;
            for script in scripts {
                encode_metadata(buf, script)?;
            }
        }
        Packet::EncryptedScriptRequest {
            script_id,
            account_session,
            script_session,
        } => {
            buf.put_i32(*script_id);
            put_str(buf, account_session)?;
            put_str(buf, script_session)?;
        }
        Packet::EncryptedScriptResponse {
            url,
            sanitized_name,
            checksum,
            key_base64,
            flag,
        } => {
            put_str(buf, url)?;
            put_str(buf, sanitized_name)?;
            put_str(buf, checksum)?;
            put_str(buf, key_base64)?;
            buf.put_i32(*flag);
        }
        Packet::ScriptOptionsRequest {
            account_session,
            script_session,
        } => {
            put_str(buf, account_session)?;
            put_str(buf, script_session)?;
        }
        Packet::ScriptOptionsResponse { csv_options } => put_str(buf, csv_options)?,
        Packet::ScriptStartRequest
        | Packet::GetActiveInstancesRequest
        | Packet::GetTotalInstancesRequest
        | Packet::AuthenticationCodeRequest
        | Packet::PurchasedScriptIdsRequest => {}
        Packet::ScriptStartResponse { started } => buf.put_u8(*started as u8),
        Packet::InstanceCountResponse { count } => buf.put_i32(*count),
        Packet::AuthenticationCodeResponse { code } => buf.put_i32(*code),
        Packet::PurchasedScriptIdsResponse { user_id } => buf.put_i32(*user_id),
        Packet::Wrapped {
            timestamp_ms,
            inner,
        } => {
            buf.put_i64(*timestamp_ms);
            let inner_body = encode_body(inner)?;
            buf.put_slice(&inner_body);
        }
        Packet::Unrecognized { .. } => unreachable!("handled in encode_body"),
    }
    Ok(())
}

/// Returns `Ok(None)` for an unknown canonical identifier.
fn decode_fields(canonical: &str, buf: &mut Bytes) -> FramingResult<Option<Packet>> {
    let packet = match canonical {
        "scriptcast.LoginRequest" => Packet::LoginRequest {
            username: get_str(buf, "username")?,
            password: get_str(buf, "password")?,
            shared_secret: get_str(buf, "shared secret")?,
        },
        "scriptcast.LoginResponse" => {
            let username = get_str(buf, "username")?;
            let account_session = get_str(buf, "account session")?;
            let session_token = get_str(buf, "session token")?;
            let user_id = get_i32(buf, "user id")?;
            let count = get_list_len(buf, "auth flags")?;
            let mut auth_flags = Vec::with_capacity(count);
            for _ in 0..count {
                auth_flags.push(get_i32(buf, "auth flag")?);
            }
            Packet::LoginResponse {
                username,
                account_session,
                session_token,
                user_id,
                auth_flags,
            }
        }
        "scriptcast.RevisionInfoRequest" => Packet::RevisionInfoRequest {
            hardware_id: get_str(buf, "hardware id")?,
            agent_flags: get_str(buf, "agent flags")?,
        },
        "scriptcast.RevisionInfoResponse" => Packet::RevisionInfoResponse {
            revision_data: get_str(buf, "revision data")?,
            checksum: get_i32(buf, "checksum")?,
        },
        "scriptcast.ScriptSessionRequest" => Packet::ScriptSessionRequest {
            session_key: get_str(buf, "session key")?,
        },
        "scriptcast.ScriptSessionResponse" => Packet::ScriptSessionResponse {
            status: get_i32(buf, "status")?,
            script_session: get_str(buf, "script session")?,
        },
        "scriptcast.FreeScriptListRequest" => Packet::FreeScriptListRequest,
        "scriptcast.PaidScriptListRequest" => Packet::PaidScriptListRequest {
            account_session: get_str(buf, "account session")?,
        },
        "scriptcast.ScriptListResponse" => {
            let count = get_list_len(buf, "script list")?;
            let mut scripts = Vec::with_capacity(count);
            for _ in 0..count {
                scripts.push(decode_metadata(buf)?);
            }
            Packet::ScriptListResponse { scripts }
        }
        "scriptcast.EncryptedScriptRequest" => Packet::EncryptedScriptRequest {
            script_id: get_i32(buf, "script id")?,
            account_session: get_str(buf, "account session")?,
            script_session: get_str(buf, "script session")?,
        },
        "scriptcast.EncryptedScriptResponse" => Packet::EncryptedScriptResponse {
            url: get_str(buf, "url")?,
            sanitized_name: get_str(buf, "sanitized name")?,
            checksum: get_str(buf, "checksum")?,
            key_base64: get_str(buf, "key")?,
            flag: get_i32(buf, "flag")?,
        },
        "scriptcast.ScriptOptionsRequest" => Packet::ScriptOptionsRequest {
            account_session: get_str(buf, "account session")?,
            script_session: get_str(buf, "script session")?,
        },
        "scriptcast.ScriptOptionsResponse" => Packet::ScriptOptionsResponse {
            csv_options: get_str(buf, "csv options")?,
        },
        "scriptcast.ScriptStartRequest" => Packet::ScriptStartRequest,
        "scriptcast.ScriptStartResponse" => Packet::ScriptStartResponse {
            started: get_u8(buf, "started")? != 0,
        },
        "scriptcast.GetActiveInstancesRequest" => Packet::GetActiveInstancesRequest,
        "scriptcast.GetTotalInstancesRequest" => Packet::GetTotalInstancesRequest,
        "scriptcast.InstanceCountResponse" => Packet::InstanceCountResponse {
            count: get_i32(buf, "count")?,
        },
        "scriptcast.AuthenticationCodeRequest" => Packet::AuthenticationCodeRequest,
        "scriptcast.AuthenticationCodeResponse" => Packet::AuthenticationCodeResponse {
            code: get_i32(buf, "code")?,
        },
        "scriptcast.PurchasedScriptIdsRequest" => Packet::PurchasedScriptIdsRequest,
        "scriptcast.PurchasedScriptIdsResponse" => Packet::PurchasedScriptIdsResponse {
            user_id: get_i32(buf, "user id")?,
        },
        "scriptcast.Wrapped" => {
            let timestamp_ms = get_i64(buf, "timestamp")?;
            let inner_body = buf.copy_to_bytes(buf.remaining());
            let inner = decode_body(inner_body)?;
            Packet::Wrapped {
                timestamp_ms,
                inner: Box::new(inner),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(packet))
}

fn encode_metadata(buf: &mut BytesMut, meta: &ScriptMetadata) -> FramingResult<()> {
    buf.put_i32(meta.script_id);
    buf.put_i32(meta.store_id);
    put_str(buf, &meta.name)?;
    put_str(buf, &meta.description)?;
    buf.put_f64(meta.version);
    put_str(buf, &meta.author)?;
    put_str(buf, &meta.image_url)?;
    put_str(buf, &meta.thread_url)?;
    Ok(())
}

fn decode_metadata(buf: &mut Bytes) -> FramingResult<ScriptMetadata> {
    Ok(ScriptMetadata {
        script_id: get_i32(buf, "script id")?,
        store_id: get_i32(buf, "store id")?,
        name: get_str(buf, "name")?,
        description: get_str(buf, "description")?,
        version: get_f64(buf, "version")?,
        author: get_str(buf, "author")?,
        image_url: get_str(buf, "image url")?,
        thread_url: get_str(buf, "thread url")?,
    })
}

fn put_str(buf: &mut BytesMut, s: &str) -> FramingResult<()> {
    let len = s.len();
    if len > u16::MAX as usize {
        return Err(FramingError::malformed(
            "string",
            format!("length {len} exceeds u16"),
        ));
    }
    buf.put_u16(len as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_list_len(buf: &mut BytesMut, len: usize) -> FramingResult<()> {
    if len > u16::MAX as usize {
        return Err(FramingError::malformed(
            "list",
            format!("length {len} exceeds u16"),
        ));
    }
    buf.put_u16(len as u16);
    Ok(())
}

fn need(buf: &Bytes, what: &'static str, need: usize) -> FramingResult<()> {
    if buf.remaining() < need {
        return Err(FramingError::Truncated {
            what,
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes, what: &'static str) -> FramingResult<u8> {
    need(buf, what, 1)?;
    Ok(buf.get_u8())
}

fn get_i32(buf: &mut Bytes, what: &'static str) -> FramingResult<i32> {
    need(buf, what, 4)?;
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut Bytes, what: &'static str) -> FramingResult<i64> {
    need(buf, what, 8)?;
    Ok(buf.get_i64())
}

fn get_f64(buf: &mut Bytes, what: &'static str) -> FramingResult<f64> {
    need(buf, what, 8)?;
    Ok(buf.get_f64())
}

fn get_list_len(buf: &mut Bytes, what: &'static str) -> FramingResult<usize> {
    need(buf, what, 2)?;
    Ok(buf.get_u16() as usize)
}

fn get_str(buf: &mut Bytes, what: &'static str) -> FramingResult<String> {
    let len = get_list_len(buf, what)?;
    need(buf, what, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| FramingError::InvalidUtf8(what))
}
