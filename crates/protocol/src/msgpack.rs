//! MessagePack body encoding used by the newer wire generation.
//!
//! Layout: `packetId` (positive fixint), signed 32-bit `counter`, a binary
//! header, then the type-specific payload. A `packetId` of
//! [`ids::WRAPPED`](crate::packets::ids::WRAPPED) means the payload is a
//! msgpack timestamp extension followed by one inner packet recursively
//! encoded in the same scheme; the outer id and counter belong to the
//! envelope, not the inner packet.

use bytes::Bytes;

use crate::error::{FramingError, FramingResult};
use crate::packets::{ids, Packet, ScriptMetadata};

/// Encodes one packet with its sequence counter.
pub fn encode_body(packet: &Packet, counter: i32) -> FramingResult<Bytes> {
    // Unrecognized bodies are carried verbatim, header included.
    if let Packet::Unrecognized { raw } = packet {
        return Ok(raw.clone());
    }

    let mut out = Vec::new();
    write_uint(&mut out, packet.id() as u64)?;
    write_int(&mut out, counter)?;

    let payload = encode_payload(packet, counter)?;
    rmp::encode::write_bin(&mut out, &payload).map_err(write_err)?;
    Ok(Bytes::from(out))
}

/// Decodes one body, returning the packet and the envelope counter. The body
/// must be consumed exactly.
pub fn decode_body(body: Bytes) -> FramingResult<(Packet, i32)> {
    let mut rd: &[u8] = body.as_ref();

    let id: u8 = rmp::decode::read_int(&mut rd).map_err(|e| read_err("packet id", e))?;
    let counter: i32 = rmp::decode::read_int(&mut rd).map_err(|e| read_err("counter", e))?;

    let len = rmp::decode::read_bin_len(&mut rd).map_err(|e| read_err("payload header", e))?
        as usize;
    if rd.len() < len {
        return Err(FramingError::Truncated {
            what: "payload",
            need: len,
            have: rd.len(),
        });
    }
    let (payload, rest) = rd.split_at(len);
    if !rest.is_empty() {
        return Err(FramingError::TrailingBytes {
            remaining: rest.len(),
        });
    }

    let packet = match decode_payload(id, payload)? {
        Some(packet) => packet,
        None => {
            return Ok((Packet::Unrecognized { raw: body }, counter));
        }
    };
    Ok((packet, counter))
}

fn encode_payload(packet: &Packet, counter: i32) -> FramingResult<Vec<u8>> {
    let mut out = Vec::new();
    match packet {
        Packet::Wrapped {
            timestamp_ms,
            inner,
        } => {
            write_timestamp(&mut out, *timestamp_ms)?;
            let inner_body = encode_body(inner, counter)?;
            out.extend_from_slice(&inner_body);
        }
        Packet::LoginRequest {
            username,
            password,
            shared_secret,
        } => {
            write_str(&mut out, username)?;
            write_str(&mut out, password)?;
            write_str(&mut out, shared_secret)?;
        }
        Packet::LoginResponse {
            username,
            account_session,
            session_token,
            user_id,
            auth_flags,
        } => {
            write_str(&mut out, username)?;
            write_str(&mut out, account_session)?;
            write_str(&mut out, session_token)?;
            write_int(&mut out, *user_id)?;
            rmp::encode::write_array_len(&mut out, auth_flags.len() as u32)
                .map_err(write_err)?;
            for flag in auth_flags {
                write_int(&mut out, *flag)?;
            }
        }
        Packet::RevisionInfoRequest {
            hardware_id,
            agent_flags,
        } => {
            write_str(&mut out, hardware_id)?;
            write_str(&mut out, agent_flags)?;
        }
        Packet::RevisionInfoResponse {
            revision_data,
            checksum,
        } => {
            write_str(&mut out, revision_data)?;
            write_int(&mut out, *checksum)?;
        }
        Packet::ScriptSessionRequest { session_key } => write_str(&mut out, session_key)?,
        Packet::ScriptSessionResponse {
            status,
            script_session,
        } => {
            write_int(&mut out, *status)?;
            write_str(&mut out, script_session)?;
        }
        Packet::FreeScriptListRequest => {}
        Packet::PaidScriptListRequest { account_session } => {
            write_str(&mut out, account_session)?
        }
        Packet::ScriptListResponse { scripts } => {
            rmp::encode::write_array_len(&mut out, scripts.len() as u32).map_err(write_err)?;
            for script in scripts {
                encode_metadata(&mut out, script)?;
            }
        }
        Packet::EncryptedScriptRequest {
            script_id,
            account_session,
            script_session,
        } => {
            write_int(&mut out, *script_id)?;
            write_str(&mut out, account_session)?;
            write_str(&mut out, script_session)?;
        }
        Packet::EncryptedScriptResponse {
            url,
            sanitized_name,
            checksum,
            key_base64,
            flag,
        } => {
            write_str(&mut out, url)?;
            write_str(&mut out, sanitized_name)?;
            write_str(&mut out, checksum)?;
            write_str(&mut out, key_base64)?;
            write_int(&mut out, *flag)?;
        }
        Packet::ScriptOptionsRequest {
            account_session,
            script_session,
        } => {
            write_str(&mut out, account_session)?;
            write_str(&mut out, script_session)?;
        }
        Packet::ScriptOptionsResponse { csv_options } => write_str(&mut out, csv_options)?,
        Packet::ScriptStartRequest
        | Packet::GetActiveInstancesRequest
        | Packet::GetTotalInstancesRequest
        | Packet::AuthenticationCodeRequest
        | Packet::PurchasedScriptIdsRequest => {}
        Packet::ScriptStartResponse { started } => {
            rmp::encode::write_bool(&mut out, *started).map_err(|e| {
                FramingError::malformed("msgpack payload", e)
            })?;
        }
        Packet::InstanceCountResponse { count } => write_int(&mut out, *count)?,
        Packet::AuthenticationCodeResponse { code } => write_int(&mut out, *code)?,
        Packet::PurchasedScriptIdsResponse { user_id } => write_int(&mut out, *user_id)?,
        Packet::Unrecognized { .. } => unreachable!("handled in encode_body"),
    }
    Ok(out)
}

/// Returns `Ok(None)` for an unknown packet id.
fn decode_payload(id: u8, payload: &[u8]) -> FramingResult<Option<Packet>> {
    let mut rd = payload;
    let packet = match id {
        ids::WRAPPED => {
            let timestamp_ms = read_timestamp(&mut rd)?;
            let inner_body = Bytes::copy_from_slice(rd);
            rd = &[];
            let (inner, _inner_counter) = decode_body(inner_body)?;
            Packet::Wrapped {
                timestamp_ms,
                inner: Box::new(inner),
            }
        }
        ids::LOGIN_REQUEST => Packet::LoginRequest {
            username: read_str(&mut rd, "username")?,
            password: read_str(&mut rd, "password")?,
            shared_secret: read_str(&mut rd, "shared secret")?,
        },
        ids::LOGIN_RESPONSE => {
            let username = read_str(&mut rd, "username")?;
            let account_session = read_str(&mut rd, "account session")?;
            let session_token = read_str(&mut rd, "session token")?;
            let user_id = read_int(&mut rd, "user id")?;
            let count =
                rmp::decode::read_array_len(&mut rd).map_err(|e| read_err("auth flags", e))?;
            let mut auth_flags = Vec::with_capacity(count as usize);
            for _ in 0..count {
                auth_flags.push(read_int(&mut rd, "auth flag")?);
            }
            Packet::LoginResponse {
                username,
                account_session,
                session_token,
                user_id,
                auth_flags,
            }
        }
        ids::REVISION_INFO_REQUEST => Packet::RevisionInfoRequest {
            hardware_id: read_str(&mut rd, "hardware id")?,
            agent_flags: read_str(&mut rd, "agent flags")?,
        },
        ids::REVISION_INFO_RESPONSE => Packet::RevisionInfoResponse {
            revision_data: read_str(&mut rd, "revision data")?,
            checksum: read_int(&mut rd, "checksum")?,
        },
        ids::SCRIPT_SESSION_REQUEST => Packet::ScriptSessionRequest {
            session_key: read_str(&mut rd, "session key")?,
        },
        ids::SCRIPT_SESSION_RESPONSE => Packet::ScriptSessionResponse {
            status: read_int(&mut rd, "status")?,
            script_session: read_str(&mut rd, "script session")?,
        },
        ids::FREE_SCRIPT_LIST_REQUEST => Packet::FreeScriptListRequest,
        ids::PAID_SCRIPT_LIST_REQUEST => Packet::PaidScriptListRequest {
            account_session: read_str(&mut rd, "account session")?,
        },
        ids::SCRIPT_LIST_RESPONSE => {
            let count =
                rmp::decode::read_array_len(&mut rd).map_err(|e| read_err("script list", e))?;
            let mut scripts = Vec::with_capacity(count as usize);
            for _ in 0..count {
                scripts.push(decode_metadata(&mut rd)?);
            }
            Packet::ScriptListResponse { scripts }
        }
        ids::ENCRYPTED_SCRIPT_REQUEST => Packet::EncryptedScriptRequest {
            script_id: read_int(&mut rd, "script id")?,
            account_session: read_str(&mut rd, "account session")?,
            script_session: read_str(&mut rd, "script session")?,
        },
        ids::ENCRYPTED_SCRIPT_RESPONSE => Packet::EncryptedScriptResponse {
            url: read_str(&mut rd, "url")?,
            sanitized_name: read_str(&mut rd, "sanitized name")?,
            checksum: read_str(&mut rd, "checksum")?,
            key_base64: read_str(&mut rd, "key")?,
            flag: read_int(&mut rd, "flag")?,
        },
        ids::SCRIPT_OPTIONS_REQUEST => Packet::ScriptOptionsRequest {
            account_session: read_str(&mut rd, "account session")?,
            script_session: read_str(&mut rd, "script session")?,
        },
        ids::SCRIPT_OPTIONS_RESPONSE => Packet::ScriptOptionsResponse {
            csv_options: read_str(&mut rd, "csv options")?,
        },
        ids::SCRIPT_START_REQUEST => Packet::ScriptStartRequest,
        ids::SCRIPT_START_RESPONSE => Packet::ScriptStartResponse {
            started: rmp::decode::read_bool(&mut rd).map_err(|e| read_err("started", e))?,
        },
        ids::GET_ACTIVE_INSTANCES_REQUEST => Packet::GetActiveInstancesRequest,
        ids::GET_TOTAL_INSTANCES_REQUEST => Packet::GetTotalInstancesRequest,
        ids::INSTANCE_COUNT_RESPONSE => Packet::InstanceCountResponse {
            count: read_int(&mut rd, "count")?,
        },
        ids::AUTHENTICATION_CODE_REQUEST => Packet::AuthenticationCodeRequest,
        ids::AUTHENTICATION_CODE_RESPONSE => Packet::AuthenticationCodeResponse {
            code: read_int(&mut rd, "code")?,
        },
        ids::PURCHASED_SCRIPT_IDS_REQUEST => Packet::PurchasedScriptIdsRequest,
        ids::PURCHASED_SCRIPT_IDS_RESPONSE => Packet::PurchasedScriptIdsResponse {
            user_id: read_int(&mut rd, "user id")?,
        },
        _ => return Ok(None),
    };

    if !rd.is_empty() {
        return Err(FramingError::TrailingBytes {
            remaining: rd.len(),
        });
    }
    Ok(Some(packet))
}

fn encode_metadata(out: &mut Vec<u8>, meta: &ScriptMetadata) -> FramingResult<()> {
    write_int(out, meta.script_id)?;
    write_int(out, meta.store_id)?;
    write_str(out, &meta.name)?;
    write_str(out, &meta.description)?;
    rmp::encode::write_f64(out, meta.version)
        .map_err(|e| FramingError::malformed("msgpack payload", e))?;
    write_str(out, &meta.author)?;
    write_str(out, &meta.image_url)?;
    write_str(out, &meta.thread_url)?;
    Ok(())
}

fn decode_metadata(rd: &mut &[u8]) -> FramingResult<ScriptMetadata> {
    Ok(ScriptMetadata {
        script_id: read_int(rd, "script id")?,
        store_id: read_int(rd, "store id")?,
        name: read_str(rd, "name")?,
        description: read_str(rd, "description")?,
        version: rmp::decode::read_f64(rd).map_err(|e| read_err("version", e))?,
        author: read_str(rd, "author")?,
        image_url: read_str(rd, "image url")?,
        thread_url: read_str(rd, "thread url")?,
    })
}

/// Millisecond timestamp as a msgpack `-1` extension. Encoded as timestamp64
/// (30-bit nanoseconds over 34-bit seconds); timestamp32 and timestamp96 are
/// accepted on decode.
fn write_timestamp(out: &mut Vec<u8>, timestamp_ms: i64) -> FramingResult<()> {
    let secs = timestamp_ms.div_euclid(1000) as u64;
    let nanos = (timestamp_ms.rem_euclid(1000) as u64) * 1_000_000;
    let data = (nanos << 34) | (secs & 0x3_FFFF_FFFF);

    rmp::encode::write_ext_meta(out, 8, -1)
        .map_err(|e| FramingError::malformed("timestamp", e))?;
    out.extend_from_slice(&data.to_be_bytes());
    Ok(())
}

fn read_timestamp(rd: &mut &[u8]) -> FramingResult<i64> {
    let meta = rmp::decode::read_ext_meta(rd).map_err(|e| read_err("timestamp", e))?;
    if meta.typeid != -1 {
        return Err(FramingError::malformed(
            "timestamp",
            format!("unexpected ext type {}", meta.typeid),
        ));
    }
    let size = meta.size as usize;
    if rd.len() < size {
        return Err(FramingError::Truncated {
            what: "timestamp",
            need: size,
            have: rd.len(),
        });
    }
    let (data, rest) = rd.split_at(size);
    *rd = rest;

    match size {
        4 => {
            let secs = u32::from_be_bytes(data.try_into().unwrap()) as i64;
            Ok(secs * 1000)
        }
        8 => {
            let raw = u64::from_be_bytes(data.try_into().unwrap());
            let nanos = (raw >> 34) as i64;
            let secs = (raw & 0x3_FFFF_FFFF) as i64;
            Ok(secs * 1000 + nanos / 1_000_000)
        }
        12 => {
            let nanos = u32::from_be_bytes(data[0..4].try_into().unwrap()) as i64;
            let secs = i64::from_be_bytes(data[4..12].try_into().unwrap());
            Ok(secs * 1000 + nanos / 1_000_000)
        }
        other => Err(FramingError::malformed(
            "timestamp",
            format!("unsupported ext length {other}"),
        )),
    }
}

fn write_uint(out: &mut Vec<u8>, value: u64) -> FramingResult<()> {
    rmp::encode::write_uint(out, value)
        .map(|_| ())
        .map_err(|e| FramingError::malformed("msgpack payload", e))
}

fn write_int(out: &mut Vec<u8>, value: i32) -> FramingResult<()> {
    rmp::encode::write_sint(out, value as i64)
        .map(|_| ())
        .map_err(|e| FramingError::malformed("msgpack payload", e))
}

fn write_str(out: &mut Vec<u8>, s: &str) -> FramingResult<()> {
    rmp::encode::write_str(out, s).map_err(|e| FramingError::malformed("msgpack payload", e))
}

fn write_err(e: impl ToString) -> FramingError {
    FramingError::malformed("msgpack payload", e)
}

fn read_err(what: &'static str, e: impl ToString) -> FramingError {
    FramingError::malformed(what, e)
}

fn read_int(rd: &mut &[u8], what: &'static str) -> FramingResult<i32> {
    rmp::decode::read_int(rd).map_err(|e| read_err(what, e))
}

fn read_str(rd: &mut &[u8], what: &'static str) -> FramingResult<String> {
    let len = rmp::decode::read_str_len(rd).map_err(|e| read_err(what, e))? as usize;
    if rd.len() < len {
        return Err(FramingError::Truncated {
            what,
            need: len,
            have: rd.len(),
        });
    }
    let (bytes, rest) = rd.split_at(len);
    let s = std::str::from_utf8(bytes)
        .map_err(|_| FramingError::InvalidUtf8(what))?
        .to_owned();
    *rd = rest;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_packet_round_trips_with_counter() {
        let packet = Packet::LoginRequest {
            username: "alice".into(),
            password: "hunter2".into(),
            shared_secret: "sekrit".into(),
        };

        let body = encode_body(&packet, 7).unwrap();
        let (decoded, counter) = decode_body(body).unwrap();

        assert_eq!(decoded, packet);
        assert_eq!(counter, 7);
    }

    #[test]
    fn wrapped_packet_round_trips() {
        let packet = Packet::Wrapped {
            timestamp_ms: 1_724_460_000_123,
            inner: Box::new(Packet::ScriptSessionResponse {
                status: 0,
                script_session: "token".into(),
            }),
        };

        let body = encode_body(&packet, 3).unwrap();
        let (decoded, counter) = decode_body(body).unwrap();

        assert_eq!(decoded, packet);
        assert_eq!(counter, 3);
    }

    #[test]
    fn timestamp_survives_millisecond_precision() {
        let mut out = Vec::new();
        write_timestamp(&mut out, 1_724_460_000_999).unwrap();
        let mut rd: &[u8] = &out;
        assert_eq!(read_timestamp(&mut rd).unwrap(), 1_724_460_000_999);
        assert!(rd.is_empty());
    }

    #[test]
    fn unknown_id_becomes_unrecognized() {
        let mut out = Vec::new();
        write_uint(&mut out, 99).unwrap();
        write_int(&mut out, 0).unwrap();
        rmp::encode::write_bin(&mut out, &[0xDE, 0xAD]).unwrap();
        let body = Bytes::from(out);

        let (decoded, _) = decode_body(body.clone()).unwrap();
        assert_eq!(decoded, Packet::Unrecognized { raw: body.clone() });

        // Re-encoding is byte-faithful.
        assert_eq!(encode_body(&decoded, 0).unwrap(), body);
    }

    #[test]
    fn truncated_payload_fails_closed() {
        let packet = Packet::ScriptOptionsResponse {
            csv_options: "speed=42,mode=7".into(),
        };
        let body = encode_body(&packet, 1).unwrap();
        let truncated = body.slice(0..body.len() - 2);

        assert!(decode_body(truncated).is_err());
    }

    #[test]
    fn trailing_bytes_fail_closed() {
        let packet = Packet::ScriptStartRequest;
        let mut raw = encode_body(&packet, 0).unwrap().to_vec();
        raw.push(0xFF);

        assert!(matches!(
            decode_body(Bytes::from(raw)),
            Err(FramingError::TrailingBytes { .. })
        ));
    }

    #[test]
    fn negative_counter_round_trips() {
        let body = encode_body(&Packet::FreeScriptListRequest, -1).unwrap();
        let (_, counter) = decode_body(body).unwrap();
        assert_eq!(counter, -1);
    }
}
