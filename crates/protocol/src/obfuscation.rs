//! Static bidirectional mapping from canonical type identifiers to the short
//! opaque tokens used by the legacy body encoding.
//!
//! Types absent from the map are encoded with a fat descriptor (the full
//! identifier) and must keep round-tripping that way: the fallback is what
//! keeps unmapped types interoperable with deployed peers.

/// Canonical identifier → wire token. The newer-generation handshake packets
/// never travelled the legacy object encoding, so they are deliberately
/// unmapped and take the fat-descriptor path.
const MAP: &[(&str, &str)] = &[
    ("scriptcast.ScriptSessionRequest", "sc.ba"),
    ("scriptcast.ScriptSessionResponse", "sc.a9"),
    ("scriptcast.FreeScriptListRequest", "sc.b1"),
    ("scriptcast.PaidScriptListRequest", "sc.aR"),
    ("scriptcast.ScriptListResponse", "sc.a3"),
    ("scriptcast.EncryptedScriptRequest", "sc.B5"),
    ("scriptcast.EncryptedScriptResponse", "sc.aJ"),
    ("scriptcast.ScriptOptionsRequest", "sc.a1"),
    ("scriptcast.ScriptOptionsResponse", "sc.bd"),
    ("scriptcast.ScriptStartRequest", "sc.aj"),
    ("scriptcast.ScriptStartResponse", "sc.Ad"),
    ("scriptcast.GetActiveInstancesRequest", "sc.bC"),
    ("scriptcast.GetTotalInstancesRequest", "sc.aZ"),
    ("scriptcast.InstanceCountResponse", "sc.ah"),
    ("scriptcast.AuthenticationCodeRequest", "sc.bG"),
    ("scriptcast.AuthenticationCodeResponse", "sc.bR"),
    ("scriptcast.PurchasedScriptIdsRequest", "sc.a7"),
    ("scriptcast.PurchasedScriptIdsResponse", "sc.b0"),
];

/// Returns the wire token for a canonical identifier, or `None` when the type
/// is unmapped and must be encoded fat.
pub fn token_for(canonical: &str) -> Option<&'static str> {
    MAP.iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, token)| *token)
}

/// Resolves a wire token back to its canonical identifier. Unknown tokens are
/// returned unchanged: an unmapped type encodes its real identifier in the
/// thin slot, and that identifier is already canonical.
pub fn canonical_for(token: &str) -> &str {
    MAP.iter()
        .find(|(_, t)| *t == token)
        .map(|(name, _)| *name)
        .unwrap_or(token)
}
