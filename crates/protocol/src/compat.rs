//! Compatibility arithmetic shared by both sides of the protocol.
//!
//! The deployed client computes these values with JVM semantics, so the
//! string hash here must match `java.lang.String::hashCode` exactly,
//! including overflow behavior.

/// Multiplier folded into the revision-info response checksum. The value has
/// no cryptographic meaning; the real client checks it verbatim.
pub const REVISION_CONSTANT: i32 = -1640531527;

/// `java.lang.String::hashCode`: `h = 31 * h + c` over UTF-16 code units,
/// with wrapping 32-bit arithmetic.
pub fn java_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

/// Revision-info response checksum: a fingerprint over the request's agent
/// flags and the authenticated user id.
pub fn revision_checksum(agent_flags: &str, user_id: i32) -> i32 {
    java_string_hash(agent_flags) ^ user_id.wrapping_mul(REVISION_CONSTANT)
}

/// Obfuscates (or, being XOR, de-obfuscates) one numeric option value for
/// transmission alongside a selected script.
pub fn obfuscate_option_value(value: i32, script_session: &str, user_id: i32) -> i32 {
    value ^ java_string_hash(script_session) ^ user_id
}

/// Strips a script name down to `[A-Za-z0-9_]`, mapping spaces to
/// underscores, for use in URLs and file names.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_hash_matches_jvm_reference() {
        // Values computed with java.lang.String::hashCode.
        assert_eq!(java_string_hash(""), 0);
        assert_eq!(java_string_hash("a"), 97);
        assert_eq!(java_string_hash("abc"), 96354);
        assert_eq!(java_string_hash("hello world"), 1794106052);
    }

    #[test]
    fn option_obfuscation_is_self_inverse() {
        let value = 123_456;
        let masked = obfuscate_option_value(value, "session-token", 42);
        assert_ne!(masked, value);
        assert_eq!(obfuscate_option_value(masked, "session-token", 42), value);
    }

    #[test]
    fn revision_checksum_depends_on_both_inputs() {
        let a = revision_checksum("flags", 1);
        assert_ne!(a, revision_checksum("flags", 2));
        assert_ne!(a, revision_checksum("other", 1));
    }

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(sanitize_name("Ore Miner v2!"), "Ore_Miner_v2");
        assert_eq!(sanitize_name("a/b\\c"), "abc");
        assert_eq!(sanitize_name("already_clean"), "already_clean");
    }
}
