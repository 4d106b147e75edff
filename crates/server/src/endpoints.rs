//! Distribution endpoint registry.
//!
//! Every script in the current generation gets a random, unguessable URL
//! token; the HTTP ingress resolves tokens back to script ids. Tokens are
//! regenerated whenever the store publishes a new generation, so URLs handed
//! out before a reload go dead with it.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use parking_lot::RwLock;
use scriptcast_protocol::{checksum_hex, ArtifactCipher};
use tracing::debug;

use crate::cache::SharedLru;
use crate::error::StoreError;
use crate::store::ScriptStore;

/// Encrypted artifacts kept resident at once.
pub const ENCRYPTED_CACHE_CAPACITY: usize = 10;

const CHECKSUM_CACHE_CAPACITY: usize = 64;
const TOKEN_BYTES: usize = 16;

#[derive(Debug, Default)]
struct TokenTable {
    seq: u64,
    by_token: HashMap<String, i32>,
    by_id: HashMap<i32, String>,
}

/// Token table plus caches of encryption-derived data. Follows the store's
/// generation lazily: the first lookup after a reload rebuilds the table.
#[derive(Debug)]
pub struct EndpointRegistry {
    store: Arc<ScriptStore>,
    cipher: ArtifactCipher,
    table: RwLock<TokenTable>,
    encrypted_cache: SharedLru<(u64, i32), Bytes>,
    checksum_cache: SharedLru<(u64, i32), String>,
}

impl EndpointRegistry {
    pub fn new(store: Arc<ScriptStore>, cipher: ArtifactCipher) -> Self {
        let registry = Self {
            store,
            cipher,
            table: RwLock::new(TokenTable::default()),
            encrypted_cache: SharedLru::new(ENCRYPTED_CACHE_CAPACITY),
            checksum_cache: SharedLru::new(CHECKSUM_CACHE_CAPACITY),
        };
        registry.rebuild();
        registry
    }

    pub fn cipher(&self) -> &ArtifactCipher {
        &self.cipher
    }

    /// Maps a URL token to a script id, or `None` for stale and unknown
    /// tokens.
    pub fn resolve(&self, token: &str) -> Option<i32> {
        self.ensure_current();
        self.table.read().by_token.get(token).copied()
    }

    /// The current URL token for a script.
    pub fn token_for(&self, script_id: i32) -> Result<String, StoreError> {
        self.ensure_current();
        self.table
            .read()
            .by_id
            .get(&script_id)
            .cloned()
            .ok_or(StoreError::ArtifactNotFound(script_id))
    }

    /// Encrypted artifact bytes, computed lazily and kept in a small LRU.
    pub fn encrypted_bytes(&self, script_id: i32) -> Result<Bytes, StoreError> {
        let seq = self.store.generation_seq();
        self.encrypted_cache.get_or_try_insert_with((seq, script_id), || {
            let plaintext = self.store.bytes(script_id)?;
            Ok(Bytes::from(self.cipher.encrypt(&plaintext)))
        })
    }

    /// Hex checksum over the *encrypted* bytes; the client verifies its
    /// download against this before decrypting.
    pub fn checksum(&self, script_id: i32) -> Result<String, StoreError> {
        let seq = self.store.generation_seq();
        self.checksum_cache.get_or_try_insert_with((seq, script_id), || {
            let encrypted = self.encrypted_bytes(script_id)?;
            Ok(checksum_hex(&encrypted))
        })
    }

    fn ensure_current(&self) {
        if self.table.read().seq == self.store.generation_seq() {
            return;
        }
        self.rebuild();
    }

    /// Regenerates every token from fresh randomness.
    fn rebuild(&self) {
        let seq = self.store.generation_seq();
        let ids = self.store.script_ids();

        let mut by_token = HashMap::with_capacity(ids.len());
        let mut by_id = HashMap::with_capacity(ids.len());
        for id in ids {
            let token = fresh_token();
            by_token.insert(token.clone(), id);
            by_id.insert(id, token);
        }

        let mut table = self.table.write();
        // Never clobber a table a racing rebuild built for a newer generation.
        if table.seq <= seq {
            debug!(seq, endpoints = by_id.len(), "rebuilt endpoint tokens");
            *table = TokenTable { seq, by_token, by_id };
        }
    }
}

fn fresh_token() -> String {
    let raw: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(raw)
}
