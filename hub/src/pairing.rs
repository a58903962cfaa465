//! Pair-code issuance and lookup.
//!
//! A pair code is a short human-transferable token that authorizes one phone
//! to attach to one desktop. Codes are 8 symbols from a 32-symbol alphabet
//! that excludes the visually ambiguous `0 O 1 I`, displayed with a dash
//! after the 4th symbol (`ABCD-EFGH`). Confirmation is case- and
//! separator-insensitive: input is stripped of non-alphanumerics and
//! uppercased before lookup.
//!
//! A device holds at most one pending code — requesting a new one replaces
//! any prior code from the same device. Codes expire after five minutes; the
//! reaper deletes expired entries, and a confirm attempt against an expired
//! code deletes it eagerly.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;

use crate::registry::Role;

/// Code alphabet: digits and uppercase letters minus `0 O 1 I`.
const CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Normalized code length. The 4-symbol compact form used by the embedded
/// variant is not compiled in; codes of any other length never match.
pub const CODE_LEN: usize = 8;

/// Pending codes live this long.
pub const CODE_TTL_MS: u64 = 5 * 60 * 1000;

/// A pair code waiting for its counterpart device.
#[derive(Debug, Clone)]
pub struct PendingPair {
    /// Normalized form (no separator, uppercase).
    pub code: String,
    pub device_id: String,
    pub device_name: String,
    pub role: Role,
    pub expires_at: u64,
}

/// Outcome of taking a code for confirmation.
pub enum CodeLookup {
    /// Code matched a live pending pair; the entry has been removed.
    Found(PendingPair),
    /// Code matched but had expired; the entry has been removed.
    Expired,
    /// No such code.
    NotFound,
}

/// Store of pending pair codes, keyed by normalized code.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct PairingStore {
    inner: Arc<RwLock<HashMap<String, PendingPair>>>,
}

/// Strip separators and uppercase, so `abcd-efgh`, `ABCDEFGH` and `abcdefgh`
/// all resolve to the same entry.
#[must_use]
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Human-readable form with a dash after the 4th symbol.
#[must_use]
pub fn display_code(code: &str) -> String {
    if code.len() == CODE_LEN {
        format!("{}-{}", &code[..4], &code[4..])
    } else {
        code.to_string()
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

impl PairingStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Issue a fresh code for a device, replacing any code it already holds.
    /// Never reuses a code that collides with a live entry.
    pub async fn issue(
        &self,
        device_id: &str,
        device_name: &str,
        role: Role,
        now_ms: u64,
    ) -> PendingPair {
        let mut pending = self.inner.write().await;
        pending.retain(|_, p| p.device_id != device_id);

        let code = loop {
            let candidate = generate_code();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let pair = PendingPair {
            code: code.clone(),
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            role,
            expires_at: now_ms + CODE_TTL_MS,
        };
        pending.insert(code, pair.clone());
        pair
    }

    /// Look up a raw (unnormalized) code for confirmation.
    ///
    /// A live entry is removed and returned; an expired entry is removed and
    /// reported as [`CodeLookup::Expired`]. Same-role checks are the caller's
    /// job — on a role clash the caller re-inserts via [`PairingStore::put_back`]
    /// so the correct peer can still use the code.
    pub async fn take(&self, raw_code: &str, now_ms: u64) -> CodeLookup {
        let code = normalize_code(raw_code);
        let mut pending = self.inner.write().await;
        match pending.remove(&code) {
            Some(p) if now_ms > p.expires_at => CodeLookup::Expired,
            Some(p) => CodeLookup::Found(p),
            None => CodeLookup::NotFound,
        }
    }

    /// Re-insert a pending pair taken by [`PairingStore::take`] whose confirm
    /// was rejected without consuming the code.
    pub async fn put_back(&self, pair: PendingPair) {
        self.inner.write().await.insert(pair.code.clone(), pair);
    }

    /// Delete entries past their expiry. Returns how many were removed.
    pub async fn remove_expired(&self, now_ms: u64) -> usize {
        let mut pending = self.inner.write().await;
        let before = pending.len();
        pending.retain(|_, p| now_ms <= p.expires_at);
        before - pending.len()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for PairingStore {
    fn default() -> Self {
        Self::new()
    }
}
