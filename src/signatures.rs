//! Thinking-signature cache.
//!
//! Reasoning signatures are opaque bytes minted by a specific model family;
//! the upstream validates them on the next turn. When a conversation crosses
//! model families the foreign signatures must be dropped or replaced before
//! dispatch. This table remembers which family produced each signature so the
//! projection can make that call.
//!
//! Keys are salted with the derived session id so a signature cached for one
//! conversation cannot resurrect into another.

use crate::types::ModelFamily;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

type Key = [u8; 32];

struct Entry {
    family: ModelFamily,
    inserted_at: chrono::DateTime<chrono::Utc>,
    tick: u64,
}

struct CacheState {
    entries: HashMap<Key, Entry>,
    tick: u64,
}

pub struct SignatureCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    fn key(session_id: &str, signature: &str) -> Key {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(signature.as_bytes());
        hasher.finalize().into()
    }

    /// Insert or refresh a signature binding. Last writer wins.
    pub fn remember(&self, session_id: &str, signature: &str, family: ModelFamily) {
        if signature.is_empty() {
            return;
        }
        let key = Self::key(session_id, signature);
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(
            key,
            Entry {
                family,
                inserted_at: chrono::Utc::now(),
                tick,
            },
        );

        if state.entries.len() > self.capacity {
            // Evict the least recently touched entry.
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.tick)
                .map(|(k, _)| *k)
            {
                state.entries.remove(&oldest);
            }
        }
    }

    pub fn lookup(&self, session_id: &str, signature: &str) -> Option<ModelFamily> {
        let key = Self::key(session_id, signature);
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(&key)?;
        entry.tick = tick;
        Some(entry.family)
    }

    /// True when any of the given signatures is cached for `family` in this
    /// conversation. Used to detect cross-model history before dispatch.
    pub fn has_family<'a, I>(&self, session_id: &str, signatures: I, family: ModelFamily) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        signatures
            .into_iter()
            .any(|sig| self.lookup(session_id, sig) == Some(family))
    }

    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(s) => s.entries.len(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(crate::constants::SIGNATURE_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_and_lookup() {
        let cache = SignatureCache::new(16);
        cache.remember("sess", "sig-a", ModelFamily::Gemini);
        assert_eq!(cache.lookup("sess", "sig-a"), Some(ModelFamily::Gemini));
        assert_eq!(cache.lookup("sess", "sig-b"), None);
    }

    #[test]
    fn sessions_are_isolated() {
        let cache = SignatureCache::new(16);
        cache.remember("sess-1", "sig", ModelFamily::Claude);
        assert_eq!(cache.lookup("sess-2", "sig"), None);
    }

    #[test]
    fn last_writer_wins() {
        let cache = SignatureCache::new(16);
        cache.remember("sess", "sig", ModelFamily::Claude);
        cache.remember("sess", "sig", ModelFamily::Gemini);
        assert_eq!(cache.lookup("sess", "sig"), Some(ModelFamily::Gemini));
    }

    #[test]
    fn eviction_drops_least_recently_used() {
        let cache = SignatureCache::new(2);
        cache.remember("sess", "a", ModelFamily::Gemini);
        cache.remember("sess", "b", ModelFamily::Gemini);
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.lookup("sess", "a").is_some());
        cache.remember("sess", "c", ModelFamily::Claude);

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("sess", "a").is_some());
        assert!(cache.lookup("sess", "b").is_none());
        assert!(cache.lookup("sess", "c").is_some());
    }

    #[test]
    fn has_family_scans_conversation_signatures() {
        let cache = SignatureCache::new(16);
        cache.remember("sess", "g1", ModelFamily::Gemini);
        cache.remember("sess", "c1", ModelFamily::Claude);

        let sigs = ["g1", "c1"];
        assert!(cache.has_family("sess", sigs.iter().copied(), ModelFamily::Gemini));
        assert!(cache.has_family("sess", sigs.iter().copied(), ModelFamily::Claude));
        assert!(!cache.has_family("sess", ["zzz"].iter().copied(), ModelFamily::Gemini));
    }
}
