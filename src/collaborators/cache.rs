//! # Synthesis Cache
//!
//! Repeated utterances (the greeting, the apology) would otherwise hit the
//! synthesis service on every call. The cache keys container audio by a
//! content hash of the utterance text: concurrent readers, compute-once /
//! write-once per key. A key's bytes never change after first insert.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Content-hash-keyed cache of synthesized container audio.
pub struct SynthesisCache {
    entries: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl SynthesisCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, text: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.read().unwrap().get(&Self::key(text)).cloned()
    }

    /// Store synthesized audio for an utterance.
    ///
    /// Write-once: if another task stored the same key first, the existing
    /// bytes win and are returned, so every reader of a key sees one value.
    pub fn store(&self, text: &str, audio: Vec<u8>) -> Arc<Vec<u8>> {
        let key = Self::key(text);
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key).or_insert_with(|| {
            debug!("Caching {} synthesized bytes", audio.len());
            Arc::new(audio)
        });
        entry.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for SynthesisCache {
    fn default() -> Self {
        Self::new()
    }
}
