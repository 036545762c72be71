//! Local packet store seam.
//!
//! The persistent store is an external collaborator: blobs keyed by 32-byte
//! hash, segregated by record kind. The core only needs the four calls of
//! [`PacketStore`]. `put` derives the key from the record's own bytes (the
//! marker byte says which field holds it), so a record fetched from the
//! network can be cached verbatim.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::packet::{EmailEncryptedPacket, IndexPacket, RecordType};

/// Entries kept per record kind by the in-memory store.
const MEMORY_STORE_CAPACITY: usize = 4096;

pub trait PacketStore: Send + Sync {
    fn get_index(&self, key: &[u8; 32]) -> Option<Vec<u8>>;
    fn get_email(&self, key: &[u8; 32]) -> Option<Vec<u8>>;
    fn get_contact(&self, key: &[u8; 32]) -> Option<Vec<u8>>;

    /// Store a serialized record; returns false when the bytes are not a
    /// recognizable record.
    fn put(&self, data: &[u8]) -> bool;
}

/// Work out a record's kind and storage key from its serialized form.
pub(crate) fn record_key(data: &[u8]) -> Option<(RecordType, [u8; 32])> {
    match data.first().copied() {
        Some(IndexPacket::MARKER) => {
            let packet = IndexPacket::decode(data).ok()?;
            Some((RecordType::Index, packet.dest_hash))
        }
        Some(EmailEncryptedPacket::MARKER) => {
            let packet = EmailEncryptedPacket::decode(data).ok()?;
            Some((RecordType::Email, packet.key))
        }
        Some(b'C') => {
            // directory entries are opaque; keyed by content hash
            let digest = Sha256::digest(data);
            let mut key = [0u8; 32];
            key.copy_from_slice(&digest);
            Some((RecordType::Contact, key))
        }
        _ => None,
    }
}

/// Bounded in-memory store for tests and ephemeral nodes.
pub struct MemoryStore {
    index: Mutex<LruCache<[u8; 32], Vec<u8>>>,
    email: Mutex<LruCache<[u8; 32], Vec<u8>>>,
    contact: Mutex<LruCache<[u8; 32], Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MEMORY_STORE_CAPACITY).expect("capacity must be non-zero");
        Self {
            index: Mutex::new(LruCache::new(cap)),
            email: Mutex::new(LruCache::new(cap)),
            contact: Mutex::new(LruCache::new(cap)),
        }
    }

    fn shelf(&self, kind: RecordType) -> &Mutex<LruCache<[u8; 32], Vec<u8>>> {
        match kind {
            RecordType::Index => &self.index,
            RecordType::Email => &self.email,
            RecordType::Contact => &self.contact,
        }
    }

    fn get(&self, kind: RecordType, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.shelf(kind)
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketStore for MemoryStore {
    fn get_index(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.get(RecordType::Index, key)
    }

    fn get_email(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.get(RecordType::Email, key)
    }

    fn get_contact(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.get(RecordType::Contact, key)
    }

    fn put(&self, data: &[u8]) -> bool {
        let Some((kind, key)) = record_key(data) else {
            debug!(marker = data.first(), "unrecognized record, not stored");
            return false;
        };
        self.shelf(kind)
            .lock()
            .expect("store lock poisoned")
            .put(key, data.to_vec());
        true
    }
}

/// Filesystem store: `<root>/{index,email,contact}/<hex key>.dat`.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        for kind in ["index", "email", "contact"] {
            std::fs::create_dir_all(root.join(kind))?;
        }
        Ok(Self { root })
    }

    fn path_for(&self, kind: RecordType, key: &[u8; 32]) -> PathBuf {
        let dir = match kind {
            RecordType::Index => "index",
            RecordType::Email => "email",
            RecordType::Contact => "contact",
        };
        self.root.join(dir).join(format!("{}.dat", hex::encode(key)))
    }

    fn read(&self, kind: RecordType, key: &[u8; 32]) -> Option<Vec<u8>> {
        let path = self.path_for(kind, key);
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read stored packet");
                None
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PacketStore for FsStore {
    fn get_index(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.read(RecordType::Index, key)
    }

    fn get_email(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.read(RecordType::Email, key)
    }

    fn get_contact(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.read(RecordType::Contact, key)
    }

    fn put(&self, data: &[u8]) -> bool {
        let Some((kind, key)) = record_key(data) else {
            debug!(marker = data.first(), "unrecognized record, not stored");
            return false;
        };
        let path = self.path_for(kind, &key);
        match std::fs::write(&path, data) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot write packet");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{IndexEntry, PROTOCOL_V4};
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("veilpost-store-{}-{}", std::process::id(), n))
    }

    fn sample_index() -> IndexPacket {
        IndexPacket {
            dest_hash: [7u8; 32],
            entries: vec![IndexEntry {
                key: [1u8; 32],
                delete_hash: [2u8; 32],
                time: 12345,
            }],
        }
    }

    fn sample_email() -> EmailEncryptedPacket {
        let ciphertext = vec![0x33; 64];
        EmailEncryptedPacket {
            key: EmailEncryptedPacket::compute_key(&ciphertext),
            delete_hash: [4u8; 32],
            algorithm: 2,
            stored_time: 0,
            ciphertext,
        }
    }

    #[test]
    fn memory_store_round_trips_by_embedded_key() {
        let store = MemoryStore::new();

        let index = sample_index();
        assert!(store.put(&index.encode()));
        assert_eq!(store.get_index(&index.dest_hash), Some(index.encode()));

        let email = sample_email();
        assert!(store.put(&email.encode()));
        assert_eq!(store.get_email(&email.key), Some(email.encode()));

        // kinds do not bleed into each other
        assert!(store.get_email(&index.dest_hash).is_none());
        assert!(store.get_index(&email.key).is_none());
    }

    #[test]
    fn contact_records_key_by_content_hash() {
        let store = MemoryStore::new();
        let mut record = vec![b'C', PROTOCOL_V4];
        record.extend_from_slice(b"directory entry bytes");
        assert!(store.put(&record));

        let (_, key) = record_key(&record).unwrap();
        assert_eq!(store.get_contact(&key), Some(record));
    }

    #[test]
    fn unknown_marker_is_rejected() {
        let store = MemoryStore::new();
        assert!(!store.put(b"Zjunk"));
        assert!(!store.put(b""));
    }

    #[test]
    fn fs_store_round_trip() {
        let store = FsStore::open(scratch_dir()).unwrap();
        let email = sample_email();
        assert!(store.put(&email.encode()));
        assert_eq!(store.get_email(&email.key), Some(email.encode()));
        assert!(store.get_email(&[0u8; 32]).is_none());
    }
}
