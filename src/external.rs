//! Seams to the capabilities this core consumes but does not implement:
//! signature verification, content-addressed storage and the event
//! transport. The in-process implementations here back the single-process
//! harness and tests; production wires real ones in.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::error::{FlotillaError, Result};
use crate::model::{JobEvent, StorageKind, StorageSpec};

/// Verifies that a client's submission was signed by the holder of the
/// given public key. Cryptographic mechanics are out of scope here.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool;
}

/// Accepts every signature. For tests and trusted single-process setups.
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _public_key: &[u8], _payload: &[u8], _signature: &[u8]) -> bool {
        true
    }
}

/// Rejects every signature. For exercising the submission failure path.
pub struct DenyAllVerifier;

impl SignatureVerifier for DenyAllVerifier {
    fn verify(&self, _public_key: &[u8], _payload: &[u8], _signature: &[u8]) -> bool {
        false
    }
}

/// Content-addressed object store (IPFS-like). Publishing pins winning
/// results through it; the execution planner lists volume contents through
/// it to expand sharding globs.
pub trait StorageBackend: Send + Sync {
    /// Pin a blob and return the storage spec it is now addressable by.
    fn pin(&self, data: &[u8]) -> Result<StorageSpec>;

    /// Retrieve a previously pinned blob.
    fn fetch(&self, spec: &StorageSpec) -> Result<Vec<u8>>;

    /// Enumerate the item paths inside a volume. Unknown volumes are empty.
    fn list(&self, volume: &StorageSpec) -> Result<Vec<String>>;
}

/// In-memory storage backend for the single-process harness.
#[derive(Default)]
pub struct InMemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    volumes: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a named volume with item paths, as a real backend would
    /// enumerate them.
    pub fn add_volume(&self, name: &str, items: Vec<String>) {
        self.volumes
            .lock()
            .expect("storage lock poisoned")
            .insert(name.to_string(), items);
    }
}

impl StorageBackend for InMemoryStorage {
    fn pin(&self, data: &[u8]) -> Result<StorageSpec> {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        let cid = format!("mem{:016x}", hasher.finish());
        self.objects
            .lock()
            .expect("storage lock poisoned")
            .insert(cid.clone(), data.to_vec());
        Ok(StorageSpec {
            kind: StorageKind::Ipfs,
            name: "results".to_string(),
            cid,
            ..Default::default()
        })
    }

    fn fetch(&self, spec: &StorageSpec) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .expect("storage lock poisoned")
            .get(&spec.cid)
            .cloned()
            .ok_or_else(|| FlotillaError::Storage(format!("no object pinned at {}", spec.cid)))
    }

    fn list(&self, volume: &StorageSpec) -> Result<Vec<String>> {
        Ok(self
            .volumes
            .lock()
            .expect("storage lock poisoned")
            .get(&volume.name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Broadcasts events to the rest of the network. Could be gossip, RPC, or a
/// direct call in a single-process harness.
pub trait Transport: Send + Sync {
    fn broadcast(&self, event: &JobEvent) -> Result<()>;
}

/// Transport for a single-process network: events already live on the local
/// log, so broadcasting is a no-op.
pub struct LoopbackTransport;

impl Transport for LoopbackTransport {
    fn broadcast(&self, _event: &JobEvent) -> Result<()> {
        Ok(())
    }
}
