/// Gzip-compressed JSON dump of the whole directory
///
/// The encoded bytes are kept until the next write. Builds are tagged with
/// the generation they started at; a build that overlaps a write is handed
/// to its caller but never installed.
use crate::error::{BdrsError, BdrsResult};
use flate2::{write::GzEncoder, Compression};
use std::{
    collections::BTreeMap,
    io::Write,
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct SnapshotState {
    generation: u64,
    encoded: Option<Arc<Vec<u8>>>,
}

/// Lazily rebuilt directory dump
#[derive(Default)]
pub struct DirectorySnapshot {
    state: Mutex<SnapshotState>,
}

impl DirectorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SnapshotState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Encoded dump if one is current
    pub fn current(&self) -> Option<Arc<Vec<u8>>> {
        self.with_state(|state| state.encoded.clone())
    }

    /// Generation to tag a new build with
    pub fn generation(&self) -> u64 {
        self.with_state(|state| state.generation)
    }

    /// Keep a finished build unless a write happened since it started
    pub fn install(&self, generation: u64, encoded: Arc<Vec<u8>>) -> bool {
        self.with_state(|state| {
            if state.generation != generation {
                return false;
            }
            state.encoded = Some(encoded);
            true
        })
    }

    pub fn invalidate(&self) {
        self.with_state(|state| {
            state.generation = state.generation.wrapping_add(1);
            state.encoded = None;
        })
    }
}

/// Encode the BPN to DID map as gzip-compressed JSON
pub fn encode_directory(entries: &BTreeMap<String, String>) -> BdrsResult<Vec<u8>> {
    let json = serde_json::to_vec(entries)
        .map_err(|e| BdrsError::Internal(format!("Failed to serialize directory: {}", e)))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}
