//! # Key-Piece Store
//!
//! Durable, generation-indexed store of the key pieces this node holds on
//! behalf of cluster members.
//!
//! ```text
//! generation ──► { owner UUID ──► KeyPiece }
//! ```
//!
//! ## Consistency
//!
//! - One lock guards the whole map. Every mutation holds it for the full
//!   mutate-then-persist sequence, and reads take the same lock, so a reader
//!   sees the state before or after any single call, never in between.
//! - After each mutation the full store is serialized to `pieces-new` and
//!   renamed over `pieces`. The rename is the atomicity boundary: a crash
//!   before it leaves the previous file intact.
//! - A failed persist is logged and returned as [`Error::Persist`]. The
//!   in-memory mutation is kept, so memory can be briefly ahead of disk.
//! - A generation with no pieces left is removed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bincode::Options;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::Error;
use crate::keys::KeyPiece;

/// Canonical file name of the persisted store inside the metadata directory.
pub const PIECES_FILENAME: &str = "pieces";

/// Upper bound on the persisted store size accepted at load time (64 MiB).
const MAX_STORE_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Pieces of one generation, keyed by owning node.
pub type KeyPieceMap = HashMap<Uuid, KeyPiece>;

/// Full contents of the store, keyed by generation.
pub type Generations = BTreeMap<i64, KeyPieceMap>;

fn store_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STORE_FILE_SIZE)
        .with_fixint_encoding()
}

/// Write `bytes` to `target` via a sibling `<name>-new` file and a rename.
pub(crate) async fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push("-new");
    let tmp_path = target.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, target).await
}

pub struct KeyPieceStore {
    path: PathBuf,
    generations: Mutex<Generations>,
}

impl KeyPieceStore {
    /// Open the store persisted under `meta_dir`, starting empty if no file
    /// exists yet.
    pub async fn open(meta_dir: &Path) -> anyhow::Result<Self> {
        let path = meta_dir.join(PIECES_FILENAME);
        let generations = match tokio::fs::read(&path).await {
            Ok(bytes) => store_options()
                .deserialize::<Generations>(&bytes)
                .with_context(|| format!("corrupt key-piece store at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Generations::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let pieces: usize = generations.values().map(|m| m.len()).sum();
        info!(
            generations = generations.len(),
            pieces,
            path = %path.display(),
            "loaded key-piece store"
        );

        Ok(Self {
            path,
            generations: Mutex::new(generations),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The piece held for `uuid` at `generation`, if any.
    pub async fn get_piece(&self, generation: i64, uuid: &Uuid) -> Option<KeyPiece> {
        let generations = self.generations.lock().await;
        generations.get(&generation)?.get(uuid).cloned()
    }

    /// Store `piece` for `uuid` at `generation`, replacing any earlier piece
    /// for the same pair.
    pub async fn add_piece(&self, generation: i64, uuid: Uuid, piece: KeyPiece) -> Result<(), Error> {
        let mut generations = self.generations.lock().await;
        generations.entry(generation).or_default().insert(uuid, piece);
        debug!(generation, owner = %uuid, "stored key piece");
        self.persist(&generations).await
    }

    pub async fn delete_piece(&self, generation: i64, uuid: &Uuid) -> Result<(), Error> {
        let mut generations = self.generations.lock().await;
        let Some(pieces) = generations.get_mut(&generation) else {
            return Ok(());
        };
        pieces.remove(uuid);
        if pieces.is_empty() {
            generations.remove(&generation);
        }
        debug!(generation, owner = %uuid, "deleted key piece");
        self.persist(&generations).await
    }

    pub async fn delete_generation(&self, generation: i64) -> Result<(), Error> {
        let mut generations = self.generations.lock().await;
        generations.remove(&generation);
        debug!(generation, "deleted key-piece generation");
        self.persist(&generations).await
    }

    /// Generations currently holding at least one piece, ascending.
    pub async fn generations(&self) -> Vec<i64> {
        self.generations.lock().await.keys().copied().collect()
    }

    /// Total number of pieces across all generations.
    pub async fn len(&self) -> usize {
        self.generations.lock().await.values().map(|m| m.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Point-in-time copy of the whole store.
    pub async fn snapshot(&self) -> Generations {
        self.generations.lock().await.clone()
    }

    /// Called with the lock held so persisted states are totally ordered.
    async fn persist(&self, generations: &Generations) -> Result<(), Error> {
        let bytes = store_options().serialize(generations).map_err(|e| {
            error!(error = %e, "failed to encode key-piece store");
            Error::persist(format!("failed to encode key-piece store: {}", e))
        })?;

        write_atomic(&self.path, &bytes).await.map_err(|e| {
            error!(
                error = %e,
                path = %self.path.display(),
                "failed to save key-piece store"
            );
            Error::persist(format!(
                "failed to save key-piece store to {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}
