//! Checkpoint store and state verification.
//!
//! The verifier owns every checkpoint sealed during a run. A checkpoint
//! binds a snapshot to a SHA-256 state hash, a Merkle root over the
//! snapshot's leaves, and an optional predecessor hash forming a chain.
//! Verification answers one question: is this state still trustworthy?
//! It returns a typed verdict and never panics or throws on bad input.
//!
//! Checkpoints live in a concurrent map with per-key locking, so a
//! create on one key never blocks reads of another and a writer always
//! reads its own writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::hash::{hash_value, snapshot_leaves};
use crate::merkle::{MerkleProof, MerkleTree};

/// Identifier for a checkpoint. The scheduler names checkpoints after
/// the task that sealed them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl From<&str> for CheckpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CheckpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sealed state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    /// The sealed snapshot.
    pub snapshot: Value,
    /// SHA-256 over the canonical encoding of the snapshot.
    pub state_hash: String,
    /// Merkle root over the snapshot's ordered leaves.
    pub merkle_root: String,
    /// State hash of the predecessor checkpoint, when chained.
    pub predecessor_hash: Option<String>,
    /// Time-to-live; past this age the checkpoint is expired.
    pub ttl: Duration,
    /// Seal order, linearized by the verifier's atomic counter.
    pub seq: u64,
}

impl Checkpoint {
    /// Whether the checkpoint's age exceeds its TTL.
    pub fn is_expired(&self) -> bool {
        self.age() >= self.ttl
    }

    /// Age of the checkpoint.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Result of verifying a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointVerdict {
    Valid,
    Expired,
    HashMismatch,
    NotFound,
}

impl std::fmt::Display for CheckpointVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointVerdict::Valid => write!(f, "VALID"),
            CheckpointVerdict::Expired => write!(f, "EXPIRED"),
            CheckpointVerdict::HashMismatch => write!(f, "HASH_MISMATCH"),
            CheckpointVerdict::NotFound => write!(f, "NOT_FOUND"),
        }
    }
}

/// Record of a detected corruption, kept for the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionEvent {
    pub timestamp: DateTime<Utc>,
    pub checkpoint_id: CheckpointId,
    pub expected_hash: String,
    pub actual_hash: String,
}

/// Aggregate corruption report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionReport {
    pub total_events: usize,
    pub events: Vec<CorruptionEvent>,
    pub checkpoints_monitored: usize,
}

/// In-memory checkpoint store with TTL enforcement and hash chaining.
///
/// The store is a sharded concurrent map: operations on different
/// checkpoint ids take independent locks and never serialize against
/// each other.
pub struct StateVerifier {
    checkpoints: DashMap<CheckpointId, Checkpoint>,
    corruption_events: RwLock<Vec<CorruptionEvent>>,
    max_checkpoints: usize,
    seq: AtomicU64,
}

impl StateVerifier {
    pub fn new(max_checkpoints: usize) -> Self {
        Self {
            checkpoints: DashMap::new(),
            corruption_events: RwLock::new(Vec::new()),
            max_checkpoints: max_checkpoints.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Seal a snapshot into a checkpoint.
    ///
    /// The predecessor, when given, is resolved to its state hash so the
    /// chain survives eviction of the predecessor record itself.
    pub fn create_checkpoint(
        &self,
        id: CheckpointId,
        snapshot: Value,
        ttl: Duration,
        predecessor: Option<&CheckpointId>,
    ) -> Result<Checkpoint> {
        let predecessor_hash = predecessor
            .and_then(|pred_id| self.checkpoints.get(pred_id))
            .map(|entry| entry.state_hash.clone());

        let state_hash = hash_value(&snapshot);
        let merkle_root = MerkleTree::new(snapshot_leaves(&snapshot))?
            .root()
            .to_string();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        let checkpoint = Checkpoint {
            id: id.clone(),
            created_at: Utc::now(),
            snapshot,
            state_hash,
            merkle_root,
            predecessor_hash,
            ttl,
            seq,
        };

        info!(
            checkpoint_id = %id,
            merkle_root = %&checkpoint.merkle_root[..16],
            seq,
            "sealed checkpoint"
        );

        self.checkpoints.insert(id, checkpoint.clone());
        self.evict_beyond_capacity();
        Ok(checkpoint)
    }

    /// Re-seal an existing checkpoint from its stored snapshot with a
    /// fresh timestamp and sequence number.
    ///
    /// This is the forced-refresh path: when a predecessor has expired,
    /// the scheduler must re-seal the current state before any further
    /// checkpoint-dependent operation.
    pub fn reseal(&self, id: &CheckpointId, ttl: Duration) -> Result<Checkpoint> {
        let (snapshot, predecessor_hash) = self
            .checkpoints
            .get(id)
            .map(|entry| (entry.snapshot.clone(), entry.predecessor_hash.clone()))
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))?;

        let state_hash = hash_value(&snapshot);
        let merkle_root = MerkleTree::new(snapshot_leaves(&snapshot))?
            .root()
            .to_string();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        let checkpoint = Checkpoint {
            id: id.clone(),
            created_at: Utc::now(),
            snapshot,
            state_hash,
            merkle_root,
            predecessor_hash,
            ttl,
            seq,
        };

        info!(checkpoint_id = %id, seq, "re-sealed expired checkpoint");
        self.checkpoints.insert(id.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    /// Verify a checkpoint against the current snapshot.
    ///
    /// VALID requires the checkpoint to exist, to be younger than its
    /// TTL, and the canonical hash of `current_snapshot` to equal the
    /// stored state hash. Never returns an error.
    pub fn verify_checkpoint(&self, id: &CheckpointId, current_snapshot: &Value) -> CheckpointVerdict {
        let stored = match self.checkpoints.get(id).map(|entry| entry.clone()) {
            Some(c) => c,
            None => {
                warn!(checkpoint_id = %id, "checkpoint not found");
                return CheckpointVerdict::NotFound;
            }
        };

        if stored.is_expired() {
            warn!(checkpoint_id = %id, age = ?stored.age(), "checkpoint expired");
            return CheckpointVerdict::Expired;
        }

        let actual = hash_value(current_snapshot);
        if actual != stored.state_hash {
            self.log_corruption(id, &stored.state_hash, &actual);
            return CheckpointVerdict::HashMismatch;
        }

        CheckpointVerdict::Valid
    }

    /// Verify a checkpoint against its own stored snapshot.
    pub fn verify_stored(&self, id: &CheckpointId) -> CheckpointVerdict {
        let snapshot = match self.checkpoints.get(id).map(|entry| entry.snapshot.clone()) {
            Some(s) => s,
            None => return CheckpointVerdict::NotFound,
        };
        self.verify_checkpoint(id, &snapshot)
    }

    /// Validate one snapshot leaf against the stored Merkle root.
    ///
    /// For object snapshots the leaf value is the single-entry object
    /// `{key: value}`; for array snapshots it is the element itself.
    pub fn verify_leaf(
        &self,
        id: &CheckpointId,
        leaf_index: usize,
        leaf_value: &Value,
        proof: &MerkleProof,
    ) -> bool {
        let Some((root, leaf_count)) = self
            .checkpoints
            .get(id)
            .map(|entry| (entry.merkle_root.clone(), snapshot_leaves(&entry.snapshot).len()))
        else {
            return false;
        };
        if leaf_index >= leaf_count {
            return false;
        }
        MerkleTree::verify_proof(&hash_value(leaf_value), proof, &root)
    }

    /// Build an inclusion proof for a stored checkpoint's leaf.
    pub fn proof(&self, id: &CheckpointId, leaf_index: usize) -> Result<MerkleProof> {
        let snapshot = self
            .checkpoints
            .get(id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))?;
        MerkleTree::new(snapshot_leaves(&snapshot))?.proof(leaf_index)
    }

    /// Find a checkpoint by its state hash. Used to walk the
    /// predecessor chain backward during rollback.
    pub fn find_by_state_hash(&self, state_hash: &str) -> Option<Checkpoint> {
        self.checkpoints
            .iter()
            .find(|entry| entry.state_hash == state_hash)
            .map(|entry| entry.clone())
    }

    /// Fetch a checkpoint by id.
    pub fn get(&self, id: &CheckpointId) -> Option<Checkpoint> {
        self.checkpoints.get(id).map(|entry| entry.clone())
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Remove expired checkpoints. Idempotent; returns how many were
    /// removed this pass.
    pub fn gc_expired(&self) -> usize {
        let before = self.checkpoints.len();
        self.checkpoints.retain(|id, c| {
            let keep = !c.is_expired();
            if !keep {
                info!(checkpoint_id = %id, "removed expired checkpoint");
            }
            keep
        });
        before.saturating_sub(self.checkpoints.len())
    }

    /// Report of all corruption events seen so far.
    pub fn corruption_report(&self) -> CorruptionReport {
        let events = self.corruption_events.read().expect("verifier poisoned");
        CorruptionReport {
            total_events: events.len(),
            events: events.clone(),
            checkpoints_monitored: self.len(),
        }
    }

    fn log_corruption(&self, id: &CheckpointId, expected: &str, actual: &str) {
        error!(
            checkpoint_id = %id,
            expected_hash = %expected,
            actual_hash = %actual,
            "state corruption detected"
        );
        let mut events = self.corruption_events.write().expect("verifier poisoned");
        events.push(CorruptionEvent {
            timestamp: Utc::now(),
            checkpoint_id: id.clone(),
            expected_hash: expected.to_string(),
            actual_hash: actual.to_string(),
        });
    }

    fn evict_beyond_capacity(&self) {
        while self.checkpoints.len() > self.max_checkpoints {
            // The guard from min_by_key is released before the removal.
            let oldest = self
                .checkpoints
                .iter()
                .min_by_key(|entry| entry.seq)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    info!(checkpoint_id = %id, "evicted checkpoint beyond capacity");
                    self.checkpoints.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl Default for StateVerifier {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_CHECKPOINTS)
    }
}
