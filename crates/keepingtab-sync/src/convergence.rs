//! Convergence verification.
//!
//! Two stores that applied the same set of events, in any order and with
//! any amount of replay, must hold identical tabs. The state hash makes that
//! checkable without exchanging the tabs themselves.

use std::fmt;

use keepingtab_core::canonical_tab_bytes;
use keepingtab_store::{StoreExt, TabStore};

use crate::error::Result;

/// Blake3 digest of a store's tab set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    /// Hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compute a deterministic hash over every stored tab, tombstones included.
///
/// Algorithm:
/// 1. Enumerate tabs in id order
/// 2. Hash: H = Blake3(prefix || len(tab_0) || tab_0 || len(tab_1) || ...)
///    over the canonical CBOR encoding of each tab
/// 3. Return final H
pub async fn compute_store_state_hash<S: TabStore + ?Sized>(store: &S) -> Result<StateHash> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"keepingtab-state-v0:");

    let mut scan = store.list();
    while let Some(tab) = scan.next().await? {
        let bytes = canonical_tab_bytes(&tab)?;
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }

    Ok(StateHash(*hasher.finalize().as_bytes()))
}

/// Result of comparing two stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// Both stores hold identical tabs.
    Converged(StateHash),
    /// The stores differ.
    Diverged { local: StateHash, remote: StateHash },
}

impl ConvergenceResult {
    /// Check if the stores converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged(_))
    }
}

/// Verify a local store against a known remote state hash.
pub async fn verify_against<S: TabStore + ?Sized>(
    local: &S,
    remote: StateHash,
) -> Result<ConvergenceResult> {
    let local = compute_store_state_hash(local).await?;
    Ok(if local == remote {
        ConvergenceResult::Converged(local)
    } else {
        ConvergenceResult::Diverged { local, remote }
    })
}

/// Verify two stores hold the same tabs.
pub async fn verify_convergence<A, B>(local: &A, remote: &B) -> Result<ConvergenceResult>
where
    A: TabStore + ?Sized,
    B: TabStore + ?Sized,
{
    let remote = compute_store_state_hash(remote).await?;
    verify_against(local, remote).await
}
