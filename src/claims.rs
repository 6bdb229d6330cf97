use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;

use crate::constants::Group;
use crate::errors::{PolicyViolation, Result};
use crate::events::ChainEvent;
use crate::merkle::MerkleTree;
use crate::models::{ClaimEntry, ClaimTransition};
use crate::store::Store;
use crate::utils::encode_hash;

/// A claim entry together with whether it can be claimed right now.
#[derive(Serialize, Debug, Clone)]
pub struct ClaimStatus {
  pub entry: ClaimEntry,
  pub published: bool,
  pub claimable: bool,
}

/// Unclaimed entries for every leaf of a freshly built tree.
pub fn seed_entries(epoch_id: u64, group: Group, tree: &MerkleTree) -> Vec<ClaimEntry> {
  tree.leaves().iter().enumerate()
    .map(|(i, leaf)| ClaimEntry {
      epoch_id,
      group,
      account: leaf.account.clone(),
      amount: leaf.amount,
      leaf_hash: encode_hash(&leaf.hash),
      proof: tree.proof(i).iter().map(encode_hash).collect(),
      claimed: false,
      claim_ref: None,
      claimed_at: None,
    })
    .collect()
}

/// Marks `entries` claimed where the distributor already reported a claim,
/// so claims ingested before their entries existed are not lost. Returns
/// the number of entries marked.
pub fn apply_recorded_claims(store: &dyn Store, epoch_id: u64, group: Group, entries: &mut [ClaimEntry]) -> Result<usize> {
  let mut applied = 0;
  for fact in store.facts_named("Claimed")? {
    let (claimed_epoch, claimed_group, account, amount) = match ChainEvent::from_fact(&fact)? {
      ChainEvent::Claimed { epoch_id, group, account, amount } => (epoch_id, group, account, amount),
      _ => continue,
    };
    if claimed_epoch != epoch_id || claimed_group != group.index() {
      continue
    }
    match entries.iter_mut().find(|e| e.account == account) {
      Some(entry) if !entry.claimed => {
        if entry.amount != amount {
          warn!("Claim by {} in {}/{} paid {}, entry holds {}.", account, epoch_id, group, amount, entry.amount);
        }
        entry.claimed = true;
        entry.claim_ref = Some(fact.tx_ref.clone());
        entry.claimed_at = Some(chrono::Utc::now().naive_utc());
        applied += 1;
      },
      Some(_) => (),
      None => warn!("Claim by {} in {}/{} ({}) matches no entry.", account, epoch_id, group, fact.tx_ref),
    }
  }
  Ok(applied)
}

pub struct ClaimLedger {
  store: Arc<dyn Store>,
}

impl ClaimLedger {
  pub fn new(store: Arc<dyn Store>) -> Self {
    Self { store }
  }

  /// Unclaimed, and the commitment holding it is published.
  pub fn is_claimable(&self, epoch_id: u64, group: Group, account: &str) -> Result<bool> {
    Ok(self.status(epoch_id, group, account)?.map(|s| s.claimable).unwrap_or(false))
  }

  pub fn status(&self, epoch_id: u64, group: Group, account: &str) -> Result<Option<ClaimStatus>> {
    let entry = match self.store.claim_entry(epoch_id, group, account)? {
      Some(entry) => entry,
      None => return Ok(None),
    };
    let published = self.store.commitment(epoch_id, group)?.map(|c| c.published).unwrap_or(false);
    let claimable = published && !entry.claimed;
    Ok(Some(ClaimStatus { entry, published, claimable }))
  }

  /// Flips an entry to claimed. Succeeds once per key and only after the
  /// root is published; later calls are rejected without touching the entry.
  pub fn mark_claimed(
    &self,
    epoch_id: u64,
    group: Group,
    account: &str,
    claim_ref: &str,
    claimed_at: NaiveDateTime,
  ) -> Result<()> {
    // published never reverts, so the check cannot go stale
    let published = self.store.commitment(epoch_id, group)?.map(|c| c.published).unwrap_or(false);
    if !published {
      return match self.store.claim_entry(epoch_id, group, account)? {
        Some(_) => Err(PolicyViolation::NotClaimable { epoch_id, group, account: account.to_owned() }.into()),
        None => Err(PolicyViolation::ClaimNotFound { epoch_id, group, account: account.to_owned() }.into()),
      }
    }
    match self.store.mark_claimed(epoch_id, group, account, claim_ref, claimed_at)? {
      ClaimTransition::Claimed => {
        info!("Claim recorded for {} in {}/{} ({}).", account, epoch_id, group, claim_ref);
        Ok(())
      },
      ClaimTransition::AlreadyClaimed => {
        Err(PolicyViolation::AlreadyClaimed { epoch_id, group, account: account.to_owned() }.into())
      },
      ClaimTransition::NotFound => {
        Err(PolicyViolation::ClaimNotFound { epoch_id, group, account: account.to_owned() }.into())
      },
    }
  }
}
