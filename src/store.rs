//! Persistence seam for the pipeline.
//!
//! Every write is either an idempotent upsert keyed on a natural key or a
//! guarded once-only transition, so every stage can be re-run safely.

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::constants::Group;
use crate::errors::{Error, PolicyViolation, Result};
use crate::models::*;

/// Everything one `ingest` call persists, committed atomically.
#[derive(Debug, Clone)]
pub struct IngestBatch {
  pub source_id: String,
  pub facts: Vec<RawEventFact>,
  pub epochs: Vec<RevenueEpoch>,
  pub machine_revenues: Vec<MachineRevenue>,
  /// Applied to existing claim entries in the same transaction.
  pub claims: Vec<ClaimRecord>,
  pub checkpoint: SourceCheckpoint,
}

/// What a committed batch changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
  pub new_facts: usize,
  pub claims_applied: usize,
  /// Claims whose entry does not exist yet. Their facts are kept and they
  /// are applied when the entries are seeded.
  pub claims_waiting: usize,
}

pub trait Store: Send + Sync {
  fn checkpoint(&self, source_id: &str) -> Result<Option<SourceCheckpoint>>;
  fn checkpoints(&self) -> Result<Vec<SourceCheckpoint>>;
  /// Upserts facts and derived records, applies claims and advances the
  /// checkpoint in one transaction.
  fn commit_batch(&self, batch: &IngestBatch) -> Result<BatchSummary>;
  /// Facts at or below `block`, ordered by (block, log index).
  fn facts_up_to(&self, block: u64) -> Result<Vec<RawEventFact>>;
  /// Every fact of one event, ordered by (block, log index).
  fn facts_named(&self, event_name: &str) -> Result<Vec<RawEventFact>>;

  fn revenue_epoch(&self, epoch_id: u64) -> Result<Option<RevenueEpoch>>;
  fn revenue_epochs(&self) -> Result<Vec<RevenueEpoch>>;
  fn set_epoch_split(&self, epoch_id: u64, split: &PoolSplit) -> Result<()>;
  fn machine_revenues(&self, epoch_id: u64) -> Result<Vec<MachineRevenue>>;

  fn replace_staking_snapshot(&self, epoch_id: u64, rows: &[StakingSnapshot]) -> Result<()>;
  fn staking_snapshot(&self, epoch_id: u64) -> Result<Vec<StakingSnapshot>>;
  fn replace_ownership_snapshot(&self, epoch_id: u64, rows: &[OwnershipSnapshot]) -> Result<()>;
  fn ownership_snapshot(&self, epoch_id: u64) -> Result<Vec<OwnershipSnapshot>>;
  fn replace_holder_snapshot(&self, epoch_id: u64, rows: &[MachineHolderSnapshot]) -> Result<()>;
  fn holder_snapshot(&self, epoch_id: u64) -> Result<Vec<MachineHolderSnapshot>>;

  fn commitment(&self, epoch_id: u64, group: Group) -> Result<Option<MerkleCommitment>>;
  fn commitments(&self, epoch_id: u64) -> Result<Vec<MerkleCommitment>>;
  /// Oldest epoch first, then group order.
  fn unpublished_commitments(&self) -> Result<Vec<MerkleCommitment>>;
  /// Overwrites an unpublished commitment and its claim entries. Refused
  /// once any of the existing entries has been claimed.
  fn replace_commitment(&self, commitment: &MerkleCommitment, entries: &[ClaimEntry]) -> Result<()>;
  /// Records a submission reference and its time on a still-unpublished
  /// commitment.
  fn set_publish_ref(&self, epoch_id: u64, group: Group, publish_ref: &str) -> Result<()>;
  /// Flips `published` once. Returns false if it was already set.
  fn mark_published(&self, epoch_id: u64, group: Group, publish_ref: &str) -> Result<bool>;

  fn claim_entry(&self, epoch_id: u64, group: Group, account: &str) -> Result<Option<ClaimEntry>>;
  fn claim_entries(&self, epoch_id: u64, group: Group) -> Result<Vec<ClaimEntry>>;
  fn mark_claimed(
    &self,
    epoch_id: u64,
    group: Group,
    account: &str,
    claim_ref: &str,
    claimed_at: NaiveDateTime,
  ) -> Result<ClaimTransition>;
}

/// Checks shared by every store before a batch is applied.
pub(crate) fn check_checkpoint_advance(
  existing: Option<&SourceCheckpoint>,
  next: &SourceCheckpoint,
) -> Result<()> {
  if let Some(existing) = existing {
    if next.last_processed_block < existing.last_processed_block {
      return Err(Error::integrity(&next.source_id, format!(
        "checkpoint would rewind from {} to {}", existing.last_processed_block, next.last_processed_block
      )))
    }
    if next.last_processed_block == existing.last_processed_block
      && next.last_processed_ref != existing.last_processed_ref {
      return Err(Error::integrity(&next.source_id, format!(
        "block {} hash changed from {} to {}",
        existing.last_processed_block, existing.last_processed_ref, next.last_processed_ref
      )))
    }
  }
  Ok(())
}

pub(crate) fn check_epoch_repost(source_id: &str, existing: &RevenueEpoch, posted: &RevenueEpoch) -> Result<()> {
  if existing.total_revenue != posted.total_revenue || existing.tx_ref != posted.tx_ref {
    return Err(Error::integrity(source_id, format!(
      "epoch {} posted twice ({} in {}, {} in {})",
      posted.epoch_id, existing.total_revenue, existing.tx_ref, posted.total_revenue, posted.tx_ref
    )))
  }
  Ok(())
}

pub(crate) fn check_machine_revenue(source_id: &str, existing: &MachineRevenue, posted: &MachineRevenue) -> Result<()> {
  if existing.amount != posted.amount {
    return Err(Error::integrity(source_id, format!(
      "machine {} revenue for epoch {} reported as both {} and {}",
      posted.machine_id, posted.epoch_id, existing.amount, posted.amount
    )))
  }
  Ok(())
}

#[derive(Default)]
struct Inner {
  checkpoints: BTreeMap<String, SourceCheckpoint>,
  facts: BTreeMap<(String, u32), RawEventFact>,
  epochs: BTreeMap<u64, RevenueEpoch>,
  machine_revenues: BTreeMap<(u64, String), MachineRevenue>,
  staking: BTreeMap<u64, Vec<StakingSnapshot>>,
  ownership: BTreeMap<u64, Vec<OwnershipSnapshot>>,
  holders: BTreeMap<u64, Vec<MachineHolderSnapshot>>,
  commitments: BTreeMap<(u64, Group), MerkleCommitment>,
  claims: BTreeMap<(u64, Group, String), ClaimEntry>,
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Store for MemoryStore {
  fn checkpoint(&self, source_id: &str) -> Result<Option<SourceCheckpoint>> {
    Ok(self.inner.lock().checkpoints.get(source_id).cloned())
  }

  fn checkpoints(&self) -> Result<Vec<SourceCheckpoint>> {
    Ok(self.inner.lock().checkpoints.values().cloned().collect())
  }

  fn commit_batch(&self, batch: &IngestBatch) -> Result<BatchSummary> {
    let mut inner = self.inner.lock();

    // validate everything before touching state, including entries earlier
    // in the same batch
    check_checkpoint_advance(inner.checkpoints.get(&batch.source_id), &batch.checkpoint)?;
    let mut epochs: BTreeMap<u64, &RevenueEpoch> = BTreeMap::new();
    for epoch in batch.epochs.iter() {
      match epochs.get(&epoch.epoch_id).copied().or_else(|| inner.epochs.get(&epoch.epoch_id)) {
        Some(existing) => check_epoch_repost(&batch.source_id, existing, epoch)?,
        None => {
          epochs.insert(epoch.epoch_id, epoch);
        },
      }
    }
    let mut revenues: BTreeMap<(u64, &str), &MachineRevenue> = BTreeMap::new();
    for revenue in batch.machine_revenues.iter() {
      let key = (revenue.epoch_id, revenue.machine_id.as_str());
      let existing = revenues.get(&key).copied()
        .or_else(|| inner.machine_revenues.get(&(revenue.epoch_id, revenue.machine_id.clone())));
      match existing {
        Some(existing) => check_machine_revenue(&batch.source_id, existing, revenue)?,
        None => {
          revenues.insert(key, revenue);
        },
      }
    }

    let mut inserted = 0;
    for fact in batch.facts.iter() {
      let key = (fact.tx_ref.clone(), fact.log_index);
      if !inner.facts.contains_key(&key) {
        inner.facts.insert(key, fact.clone());
        inserted += 1;
      }
    }
    for epoch in batch.epochs.iter() {
      inner.epochs.entry(epoch.epoch_id).or_insert_with(|| epoch.clone());
    }
    for revenue in batch.machine_revenues.iter() {
      inner.machine_revenues
        .entry((revenue.epoch_id, revenue.machine_id.clone()))
        .or_insert_with(|| revenue.clone());
    }
    let mut summary = BatchSummary { new_facts: inserted, ..BatchSummary::default() };
    for claim in batch.claims.iter() {
      match inner.claims.get_mut(&(claim.epoch_id, claim.group, claim.account.clone())) {
        None => summary.claims_waiting += 1,
        Some(entry) if entry.claimed => (),
        Some(entry) => {
          entry.claimed = true;
          entry.claim_ref = Some(claim.claim_ref.clone());
          entry.claimed_at = Some(claim.claimed_at);
          summary.claims_applied += 1;
        },
      }
    }
    inner.checkpoints.insert(batch.source_id.clone(), batch.checkpoint.clone());
    Ok(summary)
  }

  fn facts_up_to(&self, block: u64) -> Result<Vec<RawEventFact>> {
    let inner = self.inner.lock();
    let mut facts: Vec<RawEventFact> = inner.facts.values()
      .filter(|f| f.block_number <= block)
      .cloned()
      .collect();
    facts.sort_by_key(|f| (f.block_number, f.log_index));
    Ok(facts)
  }

  fn facts_named(&self, event_name: &str) -> Result<Vec<RawEventFact>> {
    let inner = self.inner.lock();
    let mut facts: Vec<RawEventFact> = inner.facts.values()
      .filter(|f| f.event_name == event_name)
      .cloned()
      .collect();
    facts.sort_by_key(|f| (f.block_number, f.log_index));
    Ok(facts)
  }

  fn revenue_epoch(&self, epoch_id: u64) -> Result<Option<RevenueEpoch>> {
    Ok(self.inner.lock().epochs.get(&epoch_id).cloned())
  }

  fn revenue_epochs(&self) -> Result<Vec<RevenueEpoch>> {
    Ok(self.inner.lock().epochs.values().cloned().collect())
  }

  fn set_epoch_split(&self, epoch_id: u64, split: &PoolSplit) -> Result<()> {
    let mut inner = self.inner.lock();
    let epoch = inner.epochs.get_mut(&epoch_id)
      .ok_or_else(|| Error::NotReady(format!("epoch {} has not been posted", epoch_id)))?;
    if let Some(existing) = epoch.split {
      if existing != *split {
        return Err(Error::Invariant(format!("epoch {} split already populated differently", epoch_id)))
      }
      return Ok(())
    }
    epoch.split = Some(*split);
    Ok(())
  }

  fn machine_revenues(&self, epoch_id: u64) -> Result<Vec<MachineRevenue>> {
    Ok(self.inner.lock().machine_revenues.values()
      .filter(|r| r.epoch_id == epoch_id)
      .cloned()
      .collect())
  }

  fn replace_staking_snapshot(&self, epoch_id: u64, rows: &[StakingSnapshot]) -> Result<()> {
    self.inner.lock().staking.insert(epoch_id, rows.to_vec());
    Ok(())
  }

  fn staking_snapshot(&self, epoch_id: u64) -> Result<Vec<StakingSnapshot>> {
    Ok(self.inner.lock().staking.get(&epoch_id).cloned().unwrap_or_default())
  }

  fn replace_ownership_snapshot(&self, epoch_id: u64, rows: &[OwnershipSnapshot]) -> Result<()> {
    self.inner.lock().ownership.insert(epoch_id, rows.to_vec());
    Ok(())
  }

  fn ownership_snapshot(&self, epoch_id: u64) -> Result<Vec<OwnershipSnapshot>> {
    Ok(self.inner.lock().ownership.get(&epoch_id).cloned().unwrap_or_default())
  }

  fn replace_holder_snapshot(&self, epoch_id: u64, rows: &[MachineHolderSnapshot]) -> Result<()> {
    self.inner.lock().holders.insert(epoch_id, rows.to_vec());
    Ok(())
  }

  fn holder_snapshot(&self, epoch_id: u64) -> Result<Vec<MachineHolderSnapshot>> {
    Ok(self.inner.lock().holders.get(&epoch_id).cloned().unwrap_or_default())
  }

  fn commitment(&self, epoch_id: u64, group: Group) -> Result<Option<MerkleCommitment>> {
    Ok(self.inner.lock().commitments.get(&(epoch_id, group)).cloned())
  }

  fn commitments(&self, epoch_id: u64) -> Result<Vec<MerkleCommitment>> {
    Ok(self.inner.lock().commitments.values()
      .filter(|c| c.epoch_id == epoch_id)
      .cloned()
      .collect())
  }

  fn unpublished_commitments(&self) -> Result<Vec<MerkleCommitment>> {
    Ok(self.inner.lock().commitments.values()
      .filter(|c| !c.published)
      .cloned()
      .collect())
  }

  fn replace_commitment(&self, commitment: &MerkleCommitment, entries: &[ClaimEntry]) -> Result<()> {
    let mut inner = self.inner.lock();
    let key = (commitment.epoch_id, commitment.group);
    if let Some(existing) = inner.commitments.get(&key) {
      if existing.published {
        return Err(PolicyViolation::CommitmentPublished {
          epoch_id: commitment.epoch_id,
          group: commitment.group,
        }.into())
      }
    }
    let claimed = inner.claims.values()
      .any(|c| c.epoch_id == commitment.epoch_id && c.group == commitment.group && c.claimed);
    if claimed {
      return Err(PolicyViolation::ClaimsRecorded { epoch_id: commitment.epoch_id, group: commitment.group }.into())
    }
    inner.claims.retain(|(e, g, _), _| !(*e == commitment.epoch_id && *g == commitment.group));
    for entry in entries {
      inner.claims.insert((entry.epoch_id, entry.group, entry.account.clone()), entry.clone());
    }
    inner.commitments.insert(key, commitment.clone());
    Ok(())
  }

  fn set_publish_ref(&self, epoch_id: u64, group: Group, publish_ref: &str) -> Result<()> {
    let mut inner = self.inner.lock();
    match inner.commitments.get_mut(&(epoch_id, group)) {
      Some(c) if c.published => Err(PolicyViolation::CommitmentPublished { epoch_id, group }.into()),
      Some(c) => {
        c.publish_ref = Some(publish_ref.to_owned());
        c.submitted_at = Some(chrono::Utc::now().naive_utc());
        Ok(())
      },
      None => Err(PolicyViolation::CommitmentNotFound { epoch_id, group }.into()),
    }
  }

  fn mark_published(&self, epoch_id: u64, group: Group, publish_ref: &str) -> Result<bool> {
    let mut inner = self.inner.lock();
    match inner.commitments.get_mut(&(epoch_id, group)) {
      Some(c) if c.published => Ok(false),
      Some(c) => {
        c.published = true;
        c.publish_ref = Some(publish_ref.to_owned());
        Ok(true)
      },
      None => Err(PolicyViolation::CommitmentNotFound { epoch_id, group }.into()),
    }
  }

  fn claim_entry(&self, epoch_id: u64, group: Group, account: &str) -> Result<Option<ClaimEntry>> {
    Ok(self.inner.lock().claims.get(&(epoch_id, group, account.to_owned())).cloned())
  }

  fn claim_entries(&self, epoch_id: u64, group: Group) -> Result<Vec<ClaimEntry>> {
    Ok(self.inner.lock().claims.values()
      .filter(|c| c.epoch_id == epoch_id && c.group == group)
      .cloned()
      .collect())
  }

  fn mark_claimed(
    &self,
    epoch_id: u64,
    group: Group,
    account: &str,
    claim_ref: &str,
    claimed_at: NaiveDateTime,
  ) -> Result<ClaimTransition> {
    let mut inner = self.inner.lock();
    match inner.claims.get_mut(&(epoch_id, group, account.to_owned())) {
      None => Ok(ClaimTransition::NotFound),
      Some(entry) if entry.claimed => Ok(ClaimTransition::AlreadyClaimed),
      Some(entry) => {
        entry.claimed = true;
        entry.claim_ref = Some(claim_ref.to_owned());
        entry.claimed_at = Some(claimed_at);
        Ok(ClaimTransition::Claimed)
      },
    }
  }
}
