//! Epoch orchestration: snapshot, split, allocate, commit, publish.

use serde::Serialize;
use std::sync::Arc;

use crate::allocation::allocate;
use crate::claims::{apply_recorded_claims, seed_entries};
use crate::config::Config;
use crate::constants::Group;
use crate::distribution::{split_revenue, validate_split};
use crate::errors::{Error, Result};
use crate::merkle::{verify, MerkleTree};
use crate::models::{MerkleCommitment, PoolSplit};
use crate::publisher::{PublishOutcome, Publisher};
use crate::snapshot::{SnapshotEngine, SnapshotSummary};
use crate::store::Store;
use crate::utils::{checked_sum, u128_string};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GroupOutcome {
  Committed {
    root: String,
    leaf_count: u32,
    #[serde(with = "u128_string")]
    total_amount: u128,
    #[serde(with = "u128_string")]
    remainder: u128,
    remainder_account: Option<String>,
  },
  /// Nobody held weight, so no commitment was built.
  Unallocated {
    #[serde(with = "u128_string")]
    amount: u128,
  },
  SkippedPublished { root: String },
  /// Entries already carry claims, so the commitment is frozen.
  SkippedClaimed { root: String },
}

#[derive(Serialize, Debug, Clone)]
pub struct GroupReport {
  pub group: Group,
  #[serde(with = "u128_string")]
  pub pool: u128,
  pub outcome: GroupOutcome,
  pub publish: Option<PublishOutcome>,
}

#[derive(Serialize, Debug, Clone)]
pub struct EpochReport {
  pub epoch_id: u64,
  pub split: PoolSplit,
  pub snapshot: Option<SnapshotSummary>,
  pub groups: Vec<GroupReport>,
}

pub struct Pipeline {
  config: Arc<Config>,
  store: Arc<dyn Store>,
  snapshots: SnapshotEngine,
}

impl Pipeline {
  pub fn new(config: Arc<Config>, store: Arc<dyn Store>) -> Self {
    let snapshots = SnapshotEngine::new(config.clone(), store.clone());
    Self { config, store, snapshots }
  }

  pub fn snapshots(&self) -> &SnapshotEngine {
    &self.snapshots
  }

  /// Splits the epoch's revenue and records it. A split already on record
  /// must match the recomputed one.
  pub fn compute_split(&self, epoch_id: u64) -> Result<PoolSplit> {
    let epoch = self.store.revenue_epoch(epoch_id)?
      .ok_or_else(|| Error::NotReady(format!("epoch {} has not been posted", epoch_id)))?;
    let split = split_revenue(epoch.total_revenue, &self.config.distribution.ratios)?;
    if let Some(existing) = epoch.split {
      validate_split(&existing)?;
      if existing != split {
        return Err(Error::Invariant(format!(
          "epoch {} split on record {:?} differs from recomputed {:?}", epoch_id, existing, split
        )))
      }
      return Ok(existing)
    }
    self.store.set_epoch_split(epoch_id, &split)?;
    info!("Epoch {} split: {:?}", epoch_id, split);
    Ok(split)
  }

  /// Allocates the group's pool from its snapshot and replaces the
  /// commitment and claim entries, unless the commitment is published or
  /// any entry is claimed. Claims ingested before the entries existed are
  /// applied to the fresh entries.
  pub fn build_commitment(&self, epoch_id: u64, group: Group, split: &PoolSplit) -> Result<GroupOutcome> {
    if let Some(existing) = self.store.commitment(epoch_id, group)? {
      if existing.published {
        info!("Commitment {}/{} is published, leaving it as is.", epoch_id, group);
        return Ok(GroupOutcome::SkippedPublished { root: existing.root_hash })
      }
      if self.store.claim_entries(epoch_id, group)?.iter().any(|e| e.claimed) {
        warn!("Commitment {}/{} has claims but is not marked published, leaving it as is.", epoch_id, group);
        return Ok(GroupOutcome::SkippedClaimed { root: existing.root_hash })
      }
    }

    let pool = split.for_group(group);
    let beneficiaries = self.snapshots.beneficiaries(epoch_id, group)?;
    let allocation = allocate(pool, &beneficiaries)?;
    if allocation.rewards.is_empty() {
      if pool > 0 {
        warn!("Nobody eligible in {}/{}; {} left unallocated.", epoch_id, group, allocation.unallocated());
      }
      return Ok(GroupOutcome::Unallocated { amount: allocation.unallocated() })
    }

    let rewards: Vec<(String, u128)> = allocation.rewards.iter().map(|r| (r.account.clone(), r.amount)).collect();
    let tree = MerkleTree::build(epoch_id, group, &rewards)?;
    let mut entries = seed_entries(epoch_id, group, &tree);

    let root = tree.root();
    for (i, leaf) in tree.leaves().iter().enumerate() {
      if !verify(&leaf.hash, &tree.proof(i), &root) {
        return Err(Error::Invariant(format!("proof for {} in {}/{} does not verify", leaf.account, epoch_id, group)))
      }
    }
    let total = checked_sum(entries.iter().map(|e| e.amount))?;
    if total != pool {
      return Err(Error::Invariant(format!("{}/{} entries sum to {}, pool is {}", epoch_id, group, total, pool)))
    }
    let leaf_count = u32::try_from(entries.len())
      .map_err(|_| Error::Invariant(format!("{}/{} has too many leaves", epoch_id, group)))?;

    let commitment = MerkleCommitment {
      epoch_id,
      group,
      root_hash: tree.root_hex(),
      total_amount: total,
      leaf_count,
      published: false,
      publish_ref: None,
      submitted_at: None,
    };
    let recorded = apply_recorded_claims(self.store.as_ref(), epoch_id, group, &mut entries)?;
    if recorded > 0 {
      warn!("{} claims in {}/{} arrived before their entries.", recorded, epoch_id, group);
    }
    self.store.replace_commitment(&commitment, &entries)?;
    info!("Committed {}/{}: root {} over {} leaves.", epoch_id, group, commitment.root_hash, leaf_count);
    Ok(GroupOutcome::Committed {
      root: commitment.root_hash,
      leaf_count,
      total_amount: total,
      remainder: allocation.remainder,
      remainder_account: allocation.remainder_account,
    })
  }

  /// Split plus commitments for all groups, from snapshots already taken.
  pub fn build_commitments(&self, epoch_id: u64) -> Result<EpochReport> {
    let split = self.compute_split(epoch_id)?;
    let groups = Group::ALL.iter()
      .map(|group| Ok(GroupReport {
        group: *group,
        pool: split.for_group(*group),
        outcome: self.build_commitment(epoch_id, *group, &split)?,
        publish: None,
      }))
      .collect::<Result<Vec<GroupReport>>>()?;
    Ok(EpochReport { epoch_id, split, snapshot: None, groups })
  }

  /// Runs every stage for one epoch. Publishing is skipped without a
  /// publisher.
  pub fn run_epoch(&self, epoch_id: u64, publisher: Option<&Publisher>) -> Result<EpochReport> {
    let summary = self.snapshots.snapshot_all(epoch_id)?;
    let mut report = self.build_commitments(epoch_id)?;
    report.snapshot = Some(summary);
    if let Some(publisher) = publisher {
      for g in report.groups.iter_mut() {
        if let GroupOutcome::Committed { .. } = g.outcome {
          g.publish = Some(publisher.publish(epoch_id, g.group)?);
        }
      }
    }
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::claims::ClaimLedger;
  use crate::errors::ErrorKind;
  use crate::events::ChainEvent;
  use crate::ingest::{Ingestor, SourceLocks};
  use crate::merkle::Hash;
  use crate::store::MemoryStore;
  use crate::testkit::{self, acct, FakeChain, DISTRIBUTOR, FRACTIONAL, MACHINES, REVENUE, STAKING};
  use crate::utils::decode_hash;

  struct World {
    config: Arc<Config>,
    store: Arc<MemoryStore>,
    chain: Arc<FakeChain>,
    ingestor: Ingestor,
    pipeline: Pipeline,
    publisher: Publisher,
  }

  fn world() -> World {
    let config = Arc::new(testkit::config());
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(FakeChain::new());
    let ingestor = Ingestor::new(config.clone(), store.clone(), chain.clone(), Arc::new(SourceLocks::new()));
    let pipeline = Pipeline::new(config.clone(), store.clone());
    let publisher = Publisher::new(config.clone(), store.clone(), chain.clone());
    World { config, store, chain, ingestor, pipeline, publisher }
  }

  fn populate(chain: &FakeChain) {
    chain.emit(STAKING, 2, ChainEvent::PositionOpened {
      position_id: "1".to_owned(), account: acct(1), amount: 100, lock_days: 0, lock_until: 0,
    });
    chain.emit(STAKING, 3, ChainEvent::PositionOpened {
      position_id: "2".to_owned(), account: acct(2), amount: 100, lock_days: 365, lock_until: 1_800_000_000,
    });
    chain.emit(MACHINES, 2, ChainEvent::MachineTransferred {
      machine_id: "1".to_owned(), from: crate::constants::ZERO_ADDRESS.to_owned(), to: acct(3),
    });
    chain.emit(FRACTIONAL, 2, ChainEvent::AssetRegistered {
      asset_id: "1".to_owned(), share_basis_points: 2_500, expires_at: 0,
    });
    chain.emit(FRACTIONAL, 3, ChainEvent::SharesTransferred {
      asset_id: "1".to_owned(), from: crate::constants::ZERO_ADDRESS.to_owned(), to: acct(4), units: 3,
    });
    chain.emit(REVENUE, 4, ChainEvent::MachineRevenueReported { epoch_id: 1, machine_id: "1".to_owned(), amount: 77 });
    chain.emit(REVENUE, 5, ChainEvent::RevenuePosted { epoch_id: 1, total_revenue: 10_001, posted_at: 1_700_000_000 });
    chain.set_head(8);
  }

  fn proof_of(store: &MemoryStore, epoch_id: u64, group: Group, account: &str) -> (Hash, Vec<Hash>) {
    let entry = store.claim_entry(epoch_id, group, account).unwrap().unwrap();
    let proof = entry.proof.iter().map(|p| decode_hash(p).unwrap()).collect();
    (decode_hash(&entry.leaf_hash).unwrap(), proof)
  }

  #[test]
  fn epoch_runs_end_to_end() {
    let w = world();
    populate(&w.chain);
    assert!(w.ingestor.catch_up().failed.is_empty());

    let report = w.pipeline.run_epoch(1, Some(&w.publisher)).unwrap();
    assert_eq!((report.split.opc, report.split.alpha, report.split.remainder), (7_001, 2_000, 1));
    assert_eq!(report.snapshot.as_ref().map(|s| (s.stakers, s.holders, s.owners)), Some((2, 1, 1)));

    // alpha: weights 100_000 and 300_000 over a pool of 2000
    let alpha = w.store.claim_entries(1, Group::Alpha).unwrap();
    let amounts: Vec<(String, u128)> = alpha.iter().map(|e| (e.account.clone(), e.amount)).collect();
    assert_eq!(amounts, vec![(acct(1), 500), (acct(2), 1_500)]);
    for e in alpha.iter() {
      let (leaf, proof) = proof_of(&w.store, 1, Group::Alpha, &e.account);
      let root = decode_hash(&w.store.commitment(1, Group::Alpha).unwrap().unwrap().root_hash).unwrap();
      assert!(verify(&leaf, &proof, &root));
    }
    assert_eq!(w.store.claim_entries(1, Group::Beta).unwrap()[0].amount, 300);
    assert_eq!(w.store.claim_entries(1, Group::Gamma).unwrap()[0].account, acct(4));

    for g in report.groups.iter() {
      assert!(matches!(g.publish, Some(PublishOutcome::Published { .. })), "{:?}", g);
    }
    assert_eq!(w.chain.submissions().len(), 3);

    // claim through the distributor and ingest it back
    let ledger = ClaimLedger::new(w.store.clone());
    assert!(ledger.is_claimable(1, Group::Alpha, &acct(2)).unwrap());
    w.chain.emit(DISTRIBUTOR, 9, ChainEvent::Claimed { epoch_id: 1, group: 0, account: acct(2), amount: 1_500 });
    w.ingestor.catch_up();
    assert!(!ledger.is_claimable(1, Group::Alpha, &acct(2)).unwrap());

    // a rerun touches nothing that is published
    let rerun = w.pipeline.run_epoch(1, Some(&w.publisher)).unwrap();
    for g in rerun.groups.iter() {
      assert!(matches!(g.outcome, GroupOutcome::SkippedPublished { .. }));
      assert_eq!(g.publish, None);
    }
    assert_eq!(w.chain.submissions().len(), 3);
    assert!(w.store.claim_entry(1, Group::Alpha, &acct(2)).unwrap().unwrap().claimed);
  }

  #[test]
  fn early_claims_survive_the_first_build() {
    let w = world();
    populate(&w.chain);
    w.chain.emit(DISTRIBUTOR, 6, ChainEvent::Claimed { epoch_id: 1, group: 0, account: acct(2), amount: 1_500 });
    assert!(w.ingestor.catch_up().failed.is_empty());
    assert!(w.store.claim_entries(1, Group::Alpha).unwrap().is_empty());

    w.pipeline.run_epoch(1, None).unwrap();
    let claimed = w.store.claim_entry(1, Group::Alpha, &acct(2)).unwrap().unwrap();
    assert!(claimed.claimed);
    assert!(!w.store.claim_entry(1, Group::Alpha, &acct(1)).unwrap().unwrap().claimed);

    // the claimed group is frozen while the rest rebuild
    let rerun = w.pipeline.run_epoch(1, None).unwrap();
    assert!(matches!(rerun.groups[0].outcome, GroupOutcome::SkippedClaimed { .. }));
    assert!(matches!(rerun.groups[1].outcome, GroupOutcome::Committed { .. }));
    assert_eq!(w.store.claim_entry(1, Group::Alpha, &acct(2)).unwrap().unwrap(), claimed);
  }

  #[test]
  fn unpublished_commitments_are_rebuilt_identically() {
    let w = world();
    populate(&w.chain);
    w.ingestor.catch_up();
    let first = w.pipeline.run_epoch(1, None).unwrap();
    let second = w.pipeline.run_epoch(1, None).unwrap();
    let roots = |r: &EpochReport| r.groups.iter().map(|g| g.outcome.clone()).collect::<Vec<_>>();
    assert_eq!(roots(&first), roots(&second));
    assert!(w.chain.submissions().is_empty());
  }

  #[test]
  fn empty_group_is_left_unallocated() {
    let w = world();
    w.chain.emit(REVENUE, 2, ChainEvent::RevenuePosted { epoch_id: 1, total_revenue: 1_000, posted_at: 1 });
    w.chain.set_head(3);
    w.ingestor.catch_up();
    let report = w.pipeline.run_epoch(1, Some(&w.publisher)).unwrap();
    let alpha = &report.groups[0];
    assert_eq!(alpha.outcome, GroupOutcome::Unallocated { amount: 200 });
    assert!(alpha.publish.is_none());
    assert!(w.store.commitments(1).unwrap().is_empty());
  }

  #[test]
  fn waits_for_every_source() {
    let w = world();
    populate(&w.chain);
    w.ingestor.ingest("revenue", 1, 8).unwrap();
    let err = w.pipeline.run_epoch(1, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(w.store.revenue_epoch(1).unwrap().unwrap().split.is_none());
  }

  #[test]
  fn a_split_on_record_must_match() {
    let w = world();
    populate(&w.chain);
    w.ingestor.catch_up();
    let mut tampered = split_revenue(10_001, &w.config.distribution.ratios).unwrap();
    tampered.opc -= 1;
    tampered.alpha += 1;
    w.store.set_epoch_split(1, &tampered).unwrap();
    assert!(matches!(w.pipeline.compute_split(1), Err(Error::Invariant(_))));
  }
}
