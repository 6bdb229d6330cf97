//! Per-epoch beneficiary snapshots, folded from stored facts up to the
//! epoch's boundary block.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::allocation::Beneficiary;
use crate::config::Config;
use crate::constants::{Group, ZERO_ADDRESS};
use crate::errors::{Error, Result};
use crate::events::ChainEvent;
use crate::models::*;
use crate::store::Store;

#[derive(Debug, Clone)]
struct Position {
  account: String,
  amount: u128,
  lock_days: u64,
  lock_until: u64,
  opened: PositionOrder,
}

#[derive(Debug, Clone)]
struct Machine {
  owner: String,
  acquired: PositionOrder,
  decommissioned: bool,
}

#[derive(Debug, Clone)]
struct Asset {
  share_basis_points: u32,
  expires_at: u64,
  decommissioned: bool,
}

#[derive(Debug, Clone)]
struct Holding {
  units: u128,
  acquired: PositionOrder,
}

/// Contract state reconstructed from facts.
#[derive(Debug, Default)]
struct ChainState {
  /// keyed by (source, position id)
  positions: BTreeMap<(String, String), Position>,
  machines: BTreeMap<String, Machine>,
  /// keyed by (source, asset id)
  assets: BTreeMap<(String, String), Asset>,
  /// keyed by (source, asset id, account)
  holdings: BTreeMap<(String, String, String), Holding>,
}

impl ChainState {
  fn fold(facts: &[RawEventFact]) -> Result<ChainState> {
    let mut state = ChainState::default();
    for fact in facts {
      let event = ChainEvent::from_fact(fact)?;
      state.apply(fact, event)?;
    }
    Ok(state)
  }

  fn apply(&mut self, fact: &RawEventFact, event: ChainEvent) -> Result<()> {
    let source = fact.source_id.clone();
    let fail = |reason: String| Err(Error::integrity(&fact.source_id, format!("{} at {}", reason, fact.order())));
    match event {
      ChainEvent::PositionOpened { position_id, account, amount, lock_days, lock_until } => {
        let key = (source, position_id);
        if self.positions.contains_key(&key) {
          return fail(format!("position {} opened twice", key.1))
        }
        self.positions.insert(key, Position { account, amount, lock_days, lock_until, opened: fact.order() });
      },
      ChainEvent::PositionClosed { position_id } => {
        if self.positions.remove(&(source, position_id.clone())).is_none() {
          return fail(format!("position {} closed but never opened", position_id))
        }
      },
      ChainEvent::MachineTransferred { machine_id, from, to } => {
        if from == ZERO_ADDRESS {
          if self.machines.contains_key(&machine_id) {
            return fail(format!("machine {} minted twice", machine_id))
          }
          self.machines.insert(machine_id, Machine { owner: to, acquired: fact.order(), decommissioned: false });
          return Ok(())
        }
        let owner = self.machines.get(&machine_id).map(|m| m.owner.clone());
        if owner.as_deref() != Some(from.as_str()) {
          return fail(format!("machine {} transferred from {} but owned by {:?}", machine_id, from, owner))
        }
        if to == ZERO_ADDRESS {
          self.machines.remove(&machine_id);
        } else if let Some(machine) = self.machines.get_mut(&machine_id) {
          machine.owner = to;
          machine.acquired = fact.order();
        }
      },
      ChainEvent::MachineDecommissioned { machine_id } => {
        match self.machines.get_mut(&machine_id) {
          Some(machine) => machine.decommissioned = true,
          None => return fail(format!("unknown machine {} decommissioned", machine_id)),
        }
      },
      ChainEvent::AssetRegistered { asset_id, share_basis_points, expires_at } => {
        let key = (source, asset_id);
        if self.assets.contains_key(&key) {
          return fail(format!("asset {} registered twice", key.1))
        }
        self.assets.insert(key, Asset { share_basis_points, expires_at, decommissioned: false });
      },
      ChainEvent::SharesTransferred { asset_id, from, to, units } => {
        if !self.assets.contains_key(&(source.clone(), asset_id.clone())) {
          return fail(format!("shares of unregistered asset {} transferred", asset_id))
        }
        if from != ZERO_ADDRESS {
          let key = (source.clone(), asset_id.clone(), from.clone());
          let remaining = match self.holdings.get(&key).and_then(|h| h.units.checked_sub(units)) {
            Some(remaining) => remaining,
            None => return fail(format!("{} transferred more units of asset {} than held", from, asset_id)),
          };
          if remaining == 0 {
            self.holdings.remove(&key);
          } else if let Some(h) = self.holdings.get_mut(&key) {
            h.units = remaining;
          }
        }
        if to != ZERO_ADDRESS && units > 0 {
          let order = fact.order();
          let holding = self.holdings.entry((source, asset_id.clone(), to.clone()))
            .or_insert(Holding { units: 0, acquired: order });
          holding.units = match holding.units.checked_add(units) {
            Some(units) => units,
            None => return fail(format!("holding of {} in asset {} overflows", to, asset_id)),
          };
        }
      },
      ChainEvent::AssetDecommissioned { asset_id } => {
        match self.assets.get_mut(&(source, asset_id.clone())) {
          Some(asset) => asset.decommissioned = true,
          None => return fail(format!("unknown asset {} decommissioned", asset_id)),
        }
      },
      // not part of beneficiary state
      ChainEvent::RevenuePosted { .. }
      | ChainEvent::MachineRevenueReported { .. }
      | ChainEvent::RootSubmitted { .. }
      | ChainEvent::Claimed { .. } => (),
    }
    Ok(())
  }
}

fn timestamp(secs: u64) -> Option<NaiveDateTime> {
  if secs == 0 {
    return None
  }
  i64::try_from(secs).ok()
    .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
    .map(|d| d.naive_utc())
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
  pub epoch_id: u64,
  pub boundary_block: u64,
  pub stakers: usize,
  pub owners: usize,
  pub holders: usize,
}

pub struct SnapshotEngine {
  config: Arc<Config>,
  store: Arc<dyn Store>,
}

impl SnapshotEngine {
  pub fn new(config: Arc<Config>, store: Arc<dyn Store>) -> Self {
    Self { config, store }
  }

  /// The posted epoch, once every snapshot source has ingested past its
  /// boundary block.
  pub fn boundary(&self, epoch_id: u64) -> Result<RevenueEpoch> {
    let epoch = self.store.revenue_epoch(epoch_id)?
      .ok_or_else(|| Error::NotReady(format!("epoch {} has not been posted", epoch_id)))?;
    for source in self.config.sources.iter().filter(|s| s.kind.feeds_snapshots()) {
      let reached = self.store.checkpoint(&source.id)?.map(|c| c.last_processed_block).unwrap_or(0);
      if reached < epoch.source_block {
        return Err(Error::NotReady(format!(
          "source {} at block {} has not reached epoch {} boundary {}", source.id, reached, epoch_id, epoch.source_block
        )))
      }
    }
    Ok(epoch)
  }

  fn state_at(&self, epoch: &RevenueEpoch) -> Result<ChainState> {
    let facts = self.store.facts_up_to(epoch.source_block)?;
    debug!("Folding {} facts for epoch {} up to block {}.", facts.len(), epoch.epoch_id, epoch.source_block);
    ChainState::fold(&facts)
  }

  pub fn snapshot_all(&self, epoch_id: u64) -> Result<SnapshotSummary> {
    let epoch = self.boundary(epoch_id)?;
    let state = self.state_at(&epoch)?;
    let staking = self.staking_rows(&epoch, &state)?;
    let ownership = ownership_rows(&epoch, &state)?;
    let holders = self.holder_rows(&epoch, &state)?;
    self.store.replace_staking_snapshot(epoch_id, &staking)?;
    self.store.replace_ownership_snapshot(epoch_id, &ownership)?;
    self.store.replace_holder_snapshot(epoch_id, &holders)?;
    let summary = SnapshotSummary {
      epoch_id,
      boundary_block: epoch.source_block,
      stakers: staking.len(),
      owners: ownership.len(),
      holders: holders.len(),
    };
    info!("Snapshot for epoch {}: {:?}", epoch_id, summary);
    Ok(summary)
  }

  pub fn snapshot_staking(&self, epoch_id: u64) -> Result<Vec<StakingSnapshot>> {
    let epoch = self.boundary(epoch_id)?;
    let rows = self.staking_rows(&epoch, &self.state_at(&epoch)?)?;
    self.store.replace_staking_snapshot(epoch_id, &rows)?;
    Ok(rows)
  }

  pub fn snapshot_ownership(&self, epoch_id: u64) -> Result<Vec<OwnershipSnapshot>> {
    let epoch = self.boundary(epoch_id)?;
    let rows = ownership_rows(&epoch, &self.state_at(&epoch)?)?;
    self.store.replace_ownership_snapshot(epoch_id, &rows)?;
    Ok(rows)
  }

  pub fn snapshot_holders(&self, epoch_id: u64) -> Result<Vec<MachineHolderSnapshot>> {
    let epoch = self.boundary(epoch_id)?;
    let rows = self.holder_rows(&epoch, &self.state_at(&epoch)?)?;
    self.store.replace_holder_snapshot(epoch_id, &rows)?;
    Ok(rows)
  }

  fn staking_rows(&self, epoch: &RevenueEpoch, state: &ChainState) -> Result<Vec<StakingSnapshot>> {
    let mut by_account: BTreeMap<&str, Vec<&Position>> = BTreeMap::new();
    for p in state.positions.values() {
      by_account.entry(p.account.as_str()).or_default().push(p);
    }

    let mut rows = vec![];
    for (account, positions) in by_account {
      let mut principal: u128 = 0;
      let mut effective: u128 = 0;
      let mut multipliers = vec![];
      for p in positions.iter().filter(|p| p.amount > 0) {
        let multiplier = self.config.distribution.weight_tier(p.lock_days);
        let weighted = p.amount.checked_mul(multiplier)
          .and_then(|w| effective.checked_add(w))
          .ok_or_else(|| Error::Invariant(format!("effective weight of {} overflows", account)))?;
        effective = weighted;
        principal = principal.checked_add(p.amount)
          .ok_or_else(|| Error::Invariant(format!("principal of {} overflows", account)))?;
        multipliers.push(multiplier);
      }
      if principal == 0 {
        continue
      }
      multipliers.sort_unstable();
      multipliers.dedup();
      let lock_weight = if multipliers.len() == 1 { multipliers[0] } else { effective / principal };
      let live = positions.iter().filter(|p| p.amount > 0);
      rows.push(StakingSnapshot {
        epoch_id: epoch.epoch_id,
        account: account.to_owned(),
        principal,
        lock_weight,
        effective_weight: effective,
        lock_until: live.clone().map(|p| p.lock_until).max().and_then(timestamp),
        created_at: live.map(|p| p.opened).min().unwrap_or_default(),
      });
    }
    Ok(rows)
  }

  fn holder_rows(&self, epoch: &RevenueEpoch, state: &ChainState) -> Result<Vec<MachineHolderSnapshot>> {
    let revenues: BTreeMap<String, u128> = self.store.machine_revenues(epoch.epoch_id)?
      .into_iter()
      .map(|r| (r.machine_id, r.amount))
      .collect();
    let mut rows: Vec<MachineHolderSnapshot> = state.machines.iter()
      .filter(|(_, m)| !m.decommissioned)
      .filter_map(|(id, m)| {
        let weight = revenues.get(id).cloned().unwrap_or(0);
        if weight == 0 {
          return None
        }
        Some(MachineHolderSnapshot {
          epoch_id: epoch.epoch_id,
          account: m.owner.clone(),
          machine_id: id.clone(),
          revenue_weight: weight,
          created_at: m.acquired,
        })
      })
      .collect();
    rows.sort_by(|a, b| (&a.account, &a.machine_id).cmp(&(&b.account, &b.machine_id)));
    Ok(rows)
  }

  /// Weights feeding the allocator for `group`, one per account.
  pub fn beneficiaries(&self, epoch_id: u64, group: Group) -> Result<Vec<Beneficiary>> {
    let weighted: Vec<(String, u128, PositionOrder)> = match group {
      Group::Alpha => self.store.staking_snapshot(epoch_id)?
        .into_iter()
        .map(|s| (s.account, s.effective_weight, s.created_at))
        .collect(),
      Group::Beta => self.store.holder_snapshot(epoch_id)?
        .into_iter()
        .map(|s| (s.account, s.revenue_weight, s.created_at))
        .collect(),
      Group::Gamma => self.store.ownership_snapshot(epoch_id)?
        .into_iter()
        .map(|s| (s.account, s.effective_share, s.created_at))
        .collect(),
    };

    let mut merged: BTreeMap<String, Beneficiary> = BTreeMap::new();
    for (account, weight, created_at) in weighted {
      let entry = merged.entry(account.clone())
        .or_insert(Beneficiary { account, weight: 0, created_at });
      entry.weight = entry.weight.checked_add(weight)
        .ok_or_else(|| Error::Invariant(format!("{} weight of {} overflows", group, entry.account)))?;
      entry.created_at = entry.created_at.min(created_at);
    }
    Ok(merged.into_values().collect())
  }
}

fn ownership_rows(epoch: &RevenueEpoch, state: &ChainState) -> Result<Vec<OwnershipSnapshot>> {
  let now = epoch.source_time.and_utc().timestamp();
  let mut rows = vec![];
  for ((source, asset_id, account), holding) in state.holdings.iter() {
    let asset = match state.assets.get(&(source.clone(), asset_id.clone())) {
      Some(asset) => asset,
      None => continue,
    };
    let expired = asset.expires_at != 0 && i64::try_from(asset.expires_at).map(|e| e <= now).unwrap_or(false);
    if asset.decommissioned || expired || holding.units == 0 {
      continue
    }
    let effective_share = u128::from(asset.share_basis_points).checked_mul(holding.units)
      .ok_or_else(|| Error::Invariant(format!("share of {} in asset {} overflows", account, asset_id)))?;
    rows.push(OwnershipSnapshot {
      epoch_id: epoch.epoch_id,
      account: account.clone(),
      asset_id: asset_id.clone(),
      share_basis_points: asset.share_basis_points,
      units_held: holding.units,
      effective_share,
      created_at: holding.acquired,
    });
  }
  rows.sort_by(|a, b| (&a.account, &a.asset_id).cmp(&(&b.account, &b.asset_id)));
  Ok(rows)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::ErrorKind;
  use crate::store::MemoryStore;
  use crate::testkit::{self, acct, fact, seed};

  fn engine() -> (SnapshotEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (SnapshotEngine::new(Arc::new(testkit::config()), store.clone()), store)
  }

  fn opened(id: u32, account: u32, amount: u128, lock_days: u64) -> ChainEvent {
    ChainEvent::PositionOpened {
      position_id: id.to_string(),
      account: acct(account),
      amount,
      lock_days,
      lock_until: 1_800_000_000,
    }
  }

  fn posted(epoch_id: u64, total: u128) -> ChainEvent {
    ChainEvent::RevenuePosted { epoch_id, total_revenue: total, posted_at: 1_750_000_000 }
  }

  #[test]
  fn staking_folds_open_positions_by_account() {
    let (engine, store) = engine();
    seed(&store, "staking", vec![
      fact("staking", 10, 0, opened(1, 1, 100, 0)),
      fact("staking", 10, 1, opened(2, 2, 100, 400)),
      fact("staking", 11, 0, opened(3, 1, 100, 365)),
      fact("staking", 12, 0, opened(4, 3, 50, 0)),
      fact("staking", 13, 0, ChainEvent::PositionClosed { position_id: "4".to_owned() }),
      // after the boundary
      fact("staking", 30, 0, opened(5, 4, 100, 0)),
    ], 30);
    seed(&store, "revenue", vec![fact("revenue", 20, 0, posted(1, 1_000))], 30);
    testkit::advance_all(&store, 30);

    let rows = engine.snapshot_staking(1).unwrap();
    assert_eq!(rows.len(), 2);
    let a = &rows[0];
    assert_eq!(a.account, acct(1));
    assert_eq!(a.principal, 200);
    assert_eq!(a.effective_weight, 100 * 1_000 + 100 * 3_000);
    assert_eq!(a.lock_weight, 2_000);
    assert_eq!(a.created_at, PositionOrder { block: 10, log_index: 0 });
    let b = &rows[1];
    assert_eq!((b.principal, b.lock_weight, b.effective_weight), (100, 3_000, 300_000));
    assert!(b.lock_until.is_some());

    // rerun replaces rather than appends
    engine.snapshot_staking(1).unwrap();
    assert_eq!(store.staking_snapshot(1).unwrap(), rows);
  }

  #[test]
  fn ownership_skips_decommissioned_and_expired_assets() {
    let (engine, store) = engine();
    let registered = |id: &str, bps: u32, expires_at: u64| ChainEvent::AssetRegistered {
      asset_id: id.to_owned(), share_basis_points: bps, expires_at,
    };
    let transfer = |id: &str, from: &str, to: &str, units: u128| ChainEvent::SharesTransferred {
      asset_id: id.to_owned(), from: from.to_owned(), to: to.to_owned(), units,
    };
    seed(&store, "fractional", vec![
      fact("fractional", 5, 0, registered("1", 500, 0)),
      fact("fractional", 5, 1, registered("2", 500, 0)),
      fact("fractional", 5, 2, registered("3", 500, 1_000)),
      fact("fractional", 6, 0, transfer("1", ZERO_ADDRESS, &acct(1), 10)),
      fact("fractional", 6, 1, transfer("1", &acct(1), &acct(2), 4)),
      fact("fractional", 6, 2, transfer("2", ZERO_ADDRESS, &acct(1), 10)),
      fact("fractional", 6, 3, transfer("3", ZERO_ADDRESS, &acct(3), 10)),
      fact("fractional", 7, 0, ChainEvent::AssetDecommissioned { asset_id: "2".to_owned() }),
      fact("fractional", 7, 1, transfer("1", &acct(2), ZERO_ADDRESS, 4)),
      fact("fractional", 7, 2, transfer("1", ZERO_ADDRESS, &acct(2), 1)),
    ], 20);
    seed(&store, "revenue", vec![fact("revenue", 8, 0, posted(1, 1_000))], 20);
    testkit::advance_all(&store, 20);

    let rows = engine.snapshot_ownership(1).unwrap();
    let summary: Vec<(String, String, u128, u128)> = rows.iter()
      .map(|r| (r.account.clone(), r.asset_id.clone(), r.units_held, r.effective_share))
      .collect();
    assert_eq!(summary, vec![
      (acct(1), "1".to_owned(), 6, 3_000),
      (acct(2), "1".to_owned(), 1, 500),
    ]);
    // re-acquired after a full burn counts from the new position
    assert_eq!(rows[1].created_at, PositionOrder { block: 7, log_index: 2 });
  }

  #[test]
  fn holders_are_weighted_by_machine_revenue() {
    let (engine, store) = engine();
    let moved = |id: u32, from: &str, to: &str| ChainEvent::MachineTransferred {
      machine_id: id.to_string(), from: from.to_owned(), to: to.to_owned(),
    };
    seed(&store, "machines", vec![
      fact("machines", 3, 0, moved(1, ZERO_ADDRESS, &acct(1))),
      fact("machines", 3, 1, moved(2, ZERO_ADDRESS, &acct(1))),
      fact("machines", 3, 2, moved(3, ZERO_ADDRESS, &acct(2))),
      fact("machines", 3, 3, moved(4, ZERO_ADDRESS, &acct(2))),
      fact("machines", 4, 0, moved(2, &acct(1), &acct(3))),
      fact("machines", 4, 1, ChainEvent::MachineDecommissioned { machine_id: "4".to_owned() }),
    ], 20);
    let report = |machine: u32, amount: u128| ChainEvent::MachineRevenueReported {
      epoch_id: 1, machine_id: machine.to_string(), amount,
    };
    seed(&store, "revenue", vec![
      fact("revenue", 9, 0, report(1, 300)),
      fact("revenue", 9, 1, report(2, 200)),
      fact("revenue", 9, 2, report(3, 0)),
      fact("revenue", 9, 3, report(4, 900)),
      fact("revenue", 10, 0, posted(1, 1_000)),
    ], 20);
    testkit::advance_all(&store, 20);

    let rows = engine.snapshot_holders(1).unwrap();
    let summary: Vec<(String, String, u128)> = rows.iter()
      .map(|r| (r.account.clone(), r.machine_id.clone(), r.revenue_weight))
      .collect();
    assert_eq!(summary, vec![(acct(1), "1".to_owned(), 300), (acct(3), "2".to_owned(), 200)]);

    let beta = engine.beneficiaries(1, Group::Beta).unwrap();
    assert_eq!(beta.iter().map(|b| b.weight).collect::<Vec<_>>(), vec![300, 200]);
  }

  #[test]
  fn refuses_until_sources_pass_the_boundary() {
    let (engine, store) = engine();
    seed(&store, "revenue", vec![fact("revenue", 50, 0, posted(1, 1_000))], 50);
    seed(&store, "staking", vec![], 49);
    let err = engine.snapshot_all(1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.to_string().contains("staking"));

    assert!(matches!(engine.snapshot_all(2), Err(Error::NotReady(_))));
  }

  #[test]
  fn overdrawn_shares_are_an_integrity_violation() {
    let (engine, store) = engine();
    seed(&store, "fractional", vec![
      fact("fractional", 5, 0, ChainEvent::AssetRegistered { asset_id: "1".to_owned(), share_basis_points: 100, expires_at: 0 }),
      fact("fractional", 6, 0, ChainEvent::SharesTransferred {
        asset_id: "1".to_owned(), from: acct(1), to: acct(2), units: 1,
      }),
    ], 20);
    seed(&store, "revenue", vec![fact("revenue", 8, 0, posted(1, 1_000))], 20);
    testkit::advance_all(&store, 20);
    assert_eq!(engine.snapshot_all(1).unwrap_err().kind(), ErrorKind::DataIntegrity);
  }
}
