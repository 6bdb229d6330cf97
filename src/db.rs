//! PostgreSQL store. Diesel is blocking, so callers run it from sync actors.

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde_json::Value;
use std::convert::TryFrom;

use crate::constants::Group;
use crate::errors::{Error, PolicyViolation, Result};
use crate::models::*;
use crate::schema::*;
use crate::store::{check_checkpoint_advance, check_epoch_repost, check_machine_revenue, BatchSummary, IngestBatch, Store};
use crate::utils::{from_u128, to_u128};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

const INSERT_CHUNK: usize = 1000;

pub fn create_pool(database_url: &str) -> Result<DbPool> {
  let manager = ConnectionManager::<PgConnection>::new(database_url);
  r2d2::Pool::builder()
    .build(manager)
    .map_err(|e| Error::Storage(e.to_string()))
}

pub fn run_migrations(pool: &DbPool) -> Result<()> {
  let mut conn = pool.get()?;
  let applied = conn.run_pending_migrations(MIGRATIONS)
    .map_err(|e| Error::Storage(format!("failed to run migrations: {}", e)))?;
  info!("Applied {} migrations.", applied.len());
  Ok(())
}

fn to_i64(v: u64) -> Result<i64> {
  i64::try_from(v).map_err(|_| Error::Storage(format!("{} does not fit a bigint column", v)))
}

fn to_u64(v: i64) -> Result<u64> {
  u64::try_from(v).map_err(|_| Error::Storage(format!("negative value {} in unsigned column", v)))
}

fn to_u32(v: i32) -> Result<u32> {
  u32::try_from(v).map_err(|_| Error::Storage(format!("negative value {} in unsigned column", v)))
}

fn parse_group(name: &str) -> Result<Group> {
  name.parse::<Group>().map_err(Error::Storage)
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = source_checkpoints)]
struct CheckpointRow {
  source_id: String,
  last_processed_block: i64,
  last_processed_ref: String,
  updated_at: NaiveDateTime,
}

impl CheckpointRow {
  fn from_model(c: &SourceCheckpoint) -> Result<Self> {
    Ok(Self {
      source_id: c.source_id.clone(),
      last_processed_block: to_i64(c.last_processed_block)?,
      last_processed_ref: c.last_processed_ref.clone(),
      updated_at: chrono::Utc::now().naive_utc(),
    })
  }

  fn into_model(self) -> Result<SourceCheckpoint> {
    Ok(SourceCheckpoint {
      source_id: self.source_id,
      last_processed_block: to_u64(self.last_processed_block)?,
      last_processed_ref: self.last_processed_ref,
    })
  }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = raw_event_facts)]
struct FactRow {
  tx_ref: String,
  log_index: i32,
  source_id: String,
  block_number: i64,
  event_name: String,
  decoded_args: Value,
}

impl FactRow {
  fn from_model(f: &RawEventFact) -> Result<Self> {
    Ok(Self {
      tx_ref: f.tx_ref.clone(),
      log_index: i32::try_from(f.log_index).map_err(|_| Error::Storage("log index overflow".to_owned()))?,
      source_id: f.source_id.clone(),
      block_number: to_i64(f.block_number)?,
      event_name: f.event_name.clone(),
      decoded_args: f.decoded_args.clone(),
    })
  }

  fn into_model(self) -> Result<RawEventFact> {
    Ok(RawEventFact {
      source_id: self.source_id,
      block_number: to_u64(self.block_number)?,
      tx_ref: self.tx_ref,
      log_index: to_u32(self.log_index)?,
      event_name: self.event_name,
      decoded_args: self.decoded_args,
    })
  }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = revenue_epochs)]
struct EpochRow {
  epoch_id: i64,
  total_revenue: BigDecimal,
  opc_amount: Option<BigDecimal>,
  alpha_amount: Option<BigDecimal>,
  beta_amount: Option<BigDecimal>,
  gamma_amount: Option<BigDecimal>,
  delta_amount: Option<BigDecimal>,
  remainder: Option<BigDecimal>,
  source_block: i64,
  source_time: NaiveDateTime,
  tx_ref: String,
}

impl EpochRow {
  fn from_model(e: &RevenueEpoch) -> Result<Self> {
    let split = e.split.as_ref();
    Ok(Self {
      epoch_id: to_i64(e.epoch_id)?,
      total_revenue: from_u128(e.total_revenue),
      opc_amount: split.map(|s| from_u128(s.opc)),
      alpha_amount: split.map(|s| from_u128(s.alpha)),
      beta_amount: split.map(|s| from_u128(s.beta)),
      gamma_amount: split.map(|s| from_u128(s.gamma)),
      delta_amount: split.map(|s| from_u128(s.delta)),
      remainder: split.map(|s| from_u128(s.remainder)),
      source_block: to_i64(e.source_block)?,
      source_time: e.source_time,
      tx_ref: e.tx_ref.clone(),
    })
  }

  fn into_model(self) -> Result<RevenueEpoch> {
    let total = to_u128(&self.total_revenue)?;
    let split = match (&self.opc_amount, &self.alpha_amount, &self.beta_amount,
                       &self.gamma_amount, &self.delta_amount, &self.remainder) {
      (Some(opc), Some(alpha), Some(beta), Some(gamma), Some(delta), Some(remainder)) => Some(PoolSplit {
        total,
        opc: to_u128(opc)?,
        alpha: to_u128(alpha)?,
        beta: to_u128(beta)?,
        gamma: to_u128(gamma)?,
        delta: to_u128(delta)?,
        remainder: to_u128(remainder)?,
      }),
      _ => None,
    };
    Ok(RevenueEpoch {
      epoch_id: to_u64(self.epoch_id)?,
      total_revenue: total,
      split,
      source_block: to_u64(self.source_block)?,
      source_time: self.source_time,
      tx_ref: self.tx_ref,
    })
  }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = machine_revenues)]
struct MachineRevenueRow {
  epoch_id: i64,
  machine_id: String,
  amount: BigDecimal,
}

impl MachineRevenueRow {
  fn from_model(r: &MachineRevenue) -> Result<Self> {
    Ok(Self { epoch_id: to_i64(r.epoch_id)?, machine_id: r.machine_id.clone(), amount: from_u128(r.amount) })
  }

  fn into_model(self) -> Result<MachineRevenue> {
    Ok(MachineRevenue { machine_id: self.machine_id, epoch_id: to_u64(self.epoch_id)?, amount: to_u128(&self.amount)? })
  }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = staking_snapshots)]
struct StakingRow {
  epoch_id: i64,
  account: String,
  principal: BigDecimal,
  lock_weight: BigDecimal,
  effective_weight: BigDecimal,
  lock_until: Option<NaiveDateTime>,
  created_block: i64,
  created_log_index: i32,
}

impl StakingRow {
  fn from_model(s: &StakingSnapshot) -> Result<Self> {
    Ok(Self {
      epoch_id: to_i64(s.epoch_id)?,
      account: s.account.clone(),
      principal: from_u128(s.principal),
      lock_weight: from_u128(s.lock_weight),
      effective_weight: from_u128(s.effective_weight),
      lock_until: s.lock_until,
      created_block: to_i64(s.created_at.block)?,
      created_log_index: s.created_at.log_index as i32,
    })
  }

  fn into_model(self) -> Result<StakingSnapshot> {
    Ok(StakingSnapshot {
      epoch_id: to_u64(self.epoch_id)?,
      account: self.account,
      principal: to_u128(&self.principal)?,
      lock_weight: to_u128(&self.lock_weight)?,
      effective_weight: to_u128(&self.effective_weight)?,
      lock_until: self.lock_until,
      created_at: PositionOrder { block: to_u64(self.created_block)?, log_index: to_u32(self.created_log_index)? },
    })
  }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = ownership_snapshots)]
struct OwnershipRow {
  epoch_id: i64,
  account: String,
  asset_id: String,
  share_basis_points: i32,
  units_held: BigDecimal,
  effective_share: BigDecimal,
  created_block: i64,
  created_log_index: i32,
}

impl OwnershipRow {
  fn from_model(s: &OwnershipSnapshot) -> Result<Self> {
    Ok(Self {
      epoch_id: to_i64(s.epoch_id)?,
      account: s.account.clone(),
      asset_id: s.asset_id.clone(),
      share_basis_points: s.share_basis_points as i32,
      units_held: from_u128(s.units_held),
      effective_share: from_u128(s.effective_share),
      created_block: to_i64(s.created_at.block)?,
      created_log_index: s.created_at.log_index as i32,
    })
  }

  fn into_model(self) -> Result<OwnershipSnapshot> {
    Ok(OwnershipSnapshot {
      epoch_id: to_u64(self.epoch_id)?,
      account: self.account,
      asset_id: self.asset_id,
      share_basis_points: to_u32(self.share_basis_points)?,
      units_held: to_u128(&self.units_held)?,
      effective_share: to_u128(&self.effective_share)?,
      created_at: PositionOrder { block: to_u64(self.created_block)?, log_index: to_u32(self.created_log_index)? },
    })
  }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = machine_holder_snapshots)]
struct HolderRow {
  epoch_id: i64,
  account: String,
  machine_id: String,
  revenue_weight: BigDecimal,
  created_block: i64,
  created_log_index: i32,
}

impl HolderRow {
  fn from_model(s: &MachineHolderSnapshot) -> Result<Self> {
    Ok(Self {
      epoch_id: to_i64(s.epoch_id)?,
      account: s.account.clone(),
      machine_id: s.machine_id.clone(),
      revenue_weight: from_u128(s.revenue_weight),
      created_block: to_i64(s.created_at.block)?,
      created_log_index: s.created_at.log_index as i32,
    })
  }

  fn into_model(self) -> Result<MachineHolderSnapshot> {
    Ok(MachineHolderSnapshot {
      epoch_id: to_u64(self.epoch_id)?,
      account: self.account,
      machine_id: self.machine_id,
      revenue_weight: to_u128(&self.revenue_weight)?,
      created_at: PositionOrder { block: to_u64(self.created_block)?, log_index: to_u32(self.created_log_index)? },
    })
  }
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = merkle_commitments)]
#[diesel(treat_none_as_null = true)]
struct CommitmentRow {
  epoch_id: i64,
  group_name: String,
  root_hash: String,
  total_amount: BigDecimal,
  leaf_count: i32,
  published: bool,
  publish_ref: Option<String>,
  submitted_at: Option<NaiveDateTime>,
  published_at: Option<NaiveDateTime>,
}

impl CommitmentRow {
  fn from_model(c: &MerkleCommitment) -> Result<Self> {
    Ok(Self {
      epoch_id: to_i64(c.epoch_id)?,
      group_name: c.group.to_string(),
      root_hash: c.root_hash.clone(),
      total_amount: from_u128(c.total_amount),
      leaf_count: i32::try_from(c.leaf_count).map_err(|_| Error::Storage("leaf count overflow".to_owned()))?,
      published: c.published,
      publish_ref: c.publish_ref.clone(),
      submitted_at: c.submitted_at,
      published_at: None,
    })
  }

  fn into_model(self) -> Result<MerkleCommitment> {
    Ok(MerkleCommitment {
      epoch_id: to_u64(self.epoch_id)?,
      group: parse_group(&self.group_name)?,
      root_hash: self.root_hash,
      total_amount: to_u128(&self.total_amount)?,
      leaf_count: to_u32(self.leaf_count)?,
      published: self.published,
      publish_ref: self.publish_ref,
      submitted_at: self.submitted_at,
    })
  }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = claim_entries)]
struct ClaimRow {
  epoch_id: i64,
  group_name: String,
  account: String,
  amount: BigDecimal,
  leaf_hash: String,
  proof: Value,
  claimed: bool,
  claim_ref: Option<String>,
  claimed_at: Option<NaiveDateTime>,
}

impl ClaimRow {
  fn from_model(c: &ClaimEntry) -> Result<Self> {
    Ok(Self {
      epoch_id: to_i64(c.epoch_id)?,
      group_name: c.group.to_string(),
      account: c.account.clone(),
      amount: from_u128(c.amount),
      leaf_hash: c.leaf_hash.clone(),
      proof: Value::from(c.proof.clone()),
      claimed: c.claimed,
      claim_ref: c.claim_ref.clone(),
      claimed_at: c.claimed_at,
    })
  }

  fn into_model(self) -> Result<ClaimEntry> {
    let proof: Vec<String> = serde_json::from_value(self.proof)
      .map_err(|e| Error::Storage(format!("malformed proof: {}", e)))?;
    Ok(ClaimEntry {
      epoch_id: to_u64(self.epoch_id)?,
      group: parse_group(&self.group_name)?,
      account: self.account,
      amount: to_u128(&self.amount)?,
      leaf_hash: self.leaf_hash,
      proof,
      claimed: self.claimed,
      claim_ref: self.claim_ref,
      claimed_at: self.claimed_at,
    })
  }
}

fn collect<R, M>(rows: Vec<R>, f: fn(R) -> Result<M>) -> Result<Vec<M>> {
  rows.into_iter().map(f).collect()
}

#[derive(Clone)]
pub struct PgStore {
  pool: DbPool,
}

impl PgStore {
  pub fn new(pool: DbPool) -> Self {
    Self { pool }
  }

  fn conn(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>> {
    Ok(self.pool.get()?)
  }
}

impl Store for PgStore {
  fn checkpoint(&self, id: &str) -> Result<Option<SourceCheckpoint>> {
    use crate::schema::source_checkpoints::dsl::*;
    let mut conn = self.conn()?;
    source_checkpoints
      .filter(source_id.eq(id))
      .first::<CheckpointRow>(&mut conn)
      .optional()?
      .map(CheckpointRow::into_model)
      .transpose()
  }

  fn checkpoints(&self) -> Result<Vec<SourceCheckpoint>> {
    use crate::schema::source_checkpoints::dsl::*;
    let mut conn = self.conn()?;
    let rows = source_checkpoints.order(source_id.asc()).load::<CheckpointRow>(&mut conn)?;
    collect(rows, CheckpointRow::into_model)
  }

  fn commit_batch(&self, batch: &IngestBatch) -> Result<BatchSummary> {
    let mut conn = self.conn()?;
    conn.transaction::<_, Error, _>(|conn| {
      // row lock serializes writers of the same source
      let existing = source_checkpoints::table
        .filter(source_checkpoints::source_id.eq(&batch.source_id))
        .for_update()
        .first::<CheckpointRow>(conn)
        .optional()?
        .map(CheckpointRow::into_model)
        .transpose()?;
      check_checkpoint_advance(existing.as_ref(), &batch.checkpoint)?;

      for epoch in batch.epochs.iter() {
        let found = revenue_epochs::table
          .filter(revenue_epochs::epoch_id.eq(to_i64(epoch.epoch_id)?))
          .for_update()
          .first::<EpochRow>(conn)
          .optional()?;
        match found {
          Some(row) => check_epoch_repost(&batch.source_id, &row.into_model()?, epoch)?,
          None => {
            diesel::insert_into(revenue_epochs::table)
              .values(&EpochRow::from_model(epoch)?)
              .execute(conn)?;
          },
        }
      }

      for revenue in batch.machine_revenues.iter() {
        let found = machine_revenues::table
          .filter(machine_revenues::epoch_id.eq(to_i64(revenue.epoch_id)?))
          .filter(machine_revenues::machine_id.eq(&revenue.machine_id))
          .first::<MachineRevenueRow>(conn)
          .optional()?;
        match found {
          Some(row) => check_machine_revenue(&batch.source_id, &row.into_model()?, revenue)?,
          None => {
            diesel::insert_into(machine_revenues::table)
              .values(&MachineRevenueRow::from_model(revenue)?)
              .execute(conn)?;
          },
        }
      }

      let rows = batch.facts.iter().map(FactRow::from_model).collect::<Result<Vec<_>>>()?;
      let mut inserted = 0;
      for chunk in rows.chunks(INSERT_CHUNK) {
        inserted += diesel::insert_into(raw_event_facts::table)
          .values(chunk)
          .on_conflict((raw_event_facts::tx_ref, raw_event_facts::log_index))
          .do_nothing()
          .execute(conn)?;
      }

      let mut summary = BatchSummary { new_facts: inserted, ..BatchSummary::default() };
      for claim in batch.claims.iter() {
        let key_epoch = to_i64(claim.epoch_id)?;
        let key_group = claim.group.to_string();
        let updated = diesel::update(claim_entries::table
          .filter(claim_entries::epoch_id.eq(key_epoch))
          .filter(claim_entries::group_name.eq(&key_group))
          .filter(claim_entries::account.eq(&claim.account))
          .filter(claim_entries::claimed.eq(false)))
          .set((
            claim_entries::claimed.eq(true),
            claim_entries::claim_ref.eq(Some(claim.claim_ref.as_str())),
            claim_entries::claimed_at.eq(Some(claim.claimed_at)),
          ))
          .execute(conn)?;
        if updated == 1 {
          summary.claims_applied += 1;
          continue
        }
        let exists = claim_entries::table
          .filter(claim_entries::epoch_id.eq(key_epoch))
          .filter(claim_entries::group_name.eq(&key_group))
          .filter(claim_entries::account.eq(&claim.account))
          .select(claim_entries::claimed)
          .first::<bool>(conn)
          .optional()?;
        if exists.is_none() {
          summary.claims_waiting += 1;
        }
      }

      let checkpoint = CheckpointRow::from_model(&batch.checkpoint)?;
      diesel::insert_into(source_checkpoints::table)
        .values(&checkpoint)
        .on_conflict(source_checkpoints::source_id)
        .do_update()
        .set(&checkpoint)
        .execute(conn)?;

      Ok(summary)
    })
  }

  fn facts_up_to(&self, block: u64) -> Result<Vec<RawEventFact>> {
    use crate::schema::raw_event_facts::dsl::*;
    let mut conn = self.conn()?;
    let rows = raw_event_facts
      .filter(block_number.le(to_i64(block)?))
      .order((block_number.asc(), log_index.asc()))
      .load::<FactRow>(&mut conn)?;
    collect(rows, FactRow::into_model)
  }

  fn facts_named(&self, name: &str) -> Result<Vec<RawEventFact>> {
    use crate::schema::raw_event_facts::dsl::*;
    let mut conn = self.conn()?;
    let rows = raw_event_facts
      .filter(event_name.eq(name))
      .order((block_number.asc(), log_index.asc()))
      .load::<FactRow>(&mut conn)?;
    collect(rows, FactRow::into_model)
  }

  fn revenue_epoch(&self, id: u64) -> Result<Option<RevenueEpoch>> {
    use crate::schema::revenue_epochs::dsl::*;
    let mut conn = self.conn()?;
    revenue_epochs
      .filter(epoch_id.eq(to_i64(id)?))
      .first::<EpochRow>(&mut conn)
      .optional()?
      .map(EpochRow::into_model)
      .transpose()
  }

  fn revenue_epochs(&self) -> Result<Vec<RevenueEpoch>> {
    use crate::schema::revenue_epochs::dsl::*;
    let mut conn = self.conn()?;
    let rows = revenue_epochs.order(epoch_id.asc()).load::<EpochRow>(&mut conn)?;
    collect(rows, EpochRow::into_model)
  }

  fn set_epoch_split(&self, id: u64, split: &PoolSplit) -> Result<()> {
    use crate::schema::revenue_epochs::dsl::*;
    let mut conn = self.conn()?;
    conn.transaction::<_, Error, _>(|conn| {
      let epoch = revenue_epochs
        .filter(epoch_id.eq(to_i64(id)?))
        .for_update()
        .first::<EpochRow>(conn)
        .optional()?
        .ok_or_else(|| Error::NotReady(format!("epoch {} has not been posted", id)))?
        .into_model()?;
      if let Some(existing) = epoch.split {
        if existing != *split {
          return Err(Error::Invariant(format!("epoch {} split already populated differently", id)))
        }
        return Ok(())
      }
      diesel::update(revenue_epochs.filter(epoch_id.eq(to_i64(id)?)))
        .set((
          opc_amount.eq(Some(from_u128(split.opc))),
          alpha_amount.eq(Some(from_u128(split.alpha))),
          beta_amount.eq(Some(from_u128(split.beta))),
          gamma_amount.eq(Some(from_u128(split.gamma))),
          delta_amount.eq(Some(from_u128(split.delta))),
          remainder.eq(Some(from_u128(split.remainder))),
        ))
        .execute(conn)?;
      Ok(())
    })
  }

  fn machine_revenues(&self, id: u64) -> Result<Vec<MachineRevenue>> {
    use crate::schema::machine_revenues::dsl::*;
    let mut conn = self.conn()?;
    let rows = machine_revenues
      .filter(epoch_id.eq(to_i64(id)?))
      .order(machine_id.asc())
      .load::<MachineRevenueRow>(&mut conn)?;
    collect(rows, MachineRevenueRow::into_model)
  }

  fn replace_staking_snapshot(&self, id: u64, rows: &[StakingSnapshot]) -> Result<()> {
    let rows = rows.iter().map(StakingRow::from_model).collect::<Result<Vec<_>>>()?;
    let mut conn = self.conn()?;
    conn.transaction::<_, Error, _>(|conn| {
      diesel::delete(staking_snapshots::table.filter(staking_snapshots::epoch_id.eq(to_i64(id)?)))
        .execute(conn)?;
      for chunk in rows.chunks(INSERT_CHUNK) {
        diesel::insert_into(staking_snapshots::table).values(chunk).execute(conn)?;
      }
      Ok(())
    })
  }

  fn staking_snapshot(&self, id: u64) -> Result<Vec<StakingSnapshot>> {
    use crate::schema::staking_snapshots::dsl::*;
    let mut conn = self.conn()?;
    let rows = staking_snapshots
      .filter(epoch_id.eq(to_i64(id)?))
      .order(account.asc())
      .load::<StakingRow>(&mut conn)?;
    collect(rows, StakingRow::into_model)
  }

  fn replace_ownership_snapshot(&self, id: u64, rows: &[OwnershipSnapshot]) -> Result<()> {
    let rows = rows.iter().map(OwnershipRow::from_model).collect::<Result<Vec<_>>>()?;
    let mut conn = self.conn()?;
    conn.transaction::<_, Error, _>(|conn| {
      diesel::delete(ownership_snapshots::table.filter(ownership_snapshots::epoch_id.eq(to_i64(id)?)))
        .execute(conn)?;
      for chunk in rows.chunks(INSERT_CHUNK) {
        diesel::insert_into(ownership_snapshots::table).values(chunk).execute(conn)?;
      }
      Ok(())
    })
  }

  fn ownership_snapshot(&self, id: u64) -> Result<Vec<OwnershipSnapshot>> {
    use crate::schema::ownership_snapshots::dsl::*;
    let mut conn = self.conn()?;
    let rows = ownership_snapshots
      .filter(epoch_id.eq(to_i64(id)?))
      .order((account.asc(), asset_id.asc()))
      .load::<OwnershipRow>(&mut conn)?;
    collect(rows, OwnershipRow::into_model)
  }

  fn replace_holder_snapshot(&self, id: u64, rows: &[MachineHolderSnapshot]) -> Result<()> {
    let rows = rows.iter().map(HolderRow::from_model).collect::<Result<Vec<_>>>()?;
    let mut conn = self.conn()?;
    conn.transaction::<_, Error, _>(|conn| {
      diesel::delete(machine_holder_snapshots::table.filter(machine_holder_snapshots::epoch_id.eq(to_i64(id)?)))
        .execute(conn)?;
      for chunk in rows.chunks(INSERT_CHUNK) {
        diesel::insert_into(machine_holder_snapshots::table).values(chunk).execute(conn)?;
      }
      Ok(())
    })
  }

  fn holder_snapshot(&self, id: u64) -> Result<Vec<MachineHolderSnapshot>> {
    use crate::schema::machine_holder_snapshots::dsl::*;
    let mut conn = self.conn()?;
    let rows = machine_holder_snapshots
      .filter(epoch_id.eq(to_i64(id)?))
      .order((account.asc(), machine_id.asc()))
      .load::<HolderRow>(&mut conn)?;
    collect(rows, HolderRow::into_model)
  }

  fn commitment(&self, id: u64, group: Group) -> Result<Option<MerkleCommitment>> {
    use crate::schema::merkle_commitments::dsl::*;
    let mut conn = self.conn()?;
    merkle_commitments
      .filter(epoch_id.eq(to_i64(id)?))
      .filter(group_name.eq(group.to_string()))
      .first::<CommitmentRow>(&mut conn)
      .optional()?
      .map(CommitmentRow::into_model)
      .transpose()
  }

  fn commitments(&self, id: u64) -> Result<Vec<MerkleCommitment>> {
    use crate::schema::merkle_commitments::dsl::*;
    let mut conn = self.conn()?;
    let rows = merkle_commitments
      .filter(epoch_id.eq(to_i64(id)?))
      .load::<CommitmentRow>(&mut conn)?;
    let mut out = collect(rows, CommitmentRow::into_model)?;
    out.sort_by_key(|c| c.group);
    Ok(out)
  }

  fn unpublished_commitments(&self) -> Result<Vec<MerkleCommitment>> {
    use crate::schema::merkle_commitments::dsl::*;
    let mut conn = self.conn()?;
    let rows = merkle_commitments
      .filter(published.eq(false))
      .load::<CommitmentRow>(&mut conn)?;
    let mut out = collect(rows, CommitmentRow::into_model)?;
    out.sort_by_key(|c| (c.epoch_id, c.group));
    Ok(out)
  }

  fn replace_commitment(&self, commitment: &MerkleCommitment, entries: &[ClaimEntry]) -> Result<()> {
    let row = CommitmentRow::from_model(commitment)?;
    let claim_rows = entries.iter().map(ClaimRow::from_model).collect::<Result<Vec<_>>>()?;
    let key_epoch = to_i64(commitment.epoch_id)?;
    let key_group = commitment.group.to_string();
    let mut conn = self.conn()?;
    conn.transaction::<_, Error, _>(|conn| {
      let existing = merkle_commitments::table
        .filter(merkle_commitments::epoch_id.eq(key_epoch))
        .filter(merkle_commitments::group_name.eq(&key_group))
        .for_update()
        .first::<CommitmentRow>(conn)
        .optional()?;
      if existing.map(|c| c.published).unwrap_or(false) {
        return Err(PolicyViolation::CommitmentPublished {
          epoch_id: commitment.epoch_id,
          group: commitment.group,
        }.into())
      }
      // row locks keep claims out until the entries are replaced
      let claimed = claim_entries::table
        .filter(claim_entries::epoch_id.eq(key_epoch))
        .filter(claim_entries::group_name.eq(&key_group))
        .select(claim_entries::claimed)
        .for_update()
        .load::<bool>(conn)?;
      if claimed.into_iter().any(|c| c) {
        return Err(PolicyViolation::ClaimsRecorded {
          epoch_id: commitment.epoch_id,
          group: commitment.group,
        }.into())
      }

      diesel::delete(claim_entries::table
        .filter(claim_entries::epoch_id.eq(key_epoch))
        .filter(claim_entries::group_name.eq(&key_group)))
        .execute(conn)?;
      diesel::insert_into(merkle_commitments::table)
        .values(&row)
        .on_conflict((merkle_commitments::epoch_id, merkle_commitments::group_name))
        .do_update()
        .set(&row)
        .execute(conn)?;
      for chunk in claim_rows.chunks(INSERT_CHUNK) {
        diesel::insert_into(claim_entries::table).values(chunk).execute(conn)?;
      }
      Ok(())
    })
  }

  fn set_publish_ref(&self, id: u64, group: Group, reference: &str) -> Result<()> {
    use crate::schema::merkle_commitments::dsl::*;
    let mut conn = self.conn()?;
    let updated = diesel::update(merkle_commitments
      .filter(epoch_id.eq(to_i64(id)?))
      .filter(group_name.eq(group.to_string()))
      .filter(published.eq(false)))
      .set((publish_ref.eq(Some(reference)), submitted_at.eq(Some(chrono::Utc::now().naive_utc()))))
      .execute(&mut conn)?;
    if updated == 1 {
      return Ok(())
    }
    match self.commitment(id, group)? {
      Some(_) => Err(PolicyViolation::CommitmentPublished { epoch_id: id, group }.into()),
      None => Err(PolicyViolation::CommitmentNotFound { epoch_id: id, group }.into()),
    }
  }

  fn mark_published(&self, id: u64, group: Group, reference: &str) -> Result<bool> {
    use crate::schema::merkle_commitments::dsl::*;
    let mut conn = self.conn()?;
    // compare-and-set on the flag
    let updated = diesel::update(merkle_commitments
      .filter(epoch_id.eq(to_i64(id)?))
      .filter(group_name.eq(group.to_string()))
      .filter(published.eq(false)))
      .set((
        published.eq(true),
        publish_ref.eq(Some(reference)),
        published_at.eq(Some(chrono::Utc::now().naive_utc())),
      ))
      .execute(&mut conn)?;
    if updated == 1 {
      return Ok(true)
    }
    match self.commitment(id, group)? {
      Some(_) => Ok(false),
      None => Err(PolicyViolation::CommitmentNotFound { epoch_id: id, group }.into()),
    }
  }

  fn claim_entry(&self, id: u64, group: Group, who: &str) -> Result<Option<ClaimEntry>> {
    use crate::schema::claim_entries::dsl::*;
    let mut conn = self.conn()?;
    claim_entries
      .filter(epoch_id.eq(to_i64(id)?))
      .filter(group_name.eq(group.to_string()))
      .filter(account.eq(who))
      .first::<ClaimRow>(&mut conn)
      .optional()?
      .map(ClaimRow::into_model)
      .transpose()
  }

  fn claim_entries(&self, id: u64, group: Group) -> Result<Vec<ClaimEntry>> {
    use crate::schema::claim_entries::dsl::*;
    let mut conn = self.conn()?;
    let rows = claim_entries
      .filter(epoch_id.eq(to_i64(id)?))
      .filter(group_name.eq(group.to_string()))
      .order(account.asc())
      .load::<ClaimRow>(&mut conn)?;
    collect(rows, ClaimRow::into_model)
  }

  fn mark_claimed(
    &self,
    id: u64,
    group: Group,
    who: &str,
    reference: &str,
    at: NaiveDateTime,
  ) -> Result<ClaimTransition> {
    use crate::schema::claim_entries::dsl::*;
    let mut conn = self.conn()?;
    let updated = diesel::update(claim_entries
      .filter(epoch_id.eq(to_i64(id)?))
      .filter(group_name.eq(group.to_string()))
      .filter(account.eq(who))
      .filter(claimed.eq(false)))
      .set((claimed.eq(true), claim_ref.eq(Some(reference)), claimed_at.eq(Some(at))))
      .execute(&mut conn)?;
    if updated == 1 {
      return Ok(ClaimTransition::Claimed)
    }
    match self.claim_entry(id, group, who)? {
      Some(_) => Ok(ClaimTransition::AlreadyClaimed),
      None => Ok(ClaimTransition::NotFound),
    }
  }
}
