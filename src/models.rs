use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::constants::Group;
use crate::utils::u128_string;

/// Last block fully processed for one event source.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceCheckpoint {
  pub source_id: String,
  pub last_processed_block: u64,
  /// Block hash at `last_processed_block`, used to detect reorgs.
  pub last_processed_ref: String,
}

/// A decoded log, keyed by (tx_ref, log_index).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawEventFact {
  pub source_id: String,
  pub block_number: u64,
  pub tx_ref: String,
  pub log_index: u32,
  pub event_name: String,
  pub decoded_args: Value,
}

impl RawEventFact {
  pub fn order(&self) -> PositionOrder {
    PositionOrder { block: self.block_number, log_index: self.log_index }
  }
}

/// Chain position of a fact, used as creation order.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PositionOrder {
  pub block: u64,
  pub log_index: u32,
}

impl fmt::Display for PositionOrder {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}:{}", self.block, self.log_index)
  }
}

/// The five pools of an epoch. `opc` already includes `remainder`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSplit {
  #[serde(with = "u128_string")]
  pub total: u128,
  #[serde(with = "u128_string")]
  pub opc: u128,
  #[serde(with = "u128_string")]
  pub alpha: u128,
  #[serde(with = "u128_string")]
  pub beta: u128,
  #[serde(with = "u128_string")]
  pub gamma: u128,
  #[serde(with = "u128_string")]
  pub delta: u128,
  #[serde(with = "u128_string")]
  pub remainder: u128,
}

impl PoolSplit {
  pub fn for_group(&self, group: Group) -> u128 {
    match group {
      Group::Alpha => self.alpha,
      Group::Beta => self.beta,
      Group::Gamma => self.gamma,
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RevenueEpoch {
  pub epoch_id: u64,
  #[serde(with = "u128_string")]
  pub total_revenue: u128,
  /// Populated by the distribution calculator.
  pub split: Option<PoolSplit>,
  pub source_block: u64,
  pub source_time: NaiveDateTime,
  pub tx_ref: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MachineRevenue {
  pub machine_id: String,
  pub epoch_id: u64,
  #[serde(with = "u128_string")]
  pub amount: u128,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StakingSnapshot {
  pub epoch_id: u64,
  pub account: String,
  #[serde(with = "u128_string")]
  pub principal: u128,
  #[serde(with = "u128_string")]
  pub lock_weight: u128,
  #[serde(with = "u128_string")]
  pub effective_weight: u128,
  pub lock_until: Option<NaiveDateTime>,
  pub created_at: PositionOrder,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OwnershipSnapshot {
  pub epoch_id: u64,
  pub account: String,
  pub asset_id: String,
  pub share_basis_points: u32,
  #[serde(with = "u128_string")]
  pub units_held: u128,
  #[serde(with = "u128_string")]
  pub effective_share: u128,
  pub created_at: PositionOrder,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MachineHolderSnapshot {
  pub epoch_id: u64,
  pub account: String,
  pub machine_id: String,
  #[serde(with = "u128_string")]
  pub revenue_weight: u128,
  pub created_at: PositionOrder,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MerkleCommitment {
  pub epoch_id: u64,
  pub group: Group,
  pub root_hash: String,
  #[serde(with = "u128_string")]
  pub total_amount: u128,
  pub leaf_count: u32,
  pub published: bool,
  /// Set on submission; `published` flips only once it is confirmed.
  pub publish_ref: Option<String>,
  /// When `publish_ref` was last set.
  pub submitted_at: Option<NaiveDateTime>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClaimEntry {
  pub epoch_id: u64,
  pub group: Group,
  pub account: String,
  #[serde(with = "u128_string")]
  pub amount: u128,
  pub leaf_hash: String,
  pub proof: Vec<String>,
  pub claimed: bool,
  pub claim_ref: Option<String>,
  pub claimed_at: Option<NaiveDateTime>,
}

/// A claim seen on the distributor contract.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
  pub epoch_id: u64,
  pub group: Group,
  pub account: String,
  #[serde(with = "u128_string")]
  pub amount: u128,
  pub claim_ref: String,
  pub claimed_at: NaiveDateTime,
}

/// Result of a once-only claim transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimTransition {
  Claimed,
  AlreadyClaimed,
  NotFound,
}
