use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::Display;

/// Denominator for every basis-point ratio.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// The all-zero address used as mint source / burn sink.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Beneficiary groups that receive a Merkle commitment per epoch.
#[derive(Display, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Group {
  /// stakers
  Alpha,
  /// machine-token holders
  Beta,
  /// fractional-ownership holders
  Gamma,
}

impl Group {
  pub const ALL: [Group; 3] = [Group::Alpha, Group::Beta, Group::Gamma];

  /// Index used by the distributor contract.
  pub fn index(&self) -> u8 {
    match *self {
      Group::Alpha => 0,
      Group::Beta => 1,
      Group::Gamma => 2,
    }
  }

  pub fn from_index(index: u8) -> Option<Group> {
    match index {
      0 => Some(Group::Alpha),
      1 => Some(Group::Beta),
      2 => Some(Group::Gamma),
      _ => None,
    }
  }
}

impl FromStr for Group {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "alpha" => Ok(Group::Alpha),
      "beta" => Ok(Group::Beta),
      "gamma" => Ok(Group::Gamma),
      _ => Err(format!("unknown group '{}'", s)),
    }
  }
}

/// The contract a source watches, which fixes the events it can emit.
#[derive(Display, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
  Revenue,
  Staking,
  MachineToken,
  Fractional,
  Distributor,
}

impl SourceKind {
  /// Whether snapshots depend on this source having passed the epoch boundary.
  pub fn feeds_snapshots(&self) -> bool {
    !matches!(self, SourceKind::Distributor)
  }
}

/// Event signatures per source kind. Indexed parameters come first.
pub mod signatures {
  pub const REVENUE_POSTED: &str = "RevenuePosted(uint256,uint256,uint256)";
  pub const MACHINE_REVENUE_REPORTED: &str = "MachineRevenueReported(uint256,uint256,uint256)";
  pub const POSITION_OPENED: &str = "PositionOpened(uint256,address,uint256,uint256,uint256)";
  pub const POSITION_CLOSED: &str = "PositionClosed(uint256)";
  pub const MACHINE_TRANSFERRED: &str = "MachineTransferred(uint256,address,address)";
  pub const MACHINE_DECOMMISSIONED: &str = "MachineDecommissioned(uint256)";
  pub const ASSET_REGISTERED: &str = "AssetRegistered(uint256,uint256,uint256)";
  pub const SHARES_TRANSFERRED: &str = "SharesTransferred(uint256,address,address,uint256)";
  pub const ASSET_DECOMMISSIONED: &str = "AssetDecommissioned(uint256)";
  pub const ROOT_SUBMITTED: &str = "RootSubmitted(uint256,uint8,bytes32)";
  pub const CLAIMED: &str = "Claimed(uint256,uint8,address,uint256)";

  /// Distributor calls.
  pub const SUBMIT_ROOT: &str = "submitRoot(uint256,uint8,bytes32)";
  pub const MERKLE_ROOTS: &str = "merkleRoots(uint256,uint8)";
}

/// Lifecycle of a submitted commitment transaction.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
  Pending,
  Confirmed,
  Failed,
  /// The node no longer knows the transaction, e.g. evicted or replaced.
  Dropped,
}
