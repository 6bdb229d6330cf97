//! Pro-rata allocation of one pool among a weighted beneficiary set.

use serde::Serialize;
use std::collections::HashSet;

use crate::errors::{Error, Result};
use crate::models::PositionOrder;
use crate::utils::{checked_sum, mul_div_floor, u128_string};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beneficiary {
  pub account: String,
  pub weight: u128,
  /// Creation order of the account's earliest eligible position.
  pub created_at: PositionOrder,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Reward {
  pub account: String,
  #[serde(with = "u128_string")]
  pub amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
  pub pool: u128,
  pub total_weight: u128,
  /// floor(pool * weight / total_weight) per beneficiary, before the remainder.
  pub shares: Vec<Reward>,
  /// pool - sum(shares).
  pub remainder: u128,
  pub remainder_account: Option<String>,
  /// Final payouts: shares with the remainder folded in. Zero amounts dropped.
  pub rewards: Vec<Reward>,
}

impl Allocation {
  /// Amount left without a recipient. Non-zero only when nobody had weight.
  pub fn unallocated(&self) -> u128 {
    if self.remainder_account.is_some() { 0 } else { self.remainder }
  }
}

pub fn allocate(pool: u128, beneficiaries: &[Beneficiary]) -> Result<Allocation> {
  let mut seen = HashSet::new();
  for b in beneficiaries {
    if !seen.insert(b.account.as_str()) {
      return Err(Error::Invariant(format!("beneficiary {} listed twice", b.account)))
    }
  }

  let eligible: Vec<&Beneficiary> = beneficiaries.iter().filter(|b| b.weight > 0).collect();
  let total_weight = checked_sum(eligible.iter().map(|b| b.weight))?;

  if total_weight == 0 {
    return Ok(Allocation {
      pool,
      total_weight,
      shares: vec![],
      remainder: pool,
      remainder_account: None,
      rewards: vec![],
    })
  }

  let shares = eligible.iter()
    .map(|b| Ok(Reward { account: b.account.clone(), amount: mul_div_floor(pool, b.weight, total_weight)? }))
    .collect::<Result<Vec<Reward>>>()?;
  let allocated = checked_sum(shares.iter().map(|r| r.amount))?;
  let remainder = pool.checked_sub(allocated)
    .ok_or_else(|| Error::Invariant(format!("shares {} exceed pool {}", allocated, pool)))?;

  // earliest position wins, account breaks ties
  let earliest = eligible.iter()
    .min_by(|a, b| (a.created_at, &a.account).cmp(&(b.created_at, &b.account)))
    .map(|b| b.account.clone());

  let mut rewards = shares.clone();
  if let Some(account) = earliest.as_ref() {
    if let Some(r) = rewards.iter_mut().find(|r| &r.account == account) {
      r.amount += remainder;
    }
  }
  rewards.retain(|r| r.amount > 0);

  let paid = checked_sum(rewards.iter().map(|r| r.amount))?;
  if paid != pool {
    return Err(Error::Invariant(format!("allocation pays {} of pool {}", paid, pool)))
  }

  Ok(Allocation { pool, total_weight, shares, remainder, remainder_account: earliest, rewards })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn beneficiary(account: &str, weight: u128, block: u64, log_index: u32) -> Beneficiary {
    Beneficiary { account: account.to_owned(), weight, created_at: PositionOrder { block, log_index } }
  }

  #[test]
  fn two_stakers_split_exactly() {
    let a = allocate(1_000, &[
      beneficiary("0xa", 100 * 1_000, 10, 0),
      beneficiary("0xb", 100 * 3_000, 11, 0),
    ]).unwrap();
    assert_eq!(a.rewards, vec![
      Reward { account: "0xa".to_owned(), amount: 250 },
      Reward { account: "0xb".to_owned(), amount: 750 },
    ]);
    assert_eq!(a.remainder, 0);
    assert_eq!(a.unallocated(), 0);
  }

  #[test]
  fn nobody_eligible_leaves_pool_unallocated() {
    let a = allocate(1_000, &[]).unwrap();
    assert!(a.rewards.is_empty());
    assert_eq!(a.unallocated(), 1_000);

    let a = allocate(1_000, &[beneficiary("0xa", 0, 1, 0)]).unwrap();
    assert!(a.rewards.is_empty());
    assert_eq!(a.unallocated(), 1_000);
  }

  #[test]
  fn remainder_goes_to_earliest_position() {
    let a = allocate(10, &[
      beneficiary("0xc", 1, 5, 2),
      beneficiary("0xa", 1, 7, 0),
      beneficiary("0xb", 1, 5, 1),
    ]).unwrap();
    assert_eq!(a.remainder, 1);
    assert_eq!(a.remainder_account.as_deref(), Some("0xb"));
    let b = a.rewards.iter().find(|r| r.account == "0xb").unwrap();
    assert_eq!(b.amount, 4);
  }

  #[test]
  fn equal_creation_order_falls_back_to_account() {
    let a = allocate(5, &[
      beneficiary("0xd", 1, 5, 1),
      beneficiary("0xc", 1, 5, 1),
    ]).unwrap();
    assert_eq!(a.remainder_account.as_deref(), Some("0xc"));
  }

  #[test]
  fn zero_weight_is_excluded_from_the_sum() {
    let a = allocate(900, &[
      beneficiary("0xa", 0, 1, 0),
      beneficiary("0xb", 2, 2, 0),
      beneficiary("0xc", 1, 3, 0),
    ]).unwrap();
    assert_eq!(a.total_weight, 3);
    assert!(a.shares.iter().all(|r| r.account != "0xa"));
    assert_eq!(a.rewards.len(), 2);
    // the earliest eligible position, not the zero-weight one, gets the remainder
    assert_eq!(a.remainder_account.as_deref(), Some("0xb"));
  }

  #[test]
  fn rejects_duplicate_accounts() {
    assert!(allocate(1, &[beneficiary("0xa", 1, 1, 0), beneficiary("0xa", 2, 2, 0)]).is_err());
  }

  #[test]
  fn shares_are_floors_and_sum_with_remainder() {
    let mut x: u128 = 7;
    for round in 0..300u32 {
      let mut set = vec![];
      for i in 0..(round % 17 + 1) {
        x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        set.push(beneficiary(&format!("0x{:04x}", i), (x >> 64) % 1_000_000_007 + 1, u64::from(i % 3), i));
      }
      let pool = x % 1_000_000_000_000_000_000_000;
      let a = allocate(pool, &set).unwrap();
      let shares: u128 = a.shares.iter().map(|r| r.amount).sum();
      assert_eq!(shares + a.remainder, pool);
      for (share, b) in a.shares.iter().zip(set.iter()) {
        assert_eq!(share.amount, mul_div_floor(pool, b.weight, a.total_weight).unwrap());
      }
      let paid: u128 = a.rewards.iter().map(|r| r.amount).sum();
      assert_eq!(paid, pool);
    }
  }
}
