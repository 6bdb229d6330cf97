use crate::config::PoolRatios;
use crate::constants::BPS_DENOMINATOR;
use crate::errors::{Error, Result};
use crate::models::PoolSplit;
use crate::utils::{checked_sum, mul_div_floor};

/// Splits `total` into the five pools. Each pool is floored; whatever the
/// floors leave behind goes to the operating-cost pool.
pub fn split_revenue(total: u128, ratios: &PoolRatios) -> Result<PoolSplit> {
  if ratios.total() != BPS_DENOMINATOR {
    return Err(Error::Invariant(format!("pool ratios sum to {} bps", ratios.total())))
  }
  let pool = |bps: u32| mul_div_floor(total, u128::from(bps), BPS_DENOMINATOR);

  let opc = pool(ratios.opc)?;
  let alpha = pool(ratios.alpha)?;
  let beta = pool(ratios.beta)?;
  let gamma = pool(ratios.gamma)?;
  let delta = pool(ratios.delta)?;

  let floored = checked_sum([opc, alpha, beta, gamma, delta])?;
  let remainder = total.checked_sub(floored)
    .ok_or_else(|| Error::Invariant(format!("pools {} exceed revenue {}", floored, total)))?;

  let split = PoolSplit { total, opc: opc + remainder, alpha, beta, gamma, delta, remainder };
  validate_split(&split)?;
  Ok(split)
}

/// The five pools must add up to the total exactly.
pub fn validate_split(split: &PoolSplit) -> Result<()> {
  let sum = checked_sum([split.opc, split.alpha, split.beta, split.gamma, split.delta])?;
  if sum != split.total {
    return Err(Error::Invariant(format!("split sums to {}, expected {}", sum, split.total)))
  }
  if split.remainder > split.opc {
    return Err(Error::Invariant(format!("remainder {} exceeds opc pool {}", split.remainder, split.opc)))
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remainder_goes_to_opc() {
    let split = split_revenue(10_001, &PoolRatios::default()).unwrap();
    assert_eq!(split, PoolSplit {
      total: 10_001,
      opc: 7_001,
      alpha: 2_000,
      beta: 300,
      gamma: 300,
      delta: 400,
      remainder: 1,
    });
  }

  #[test]
  fn zero_and_one_are_not_special() {
    let zero = split_revenue(0, &PoolRatios::default()).unwrap();
    assert_eq!((zero.opc, zero.alpha, zero.beta, zero.gamma, zero.delta, zero.remainder), (0, 0, 0, 0, 0, 0));

    let one = split_revenue(1, &PoolRatios::default()).unwrap();
    assert_eq!((one.opc, one.alpha, one.beta, one.gamma, one.delta), (1, 0, 0, 0, 0));
    assert_eq!(one.remainder, 1);
  }

  #[test]
  fn split_always_sums_to_total() {
    let ratios = [
      PoolRatios::default(),
      PoolRatios { opc: 1, alpha: 3_333, beta: 3_333, gamma: 3_332, delta: 1 },
      PoolRatios { opc: 0, alpha: 10_000, beta: 0, gamma: 0, delta: 0 },
    ];
    let mut totals: Vec<u128> = (0..2_000).collect();
    let mut x: u128 = 0x9e37_79b9_7f4a_7c15;
    for _ in 0..2_000 {
      x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
      totals.push(x);
    }
    totals.push(u128::MAX);
    totals.push(u128::MAX - 1);

    for r in ratios.iter() {
      for total in totals.iter() {
        let s = split_revenue(*total, r).unwrap();
        assert_eq!(s.opc.checked_add(s.alpha).and_then(|v| v.checked_add(s.beta))
          .and_then(|v| v.checked_add(s.gamma)).and_then(|v| v.checked_add(s.delta)), Some(*total));
        assert!(s.remainder < 5);
      }
    }
  }

  #[test]
  fn rejects_bad_ratios_and_tampered_splits() {
    let bad = PoolRatios { opc: 7_000, alpha: 2_000, beta: 300, gamma: 300, delta: 401 };
    assert!(split_revenue(100, &bad).is_err());

    let mut split = split_revenue(10_001, &PoolRatios::default()).unwrap();
    split.alpha += 1;
    assert!(validate_split(&split).is_err());
  }
}
