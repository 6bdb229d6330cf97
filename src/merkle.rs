//! SHA-256 Merkle commitments over (account, amount) rewards.
//!
//! Leaves are sorted by account. A leaf hashes the 45-byte encoding
//! `epoch_id (u64 BE) | group index (u8) | account (20 bytes) | amount (u128 BE)`.
//! Parents hash the smaller child first, and a node without a sibling is
//! carried up to the next level unchanged.

use ring::digest;

use crate::constants::Group;
use crate::errors::{Error, Result};
use crate::utils::{address_bytes, encode_hash};

pub type Hash = [u8; 32];

fn sha256(bytes: &[u8]) -> Hash {
  let d = digest::digest(&digest::SHA256, bytes);
  let mut out = [0u8; 32];
  out.copy_from_slice(d.as_ref());
  out
}

pub fn leaf_hash(epoch_id: u64, group: Group, account: &[u8; 20], amount: u128) -> Hash {
  let mut buf = Vec::with_capacity(45);
  buf.extend_from_slice(&epoch_id.to_be_bytes());
  buf.push(group.index());
  buf.extend_from_slice(account);
  buf.extend_from_slice(&amount.to_be_bytes());
  sha256(&buf)
}

pub fn hash_pair(a: &Hash, b: &Hash) -> Hash {
  let (first, second) = if a <= b { (a, b) } else { (b, a) };
  let mut buf = [0u8; 64];
  buf[..32].copy_from_slice(first);
  buf[32..].copy_from_slice(second);
  sha256(&buf)
}

/// Recomputes the root from a leaf and its sibling path.
pub fn verify(leaf: &Hash, proof: &[Hash], root: &Hash) -> bool {
  let computed = proof.iter().fold(*leaf, |node, sibling| hash_pair(&node, sibling));
  &computed == root
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleLeaf {
  pub account: String,
  pub amount: u128,
  pub hash: Hash,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
  leaves: Vec<MerkleLeaf>,
  /// levels[0] are the leaf hashes, the last level holds only the root.
  levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
  pub fn build(epoch_id: u64, group: Group, rewards: &[(String, u128)]) -> Result<MerkleTree> {
    if rewards.is_empty() {
      return Err(Error::EmptyLeafSet { epoch_id, group })
    }
    let mut sorted: Vec<&(String, u128)> = rewards.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(w) = sorted.windows(2).find(|w| w[0].0 == w[1].0) {
      return Err(Error::Invariant(format!("account {} appears twice in {}/{}", w[0].0, epoch_id, group)))
    }

    let leaves = sorted.into_iter()
      .map(|(account, amount)| {
        let bytes = address_bytes(account)
          .ok_or_else(|| Error::Invariant(format!("{} is not a canonical address", account)))?;
        Ok(MerkleLeaf { account: account.clone(), amount: *amount, hash: leaf_hash(epoch_id, group, &bytes, *amount) })
      })
      .collect::<Result<Vec<MerkleLeaf>>>()?;

    let mut levels = vec![leaves.iter().map(|l| l.hash).collect::<Vec<Hash>>()];
    loop {
      let current = match levels.last() {
        Some(level) if level.len() > 1 => level,
        _ => break,
      };
      let next: Vec<Hash> = current.chunks(2)
        .map(|pair| match pair.get(1) {
          Some(right) => hash_pair(&pair[0], right),
          None => pair[0],
        })
        .collect();
      levels.push(next);
    }
    Ok(MerkleTree { leaves, levels })
  }

  pub fn root(&self) -> Hash {
    self.levels.last().and_then(|l| l.first()).cloned().unwrap_or([0u8; 32])
  }

  pub fn root_hex(&self) -> String {
    encode_hash(&self.root())
  }

  pub fn leaves(&self) -> &[MerkleLeaf] {
    &self.leaves
  }

  pub fn total_amount(&self) -> u128 {
    self.leaves.iter().map(|l| l.amount).sum()
  }

  /// Sibling hashes from the leaf at `index` up to the root.
  pub fn proof(&self, index: usize) -> Vec<Hash> {
    let mut proof = vec![];
    let mut i = index;
    for level in self.levels.iter().take(self.levels.len().saturating_sub(1)) {
      let sibling = i ^ 1;
      if sibling < level.len() {
        proof.push(level[sibling]);
      }
      i /= 2;
    }
    proof
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn account(i: u32) -> String {
    format!("0x{:040x}", i)
  }

  fn rewards(n: u32) -> Vec<(String, u128)> {
    (1..=n).map(|i| (account(i), u128::from(i) * 1_000)).collect()
  }

  #[test]
  fn every_proof_verifies() {
    for n in 1..=33 {
      let tree = MerkleTree::build(1, Group::Alpha, &rewards(n)).unwrap();
      let root = tree.root();
      for (i, leaf) in tree.leaves().iter().enumerate() {
        assert!(verify(&leaf.hash, &tree.proof(i), &root), "leaf {} of {}", i, n);
      }
    }
  }

  #[test]
  fn single_leaf_is_its_own_root() {
    let tree = MerkleTree::build(1, Group::Beta, &rewards(1)).unwrap();
    assert_eq!(tree.root(), tree.leaves()[0].hash);
    assert!(tree.proof(0).is_empty());
  }

  #[test]
  fn odd_node_is_carried_up() {
    let tree = MerkleTree::build(1, Group::Alpha, &rewards(3)).unwrap();
    let h: Vec<Hash> = tree.leaves().iter().map(|l| l.hash).collect();
    assert_eq!(tree.root(), hash_pair(&hash_pair(&h[0], &h[1]), &h[2]));
    assert_eq!(tree.proof(2), vec![hash_pair(&h[0], &h[1])]);
  }

  #[test]
  fn order_of_input_does_not_matter() {
    let forward = rewards(10);
    let mut backward = forward.clone();
    backward.reverse();
    backward.swap(2, 7);
    let a = MerkleTree::build(4, Group::Gamma, &forward).unwrap();
    let b = MerkleTree::build(4, Group::Gamma, &backward).unwrap();
    assert_eq!(a.root(), b.root());
    assert_eq!(a.leaves(), b.leaves());
  }

  #[test]
  fn any_change_moves_the_root() {
    let base = MerkleTree::build(4, Group::Alpha, &rewards(6)).unwrap().root();

    let mut bumped = rewards(6);
    bumped[3].1 += 1;
    assert_ne!(MerkleTree::build(4, Group::Alpha, &bumped).unwrap().root(), base);
    assert_ne!(MerkleTree::build(5, Group::Alpha, &rewards(6)).unwrap().root(), base);
    assert_ne!(MerkleTree::build(4, Group::Beta, &rewards(6)).unwrap().root(), base);
  }

  #[test]
  fn tampered_proofs_fail() {
    let tree = MerkleTree::build(1, Group::Alpha, &rewards(8)).unwrap();
    let leaf = tree.leaves()[5].clone();
    let mut proof = tree.proof(5);
    assert!(!verify(&tree.leaves()[4].hash, &proof, &tree.root()));
    proof[1][0] ^= 1;
    assert!(!verify(&leaf.hash, &proof, &tree.root()));
  }

  #[test]
  fn leaf_encoding_is_fixed_width() {
    let acct = address_bytes(&account(1)).unwrap();
    let mut expected = vec![0, 0, 0, 0, 0, 0, 0, 9, 2];
    expected.extend_from_slice(&acct);
    expected.extend_from_slice(&5u128.to_be_bytes());
    assert_eq!(expected.len(), 45);
    assert_eq!(leaf_hash(9, Group::Gamma, &acct, 5), sha256(&expected));
  }

  #[test]
  fn rejects_empty_duplicate_and_malformed_input() {
    match MerkleTree::build(2, Group::Alpha, &[]) {
      Err(Error::EmptyLeafSet { epoch_id: 2, group: Group::Alpha }) => (),
      other => panic!("unexpected {:?}", other.map(|t| t.root())),
    }
    let dup = vec![(account(1), 1), (account(1), 2)];
    assert!(MerkleTree::build(2, Group::Alpha, &dup).is_err());
    assert!(MerkleTree::build(2, Group::Alpha, &[("0x12".to_owned(), 1)]).is_err());
  }
}
