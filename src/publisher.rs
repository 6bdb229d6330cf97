use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::constants::{Group, SubmissionStatus};
use crate::errors::{PolicyViolation, Result, RpcError};
use crate::models::MerkleCommitment;
use crate::rpc::ChainClient;
use crate::store::Store;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
  AlreadyPublished,
  /// The chain already held this root, e.g. from an earlier run.
  Adopted,
  Published { publish_ref: String },
  /// Submitted but not confirmed within the polling window.
  Pending { publish_ref: String },
}

#[derive(Serialize, Debug, Clone)]
pub struct PublishReport {
  pub epoch_id: u64,
  pub group: Group,
  pub outcome: PublishOutcome,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct PublishRun {
  pub reports: Vec<PublishReport>,
  /// Set when the run stopped early.
  pub blocked: Option<String>,
}

pub struct Publisher {
  config: Arc<Config>,
  store: Arc<dyn Store>,
  chain: Arc<dyn ChainClient>,
}

impl Publisher {
  pub fn new(config: Arc<Config>, store: Arc<dyn Store>, chain: Arc<dyn ChainClient>) -> Self {
    Self { config, store, chain }
  }

  /// Publishes one commitment. Safe to call repeatedly: a confirmed root is
  /// never resubmitted and an outstanding submission is reused until it
  /// fails, drops out of the node, or outlives `pending_timeout_secs`.
  /// Replacements are only sent after the chain was seen to hold no root.
  pub fn publish(&self, epoch_id: u64, group: Group) -> Result<PublishOutcome> {
    let commitment = self.store.commitment(epoch_id, group)?
      .ok_or(PolicyViolation::CommitmentNotFound { epoch_id, group })?;
    if commitment.published {
      return Ok(PublishOutcome::AlreadyPublished)
    }

    match self.chain.published_root(epoch_id, group)? {
      Some(root) if root == commitment.root_hash => {
        let publish_ref = commitment.publish_ref.clone().unwrap_or(root);
        self.store.mark_published(epoch_id, group, &publish_ref)?;
        info!("Root for {}/{} already on chain, marked published.", epoch_id, group);
        return Ok(PublishOutcome::Adopted)
      },
      Some(root) => {
        error!("Chain holds root {} for {}/{}, ours is {}.", root, epoch_id, group, commitment.root_hash);
        return Err(PolicyViolation::RootConflict { epoch_id, group, on_chain: root }.into())
      },
      None => (),
    }

    let publish_ref = match commitment.publish_ref.clone() {
      Some(tx_ref) => match self.chain.submission_status(&tx_ref)? {
        SubmissionStatus::Failed => {
          warn!("Submission {} for {}/{} failed, resubmitting.", tx_ref, epoch_id, group);
          self.submit(&commitment)?
        },
        SubmissionStatus::Dropped => {
          warn!("Submission {} for {}/{} was dropped, resubmitting.", tx_ref, epoch_id, group);
          self.submit(&commitment)?
        },
        SubmissionStatus::Pending if self.is_stale(&commitment) => {
          error!(
            "Submission {} for {}/{} pending for over {}s, resubmitting.",
            tx_ref, epoch_id, group, self.config.publisher.pending_timeout_secs
          );
          self.submit(&commitment)?
        },
        SubmissionStatus::Pending | SubmissionStatus::Confirmed => tx_ref,
      },
      None => self.submit(&commitment)?,
    };
    self.await_confirmation(epoch_id, group, publish_ref)
  }

  /// Submitted longer ago than the pending timeout. A submission with no
  /// recorded time counts as stale.
  fn is_stale(&self, commitment: &MerkleCommitment) -> bool {
    match commitment.submitted_at {
      Some(at) => {
        let age = Utc::now().naive_utc().signed_duration_since(at).num_seconds();
        u64::try_from(age).map(|age| age >= self.config.publisher.pending_timeout_secs).unwrap_or(false)
      },
      None => true,
    }
  }

  fn submit(&self, commitment: &MerkleCommitment) -> Result<String> {
    let tx_ref = self.chain.submit_commitment(commitment.epoch_id, commitment.group, &commitment.root_hash)?;
    self.store.set_publish_ref(commitment.epoch_id, commitment.group, &tx_ref)?;
    info!("Submitted root {} for {}/{} in {}.", commitment.root_hash, commitment.epoch_id, commitment.group, tx_ref);
    Ok(tx_ref)
  }

  fn await_confirmation(&self, epoch_id: u64, group: Group, publish_ref: String) -> Result<PublishOutcome> {
    let interval = Duration::from_millis(self.config.publisher.confirmation_poll_ms);
    for attempt in 0..self.config.publisher.confirmation_polls {
      if attempt > 0 {
        thread::sleep(interval);
      }
      match self.chain.submission_status(&publish_ref)? {
        SubmissionStatus::Confirmed => {
          self.store.mark_published(epoch_id, group, &publish_ref)?;
          info!("Root for {}/{} confirmed in {}.", epoch_id, group, publish_ref);
          return Ok(PublishOutcome::Published { publish_ref })
        },
        SubmissionStatus::Failed => {
          return Err(RpcError::Reverted { tx_ref: publish_ref }.into())
        },
        SubmissionStatus::Pending | SubmissionStatus::Dropped => (),
      }
    }
    debug!("Submission {} for {}/{} still pending.", publish_ref, epoch_id, group);
    Ok(PublishOutcome::Pending { publish_ref })
  }

  /// Publishes unpublished commitments oldest epoch first, stopping at the
  /// first one that fails or stays pending.
  pub fn publish_pending(&self) -> Result<PublishRun> {
    let mut run = PublishRun::default();
    for c in self.store.unpublished_commitments()? {
      match self.publish(c.epoch_id, c.group) {
        Ok(outcome) => {
          let pending = matches!(outcome, PublishOutcome::Pending { .. });
          run.reports.push(PublishReport { epoch_id: c.epoch_id, group: c.group, outcome });
          if pending {
            run.blocked = Some(format!("{}/{} awaiting confirmation", c.epoch_id, c.group));
            break
          }
        },
        Err(e) => {
          warn!("Publishing {}/{} failed: {}", c.epoch_id, c.group, e);
          run.blocked = Some(format!("{}/{}: {}", c.epoch_id, c.group, e));
          break
        },
      }
    }
    Ok(run)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::claims::seed_entries;
  use crate::errors::Error;
  use crate::merkle::MerkleTree;
  use crate::store::MemoryStore;
  use crate::testkit::{self, acct, FakeChain};

  fn setup() -> (Publisher, Arc<MemoryStore>, Arc<FakeChain>) {
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(FakeChain::new());
    let publisher = Publisher::new(Arc::new(testkit::config()), store.clone(), chain.clone());
    (publisher, store, chain)
  }

  fn commit(store: &MemoryStore, epoch_id: u64, group: Group) -> String {
    let tree = MerkleTree::build(epoch_id, group, &[(acct(1), 10), (acct(2), 20)]).unwrap();
    let commitment = MerkleCommitment {
      epoch_id,
      group,
      root_hash: tree.root_hex(),
      total_amount: 30,
      leaf_count: 2,
      published: false,
      publish_ref: None,
      submitted_at: None,
    };
    store.replace_commitment(&commitment, &seed_entries(epoch_id, group, &tree)).unwrap();
    tree.root_hex()
  }

  #[test]
  fn publishes_once() {
    let (publisher, store, chain) = setup();
    let root = commit(&store, 1, Group::Alpha);

    let outcome = publisher.publish(1, Group::Alpha).unwrap();
    assert!(matches!(outcome, PublishOutcome::Published { .. }));
    assert_eq!(chain.published_root(1, Group::Alpha).unwrap(), Some(root));
    assert!(store.commitment(1, Group::Alpha).unwrap().unwrap().published);

    assert_eq!(publisher.publish(1, Group::Alpha).unwrap(), PublishOutcome::AlreadyPublished);
    assert_eq!(chain.submissions().len(), 1);
  }

  #[test]
  fn adopts_a_matching_root_and_rejects_a_different_one() {
    let (publisher, store, chain) = setup();
    let root = commit(&store, 1, Group::Alpha);
    chain.set_root(1, Group::Alpha, &root);
    assert_eq!(publisher.publish(1, Group::Alpha).unwrap(), PublishOutcome::Adopted);
    assert!(chain.submissions().is_empty());

    commit(&store, 1, Group::Beta);
    chain.set_root(1, Group::Beta, &format!("0x{}", "ab".repeat(32)));
    match publisher.publish(1, Group::Beta) {
      Err(Error::Policy(p)) => assert_eq!(p.code(), "root_conflict"),
      other => panic!("unexpected {:?}", other),
    }
    assert!(!store.commitment(1, Group::Beta).unwrap().unwrap().published);
  }

  #[test]
  fn pending_submission_is_reused_then_confirmed() {
    let (publisher, store, chain) = setup();
    commit(&store, 2, Group::Gamma);
    chain.confirm_manually();

    let tx_ref = match publisher.publish(2, Group::Gamma).unwrap() {
      PublishOutcome::Pending { publish_ref } => publish_ref,
      other => panic!("unexpected {:?}", other),
    };
    let stored = store.commitment(2, Group::Gamma).unwrap().unwrap();
    assert_eq!(stored.publish_ref.as_deref(), Some(tx_ref.as_str()));
    assert!(!stored.published);

    assert!(matches!(publisher.publish(2, Group::Gamma).unwrap(), PublishOutcome::Pending { .. }));
    chain.confirm(&tx_ref);
    // the root is now on chain under our submission
    assert_eq!(publisher.publish(2, Group::Gamma).unwrap(), PublishOutcome::Adopted);
    assert_eq!(chain.submissions(), vec![tx_ref.clone()]);
    assert_eq!(store.commitment(2, Group::Gamma).unwrap().unwrap().publish_ref, Some(tx_ref));
  }

  #[test]
  fn failed_submission_is_resubmitted() {
    let (publisher, store, chain) = setup();
    commit(&store, 3, Group::Alpha);
    chain.confirm_manually();
    let first = match publisher.publish(3, Group::Alpha).unwrap() {
      PublishOutcome::Pending { publish_ref } => publish_ref,
      other => panic!("unexpected {:?}", other),
    };
    chain.revert(&first);
    let second = match publisher.publish(3, Group::Alpha).unwrap() {
      PublishOutcome::Pending { publish_ref } => publish_ref,
      other => panic!("unexpected {:?}", other),
    };
    assert_ne!(first, second);
    assert_eq!(chain.submissions().len(), 2);
  }

  fn pending(outcome: PublishOutcome) -> String {
    match outcome {
      PublishOutcome::Pending { publish_ref } => publish_ref,
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn dropped_submission_is_resubmitted() {
    let (publisher, store, chain) = setup();
    let root = commit(&store, 4, Group::Beta);
    chain.confirm_manually();
    let first = pending(publisher.publish(4, Group::Beta).unwrap());
    assert!(store.commitment(4, Group::Beta).unwrap().unwrap().submitted_at.is_some());

    chain.drop_submission(&first);
    let second = pending(publisher.publish(4, Group::Beta).unwrap());
    assert_ne!(first, second);
    assert_eq!(chain.submissions(), vec![first, second.clone()]);
    assert_eq!(store.commitment(4, Group::Beta).unwrap().unwrap().publish_ref, Some(second.clone()));

    chain.confirm(&second);
    assert_eq!(publisher.publish(4, Group::Beta).unwrap(), PublishOutcome::Adopted);
    assert_eq!(chain.published_root(4, Group::Beta).unwrap(), Some(root));
  }

  #[test]
  fn stale_pending_submission_is_replaced_unless_the_root_landed() {
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(FakeChain::new());
    let mut config = testkit::config();
    config.publisher.pending_timeout_secs = 0;
    let publisher = Publisher::new(Arc::new(config), store.clone(), chain.clone());
    let root = commit(&store, 5, Group::Alpha);
    chain.confirm_manually();

    let first = pending(publisher.publish(5, Group::Alpha).unwrap());
    let second = pending(publisher.publish(5, Group::Alpha).unwrap());
    assert_ne!(first, second);

    // the first one mined after all, so nothing more is sent
    chain.confirm(&first);
    assert_eq!(publisher.publish(5, Group::Alpha).unwrap(), PublishOutcome::Adopted);
    assert_eq!(chain.submissions().len(), 2);
    assert_eq!(chain.published_root(5, Group::Alpha).unwrap(), Some(root));
  }

  #[test]
  fn fresh_pending_submission_is_kept() {
    let (publisher, store, chain) = setup();
    commit(&store, 6, Group::Gamma);
    chain.confirm_manually();
    let first = pending(publisher.publish(6, Group::Gamma).unwrap());
    assert_eq!(pending(publisher.publish(6, Group::Gamma).unwrap()), first);
    assert_eq!(chain.submissions().len(), 1);
  }

  #[test]
  fn publish_pending_keeps_epoch_order() {
    let (publisher, store, chain) = setup();
    commit(&store, 1, Group::Alpha);
    commit(&store, 1, Group::Beta);
    commit(&store, 2, Group::Alpha);
    chain.reject_submissions(true);

    let run = publisher.publish_pending().unwrap();
    assert!(run.reports.is_empty());
    assert!(run.blocked.unwrap().starts_with("1/alpha"));

    chain.reject_submissions(false);
    let run = publisher.publish_pending().unwrap();
    let published: Vec<(u64, Group)> = run.reports.iter().map(|r| (r.epoch_id, r.group)).collect();
    assert_eq!(published, vec![(1, Group::Alpha), (1, Group::Beta), (2, Group::Alpha)]);
    assert!(run.blocked.is_none());
    assert!(store.unpublished_commitments().unwrap().is_empty());

    assert!(matches!(publisher.publish(9, Group::Alpha), Err(Error::Policy(_))));
  }
}
