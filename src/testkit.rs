//! Fixtures shared by unit tests: an in-process chain and fact builders.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::config::Config;
use crate::constants::{Group, SubmissionStatus};
use crate::errors::RpcError;
use crate::events::{topic, ChainEvent, LogEntry, Word};
use crate::ingest;
use crate::models::{RawEventFact, SourceCheckpoint};
use crate::rpc::ChainClient;
use crate::store::{IngestBatch, MemoryStore, Store};
use crate::utils::{address_bytes, decode_hash};

pub(crate) use crate::rpc::uint_word;

pub const REVENUE: &str = "0x1000000000000000000000000000000000000001";
pub const STAKING: &str = "0x1000000000000000000000000000000000000002";
pub const MACHINES: &str = "0x1000000000000000000000000000000000000003";
pub const FRACTIONAL: &str = "0x1000000000000000000000000000000000000004";
pub const DISTRIBUTOR: &str = "0x1000000000000000000000000000000000000005";

const CONFIG: &str = r#"
rpc:
  url: http://localhost:8545
ingest:
  confirmations: 0
  max_batch: 100
sources:
  - id: revenue
    kind: revenue
    address: "0x1000000000000000000000000000000000000001"
    start_block: 1
  - id: staking
    kind: staking
    address: "0x1000000000000000000000000000000000000002"
    start_block: 1
  - id: machines
    kind: machine_token
    address: "0x1000000000000000000000000000000000000003"
    start_block: 1
  - id: fractional
    kind: fractional
    address: "0x1000000000000000000000000000000000000004"
    start_block: 1
  - id: distributor
    kind: distributor
    address: "0x1000000000000000000000000000000000000005"
    start_block: 1
publisher:
  account: "0x2000000000000000000000000000000000000001"
  distributor_address: "0x1000000000000000000000000000000000000005"
  confirmation_polls: 3
  confirmation_poll_ms: 0
"#;

pub fn config() -> Config {
  Config::from_yaml(CONFIG).unwrap()
}

pub fn acct(i: u32) -> String {
  format!("0x{:040x}", i)
}

fn salted_hash(height: u64, salt: u32) -> String {
  format!("0x{:056x}{:08x}", height, salt)
}

/// Hash of `height` on a chain that never reorganized.
pub fn block_hash(height: u64) -> String {
  salted_hash(height, 0)
}

pub fn address_word(address: &str) -> Word {
  let mut word = [0u8; 32];
  word[12..].copy_from_slice(&address_bytes(address).unwrap());
  word
}

fn id_word(id: &str) -> Word {
  uint_word(id.parse().unwrap())
}

/// Parameters of `event` in declaration order.
fn words(event: &ChainEvent) -> Vec<Word> {
  match event {
    ChainEvent::RevenuePosted { epoch_id, total_revenue, posted_at } =>
      vec![uint_word(u128::from(*epoch_id)), uint_word(*total_revenue), uint_word(u128::from(*posted_at))],
    ChainEvent::MachineRevenueReported { epoch_id, machine_id, amount } =>
      vec![uint_word(u128::from(*epoch_id)), id_word(machine_id), uint_word(*amount)],
    ChainEvent::PositionOpened { position_id, account, amount, lock_days, lock_until } => vec![
      id_word(position_id),
      address_word(account),
      uint_word(*amount),
      uint_word(u128::from(*lock_days)),
      uint_word(u128::from(*lock_until)),
    ],
    ChainEvent::PositionClosed { position_id } => vec![id_word(position_id)],
    ChainEvent::MachineTransferred { machine_id, from, to } =>
      vec![id_word(machine_id), address_word(from), address_word(to)],
    ChainEvent::MachineDecommissioned { machine_id } => vec![id_word(machine_id)],
    ChainEvent::AssetRegistered { asset_id, share_basis_points, expires_at } =>
      vec![id_word(asset_id), uint_word(u128::from(*share_basis_points)), uint_word(u128::from(*expires_at))],
    ChainEvent::SharesTransferred { asset_id, from, to, units } =>
      vec![id_word(asset_id), address_word(from), address_word(to), uint_word(*units)],
    ChainEvent::AssetDecommissioned { asset_id } => vec![id_word(asset_id)],
    ChainEvent::RootSubmitted { epoch_id, group, root } =>
      vec![uint_word(u128::from(*epoch_id)), uint_word(u128::from(*group)), decode_hash(root).unwrap()],
    ChainEvent::Claimed { epoch_id, group, account, amount } =>
      vec![uint_word(u128::from(*epoch_id)), uint_word(u128::from(*group)), address_word(account), uint_word(*amount)],
  }
}

/// A log carrying every parameter in its data section.
pub fn log_for(address: &str, block: u64, log_index: u32, event: &ChainEvent) -> LogEntry {
  LogEntry {
    address: address.to_owned(),
    topics: vec![topic(event.signature())],
    data: words(event).concat(),
    block_number: block,
    block_hash: block_hash(block),
    tx_ref: format!("0x{:056x}{:08x}", block, log_index),
    log_index,
    removed: false,
  }
}

pub fn fact(source_id: &str, block: u64, log_index: u32, event: ChainEvent) -> RawEventFact {
  let log = log_for(crate::constants::ZERO_ADDRESS, block, log_index, &event);
  event.into_fact(source_id, &log).unwrap()
}

/// Commits `facts` and their derived records as one batch ending at `block`.
pub fn seed(store: &MemoryStore, source_id: &str, facts: Vec<RawEventFact>, block: u64) {
  let mut batch = IngestBatch {
    source_id: source_id.to_owned(),
    facts: vec![],
    epochs: vec![],
    machine_revenues: vec![],
    claims: vec![],
    checkpoint: SourceCheckpoint {
      source_id: source_id.to_owned(),
      last_processed_block: block,
      last_processed_ref: block_hash(block),
    },
  };
  for f in facts {
    let event = ChainEvent::from_fact(&f).unwrap();
    ingest::record(&mut batch, f, &event).unwrap();
  }
  store.commit_batch(&batch).unwrap();
}

/// Moves every configured source's checkpoint up to `block`.
pub fn advance_all(store: &MemoryStore, block: u64) {
  for source in config().sources.iter() {
    let reached = store.checkpoint(&source.id).unwrap().map(|c| c.last_processed_block).unwrap_or(0);
    if reached < block {
      seed(store, &source.id, vec![], block);
    }
  }
}

#[derive(Debug, Clone)]
struct Submission {
  epoch_id: u64,
  group: Group,
  root: String,
  status: SubmissionStatus,
}

#[derive(Default)]
struct FakeState {
  head: u64,
  /// Bumped for every height at or above a reorg.
  salts: HashMap<u64, u32>,
  logs: Vec<LogEntry>,
  roots: HashMap<(u64, Group), String>,
  submissions: HashMap<String, Submission>,
  order: Vec<String>,
  manual_confirm: bool,
  reject_submissions: bool,
}

impl FakeState {
  fn hash_at(&self, height: u64) -> String {
    salted_hash(height, self.salts.get(&height).cloned().unwrap_or(0))
  }
}

/// In-process chain: a head, logs per address, and a distributor contract.
#[derive(Default)]
pub struct FakeChain {
  state: Mutex<FakeState>,
}

impl FakeChain {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_head(&self, head: u64) {
    self.state.lock().head = head;
  }

  pub fn emit(&self, address: &str, block: u64, event: ChainEvent) {
    let mut state = self.state.lock();
    let log_index = state.logs.iter().filter(|l| l.block_number == block).count() as u32;
    let mut log = log_for(address, block, log_index, &event);
    log.block_hash = state.hash_at(block);
    state.logs.push(log);
    state.head = state.head.max(block);
  }

  pub fn mark_removed(&self, address: &str, block: u64) {
    for log in self.state.lock().logs.iter_mut() {
      if log.address == address && log.block_number == block {
        log.removed = true;
      }
    }
  }

  /// Replaces every block from `height` up to the head and drops their logs.
  pub fn reorg(&self, height: u64) {
    let mut state = self.state.lock();
    let head = state.head;
    for h in height..=head.max(height) + 64 {
      *state.salts.entry(h).or_insert(0) += 1;
    }
    state.logs.retain(|l| l.block_number < height);
  }

  /// Submissions stay pending until `confirm` or `revert` is called.
  pub fn confirm_manually(&self) {
    self.state.lock().manual_confirm = true;
  }

  pub fn reject_submissions(&self, reject: bool) {
    self.state.lock().reject_submissions = reject;
  }

  pub fn confirm(&self, tx_ref: &str) {
    let mut state = self.state.lock();
    if let Some(s) = state.submissions.get_mut(tx_ref) {
      s.status = SubmissionStatus::Confirmed;
      let (key, root) = ((s.epoch_id, s.group), s.root.clone());
      state.roots.insert(key, root);
    }
  }

  pub fn revert(&self, tx_ref: &str) {
    if let Some(s) = self.state.lock().submissions.get_mut(tx_ref) {
      s.status = SubmissionStatus::Failed;
    }
  }

  /// The node forgets the transaction without mining it.
  pub fn drop_submission(&self, tx_ref: &str) {
    if let Some(s) = self.state.lock().submissions.get_mut(tx_ref) {
      s.status = SubmissionStatus::Dropped;
    }
  }

  /// Writes a root directly, as another publisher would.
  pub fn set_root(&self, epoch_id: u64, group: Group, root: &str) {
    self.state.lock().roots.insert((epoch_id, group), root.to_owned());
  }

  /// Transaction references in submission order.
  pub fn submissions(&self) -> Vec<String> {
    self.state.lock().order.clone()
  }
}

impl ChainClient for FakeChain {
  fn head(&self) -> Result<u64, RpcError> {
    Ok(self.state.lock().head)
  }

  fn block_ref(&self, height: u64) -> Result<Option<String>, RpcError> {
    let state = self.state.lock();
    Ok(if height > state.head { None } else { Some(state.hash_at(height)) })
  }

  fn logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<LogEntry>, RpcError> {
    Ok(self.state.lock().logs.iter()
      .filter(|l| l.address == address && l.block_number >= from && l.block_number <= to)
      .cloned()
      .collect())
  }

  fn submit_commitment(&self, epoch_id: u64, group: Group, root: &str) -> Result<String, RpcError> {
    let mut state = self.state.lock();
    if state.reject_submissions {
      return Err(RpcError::Rpc { code: -32000, message: "insufficient funds".to_owned() })
    }
    let tx_ref = format!("0x{:064x}", state.order.len() + 1);
    let status = if state.manual_confirm { SubmissionStatus::Pending } else { SubmissionStatus::Confirmed };
    if status == SubmissionStatus::Confirmed {
      state.roots.insert((epoch_id, group), root.to_owned());
    }
    state.submissions.insert(tx_ref.clone(), Submission { epoch_id, group, root: root.to_owned(), status });
    state.order.push(tx_ref.clone());
    Ok(tx_ref)
  }

  fn submission_status(&self, tx_ref: &str) -> Result<SubmissionStatus, RpcError> {
    self.state.lock().submissions.get(tx_ref)
      .map(|s| s.status)
      .ok_or_else(|| RpcError::Malformed(format!("unknown transaction {}", tx_ref)))
  }

  fn published_root(&self, epoch_id: u64, group: Group) -> Result<Option<String>, RpcError> {
    Ok(self.state.lock().roots.get(&(epoch_id, group)).cloned())
  }
}
