//! Checkpointed ingestion of contract logs, one source at a time.

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, SourceConfig};
use crate::constants::{Group, SourceKind};
use crate::errors::{Error, ErrorKind, Result};
use crate::events::{self, ChainEvent, LogEntry};
use crate::models::*;
use crate::rpc::ChainClient;
use crate::store::{IngestBatch, Store};

/// Per-source mutexes plus the set of halted sources. Shared by every
/// ingestor in the process so that checkpoint writes stay serialized.
#[derive(Default)]
pub struct SourceLocks {
  locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
  halted: Mutex<HashMap<String, String>>,
}

impl SourceLocks {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock_for(&self, source_id: &str) -> Arc<Mutex<()>> {
    self.locks.lock().entry(source_id.to_owned()).or_default().clone()
  }

  pub fn halt(&self, source_id: &str, reason: &str) {
    error!("Halting ingestion for {}: {}", source_id, reason);
    self.halted.lock().insert(source_id.to_owned(), reason.to_owned());
  }

  pub fn halted(&self, source_id: &str) -> Option<String> {
    self.halted.lock().get(source_id).cloned()
  }

  /// Operator action after the source has been repaired.
  pub fn resume(&self, source_id: &str) -> bool {
    let resumed = self.halted.lock().remove(source_id).is_some();
    if resumed {
      warn!("Ingestion for {} resumed by operator.", source_id);
    }
    resumed
  }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
  pub source_id: String,
  pub from_block: u64,
  pub to_block: u64,
  pub logs: usize,
  pub new_facts: usize,
  pub epochs: Vec<u64>,
  pub claims: usize,
}

#[derive(Serialize, Debug, Clone)]
pub struct SourceFailure {
  pub source_id: String,
  pub error: String,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct CatchUpReport {
  pub ingested: Vec<IngestReport>,
  pub idle: Vec<String>,
  pub failed: Vec<SourceFailure>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
  pub source_id: String,
  pub kind: SourceKind,
  pub last_processed_block: Option<u64>,
  pub head: Option<u64>,
  pub lag: Option<u64>,
  pub halted: Option<String>,
}

fn posted_time(source_id: &str, posted_at: u64) -> Result<NaiveDateTime> {
  i64::try_from(posted_at).ok()
    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
    .map(|d| d.naive_utc())
    .ok_or_else(|| Error::integrity(source_id, format!("posted_at {} is not a valid time", posted_at)))
}

/// Adds a decoded fact and the records derived from it to `batch`.
pub(crate) fn record(batch: &mut IngestBatch, fact: RawEventFact, event: &ChainEvent) -> Result<()> {
  match event {
    ChainEvent::RevenuePosted { epoch_id, total_revenue, posted_at } => {
      batch.epochs.push(RevenueEpoch {
        epoch_id: *epoch_id,
        total_revenue: *total_revenue,
        split: None,
        source_block: fact.block_number,
        source_time: posted_time(&batch.source_id, *posted_at)?,
        tx_ref: fact.tx_ref.clone(),
      });
    },
    ChainEvent::MachineRevenueReported { epoch_id, machine_id, amount } => {
      batch.machine_revenues.push(MachineRevenue {
        machine_id: machine_id.clone(),
        epoch_id: *epoch_id,
        amount: *amount,
      });
    },
    ChainEvent::Claimed { epoch_id, group, account, amount } => {
      let group = Group::from_index(*group)
        .ok_or_else(|| Error::integrity(&batch.source_id, format!("claim for unknown group {}", group)))?;
      batch.claims.push(ClaimRecord {
        epoch_id: *epoch_id,
        group,
        account: account.clone(),
        amount: *amount,
        claim_ref: fact.tx_ref.clone(),
        // the event carries no timestamp
        claimed_at: chrono::Utc::now().naive_utc(),
      });
    },
    _ => (),
  }
  batch.facts.push(fact);
  Ok(())
}

pub struct Ingestor {
  config: Arc<Config>,
  store: Arc<dyn Store>,
  chain: Arc<dyn ChainClient>,
  locks: Arc<SourceLocks>,
}

impl Ingestor {
  pub fn new(config: Arc<Config>, store: Arc<dyn Store>, chain: Arc<dyn ChainClient>, locks: Arc<SourceLocks>) -> Self {
    Self { config, store, chain, locks }
  }

  fn source(&self, source_id: &str) -> Result<&SourceConfig> {
    self.config.source(source_id).ok_or_else(|| Error::Config(format!("unknown source '{}'", source_id)))
  }

  /// Halts the source on data-integrity failures before passing them on.
  fn guard<T>(&self, source_id: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = result.as_ref() {
      if e.kind() == ErrorKind::DataIntegrity {
        self.locks.halt(source_id, &e.to_string());
      }
    }
    result
  }

  /// Fetches, decodes and persists logs in `[from, to]`, then advances the
  /// checkpoint to `to`. Re-running a range already processed is a no-op.
  pub fn ingest(&self, source_id: &str, from: u64, to: u64) -> Result<IngestReport> {
    let source = self.source(source_id)?.clone();
    if from > to {
      return Err(Error::Invariant(format!("empty range {}..{} for {}", from, to, source_id)))
    }
    if let Some(reason) = self.locks.halted(source_id) {
      return Err(Error::integrity(source_id, format!("source is halted: {}", reason)))
    }

    let lock = self.locks.lock_for(source_id);
    let _held = lock.lock();

    let checkpoint = self.store.checkpoint(source_id)?;
    let next = checkpoint.as_ref()
      .map(|c| c.last_processed_block + 1)
      .unwrap_or(source.start_block);
    if from > next {
      return Err(Error::Invariant(format!(
        "{} would skip blocks {}..{}", source_id, next, from - 1
      )))
    }

    let built = self.build_batch(&source, checkpoint.as_ref(), from, to);
    let batch = self.guard(source_id, built)?;
    let logs = batch.facts.len();
    let epochs: Vec<u64> = batch.epochs.iter().map(|e| e.epoch_id).collect();
    let committed = self.store.commit_batch(&batch);
    let summary = self.guard(source_id, committed)?;

    if summary.new_facts > 0 {
      info!("{}: ingested {} new facts in blocks {}..={}.", source_id, summary.new_facts, from, to);
    } else {
      debug!("{}: nothing new in blocks {}..={}.", source_id, from, to);
    }
    if summary.claims_applied > 0 {
      info!("{}: recorded {} claims.", source_id, summary.claims_applied);
    }
    if summary.claims_waiting > 0 {
      warn!("{}: {} claims have no entry yet and will be applied when it is seeded.", source_id, summary.claims_waiting);
    }
    Ok(IngestReport {
      source_id: source_id.to_owned(),
      from_block: from,
      to_block: to,
      logs,
      new_facts: summary.new_facts,
      epochs,
      claims: summary.claims_applied,
    })
  }

  fn build_batch(
    &self,
    source: &SourceConfig,
    checkpoint: Option<&SourceCheckpoint>,
    from: u64,
    to: u64,
  ) -> Result<IngestBatch> {
    if let Some(cp) = checkpoint {
      let current = self.chain.block_ref(cp.last_processed_block)?;
      if current.as_deref() != Some(cp.last_processed_ref.as_str()) {
        return Err(Error::integrity(&source.id, format!(
          "reorg below checkpoint: block {} was {}, chain now has {:?}",
          cp.last_processed_block, cp.last_processed_ref, current
        )))
      }
    }

    let mut logs = self.chain.logs(&source.address, from, to)?;
    let to_ref = self.chain.block_ref(to)?
      .ok_or_else(|| Error::NotReady(format!("block {} is not available yet", to)))?;
    logs.sort_by_key(|l| (l.block_number, l.log_index));

    let advance = match checkpoint {
      Some(cp) if cp.last_processed_block >= to => cp.clone(),
      _ => SourceCheckpoint {
        source_id: source.id.clone(),
        last_processed_block: to,
        last_processed_ref: to_ref.clone(),
      },
    };
    let mut batch = IngestBatch {
      source_id: source.id.clone(),
      facts: vec![],
      epochs: vec![],
      machine_revenues: vec![],
      claims: vec![],
      checkpoint: advance,
    };

    for log in logs.iter() {
      self.check_log(source, log, from, to, &to_ref)?;
      let event = events::decode(source.kind, log)
        .map_err(|reason| Error::integrity(&source.id, format!(
          "log {}:{} in block {}: {}", log.tx_ref, log.log_index, log.block_number, reason
        )))?;
      trace!("{}: {:?}", source.id, event);
      if let ChainEvent::RootSubmitted { epoch_id, group, root } = &event {
        debug!("{}: root {} submitted for {}/{}.", source.id, root, epoch_id, group);
      }
      let fact = event.clone().into_fact(&source.id, log)?;
      record(&mut batch, fact, &event)?;
    }
    Ok(batch)
  }

  fn check_log(&self, source: &SourceConfig, log: &LogEntry, from: u64, to: u64, to_ref: &str) -> Result<()> {
    if log.removed {
      return Err(Error::integrity(&source.id, format!(
        "log {}:{} in block {} was removed by a reorg", log.tx_ref, log.log_index, log.block_number
      )))
    }
    if log.block_number < from || log.block_number > to {
      return Err(Error::integrity(&source.id, format!(
        "log in block {} outside requested range {}..={}", log.block_number, from, to
      )))
    }
    if !log.address.eq_ignore_ascii_case(&source.address) {
      return Err(Error::integrity(&source.id, format!("log emitted by {} instead of {}", log.address, source.address)))
    }
    if log.block_number == to && log.block_hash != to_ref {
      return Err(Error::NotReady(format!("block {} changed while it was being read", to)))
    }
    Ok(())
  }

  /// Next range for one source, or `None` when it is caught up.
  fn next_range(&self, source: &SourceConfig, head: u64) -> Result<Option<(u64, u64)>> {
    let target = match head.checked_sub(self.config.ingest.confirmations) {
      Some(target) => target,
      None => return Ok(None),
    };
    let from = self.store.checkpoint(&source.id)?
      .map(|c| c.last_processed_block + 1)
      .unwrap_or(source.start_block);
    if from > target {
      return Ok(None)
    }
    let to = from.saturating_add(self.config.ingest.max_batch - 1).min(target);
    Ok(Some((from, to)))
  }

  /// Ingests the next batch of one source.
  pub fn catch_up_source(&self, source_id: &str) -> Result<Option<IngestReport>> {
    let source = self.source(source_id)?.clone();
    let head = self.chain.head()?;
    match self.next_range(&source, head)? {
      Some((from, to)) => self.ingest(source_id, from, to).map(Some),
      None => Ok(None),
    }
  }

  /// Brings every source up to the confirmed head. A failing source is
  /// reported and skipped without holding the others back.
  pub fn catch_up(&self) -> CatchUpReport {
    let mut report = CatchUpReport::default();
    for source in self.config.sources.iter() {
      if let Some(reason) = self.locks.halted(&source.id) {
        report.failed.push(SourceFailure { source_id: source.id.clone(), error: format!("halted: {}", reason) });
        continue
      }
      let mut progressed = false;
      loop {
        match self.catch_up_source(&source.id) {
          Ok(Some(r)) => {
            report.ingested.push(r);
            progressed = true;
          },
          Ok(None) => {
            if !progressed {
              report.idle.push(source.id.clone());
            }
            break
          },
          Err(e) => {
            warn!("Catch-up of {} failed: {}", source.id, e);
            report.failed.push(SourceFailure { source_id: source.id.clone(), error: e.to_string() });
            break
          },
        }
      }
    }
    report
  }

  pub fn status(&self) -> Result<Vec<SourceStatus>> {
    let head = match self.chain.head() {
      Ok(head) => Some(head),
      Err(e) => {
        warn!("Could not read chain head: {}", e);
        None
      },
    };
    let reached: HashMap<String, u64> = self.store.checkpoints()?
      .into_iter()
      .map(|c| (c.source_id, c.last_processed_block))
      .collect();
    Ok(self.config.sources.iter()
      .map(|s| {
        let last = reached.get(&s.id).copied();
        let done = last.unwrap_or_else(|| s.start_block.saturating_sub(1));
        SourceStatus {
          source_id: s.id.clone(),
          kind: s.kind,
          last_processed_block: last,
          head,
          lag: head.map(|h| h.saturating_sub(done)),
          halted: self.locks.halted(&s.id),
        }
      })
      .collect())
  }
}
