//! Log decoding for every source kind.
//!
//! Events carry only static ABI types, so a log is read as one flat list of
//! 32-byte words: `topics[1..]` (indexed parameters, declared first) followed
//! by the data words.

use alloy_primitives::keccak256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::{signatures, SourceKind};
use crate::errors::{Error, Result};
use crate::models::RawEventFact;
use crate::utils::{encode_hash, u128_string};

pub type Word = [u8; 32];

/// One log as returned by the chain node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
  pub address: String,
  pub topics: Vec<Word>,
  pub data: Vec<u8>,
  pub block_number: u64,
  pub block_hash: String,
  pub tx_ref: String,
  pub log_index: u32,
  pub removed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "name", content = "args")]
pub enum ChainEvent {
  RevenuePosted {
    epoch_id: u64,
    #[serde(with = "u128_string")]
    total_revenue: u128,
    posted_at: u64,
  },
  MachineRevenueReported {
    epoch_id: u64,
    machine_id: String,
    #[serde(with = "u128_string")]
    amount: u128,
  },
  PositionOpened {
    position_id: String,
    account: String,
    #[serde(with = "u128_string")]
    amount: u128,
    lock_days: u64,
    lock_until: u64,
  },
  PositionClosed {
    position_id: String,
  },
  MachineTransferred {
    machine_id: String,
    from: String,
    to: String,
  },
  MachineDecommissioned {
    machine_id: String,
  },
  AssetRegistered {
    asset_id: String,
    share_basis_points: u32,
    expires_at: u64,
  },
  SharesTransferred {
    asset_id: String,
    from: String,
    to: String,
    #[serde(with = "u128_string")]
    units: u128,
  },
  AssetDecommissioned {
    asset_id: String,
  },
  RootSubmitted {
    epoch_id: u64,
    group: u8,
    root: String,
  },
  Claimed {
    epoch_id: u64,
    group: u8,
    account: String,
    #[serde(with = "u128_string")]
    amount: u128,
  },
}

/// Signatures a source of `kind` may emit.
pub fn signatures_for(kind: SourceKind) -> &'static [&'static str] {
  match kind {
    SourceKind::Revenue => &[signatures::REVENUE_POSTED, signatures::MACHINE_REVENUE_REPORTED],
    SourceKind::Staking => &[signatures::POSITION_OPENED, signatures::POSITION_CLOSED],
    SourceKind::MachineToken => &[signatures::MACHINE_TRANSFERRED, signatures::MACHINE_DECOMMISSIONED],
    SourceKind::Fractional => &[signatures::ASSET_REGISTERED, signatures::SHARES_TRANSFERRED, signatures::ASSET_DECOMMISSIONED],
    SourceKind::Distributor => &[signatures::ROOT_SUBMITTED, signatures::CLAIMED],
  }
}

pub fn topic(signature: &str) -> Word {
  keccak256(signature.as_bytes()).0
}

/// Number of static parameters in a signature.
fn arity(signature: &str) -> usize {
  let params = signature
    .split_once('(')
    .map(|(_, rest)| rest.trim_end_matches(')'))
    .unwrap_or("");
  if params.is_empty() { 0 } else { params.split(',').count() }
}

struct Words {
  words: Vec<Word>,
  next: usize,
}

impl Words {
  fn from_log(log: &LogEntry) -> std::result::Result<Words, String> {
    if log.data.len() % 32 != 0 {
      return Err(format!("data length {} is not word aligned", log.data.len()))
    }
    let mut words: Vec<Word> = log.topics.iter().skip(1).cloned().collect();
    for chunk in log.data.chunks(32) {
      let mut word = [0u8; 32];
      word.copy_from_slice(chunk);
      words.push(word);
    }
    Ok(Words { words, next: 0 })
  }

  fn len(&self) -> usize {
    self.words.len()
  }

  fn take(&mut self) -> std::result::Result<Word, String> {
    let word = self.words.get(self.next).cloned().ok_or_else(|| "missing parameter".to_owned())?;
    self.next += 1;
    Ok(word)
  }

  fn uint(&mut self, width: usize) -> std::result::Result<u128, String> {
    let word = self.take()?;
    if word[..32 - width].iter().any(|b| *b != 0) {
      return Err(format!("uint256 value 0x{} exceeds {} bytes", hex::encode(word), width))
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
  }

  fn u128(&mut self) -> std::result::Result<u128, String> {
    self.uint(16)
  }

  fn u64(&mut self) -> std::result::Result<u64, String> {
    self.uint(8).map(|v| v as u64)
  }

  fn u8(&mut self) -> std::result::Result<u8, String> {
    self.uint(1).map(|v| v as u8)
  }

  /// Identifiers are kept as decimal strings.
  fn id(&mut self) -> std::result::Result<String, String> {
    self.u128().map(|v| v.to_string())
  }

  fn address(&mut self) -> std::result::Result<String, String> {
    let word = self.take()?;
    if word[..12].iter().any(|b| *b != 0) {
      return Err(format!("0x{} is not an address", hex::encode(word)))
    }
    Ok(format!("0x{}", hex::encode(&word[12..])))
  }

  fn bytes32(&mut self) -> std::result::Result<String, String> {
    self.take().map(|w| encode_hash(&w))
  }
}

/// Decodes a log emitted by a source of `kind`. Returns the rejection reason
/// on failure; unknown events are failures, never skipped.
pub fn decode(kind: SourceKind, log: &LogEntry) -> std::result::Result<ChainEvent, String> {
  let topic0 = log.topics.first().ok_or_else(|| "log has no topics".to_owned())?;
  let signature = signatures_for(kind)
    .iter()
    .find(|s| topic(s) == *topic0)
    .ok_or_else(|| format!("unknown event topic {} for {} source", encode_hash(topic0), kind))?;

  let mut w = Words::from_log(log)?;
  if w.len() != arity(signature) {
    return Err(format!("{} expects {} parameters, log has {}", signature, arity(signature), w.len()))
  }

  let event = match *signature {
    signatures::REVENUE_POSTED => ChainEvent::RevenuePosted {
      epoch_id: w.u64()?,
      total_revenue: w.u128()?,
      posted_at: w.u64()?,
    },
    signatures::MACHINE_REVENUE_REPORTED => ChainEvent::MachineRevenueReported {
      epoch_id: w.u64()?,
      machine_id: w.id()?,
      amount: w.u128()?,
    },
    signatures::POSITION_OPENED => ChainEvent::PositionOpened {
      position_id: w.id()?,
      account: w.address()?,
      amount: w.u128()?,
      lock_days: w.u64()?,
      lock_until: w.u64()?,
    },
    signatures::POSITION_CLOSED => ChainEvent::PositionClosed { position_id: w.id()? },
    signatures::MACHINE_TRANSFERRED => ChainEvent::MachineTransferred {
      machine_id: w.id()?,
      from: w.address()?,
      to: w.address()?,
    },
    signatures::MACHINE_DECOMMISSIONED => ChainEvent::MachineDecommissioned { machine_id: w.id()? },
    signatures::ASSET_REGISTERED => {
      let asset_id = w.id()?;
      let bps = w.u64()?;
      if bps > 10_000 {
        return Err(format!("asset {} share of {} bps exceeds 10000", asset_id, bps))
      }
      ChainEvent::AssetRegistered { asset_id, share_basis_points: bps as u32, expires_at: w.u64()? }
    },
    signatures::SHARES_TRANSFERRED => ChainEvent::SharesTransferred {
      asset_id: w.id()?,
      from: w.address()?,
      to: w.address()?,
      units: w.u128()?,
    },
    signatures::ASSET_DECOMMISSIONED => ChainEvent::AssetDecommissioned { asset_id: w.id()? },
    signatures::ROOT_SUBMITTED => ChainEvent::RootSubmitted {
      epoch_id: w.u64()?,
      group: w.u8()?,
      root: w.bytes32()?,
    },
    signatures::CLAIMED => ChainEvent::Claimed {
      epoch_id: w.u64()?,
      group: w.u8()?,
      account: w.address()?,
      amount: w.u128()?,
    },
    other => return Err(format!("no decoder for {}", other)),
  };
  Ok(event)
}

impl ChainEvent {
  pub fn signature(&self) -> &'static str {
    match self {
      ChainEvent::RevenuePosted { .. } => signatures::REVENUE_POSTED,
      ChainEvent::MachineRevenueReported { .. } => signatures::MACHINE_REVENUE_REPORTED,
      ChainEvent::PositionOpened { .. } => signatures::POSITION_OPENED,
      ChainEvent::PositionClosed { .. } => signatures::POSITION_CLOSED,
      ChainEvent::MachineTransferred { .. } => signatures::MACHINE_TRANSFERRED,
      ChainEvent::MachineDecommissioned { .. } => signatures::MACHINE_DECOMMISSIONED,
      ChainEvent::AssetRegistered { .. } => signatures::ASSET_REGISTERED,
      ChainEvent::SharesTransferred { .. } => signatures::SHARES_TRANSFERRED,
      ChainEvent::AssetDecommissioned { .. } => signatures::ASSET_DECOMMISSIONED,
      ChainEvent::RootSubmitted { .. } => signatures::ROOT_SUBMITTED,
      ChainEvent::Claimed { .. } => signatures::CLAIMED,
    }
  }

  pub fn into_fact(self, source_id: &str, log: &LogEntry) -> Result<RawEventFact> {
    let value = serde_json::to_value(&self)
      .map_err(|e| Error::Invariant(format!("could not encode event: {}", e)))?;
    let name = value.get("name").and_then(Value::as_str).unwrap_or_default().to_owned();
    let args = value.get("args").cloned().unwrap_or(Value::Null);
    Ok(RawEventFact {
      source_id: source_id.to_owned(),
      block_number: log.block_number,
      tx_ref: log.tx_ref.clone(),
      log_index: log.log_index,
      event_name: name,
      decoded_args: args,
    })
  }

  pub fn from_fact(fact: &RawEventFact) -> Result<ChainEvent> {
    serde_json::from_value(json!({ "name": fact.event_name, "args": fact.decoded_args }))
      .map_err(|e| Error::integrity(&fact.source_id, format!(
        "stored fact {}:{} does not decode: {}", fact.tx_ref, fact.log_index, e
      )))
  }
}
