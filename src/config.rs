use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::constants::{SourceKind, BPS_DENOMINATOR};
use crate::errors::{Error, Result};
use crate::utils::address_bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConfigError {
  details: String
}

impl InvalidConfigError {
  pub fn details(&self) -> &str {
    self.details.as_str()
  }
}

impl fmt::Display for InvalidConfigError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.details)
  }
}

impl std::error::Error for InvalidConfigError {}

impl From<InvalidConfigError> for Error {
  fn from(e: InvalidConfigError) -> Self {
    Error::Config(e.details)
  }
}

pub trait Validate {
  fn validate(&self) -> std::result::Result<(), InvalidConfigError>;
}

fn collect_errors(errs: Vec<String>) -> std::result::Result<(), InvalidConfigError> {
  if errs.is_empty() {
    Ok(())
  } else {
    Err(InvalidConfigError{details: errs.join("\n")})
  }
}

fn default_timeout_secs() -> u64 { 10 }
fn default_max_retries() -> u32 { 5 }
fn default_backoff_base_ms() -> u64 { 500 }

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcConfig {
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_backoff_base_ms")]
  pub backoff_base_ms: u64,
}

fn default_poll_interval_secs() -> u64 { 15 }
fn default_max_batch() -> u64 { 1_000 }
fn default_confirmations() -> u64 { 12 }

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IngestConfig {
  #[serde(default = "default_poll_interval_secs")]
  pub poll_interval_secs: u64,
  #[serde(default = "default_max_batch")]
  pub max_batch: u64,
  /// Blocks kept between the chain head and the highest ingested block.
  #[serde(default = "default_confirmations")]
  pub confirmations: u64,
}

impl Default for IngestConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: default_poll_interval_secs(),
      max_batch: default_max_batch(),
      confirmations: default_confirmations(),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SourceConfig {
  pub id: String,
  pub kind: SourceKind,
  pub address: String,
  /// First block that can hold events for this source.
  pub start_block: u64,
}

/// Pool ratios in basis points.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRatios {
  pub opc: u32,
  pub alpha: u32,
  pub beta: u32,
  pub gamma: u32,
  pub delta: u32,
}

impl Default for PoolRatios {
  fn default() -> Self {
    Self { opc: 7_000, alpha: 2_000, beta: 300, gamma: 300, delta: 400 }
  }
}

impl PoolRatios {
  pub fn total(&self) -> u128 {
    [self.opc, self.alpha, self.beta, self.gamma, self.delta].iter().map(|v| u128::from(*v)).sum()
  }
}

/// Positions locked for at least `min_days` get `multiplier` per mille.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTier {
  pub min_days: u64,
  pub multiplier: u32,
}

fn default_lock_tiers() -> Vec<LockTier> {
  vec![
    LockTier { min_days: 0, multiplier: 1_000 },
    LockTier { min_days: 90, multiplier: 1_500 },
    LockTier { min_days: 180, multiplier: 2_000 },
    LockTier { min_days: 365, multiplier: 3_000 },
  ]
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DistributionConfig {
  #[serde(default)]
  pub ratios: PoolRatios,
  #[serde(default = "default_lock_tiers")]
  pub lock_tiers: Vec<LockTier>,
}

impl Default for DistributionConfig {
  fn default() -> Self {
    Self { ratios: PoolRatios::default(), lock_tiers: default_lock_tiers() }
  }
}

impl DistributionConfig {
  /// Multiplier of the highest tier whose threshold `lock_days` reaches.
  pub fn weight_tier(&self, lock_days: u64) -> u128 {
    self.lock_tiers.iter()
      .take_while(|t| t.min_days <= lock_days)
      .last()
      .map(|t| u128::from(t.multiplier))
      .unwrap_or(0)
  }
}

impl Validate for DistributionConfig {
  fn validate(&self) -> std::result::Result<(), InvalidConfigError> {
    let mut errs = vec![];
    if self.ratios.total() != BPS_DENOMINATOR {
      errs.push(format!("pool ratios must sum to {} bps, got {}", BPS_DENOMINATOR, self.ratios.total()))
    }
    match self.lock_tiers.first() {
      None => errs.push("lock_tiers must not be empty".to_owned()),
      Some(first) if first.min_days != 0 => errs.push("first lock tier must start at 0 days".to_owned()),
      _ => (),
    }
    if self.lock_tiers.windows(2).any(|w| w[0].min_days >= w[1].min_days) {
      errs.push("lock_tiers must be sorted strictly ascending by min_days".to_owned())
    }
    if self.lock_tiers.iter().any(|t| t.multiplier == 0) {
      errs.push("lock tier multipliers must be more than 0".to_owned())
    }
    collect_errors(errs)
  }
}

fn default_confirmation_polls() -> u32 { 20 }
fn default_confirmation_poll_ms() -> u64 { 3_000 }
fn default_publish_interval_secs() -> u64 { 60 }
fn default_pending_timeout_secs() -> u64 { 900 }

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PublisherConfig {
  /// Sender of root submissions.
  pub account: String,
  pub distributor_address: String,
  #[serde(default = "default_confirmation_polls")]
  pub confirmation_polls: u32,
  #[serde(default = "default_confirmation_poll_ms")]
  pub confirmation_poll_ms: u64,
  #[serde(default = "default_publish_interval_secs")]
  pub publish_interval_secs: u64,
  /// Age after which a submission with no receipt is replaced, provided the
  /// chain holds no root for the commitment.
  #[serde(default = "default_pending_timeout_secs")]
  pub pending_timeout_secs: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
  pub rpc: RpcConfig,
  #[serde(default)]
  pub ingest: IngestConfig,
  pub sources: Vec<SourceConfig>,
  #[serde(default)]
  pub distribution: DistributionConfig,
  pub publisher: PublisherConfig,
}

impl Config {
  pub fn from_yaml(yaml: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(yaml)
      .map_err(|e| Error::Config(format!("could not parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("could not read {}: {}", path.display(), e)))?;
    Config::from_yaml(&contents)
  }

  pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
    self.sources.iter().find(|s| s.id == source_id)
  }
}

impl Validate for Config {
  fn validate(&self) -> std::result::Result<(), InvalidConfigError> {
    let mut errs = vec![];
    if self.rpc.url.is_empty() {
      errs.push("rpc.url is required".to_owned())
    }
    if self.ingest.max_batch == 0 {
      errs.push("ingest.max_batch must be more than 0".to_owned())
    }
    if self.sources.is_empty() {
      errs.push("No sources found".to_owned())
    }
    let mut ids = HashSet::new();
    let mut kinds: HashMap<SourceKind, usize> = HashMap::new();
    for s in self.sources.iter() {
      let seen = kinds.entry(s.kind).or_insert(0);
      *seen += 1;
      if *seen == 2 {
        errs.push(format!("only one {} source is supported", s.kind))
      }
      if !ids.insert(s.id.as_str()) {
        errs.push(format!("source id '{}' is duplicated", s.id))
      }
      if address_bytes(&s.address.to_lowercase()).is_none() {
        errs.push(format!("source '{}' has an invalid address", s.id))
      }
    }
    if !kinds.contains_key(&SourceKind::Revenue) {
      errs.push("a revenue source is required".to_owned())
    }
    if let Err(e) = self.distribution.validate() {
      errs.push(e.details)
    }
    if address_bytes(&self.publisher.account.to_lowercase()).is_none() {
      errs.push("publisher.account is invalid".to_owned())
    }
    if address_bytes(&self.publisher.distributor_address.to_lowercase()).is_none() {
      errs.push("publisher.distributor_address is invalid".to_owned())
    }
    collect_errors(errs)
  }
}
