use std::fmt;
use thiserror::Error;

use crate::constants::Group;

/// Failures talking to the chain node.
#[derive(Error, Debug)]
pub enum RpcError {
  #[error("http transport error: {0}")]
  Http(#[from] reqwest::Error),
  #[error("rpc error {code}: {message}")]
  Rpc { code: i64, message: String },
  #[error("malformed rpc response: {0}")]
  Malformed(String),
  #[error("gave up after {attempts} attempts: {last}")]
  Exhausted { attempts: u32, last: String },
  #[error("transaction {tx_ref} failed on chain")]
  Reverted { tx_ref: String },
}

impl RpcError {
  /// Whether retrying the same call may succeed.
  pub fn is_retryable(&self) -> bool {
    match self {
      RpcError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
      RpcError::Rpc { .. } | RpcError::Malformed(_) | RpcError::Exhausted { .. } | RpcError::Reverted { .. } => false,
    }
  }
}

impl From<serde_json::Error> for RpcError {
  fn from(e: serde_json::Error) -> Self {
    RpcError::Malformed(e.to_string())
  }
}

/// Expected, non-crashing rejections surfaced to API callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
  CommitmentPublished { epoch_id: u64, group: Group },
  CommitmentNotFound { epoch_id: u64, group: Group },
  /// Claims already recorded against the entries; they can no longer be rebuilt.
  ClaimsRecorded { epoch_id: u64, group: Group },
  AlreadyClaimed { epoch_id: u64, group: Group, account: String },
  NotClaimable { epoch_id: u64, group: Group, account: String },
  ClaimNotFound { epoch_id: u64, group: Group, account: String },
  RootConflict { epoch_id: u64, group: Group, on_chain: String },
}

impl PolicyViolation {
  /// Stable reason code.
  pub fn code(&self) -> &'static str {
    match self {
      PolicyViolation::CommitmentPublished { .. } => "commitment_published",
      PolicyViolation::CommitmentNotFound { .. } => "commitment_not_found",
      PolicyViolation::ClaimsRecorded { .. } => "claims_recorded",
      PolicyViolation::AlreadyClaimed { .. } => "already_claimed",
      PolicyViolation::NotClaimable { .. } => "not_claimable",
      PolicyViolation::ClaimNotFound { .. } => "claim_not_found",
      PolicyViolation::RootConflict { .. } => "root_conflict",
    }
  }
}

impl fmt::Display for PolicyViolation {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      PolicyViolation::CommitmentPublished { epoch_id, group } =>
        write!(f, "commitment {}/{} is already published", epoch_id, group),
      PolicyViolation::CommitmentNotFound { epoch_id, group } =>
        write!(f, "no commitment for {}/{}", epoch_id, group),
      PolicyViolation::ClaimsRecorded { epoch_id, group } =>
        write!(f, "commitment {}/{} already has recorded claims", epoch_id, group),
      PolicyViolation::AlreadyClaimed { epoch_id, group, account } =>
        write!(f, "{} already claimed {}/{}", account, epoch_id, group),
      PolicyViolation::NotClaimable { epoch_id, group, account } =>
        write!(f, "{} cannot claim {}/{} before its root is published", account, epoch_id, group),
      PolicyViolation::ClaimNotFound { epoch_id, group, account } =>
        write!(f, "no claim entry for {} in {}/{}", account, epoch_id, group),
      PolicyViolation::RootConflict { epoch_id, group, on_chain } =>
        write!(f, "chain holds a different root {} for {}/{}", on_chain, epoch_id, group),
    }
  }
}

/// Coarse classification used by the worker to pick retry or halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Transient,
  DataIntegrity,
  Invariant,
  Policy,
  Storage,
}

#[derive(Error, Debug)]
pub enum Error {
  #[error("transient chain failure: {0}")]
  Transient(#[from] RpcError),
  #[error("data integrity violation on {source_id}: {reason}")]
  DataIntegrity { source_id: String, reason: String },
  #[error("invariant violated: {0}")]
  Invariant(String),
  #[error("rejected ({code}): {0}", code = .0.code())]
  Policy(PolicyViolation),
  #[error("not ready: {0}")]
  NotReady(String),
  #[error("cannot build a commitment for {epoch_id}/{group} without leaves")]
  EmptyLeafSet { epoch_id: u64, group: Group },
  #[error("storage error: {0}")]
  Storage(String),
  #[error("invalid config: {0}")]
  Config(String),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Transient(_) | Error::NotReady(_) => ErrorKind::Transient,
      Error::DataIntegrity { .. } => ErrorKind::DataIntegrity,
      Error::Invariant(_) | Error::EmptyLeafSet { .. } | Error::Config(_) => ErrorKind::Invariant,
      Error::Policy(_) => ErrorKind::Policy,
      Error::Storage(_) => ErrorKind::Storage,
    }
  }

  pub fn integrity(source_id: &str, reason: impl Into<String>) -> Self {
    Error::DataIntegrity { source_id: source_id.to_owned(), reason: reason.into() }
  }
}

impl From<PolicyViolation> for Error {
  fn from(p: PolicyViolation) -> Self {
    Error::Policy(p)
  }
}

impl From<diesel::result::Error> for Error {
  fn from(e: diesel::result::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

impl From<diesel::r2d2::PoolError> for Error {
  fn from(e: diesel::r2d2::PoolError) -> Self {
    Error::Storage(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
