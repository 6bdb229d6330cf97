use alloy_primitives::keccak256;
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use strum_macros::Display;

use crate::config::{PublisherConfig, RpcConfig};
use crate::constants::{signatures, Group, SubmissionStatus};
use crate::errors::RpcError;
use crate::events::{LogEntry, Word};
use crate::utils::{self, decode_hash, encode_hash};

/// Everything the pipeline needs from the chain.
pub trait ChainClient: Send + Sync {
  fn head(&self) -> Result<u64, RpcError>;
  /// Block hash at `height`, `None` above the head.
  fn block_ref(&self, height: u64) -> Result<Option<String>, RpcError>;
  /// Logs emitted by `address` in `[from, to]`.
  fn logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<LogEntry>, RpcError>;
  /// Sends `submitRoot` and returns the transaction reference.
  fn submit_commitment(&self, epoch_id: u64, group: Group, root: &str) -> Result<String, RpcError>;
  fn submission_status(&self, tx_ref: &str) -> Result<SubmissionStatus, RpcError>;
  /// Root currently stored by the distributor, `None` if unset.
  fn published_root(&self, epoch_id: u64, group: Group) -> Result<Option<String>, RpcError>;
}

#[derive(Display, Clone, Copy)]
pub enum RPCMethod {
  #[strum(serialize = "eth_blockNumber")]
  BlockNumber,
  #[strum(serialize = "eth_getBlockByNumber")]
  GetBlockByNumber,
  #[strum(serialize = "eth_getLogs")]
  GetLogs,
  #[strum(serialize = "eth_sendTransaction")]
  SendTransaction,
  #[strum(serialize = "eth_getTransactionReceipt")]
  GetTransactionReceipt,
  #[strum(serialize = "eth_getTransactionByHash")]
  GetTransactionByHash,
  #[strum(serialize = "eth_call")]
  Call,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RPCRequest {
  id: i32,
  jsonrpc: String,
  method: String,
  params: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RPCErrorObject {
  pub code: i64,
  pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RPCResponse {
  pub id: i32,
  pub jsonrpc: String,
  #[serde(default)]
  pub result: Value,
  pub error: Option<RPCErrorObject>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
  pub address: String,
  pub topics: Vec<String>,
  pub data: String,
  pub block_number: String,
  pub block_hash: String,
  pub transaction_hash: String,
  pub log_index: String,
  #[serde(default)]
  pub removed: bool,
}

impl RawLog {
  pub fn into_entry(self) -> Result<LogEntry, RpcError> {
    let topics = self.topics.iter()
      .map(|t| decode_hash(t).map_err(|e| RpcError::Malformed(e.to_string())))
      .collect::<Result<Vec<Word>, RpcError>>()?;
    let data = hex::decode(self.data.trim_start_matches("0x"))
      .map_err(|e| RpcError::Malformed(format!("log data: {}", e)))?;
    let block_number = quantity(&self.block_number)?;
    let log_index = quantity(&self.log_index)?;
    Ok(LogEntry {
      address: self.address.to_lowercase(),
      topics,
      data,
      block_number,
      block_hash: self.block_hash.to_lowercase(),
      tx_ref: self.transaction_hash.to_lowercase(),
      log_index: u32::try_from(log_index).map_err(|_| RpcError::Malformed(format!("log index {}", log_index)))?,
      removed: self.removed,
    })
  }
}

fn quantity(s: &str) -> Result<u64, RpcError> {
  utils::parse_quantity(s).ok_or_else(|| RpcError::Malformed(format!("invalid quantity '{}'", s)))
}

fn hex_quantity(v: u64) -> String {
  format!("0x{:x}", v)
}

pub(crate) fn uint_word(v: u128) -> Word {
  let mut word = [0u8; 32];
  word[16..].copy_from_slice(&v.to_be_bytes());
  word
}

/// ABI call data for a function taking only static arguments.
pub fn call_data(signature: &str, args: &[Word]) -> String {
  let selector = keccak256(signature.as_bytes());
  let mut data = selector.0[..4].to_vec();
  for arg in args {
    data.extend_from_slice(arg);
  }
  format!("0x{}", hex::encode(data))
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
  base * 2u32.pow(attempt.saturating_sub(1).min(10))
}

pub struct RpcClient {
  rpc_url: Url,
  http_client: Client,
  max_retries: u32,
  backoff_base: Duration,
  sender: String,
  distributor: String,
}

impl RpcClient {
  pub fn new(rpc: &RpcConfig, publisher: &PublisherConfig) -> Result<RpcClient, RpcError> {
    let rpc_url = Url::parse(rpc.url.as_str())
      .map_err(|e| RpcError::Malformed(format!("rpc url: {}", e)))?;
    let http_client = Client::builder()
      .timeout(Duration::from_secs(rpc.timeout_secs))
      .build()?;
    Ok(Self {
      rpc_url,
      http_client,
      max_retries: rpc.max_retries,
      backoff_base: Duration::from_millis(rpc.backoff_base_ms),
      sender: publisher.account.to_lowercase(),
      distributor: publisher.distributor_address.to_lowercase(),
    })
  }

  fn rpc_call_once(&self, method: RPCMethod, params: &Value) -> Result<Value, RpcError> {
    let request = RPCRequest {
      id: 1,
      jsonrpc: "2.0".to_string(),
      method: method.to_string(),
      params: params.clone(),
    };
    trace!("call {} {}", request.method, self.rpc_url);

    let resp = self.http_client.post(self.rpc_url.clone()).json(&request).send()?;
    let body = resp.text()?;
    trace!("response {}", body);

    let rpc_response: RPCResponse = serde_json::from_str(body.as_str())?;
    match rpc_response.error {
      Some(e) => Err(RpcError::Rpc { code: e.code, message: e.message }),
      None => Ok(rpc_response.result),
    }
  }

  /// Retries transport failures with exponential backoff.
  pub fn rpc_call(&self, method: RPCMethod, params: Value) -> Result<Value, RpcError> {
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self.rpc_call_once(method, &params) {
        Ok(result) => return Ok(result),
        Err(e) if e.is_retryable() && attempt <= self.max_retries => {
          let delay = backoff_delay(self.backoff_base, attempt);
          warn!("{} failed (attempt {}), retrying in {:?}: {}", method, attempt, delay, e);
          std::thread::sleep(delay);
        },
        Err(e) if e.is_retryable() => {
          return Err(RpcError::Exhausted { attempts: attempt, last: e.to_string() })
        },
        Err(e) => return Err(e),
      }
    }
  }

  fn decode<T: serde::de::DeserializeOwned>(result: Value) -> Result<T, RpcError> {
    Ok(serde_json::from_value(result)?)
  }
}

#[derive(Deserialize)]
struct BlockResult {
  hash: String,
}

#[derive(Deserialize)]
struct ReceiptResult {
  status: Option<String>,
}

impl ChainClient for RpcClient {
  fn head(&self) -> Result<u64, RpcError> {
    let result: String = Self::decode(self.rpc_call(RPCMethod::BlockNumber, json!([]))?)?;
    quantity(&result)
  }

  fn block_ref(&self, height: u64) -> Result<Option<String>, RpcError> {
    let result = self.rpc_call(RPCMethod::GetBlockByNumber, json!([hex_quantity(height), false]))?;
    let block: Option<BlockResult> = Self::decode(result)?;
    Ok(block.map(|b| b.hash.to_lowercase()))
  }

  fn logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<LogEntry>, RpcError> {
    let filter = json!([{
      "address": address,
      "fromBlock": hex_quantity(from),
      "toBlock": hex_quantity(to),
    }]);
    let raw: Vec<RawLog> = Self::decode(self.rpc_call(RPCMethod::GetLogs, filter)?)?;
    raw.into_iter().map(RawLog::into_entry).collect()
  }

  fn submit_commitment(&self, epoch_id: u64, group: Group, root: &str) -> Result<String, RpcError> {
    let root = decode_hash(root).map_err(|e| RpcError::Malformed(e.to_string()))?;
    let data = call_data(signatures::SUBMIT_ROOT, &[
      uint_word(u128::from(epoch_id)),
      uint_word(u128::from(group.index())),
      root,
    ]);
    let tx = json!([{ "from": self.sender, "to": self.distributor, "data": data }]);
    let tx_ref: String = Self::decode(self.rpc_call(RPCMethod::SendTransaction, tx)?)?;
    Ok(tx_ref.to_lowercase())
  }

  fn submission_status(&self, tx_ref: &str) -> Result<SubmissionStatus, RpcError> {
    let result = self.rpc_call(RPCMethod::GetTransactionReceipt, json!([tx_ref]))?;
    let receipt: Option<ReceiptResult> = Self::decode(result)?;
    let status = match receipt.and_then(|r| r.status) {
      Some(status) => quantity(&status)?,
      None => {
        // without a receipt, only a transaction the node still knows can land
        let tx = self.rpc_call(RPCMethod::GetTransactionByHash, json!([tx_ref]))?;
        return Ok(if tx.is_null() { SubmissionStatus::Dropped } else { SubmissionStatus::Pending })
      },
    };
    Ok(if status == 1 { SubmissionStatus::Confirmed } else { SubmissionStatus::Failed })
  }

  fn published_root(&self, epoch_id: u64, group: Group) -> Result<Option<String>, RpcError> {
    let data = call_data(signatures::MERKLE_ROOTS, &[
      uint_word(u128::from(epoch_id)),
      uint_word(u128::from(group.index())),
    ]);
    let call = json!([{ "to": self.distributor, "data": data }, "latest"]);
    let result: String = Self::decode(self.rpc_call(RPCMethod::Call, call)?)?;
    let root = decode_hash(&result).map_err(|e| RpcError::Malformed(e.to_string()))?;
    if root == [0u8; 32] {
      Ok(None)
    } else {
      Ok(Some(encode_hash(&root)))
    }
  }
}
