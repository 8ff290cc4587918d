/// RPC Client Module
///
/// This module handles all interactions with the bitcoin node over JSON-RPC.
/// The `NodeClient` trait is the stateless gateway used by the importer and the
/// prefetch cache; `BitcoindClient` implements it over HTTP with Basic
/// authentication. No caching and no retries happen at this layer.
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NodeError;
use crate::models::{Bundle, RawBlock, RawTransaction};

const LOG_PREFIX: &str = "Node";

/// The genesis coinbase cannot be fetched with `getrawtransaction`
pub const GENESIS_BLOCK_TRANSACTION: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

const COMMAND_GETBLOCKCOUNT: &str = "getblockcount";
const COMMAND_GETBLOCKHASH: &str = "getblockhash";
const COMMAND_GETBLOCK: &str = "getblock";
const COMMAND_GETRAWTRANSACTION: &str = "getrawtransaction";

/// Endpoint and credentials of the node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl NodeConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

/// Result of fetching a whole bundle.
///
/// Keeps "try again later" apart from "the node refused" so callers never have
/// to guess what an absent value meant.
#[derive(Debug)]
pub enum FetchOutcome {
    Found(Bundle),
    /// Transport fault or height not yet known to the node
    RetryLater(NodeError),
    /// Explicit RPC error or undecodable answer
    Failed(NodeError),
}

/// Gateway to the remote node.
///
/// Implementors provide the four primitive calls; `fetch_bundle` composes them.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Current chain height as known by the node
    async fn remote_height(&self) -> Result<u64, NodeError>;

    async fn block_hash(&self, height: u64) -> Result<String, NodeError>;

    /// Header fields and ordered transaction ids
    async fn block(&self, hash: &str) -> Result<RawBlock, NodeError>;

    /// Full verbosity transaction
    async fn transaction(&self, txid: &str) -> Result<RawTransaction, NodeError>;

    /// Fetch hash, block and every non-genesis transaction for `height`.
    ///
    /// Any sub-call failure aborts the whole bundle; nothing partial is returned.
    async fn fetch_bundle(&self, height: u64) -> FetchOutcome {
        match fetch_bundle_parts(self, height).await {
            Ok(bundle) => FetchOutcome::Found(bundle),
            Err(e) if e.is_retryable() => {
                tracing::debug!(component = LOG_PREFIX, "Block {} not available yet: {}", height, e);
                FetchOutcome::RetryLater(e)
            }
            Err(e) => {
                tracing::warn!(component = LOG_PREFIX, "Error getting the block data of block {}: {}", height, e);
                FetchOutcome::Failed(e)
            }
        }
    }
}

async fn fetch_bundle_parts<C: NodeClient + ?Sized>(client: &C, height: u64) -> Result<Bundle, NodeError> {
    let hash = client.block_hash(height).await?;
    let block = client.block(&hash).await?;

    if block.height != height {
        return Err(NodeError::Decode {
            method: COMMAND_GETBLOCK.to_string(),
            reason: format!("asked for height {} but block {} is at height {}", height, hash, block.height),
        });
    }

    let mut transactions = Vec::with_capacity(block.tx_ids.len());
    for txid in block.tx_ids.iter().filter(|txid| txid.as_str() != GENESIS_BLOCK_TRANSACTION) {
        transactions.push(client.transaction(txid).await?);
    }

    Ok(Bundle { height, block, transactions })
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// `NodeClient` over bitcoind's JSON-RPC HTTP interface
pub struct BitcoindClient {
    http: reqwest::Client,
    config: NodeConfig,
    url: String,
}

impl BitcoindClient {
    /// Create a new RPC client for the configured endpoint
    pub fn new(config: NodeConfig) -> Self {
        let url = config.url();
        Self { http: reqwest::Client::new(), config, url }
    }

    /// Get the endpoint URL this client is connected to
    pub fn endpoint(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, NodeError> {
        let request = RpcRequest { method, params };
        tracing::debug!(component = LOG_PREFIX, "Calling {} with {:?}", method, request.params);

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&request)
            .send()
            .await?;

        // bitcoind reports RPC errors with HTTP 500 and a regular JSON body
        let status = response.status();
        let body = response.bytes().await?;

        let decoded: RpcResponse<T> = match serde_json::from_slice(&body) {
            Ok(decoded) => decoded,
            Err(_) if !status.is_success() => {
                return Err(NodeError::Transport(format!("HTTP {} from node on {}", status, method)));
            }
            Err(e) => return Err(NodeError::Decode { method: method.to_string(), reason: e.to_string() }),
        };

        if let Some(error) = decoded.error {
            return Err(NodeError::from_rpc(error.code, error.message));
        }

        decoded
            .result
            .ok_or_else(|| NodeError::Decode { method: method.to_string(), reason: "null result".to_string() })
    }
}

#[async_trait]
impl NodeClient for BitcoindClient {
    async fn remote_height(&self) -> Result<u64, NodeError> {
        self.call(COMMAND_GETBLOCKCOUNT, Vec::new()).await
    }

    async fn block_hash(&self, height: u64) -> Result<String, NodeError> {
        self.call(COMMAND_GETBLOCKHASH, vec![Value::from(height)]).await
    }

    async fn block(&self, hash: &str) -> Result<RawBlock, NodeError> {
        self.call(COMMAND_GETBLOCK, vec![Value::from(hash)]).await
    }

    async fn transaction(&self, txid: &str) -> Result<RawTransaction, NodeError> {
        self.call(COMMAND_GETRAWTRANSACTION, vec![Value::from(txid), Value::from(1)]).await
    }
}
