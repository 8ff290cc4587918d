use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::fixtures;
use crate::error::{NodeError, RPC_INVALID_PARAMETER};
use crate::models::{Bundle, RawBlock, RawTransaction};
use crate::rpc::NodeClient;

#[derive(Default)]
struct Chain {
    bundles: BTreeMap<u64, Bundle>,
    tip: u64,
    reachable: bool,
    failing_heights: HashSet<u64>,
}

/// Mock node for testing.
/// Serves bundles from memory, counts calls and can be told to fail.
pub struct MockNode {
    chain: Mutex<Chain>,
    hash_calls: AtomicUsize,
    transaction_calls: AtomicUsize,
}

impl MockNode {
    /// A node whose chain holds fixture bundles for heights 1..=tip
    pub fn with_chain(tip: u64) -> Self {
        let node = Self {
            chain: Mutex::new(Chain { reachable: true, ..Chain::default() }),
            hash_calls: AtomicUsize::new(0),
            transaction_calls: AtomicUsize::new(0),
        };
        node.extend_chain(tip);
        node
    }

    /// Grow the chain with fixture bundles up to `tip`
    pub fn extend_chain(&self, tip: u64) {
        let mut chain = self.chain.lock().unwrap();
        for height in 1..=tip {
            chain.bundles.entry(height).or_insert_with(|| fixtures::bundle(height));
        }
        chain.tip = chain.tip.max(tip);
    }

    pub fn set_bundle(&self, bundle: Bundle) {
        let mut chain = self.chain.lock().unwrap();
        chain.tip = chain.tip.max(bundle.height);
        chain.bundles.insert(bundle.height, bundle);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.chain.lock().unwrap().reachable = reachable;
    }

    /// Every `getrawtransaction` for a transaction of `height` returns an RPC error
    pub fn fail_transactions_at(&self, height: u64) {
        self.chain.lock().unwrap().failing_heights.insert(height);
    }

    pub fn heal_transactions_at(&self, height: u64) {
        self.chain.lock().unwrap().failing_heights.remove(&height);
    }

    /// Number of `getblockhash` calls, i.e. bundle fetch attempts
    pub fn fetch_attempts(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }

    pub fn transaction_calls(&self) -> usize {
        self.transaction_calls.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> Result<(), NodeError> {
        if self.chain.lock().unwrap().reachable {
            Ok(())
        } else {
            Err(NodeError::Transport("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn remote_height(&self) -> Result<u64, NodeError> {
        self.ensure_reachable()?;
        Ok(self.chain.lock().unwrap().tip)
    }

    async fn block_hash(&self, height: u64) -> Result<String, NodeError> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;
        let chain = self.chain.lock().unwrap();
        chain
            .bundles
            .get(&height)
            .map(|bundle| bundle.block.hash.clone())
            .ok_or_else(|| NodeError::from_rpc(RPC_INVALID_PARAMETER, "Block height out of range".to_string()))
    }

    async fn block(&self, hash: &str) -> Result<RawBlock, NodeError> {
        self.ensure_reachable()?;
        let chain = self.chain.lock().unwrap();
        chain
            .bundles
            .values()
            .find(|bundle| bundle.block.hash == hash)
            .map(|bundle| bundle.block.clone())
            .ok_or_else(|| NodeError::NotFound(format!("block {}", hash)))
    }

    async fn transaction(&self, txid: &str) -> Result<RawTransaction, NodeError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;
        let chain = self.chain.lock().unwrap();
        for bundle in chain.bundles.values() {
            if let Some(tx) = bundle.transaction(txid) {
                if chain.failing_heights.contains(&bundle.height) {
                    return Err(NodeError::Rpc { code: -32603, message: "internal error".to_string() });
                }
                return Ok(tx.clone());
            }
        }
        Err(NodeError::NotFound(format!("transaction {}", txid)))
    }
}
