use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use crate::db::Storage;
use crate::models::{Address, Block, OutPoint, Transaction, TxOutput};

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<u64, Block>,
    hash_to_height: HashMap<String, u64>,
    transactions: BTreeMap<String, Transaction>,
    outputs: BTreeMap<(String, u32), TxOutput>,
    addresses: BTreeSet<String>,
    address_writes: usize,
    fail_block_writes: bool,
}

/// Everything stored, in a comparable shape
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSnapshot {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub outputs: Vec<TxOutput>,
    pub addresses: Vec<String>,
}

/// In-memory `Storage` with the same uniqueness rules as the SQL schema
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let tables = self.tables.lock().unwrap();
        GraphSnapshot {
            blocks: tables.blocks.values().cloned().collect(),
            transactions: tables.transactions.values().cloned().collect(),
            outputs: tables.outputs.values().cloned().collect(),
            addresses: tables.addresses.iter().cloned().collect(),
        }
    }

    pub fn heights(&self) -> Vec<u64> {
        self.tables.lock().unwrap().blocks.keys().copied().collect()
    }

    /// Number of `save_address` calls that created a row
    pub fn address_writes(&self) -> usize {
        self.tables.lock().unwrap().address_writes
    }

    /// Make every `save_block` fail, simulating a crash before the block row
    pub fn fail_block_writes(&self, fail: bool) {
        self.tables.lock().unwrap().fail_block_writes = fail;
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn count_blocks(&self) -> Result<u64> {
        Ok(self.tables.lock().unwrap().blocks.len() as u64)
    }

    async fn find_block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.hash_to_height.get(hash).and_then(|height| tables.blocks.get(height)).cloned())
    }

    async fn find_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        Ok(self.tables.lock().unwrap().blocks.get(&height).cloned())
    }

    async fn find_transaction(&self, txid: &str) -> Result<Option<Transaction>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.transactions.get(txid).map(|tx| {
            let mut tx = tx.clone();
            for output in tx.outputs.iter_mut() {
                if let Some(stored) = tables.outputs.get(&(output.txid.clone(), output.n)) {
                    output.spent = stored.spent;
                }
            }
            tx
        }))
    }

    async fn find_output(&self, txid: &str, n: u32) -> Result<Option<TxOutput>> {
        Ok(self.tables.lock().unwrap().outputs.get(&(txid.to_string(), n)).cloned())
    }

    async fn address_exists(&self, address: &str) -> Result<bool> {
        Ok(self.tables.lock().unwrap().addresses.contains(address))
    }

    async fn save_address(&self, address: &Address) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.addresses.insert(address.address.clone()) {
            tables.address_writes += 1;
        }
        Ok(())
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        for output in &transaction.outputs {
            if let Some(address) = &output.address {
                if !tables.addresses.contains(address) {
                    bail!("output {}:{} references unknown address {}", output.txid, output.n, address);
                }
            }
        }
        tables.transactions.entry(transaction.txid.clone()).or_insert_with(|| transaction.clone());
        for output in &transaction.outputs {
            tables.outputs.entry((output.txid.clone(), output.n)).or_insert_with(|| output.clone());
        }
        Ok(())
    }

    async fn mark_output_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        match tables.outputs.get_mut(&(outpoint.txid.clone(), outpoint.n)) {
            Some(output) => {
                output.spent = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_block(&self, block: &Block) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.fail_block_writes {
            bail!("storage unavailable");
        }
        if let Some(existing) = tables.hash_to_height.get(&block.hash).copied() {
            if let Some(stored) = tables.blocks.get_mut(&existing) {
                stored.state = block.state;
            }
            return Ok(());
        }
        if tables.blocks.contains_key(&block.height) {
            bail!("duplicate block height {}", block.height);
        }
        tables.hash_to_height.insert(block.hash.clone(), block.height);
        tables.blocks.insert(block.height, block.clone());
        Ok(())
    }
}
