/// Transform Module
///
/// Turns a fetched `Bundle` into the entity graph that gets persisted.
/// Pure: no I/O, no counters, no randomness, so the same bundle always yields
/// the same graph.
use chrono::DateTime;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{IntegrityKind, IntegrityWarning};
use crate::models::{
    Address, Block, BlockState, Bundle, OutPoint, RawInput, RawTransaction, Transaction, TxInput, TxOutput,
};
use crate::rpc::GENESIS_BLOCK_TRANSACTION;

/// A block with its transactions and the distinct addresses they pay
#[derive(Debug, Clone, PartialEq)]
pub struct BlockGraph {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    /// Distinct addresses in first-seen order
    pub addresses: Vec<Address>,
    pub warnings: Vec<IntegrityWarning>,
}

impl BlockGraph {
    #[allow(dead_code)]
    pub fn output_count(&self) -> usize {
        self.transactions.iter().map(|tx| tx.outputs.len()).sum()
    }
}

/// Build the entity graph for a bundle
pub fn assemble(bundle: &Bundle) -> BlockGraph {
    let raw = &bundle.block;
    let by_txid: HashMap<&str, &RawTransaction> =
        bundle.transactions.iter().map(|tx| (tx.txid.as_str(), tx)).collect();

    let mut transactions = Vec::with_capacity(bundle.transactions.len());
    let mut warnings = Vec::new();

    for (position, txid) in raw.tx_ids.iter().enumerate() {
        if txid == GENESIS_BLOCK_TRANSACTION {
            continue;
        }
        match by_txid.get(txid.as_str()) {
            Some(raw_tx) => transactions.push(assemble_transaction(raw_tx, &raw.hash, bundle.height, position as u32)),
            None => warnings.push(IntegrityWarning {
                subject: format!("block {}", raw.hash),
                kind: IntegrityKind::MissingTransaction,
                expected: 1,
                actual: 0,
            }),
        }
    }

    warnings.extend(verify_counts(&transactions, bundle));

    let block = Block {
        height: bundle.height,
        hash: raw.hash.clone(),
        previous_hash: raw.previous_hash.clone(),
        merkle_root: raw.merkle_root.clone(),
        time: DateTime::from_timestamp(raw.time, 0),
        version: raw.version,
        nonce: raw.nonce,
        bits: raw.bits.clone(),
        difficulty: raw.difficulty,
        size: raw.size,
        state: BlockState::Created,
        tx_ids: raw.tx_ids.clone(),
    };

    let addresses = distinct_addresses(&transactions);

    BlockGraph { block, transactions, addresses, warnings }
}

fn assemble_transaction(raw: &RawTransaction, block_hash: &str, height: u64, position: u32) -> Transaction {
    let inputs = raw
        .vin
        .iter()
        .enumerate()
        .filter_map(|(n, input)| assemble_input(&raw.txid, n as u32, input))
        .collect();

    // Keyed by index; a repeated index keeps its first output
    let mut outputs = BTreeMap::new();
    for output in &raw.vout {
        outputs.entry(output.n).or_insert_with(|| TxOutput {
            txid: raw.txid.clone(),
            n: output.n,
            value: output.value_base_units(),
            script_hex: output.script_pub_key.hex.clone(),
            script_type: output.script_pub_key.script_type.clone(),
            address: output.script_pub_key.paid_address().map(str::to_string),
            spent: false,
        });
    }

    Transaction {
        txid: raw.txid.clone(),
        block_hash: block_hash.to_string(),
        block_height: height,
        position,
        version: raw.version,
        size: raw.size,
        locktime: raw.locktime,
        inputs,
        outputs: outputs.into_values().collect(),
    }
}

fn assemble_input(txid: &str, n: u32, input: &RawInput) -> Option<TxInput> {
    let previous_output = match (&input.coinbase, &input.txid, input.vout) {
        (Some(_), _, _) => None,
        (None, Some(prev), Some(vout)) => Some(OutPoint { txid: prev.clone(), n: vout }),
        _ => return None,
    };

    Some(TxInput {
        txid: txid.to_string(),
        n,
        previous_output,
        coinbase: input.coinbase.clone(),
        sequence: input.sequence,
    })
}

fn distinct_addresses(transactions: &[Transaction]) -> Vec<Address> {
    let mut seen = HashSet::new();
    transactions
        .iter()
        .flat_map(|tx| tx.outputs.iter())
        .filter_map(|output| output.address.as_deref())
        .filter(|address| seen.insert(*address))
        .map(Address::new)
        .collect()
}

/// Compare input/output counts of `transactions` with the raw counts in `bundle`
pub fn verify_counts(transactions: &[Transaction], bundle: &Bundle) -> Vec<IntegrityWarning> {
    let mut warnings = Vec::new();

    for tx in transactions {
        let Some(raw) = bundle.transaction(&tx.txid) else {
            continue;
        };
        if tx.inputs.len() != raw.vin.len() {
            warnings.push(IntegrityWarning {
                subject: format!("transaction {}", tx.txid),
                kind: IntegrityKind::InputCount,
                expected: raw.vin.len(),
                actual: tx.inputs.len(),
            });
        }
        if tx.outputs.len() != raw.vout.len() {
            warnings.push(IntegrityWarning {
                subject: format!("transaction {}", tx.txid),
                kind: IntegrityKind::OutputCount,
                expected: raw.vout.len(),
                actual: tx.outputs.len(),
            });
        }
    }

    warnings
}
