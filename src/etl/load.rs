/// Load Module
///
/// Writes an assembled block graph through the `Storage` collaborator.
///
/// Order matters: addresses first, then transactions with their inputs and
/// outputs, then the spent marks on the outputs they consume. The block row is
/// written last by the importer, so the persisted block count only moves once a
/// height is complete and a crash anywhere before that is replayed cleanly.
use anyhow::Result;

use crate::db::Storage;
use crate::error::{IntegrityKind, IntegrityWarning};
use crate::etl::transform::{verify_counts, BlockGraph};
use crate::models::{Address, Block, Bundle, Transaction};

/// Counts of what a load actually wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub addresses_created: usize,
    pub transactions_written: usize,
    pub outputs_spent: usize,
    /// The block hash was already stored and got re-validated
    pub reused_block: bool,
}

/// Find the stored block for the graph's hash or take the assembled one.
///
/// A stored block is re-validated against the bundle; disagreements come back
/// as warnings.
pub async fn find_or_create_block<S: Storage + ?Sized>(
    storage: &S,
    graph: &BlockGraph,
    bundle: &Bundle,
) -> Result<(Block, bool, Vec<IntegrityWarning>)> {
    let Some(stored) = storage.find_block_by_hash(&graph.block.hash).await? else {
        return Ok((graph.block.clone(), false, Vec::new()));
    };

    let mut warnings = Vec::new();
    if stored.height != graph.block.height {
        warnings.push(IntegrityWarning {
            subject: format!("block {}", stored.hash),
            kind: IntegrityKind::StoredBlock,
            expected: graph.block.height as usize,
            actual: stored.height as usize,
        });
    }
    if stored.tx_ids.len() != graph.block.tx_ids.len() {
        warnings.push(IntegrityWarning {
            subject: format!("block {}", stored.hash),
            kind: IntegrityKind::MissingTransaction,
            expected: graph.block.tx_ids.len(),
            actual: stored.tx_ids.len(),
        });
    }

    let mut stored_transactions = Vec::new();
    for tx in &graph.transactions {
        if let Some(found) = storage.find_transaction(&tx.txid).await? {
            stored_transactions.push(found);
        }
    }
    warnings.extend(verify_counts(&stored_transactions, bundle));

    Ok((stored, true, warnings))
}

/// Save every address not yet stored. Returns how many were created.
pub async fn persist_addresses<S: Storage + ?Sized>(storage: &S, addresses: &[Address]) -> Result<usize> {
    let mut created = 0;
    for address in addresses {
        if storage.address_exists(&address.address).await? {
            continue;
        }
        storage.save_address(address).await?;
        tracing::debug!("Address {} created", address);
        created += 1;
    }
    Ok(created)
}

/// Save transactions, then mark the previous outputs their inputs consume.
///
/// Returns (transactions written, outputs marked spent).
pub async fn persist_transactions<S: Storage + ?Sized>(
    storage: &S,
    transactions: &[Transaction],
) -> Result<(usize, usize)> {
    for transaction in transactions {
        storage.save_transaction(transaction).await?;
    }

    let mut spent = 0;
    for input in transactions.iter().flat_map(|tx| tx.inputs.iter()) {
        let Some(previous) = &input.previous_output else {
            continue;
        };
        if storage.mark_output_spent(previous).await? {
            spent += 1;
        } else {
            tracing::debug!("Input {}:{} spends unknown output {}:{}", input.txid, input.n, previous.txid, previous.n);
        }
    }

    Ok((transactions.len(), spent))
}
