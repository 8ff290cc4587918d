/// Data Models Module
///
/// This module defines the core data structures used throughout the application.
/// The raw types mirror the JSON returned by the node (blocks, transactions,
/// inputs and outputs) and make up a fetched `Bundle`. The entity types are the
/// graph persisted by the importer.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of base units in one coin, used to convert decimal output values
pub const BASE_UNITS_PER_COIN: f64 = 100_000_000.0;

// ---------------------------------------------------------------------------
// Raw node data
// ---------------------------------------------------------------------------

/// Block header fields plus ordered transaction ids, as returned by `getblock`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub hash: String,
    pub height: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "merkleroot", default)]
    pub merkle_root: String,
    pub time: i64,
    #[serde(rename = "mediantime", default)]
    pub median_time: Option<i64>,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub bits: String,
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub chainwork: Option<String>,
    #[serde(rename = "previousblockhash", default)]
    pub previous_hash: Option<String>,
    #[serde(rename = "tx")]
    pub tx_ids: Vec<String>,
}

/// Transaction with inputs and outputs, as returned by `getrawtransaction <txid> 1`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub txid: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub locktime: u64,
    pub vin: Vec<RawInput>,
    pub vout: Vec<RawOutput>,
}

/// Either a coinbase marker or a reference to a previous output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutput {
    /// Decimal coin amount
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub hex: String,
    #[serde(rename = "type", default)]
    pub script_type: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Legacy node versions report a list instead of a single address
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
}

impl ScriptPubKey {
    /// The address paid by this script, if the node could decode one
    pub fn paid_address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .or_else(|| self.addresses.as_ref().and_then(|list| list.first()).map(String::as_str))
    }
}

impl RawOutput {
    /// Value converted to integer base units
    pub fn value_base_units(&self) -> i64 {
        (self.value * BASE_UNITS_PER_COIN).round() as i64
    }
}

/// The full raw data for one height, fetched atomically.
///
/// Immutable once produced. `transactions` follows the order of
/// `block.tx_ids`, minus the genesis coinbase which the node cannot serve.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub height: u64,
    pub block: RawBlock,
    pub transactions: Vec<RawTransaction>,
}

impl Bundle {
    pub fn transaction(&self, txid: &str) -> Option<&RawTransaction> {
        self.transactions.iter().find(|tx| tx.txid == txid)
    }
}

// ---------------------------------------------------------------------------
// Persisted graph
// ---------------------------------------------------------------------------

/// Import state of a persisted block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    /// Assembled from a bundle, not yet fully written
    Created,
    /// Block, transactions and addresses are all persisted
    Imported,
}

impl BlockState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Imported => "imported",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "imported" => Some(Self::Imported),
            _ => None,
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a persisted block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub previous_hash: Option<String>,
    pub merkle_root: String,
    pub time: Option<DateTime<Utc>>,
    pub version: i64,
    pub nonce: u64,
    pub bits: String,
    pub difficulty: f64,
    pub size: u64,
    pub state: BlockState,
    /// Ordered transaction references
    pub tx_ids: Vec<String>,
}

/// Represents a persisted transaction with its ordered inputs and outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub block_hash: String,
    pub block_height: u64,
    pub position: u32,
    pub version: i64,
    pub size: u64,
    pub locktime: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// Reference to a previous output, keyed like `TxOutput`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub n: u32,
    /// `None` for a coinbase input
    pub previous_output: Option<OutPoint>,
    pub coinbase: Option<String>,
    pub sequence: u64,
}

impl TxInput {
    #[allow(dead_code)]
    pub fn is_coinbase(&self) -> bool {
        self.previous_output.is_none()
    }
}

/// Output keyed by (txid, n)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub txid: String,
    pub n: u32,
    pub value: i64,
    pub script_hex: String,
    pub script_type: Option<String>,
    pub address: Option<String>,
    pub spent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
}

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}
