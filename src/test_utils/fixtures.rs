use crate::models::{Bundle, RawBlock, RawInput, RawOutput, RawTransaction, ScriptPubKey};
use crate::rpc::GENESIS_BLOCK_TRANSACTION;

/// Address that receives a payment in every block above height 1
pub const MERCHANT_ADDRESS: &str = "1MerchantXXXXXXXXXXXXXXXXXXXXXXXXX";

pub fn block_hash(height: u64) -> String {
    format!("{:064x}", 0xb10c_0000_u64 + height)
}

pub fn txid(height: u64, position: usize) -> String {
    format!("{:056x}{:08x}", 0x7a_0000_u64 + height, position)
}

pub fn miner_address(height: u64) -> String {
    format!("1Miner{:028}", height)
}

pub fn output(n: u32, value: f64, address: Option<&str>) -> RawOutput {
    RawOutput {
        value,
        n,
        script_pub_key: ScriptPubKey {
            hex: format!("76a914{:02x}88ac", n),
            script_type: Some("pubkeyhash".to_string()),
            address: address.map(str::to_string),
            addresses: None,
        },
    }
}

pub fn coinbase_input() -> RawInput {
    RawInput { coinbase: Some("04ffff001d0104".to_string()), txid: None, vout: None, sequence: 4_294_967_295 }
}

pub fn spend_input(txid: &str, vout: u32) -> RawInput {
    RawInput { coinbase: None, txid: Some(txid.to_string()), vout: Some(vout), sequence: 4_294_967_295 }
}

pub fn raw_block(height: u64, tx_ids: Vec<String>) -> RawBlock {
    RawBlock {
        hash: block_hash(height),
        height,
        size: 215,
        version: 1,
        merkle_root: format!("{:064x}", height),
        time: 1_231_006_505 + height as i64 * 600,
        median_time: None,
        nonce: height * 7,
        bits: "1d00ffff".to_string(),
        difficulty: 1.0,
        chainwork: None,
        previous_hash: height.checked_sub(1).map(block_hash),
        tx_ids,
    }
}

/// Deterministic bundle for `height`.
///
/// The coinbase pays the height's miner. Above height 1 a second transaction
/// spends the previous coinbase, paying the merchant and the same miner again,
/// so the miner address appears twice in the bundle.
pub fn bundle(height: u64) -> Bundle {
    let coinbase = RawTransaction {
        txid: txid(height, 0),
        version: 1,
        size: 134,
        locktime: 0,
        vin: vec![coinbase_input()],
        vout: vec![output(0, 50.0, Some(&miner_address(height)))],
    };

    let mut transactions = vec![coinbase];
    if height > 1 {
        transactions.push(RawTransaction {
            txid: txid(height, 1),
            version: 1,
            size: 258,
            locktime: 0,
            vin: vec![spend_input(&txid(height - 1, 0), 0)],
            vout: vec![output(0, 30.0, Some(MERCHANT_ADDRESS)), output(1, 20.0, Some(&miner_address(height)))],
        });
    }

    let tx_ids = transactions.iter().map(|tx| tx.txid.clone()).collect();
    Bundle { height, block: raw_block(height, tx_ids), transactions }
}

/// Height 0, whose only transaction the node cannot serve
pub fn genesis_bundle() -> Bundle {
    Bundle { height: 0, block: raw_block(0, vec![GENESIS_BLOCK_TRANSACTION.to_string()]), transactions: Vec::new() }
}
