/// Database Module
///
/// This module defines the `Storage` capabilities the importer needs and the
/// PostgreSQL implementation of them:
/// - Connection pool management
/// - Schema migrations
/// - Lookups and idempotent upserts for blocks, transactions, outputs and addresses
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::models::{Address, Block, BlockState, OutPoint, Transaction, TxInput, TxOutput};

/// Persisted entity store consulted and written by the importer
#[async_trait]
pub trait Storage: Send + Sync {
    /// Number of persisted blocks, which is also the last imported height
    async fn count_blocks(&self) -> Result<u64>;

    async fn find_block_by_hash(&self, hash: &str) -> Result<Option<Block>>;

    async fn find_block_by_height(&self, height: u64) -> Result<Option<Block>>;

    async fn find_transaction(&self, txid: &str) -> Result<Option<Transaction>>;

    async fn find_output(&self, txid: &str, n: u32) -> Result<Option<TxOutput>>;

    async fn address_exists(&self, address: &str) -> Result<bool>;

    async fn save_address(&self, address: &Address) -> Result<()>;

    /// Save a transaction with its inputs and outputs; existing rows are kept
    async fn save_transaction(&self, transaction: &Transaction) -> Result<()>;

    /// Returns false when the output is unknown
    async fn mark_output_spent(&self, outpoint: &OutPoint) -> Result<bool>;

    /// Insert the block or update the state of the stored one
    async fn save_block(&self, block: &Block) -> Result<()>;
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("Failed to run database migrations")?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }

    async fn load_transaction_parts(&self, txid: &str) -> Result<(Vec<TxInput>, Vec<TxOutput>)> {
        let inputs = sqlx::query(
            "SELECT txid, n, previous_txid, previous_n, coinbase, sequence
             FROM tx_inputs WHERE txid = $1 ORDER BY n",
        )
        .bind(txid)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load inputs of {}", txid))?
        .iter()
        .map(input_from_row)
        .collect::<Result<Vec<_>>>()?;

        let outputs = sqlx::query(
            "SELECT txid, n, value, script_hex, script_type, address, spent
             FROM tx_outputs WHERE txid = $1 ORDER BY n",
        )
        .bind(txid)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load outputs of {}", txid))?
        .iter()
        .map(output_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok((inputs, outputs))
    }
}

const BLOCK_COLUMNS: &str =
    "height, hash, previous_hash, merkle_root, block_time, version, nonce, bits, difficulty, size, state, tx_ids";

fn block_from_row(row: &sqlx::postgres::PgRow) -> Result<Block> {
    let state: String = row.try_get("state")?;
    let block_time: Option<DateTime<Utc>> = row.try_get("block_time")?;
    Ok(Block {
        height: row.try_get::<i64, _>("height")? as u64,
        hash: row.try_get("hash")?,
        previous_hash: row.try_get("previous_hash")?,
        merkle_root: row.try_get("merkle_root")?,
        time: block_time,
        version: row.try_get("version")?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        bits: row.try_get("bits")?,
        difficulty: row.try_get("difficulty")?,
        size: row.try_get::<i64, _>("size")? as u64,
        state: BlockState::parse(&state).with_context(|| format!("Unknown block state {}", state))?,
        tx_ids: row.try_get("tx_ids")?,
    })
}

fn input_from_row(row: &sqlx::postgres::PgRow) -> Result<TxInput> {
    let previous_txid: Option<String> = row.try_get("previous_txid")?;
    let previous_n: Option<i32> = row.try_get("previous_n")?;
    let previous_output = match (previous_txid, previous_n) {
        (Some(txid), Some(n)) => Some(OutPoint { txid, n: n as u32 }),
        _ => None,
    };
    Ok(TxInput {
        txid: row.try_get("txid")?,
        n: row.try_get::<i32, _>("n")? as u32,
        previous_output,
        coinbase: row.try_get("coinbase")?,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
    })
}

fn output_from_row(row: &sqlx::postgres::PgRow) -> Result<TxOutput> {
    Ok(TxOutput {
        txid: row.try_get("txid")?,
        n: row.try_get::<i32, _>("n")? as u32,
        value: row.try_get("value")?,
        script_hex: row.try_get("script_hex")?,
        script_type: row.try_get("script_type")?,
        address: row.try_get("address")?,
        spent: row.try_get("spent")?,
    })
}

#[async_trait]
impl Storage for Database {
    async fn count_blocks(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count blocks")?;
        Ok(count as u64)
    }

    async fn find_block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        let row = sqlx::query(&format!("SELECT {} FROM blocks WHERE hash = $1", BLOCK_COLUMNS))
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to find block {}", hash))?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn find_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        let row = sqlx::query(&format!("SELECT {} FROM blocks WHERE height = $1", BLOCK_COLUMNS))
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to find block at height {}", height))?;
        row.as_ref().map(block_from_row).transpose()
    }

    async fn find_transaction(&self, txid: &str) -> Result<Option<Transaction>> {
        let Some(row) = sqlx::query(
            "SELECT txid, block_hash, block_height, position, version, size, locktime
             FROM transactions WHERE txid = $1",
        )
        .bind(txid)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to find transaction {}", txid))?
        else {
            return Ok(None);
        };

        let (inputs, outputs) = self.load_transaction_parts(txid).await?;
        Ok(Some(Transaction {
            txid: row.try_get("txid")?,
            block_hash: row.try_get("block_hash")?,
            block_height: row.try_get::<i64, _>("block_height")? as u64,
            position: row.try_get::<i32, _>("position")? as u32,
            version: row.try_get("version")?,
            size: row.try_get::<i64, _>("size")? as u64,
            locktime: row.try_get::<i64, _>("locktime")? as u64,
            inputs,
            outputs,
        }))
    }

    async fn find_output(&self, txid: &str, n: u32) -> Result<Option<TxOutput>> {
        let row = sqlx::query(
            "SELECT txid, n, value, script_hex, script_type, address, spent
             FROM tx_outputs WHERE txid = $1 AND n = $2",
        )
        .bind(txid)
        .bind(n as i32)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to find output {}:{}", txid, n))?;
        row.as_ref().map(output_from_row).transpose()
    }

    async fn address_exists(&self, address: &str) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM addresses WHERE address = $1)")
            .bind(address)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to check address {}", address))?;
        Ok(exists)
    }

    async fn save_address(&self, address: &Address) -> Result<()> {
        sqlx::query("INSERT INTO addresses (address) VALUES ($1) ON CONFLICT (address) DO NOTHING")
            .bind(&address.address)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to save address {}", address))?;
        Ok(())
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions (txid, block_hash, block_height, position, version, size, locktime)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (txid) DO NOTHING
            "#,
        )
        .bind(&transaction.txid)
        .bind(&transaction.block_hash)
        .bind(transaction.block_height as i64)
        .bind(transaction.position as i32)
        .bind(transaction.version)
        .bind(transaction.size as i64)
        .bind(transaction.locktime as i64)
        .execute(&mut *tx)
        .await?;

        for input in &transaction.inputs {
            sqlx::query(
                r#"
                INSERT INTO tx_inputs (txid, n, previous_txid, previous_n, coinbase, sequence)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (txid, n) DO NOTHING
                "#,
            )
            .bind(&input.txid)
            .bind(input.n as i32)
            .bind(input.previous_output.as_ref().map(|p| p.txid.clone()))
            .bind(input.previous_output.as_ref().map(|p| p.n as i32))
            .bind(&input.coinbase)
            .bind(input.sequence as i64)
            .execute(&mut *tx)
            .await?;
        }

        // Existing outputs keep their spent flag
        for output in &transaction.outputs {
            sqlx::query(
                r#"
                INSERT INTO tx_outputs (txid, n, value, script_hex, script_type, address, spent)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (txid, n) DO NOTHING
                "#,
            )
            .bind(&output.txid)
            .bind(output.n as i32)
            .bind(output.value)
            .bind(&output.script_hex)
            .bind(&output.script_type)
            .bind(&output.address)
            .bind(output.spent)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.with_context(|| format!("Failed to save transaction {}", transaction.txid))?;

        tracing::debug!("Saved transaction {}", transaction.txid);
        Ok(())
    }

    async fn mark_output_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        let result = sqlx::query("UPDATE tx_outputs SET spent = TRUE WHERE txid = $1 AND n = $2")
            .bind(&outpoint.txid)
            .bind(outpoint.n as i32)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to mark output {}:{} spent", outpoint.txid, outpoint.n))?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_block(&self, block: &Block) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blocks (height, hash, previous_hash, merkle_root, block_time, version, nonce, bits,
                                difficulty, size, state, tx_ids)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (hash)
            DO UPDATE SET
                state = EXCLUDED.state,
                processed_at = NOW()
            "#,
        )
        .bind(block.height as i64)
        .bind(&block.hash)
        .bind(&block.previous_hash)
        .bind(&block.merkle_root)
        .bind(block.time)
        .bind(block.version)
        .bind(block.nonce as i64)
        .bind(&block.bits)
        .bind(block.difficulty)
        .bind(block.size as i64)
        .bind(block.state.as_str())
        .bind(&block.tx_ids)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save block {} at height {}", block.hash, block.height))?;

        tracing::debug!("Saved block at height {}", block.height);
        Ok(())
    }
}
