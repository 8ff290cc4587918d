/// Pipeline Module
///
/// Drives the import: a generic batch cycle parameterised by a next-unit
/// selector, a per-unit processor and a post-state setter, and the block
/// importer plugged into it. Keeps statistics and import status along the way.
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::Storage;
use crate::error::IntegrityWarning;
use crate::etl::extract::{extract_bundle, BundleSource};
use crate::etl::load::{self, LoadReport};
use crate::etl::prefetch::PrefetchCache;
use crate::etl::transform::{self, BlockGraph};
use crate::models::{Block, BlockState, Bundle};
use crate::rpc::NodeClient;

/// Log prefix of the block importer
pub const LOG_PREFIX: &str = "Blocks batch";

/// Most recent errors and integrity warnings kept for the final report
const MAX_RECORDED: usize = 100;

/// Pipeline execution statistics
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub blocks_attempted: usize,
    pub blocks_succeeded: usize,
    pub blocks_failed: usize,
    pub transactions_inserted: usize,
    pub addresses_created: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub integrity_warnings: usize,
    pub elapsed_time: Duration,
    pub error_count: usize,
    /// The last `MAX_RECORDED` errors
    pub errors: Vec<PipelineError>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_rate(&self) -> f64 {
        if self.blocks_attempted == 0 {
            0.0
        } else {
            (self.blocks_succeeded as f64 / self.blocks_attempted as f64) * 100.0
        }
    }

    pub fn blocks_per_second(&self) -> f64 {
        let secs = self.elapsed_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.blocks_succeeded as f64 / secs
        }
    }

    pub fn transactions_per_second(&self) -> f64 {
        let secs = self.elapsed_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.transactions_inserted as f64 / secs
        }
    }
}

/// Pipeline error with context
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub stage: PipelineStage,
    pub height: Option<u64>,
    pub message: String,
    #[allow(dead_code)]
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineStage {
    Select,
    Extract,
    Load,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Select => write!(f, "Select"),
            PipelineStage::Extract => write!(f, "Extract"),
            PipelineStage::Load => write!(f, "Load"),
        }
    }
}

/// Configuration for the importer and its prefetch cache
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// How far ahead of the import point the buffer is kept filled
    pub window: u64,
    /// Minimum distance to the remote tip before the buffer is asked to fill
    pub trigger_distance: u64,
    /// How far behind the buffer's maximum entries are kept
    pub retention: u64,
    pub fill_interval: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self { window: 100, trigger_distance: 100, retention: 20, fill_interval: Duration::from_secs(1) }
    }
}

/// Answer of a next-unit selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextUnit<U> {
    Ready(U),
    /// Nothing left to do this cycle
    CaughtUp,
    /// The selector could not decide, e.g. the node is unreachable
    Unavailable,
}

/// Result of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome<U> {
    Processed(U),
    /// The unit was selected but nothing was persisted; it is retried next cycle
    NotProcessed(U),
    CaughtUp,
    NoProgress,
}

/// The pluggable operations of a batch cycle
#[async_trait]
pub trait Batch: Send {
    type Unit: Copy + fmt::Display + Send + Sync;
    type Item: Send;

    fn log_prefix(&self) -> &'static str;

    /// Decide which unit to work on from persisted state
    async fn next_unit(&mut self) -> NextUnit<Self::Unit>;

    /// Produce the item for a unit, or `None` when it cannot be processed now
    async fn process(&mut self, unit: Self::Unit) -> Option<Self::Item>;

    /// Stamp the state a processed item is saved with
    fn set_processed_state(&self, item: &mut Self::Item);

    async fn save(&mut self, unit: Self::Unit, item: Self::Item) -> Result<()>;
}

/// Process, stamp and save one unit
pub async fn process_unit<B: Batch + ?Sized>(batch: &mut B, unit: B::Unit) -> CycleOutcome<B::Unit> {
    let started = Instant::now();

    let Some(mut item) = batch.process(unit).await else {
        return CycleOutcome::NotProcessed(unit);
    };
    batch.set_processed_state(&mut item);

    match batch.save(unit, item).await {
        Ok(()) => {
            tracing::info!(component = batch.log_prefix(), "{} processed in {} ms", unit, started.elapsed().as_millis());
            CycleOutcome::Processed(unit)
        }
        Err(e) => {
            tracing::error!(component = batch.log_prefix(), "Error saving {}: {:#}", unit, e);
            CycleOutcome::NotProcessed(unit)
        }
    }
}

/// Run a single cycle: select the next unit and process it
pub async fn run_cycle<B: Batch + ?Sized>(batch: &mut B) -> CycleOutcome<B::Unit> {
    match batch.next_unit().await {
        NextUnit::Ready(unit) => process_unit(batch, unit).await,
        NextUnit::CaughtUp => CycleOutcome::CaughtUp,
        NextUnit::Unavailable => CycleOutcome::NoProgress,
    }
}

/// Where the importer is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    Idle,
    DeterminingNextHeight,
    PrefetchTrigger,
    Fetching,
    Assembling,
    Persisting,
    CaughtUp,
}

/// Progress as last observed by the importer
#[derive(Debug, Clone, Default)]
pub struct ImportStatus {
    pub remote_height: Option<u64>,
    pub last_imported_height: Option<u64>,
    pub last_error: Option<String>,
    /// The last `MAX_RECORDED` warnings
    pub integrity_warnings: Vec<IntegrityWarning>,
}

/// A block whose transactions and addresses are persisted, waiting for its own row
#[derive(Debug, Clone)]
pub struct ProcessedBlock {
    pub block: Block,
    pub load: LoadReport,
    pub source: BundleSource,
}

/// Sequential block importer.
///
/// Resumes from the persisted block count: height `count + 1` is always next.
/// Cycles take `&mut self`, so one controller never runs two imports at once.
pub struct ImportController<C: NodeClient + ?Sized, S: Storage + ?Sized> {
    client: Arc<C>,
    storage: Arc<S>,
    cache: Arc<PrefetchCache>,
    config: ImportConfig,
    state: ImportState,
    status: ImportStatus,
    stats: PipelineStats,
    started: Instant,
}

impl<C: NodeClient + ?Sized, S: Storage + ?Sized> ImportController<C, S> {
    pub fn new(client: Arc<C>, storage: Arc<S>, cache: Arc<PrefetchCache>, config: ImportConfig) -> Self {
        Self {
            client,
            storage,
            cache,
            config,
            state: ImportState::Idle,
            status: ImportStatus::default(),
            stats: PipelineStats::new(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> ImportState {
        self.state
    }

    pub fn status(&self) -> &ImportStatus {
        &self.status
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.stats.clone();
        stats.elapsed_time = self.started.elapsed();
        stats
    }

    fn enter(&mut self, state: ImportState) {
        tracing::trace!(component = LOG_PREFIX, "{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn record_error(&mut self, stage: PipelineStage, height: Option<u64>, message: String, retryable: bool) {
        self.status.last_error = Some(message.clone());
        self.stats.error_count += 1;
        push_recent(&mut self.stats.errors, PipelineError { stage, height, message, retryable });
    }

    /// Height to import next, `CaughtUp` when the node has nothing newer, or
    /// `Unavailable` when progress or remote height cannot be read.
    pub async fn next_height_to_process(&mut self) -> NextUnit<u64> {
        self.enter(ImportState::DeterminingNextHeight);

        let count = match self.storage.count_blocks().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(component = LOG_PREFIX, "Error reading the number of imported blocks: {:#}", e);
                self.record_error(PipelineStage::Select, None, e.to_string(), true);
                self.enter(ImportState::Idle);
                return NextUnit::Unavailable;
            }
        };

        let remote = match self.client.remote_height().await {
            Ok(height) => height,
            Err(e) => {
                tracing::warn!(component = LOG_PREFIX, "Error retrieving the number of blocks on the node: {}", e);
                self.record_error(PipelineStage::Select, None, e.to_string(), true);
                self.enter(ImportState::Idle);
                return NextUnit::Unavailable;
            }
        };
        self.status.remote_height = Some(remote);

        let next = count + 1;
        if next > remote {
            self.enter(ImportState::CaughtUp);
            return NextUnit::CaughtUp;
        }

        if next.saturating_add(self.config.trigger_distance) <= remote {
            self.enter(ImportState::PrefetchTrigger);
            self.cache.trigger(next);
        }

        NextUnit::Ready(next)
    }

    /// Import one height: obtain, assemble, persist.
    ///
    /// Returns `NotProcessed` with persisted state untouched when the bundle
    /// cannot be obtained or written, or when `height` is not an imported
    /// height or the next one.
    pub async fn import_block(&mut self, height: u64) -> CycleOutcome<u64> {
        let count = match self.storage.count_blocks().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(component = LOG_PREFIX, "Error reading the number of imported blocks: {:#}", e);
                self.record_error(PipelineStage::Select, Some(height), e.to_string(), true);
                return CycleOutcome::NotProcessed(height);
            }
        };

        // Heights start at 1 and the block count is the last imported height
        if height == 0 || height > count + 1 {
            let message = format!("block {} is out of order, {} block(s) imported", height, count);
            tracing::warn!(component = LOG_PREFIX, "Refusing to import {}", message);
            self.record_error(PipelineStage::Select, Some(height), message, false);
            return CycleOutcome::NotProcessed(height);
        }

        process_unit(self, height).await
    }

    /// Run one full cycle
    pub async fn run_cycle(&mut self) -> CycleOutcome<u64> {
        run_cycle(self).await
    }

    async fn load_graph(&mut self, graph: &BlockGraph, bundle: &Bundle) -> Result<(Block, LoadReport)> {
        let storage = self.storage.as_ref();

        let (block, reused_block, revalidation) = load::find_or_create_block(storage, graph, bundle).await?;
        if reused_block {
            tracing::info!(component = LOG_PREFIX, "Block {} already known, re-validating", block.hash);
        }

        for warning in graph.warnings.iter().chain(revalidation.iter()) {
            tracing::warn!(component = LOG_PREFIX, "Block {}: {}", bundle.height, warning);
            push_recent(&mut self.status.integrity_warnings, warning.clone());
            self.stats.integrity_warnings += 1;
        }

        tracing::info!(
            component = LOG_PREFIX,
            "Listing all addresses from {} transaction(s)",
            graph.transactions.len()
        );
        let addresses_created = load::persist_addresses(storage, &graph.addresses).await?;
        let (transactions_written, outputs_spent) = load::persist_transactions(storage, &graph.transactions).await?;

        Ok((block, LoadReport { addresses_created, transactions_written, outputs_spent, reused_block }))
    }
}

#[async_trait]
impl<C: NodeClient + ?Sized, S: Storage + ?Sized> Batch for ImportController<C, S> {
    type Unit = u64;
    type Item = ProcessedBlock;

    fn log_prefix(&self) -> &'static str {
        LOG_PREFIX
    }

    async fn next_unit(&mut self) -> NextUnit<u64> {
        self.next_height_to_process().await
    }

    async fn process(&mut self, height: u64) -> Option<ProcessedBlock> {
        self.stats.blocks_attempted += 1;
        self.enter(ImportState::Fetching);

        let extracted = match extract_bundle(&self.cache, self.client.as_ref(), height).await {
            Ok(extracted) => extracted,
            Err(e) => {
                tracing::error!(component = LOG_PREFIX, "No response from the node for block {}: {}", height, e);
                let retryable = e.is_retryable();
                self.record_error(PipelineStage::Extract, Some(height), e.to_string(), retryable);
                self.stats.blocks_failed += 1;
                self.enter(ImportState::Idle);
                return None;
            }
        };
        match extracted.source {
            BundleSource::Cache => self.stats.cache_hits += 1,
            BundleSource::Node => self.stats.cache_misses += 1,
        }

        self.enter(ImportState::Assembling);
        let graph = transform::assemble(&extracted.bundle);

        self.enter(ImportState::Persisting);
        match self.load_graph(&graph, &extracted.bundle).await {
            Ok((block, load)) => Some(ProcessedBlock { block, load, source: extracted.source }),
            Err(e) => {
                tracing::error!(component = LOG_PREFIX, "Error persisting block {}: {:#}", height, e);
                self.record_error(PipelineStage::Load, Some(height), e.to_string(), true);
                self.stats.blocks_failed += 1;
                self.enter(ImportState::Idle);
                None
            }
        }
    }

    fn set_processed_state(&self, item: &mut ProcessedBlock) {
        item.block.state = BlockState::Imported;
    }

    async fn save(&mut self, height: u64, item: ProcessedBlock) -> Result<()> {
        let result = self.storage.save_block(&item.block).await;
        self.enter(ImportState::Idle);

        match result {
            Ok(()) => {
                self.stats.blocks_succeeded += 1;
                self.stats.transactions_inserted += item.load.transactions_written;
                self.stats.addresses_created += item.load.addresses_created;
                self.status.last_imported_height = Some(height);
                self.status.last_error = None;
                tracing::debug!(
                    component = LOG_PREFIX,
                    "Block {} ({:?}, reused: {}): {} transaction(s), {} new address(es), {} output(s) spent",
                    height,
                    item.source,
                    item.load.reused_block,
                    item.load.transactions_written,
                    item.load.addresses_created,
                    item.load.outputs_spent
                );
                Ok(())
            }
            Err(e) => {
                self.record_error(PipelineStage::Load, Some(height), e.to_string(), true);
                self.stats.blocks_failed += 1;
                Err(e)
            }
        }
    }
}

/// Append to a bounded list, dropping the oldest entry once it is full
fn push_recent<T>(list: &mut Vec<T>, item: T) {
    if list.len() == MAX_RECORDED {
        list.remove(0);
    }
    list.push(item);
}

/// Print final statistics
pub fn print_final_stats(stats: &PipelineStats, status: &ImportStatus) {
    println!("\n📊 Import Statistics:");
    println!("   ⏱️  Total time: {:.2}s", stats.elapsed_time.as_secs_f64());
    println!(
        "   📦 Blocks: {} attempted, {} imported, {} not processed",
        stats.blocks_attempted, stats.blocks_succeeded, stats.blocks_failed
    );
    println!("   ✅ Success rate: {:.1}%", stats.success_rate());
    println!("   💾 Transactions inserted: {}", stats.transactions_inserted);
    println!("   🏷️  Addresses created: {}", stats.addresses_created);
    println!("   🗃️  Prefetch buffer: {} hit(s), {} miss(es)", stats.cache_hits, stats.cache_misses);
    println!("   ⚡ Speed: {:.2} blocks/sec", stats.blocks_per_second());
    println!("   ⚡ Throughput: {:.0} txs/sec", stats.transactions_per_second());
    println!(
        "   📍 Last imported: {:?} | Node height: {:?}",
        status.last_imported_height, status.remote_height
    );
    if let Some(error) = &status.last_error {
        println!("   🧯 Last error: {}", error);
    }

    if stats.integrity_warnings > 0 {
        println!("\n⚠️  Integrity warnings: {}", stats.integrity_warnings);
        for warning in status.integrity_warnings.iter().take(5) {
            println!("   - {}", warning);
        }
    }

    if stats.error_count > 0 {
        println!("\n❌ Errors encountered: {}", stats.error_count);
        for (i, error) in stats.errors.iter().rev().take(5).enumerate() {
            println!("   {}. [{}] Block {:?}: {}", i + 1, error.stage, error.height, error.message);
        }
        if stats.error_count > 5 {
            println!("   ... and {} more errors", stats.error_count - 5);
        }
    }
}
