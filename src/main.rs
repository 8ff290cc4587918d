/// Block Graph Importer
///
/// A resumable pipeline importing a bitcoin node's blocks, transactions and
/// addresses into a PostgreSQL graph, with a read-ahead prefetch buffer.
mod cli;
mod db;
mod error;
mod etl;
mod models;
mod pipeline;
mod rpc;

#[cfg(test)]
mod test_utils;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use cli::Cli;
use db::Database;
use etl::prefetch::PrefetchCache;
use pipeline::{CycleOutcome, ImportController};
use rpc::{BitcoindClient, NodeClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    cli.validate()?;

    println!("🚀 Starting Block Graph Importer...");

    // Initialize RPC client and check the node answers
    let client = Arc::new(BitcoindClient::new(cli.node_config()));
    match client.remote_height().await {
        Ok(remote_height) => {
            println!("✅ Connected to: {}", client.endpoint());
            println!("🎯 Node height: {}", format_number(remote_height));
        }
        // Each cycle retries the node, so an outage only delays the import
        Err(e) => tracing::warn!("Node at {} not reachable yet: {}", client.endpoint(), e),
    }

    // Initialize database connection
    println!("\n💾 Connecting to PostgreSQL database...");
    let database = Database::new(&cli.database_url).await.context("Failed to connect to PostgreSQL database")?;
    database.test_connection().await.context("Database connection test failed")?;
    println!("✅ Database connected successfully!");

    println!("📋 Running database migrations...");
    database.migrate().await.context("Failed to run database migrations")?;
    let storage = Arc::new(database);

    // Start the prefetch buffer on its own task
    let import_config = cli.import_config();
    let cache = Arc::new(PrefetchCache::new(import_config.window, import_config.retention));
    let prefetch = tokio::spawn(cache.clone().run(client.clone(), import_config.fill_interval));

    let mut controller = ImportController::new(client, storage, cache, import_config);
    tracing::info!("Block Graph Importer initialized successfully");

    let interval = cli.cycle_interval();
    loop {
        let outcome = tokio::select! {
            outcome = controller.run_cycle() => outcome,
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Interrupted, stopping...");
                break;
            }
        };

        let pause = match outcome {
            CycleOutcome::Processed(_) => continue,
            CycleOutcome::CaughtUp if cli.once => break,
            CycleOutcome::CaughtUp => {
                tracing::debug!("Caught up with the node, waiting {}s", interval.as_secs());
                interval
            }
            CycleOutcome::NotProcessed(_) | CycleOutcome::NoProgress => interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Interrupted, stopping...");
                break;
            }
        }
    }

    prefetch.abort();
    pipeline::print_final_stats(&controller.stats(), controller.status());
    println!("\n✨ Import stopped.");

    Ok(())
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}
