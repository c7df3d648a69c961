//! Registering hooks, preparing statements, and using a transaction handle.
//!
//! Run with: cargo run --example hooks_and_transactions

use std::sync::Arc;

use syndradb_client::{Client, ConnectionOptions, LoggingHook, MetricsHook, TracingHook};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== SyndraDB hooks and transactions ===\n");

    let metrics = Arc::new(MetricsHook::new());
    let client = Client::builder()
        .options(ConnectionOptions::default())
        .with_hook(Arc::new(LoggingHook::new()))
        .with_hook(metrics.clone())
        .with_hook(Arc::new(TracingHook::new("example-app")))
        .build();

    client.connect("syndra://localhost:7000:mydb:admin:password;").await?;

    println!("1. Prepared statement...");
    let set_key = client.prepare("SET {} {}", 2);
    set_key.mutate(&client, &["counter".to_string(), "0".to_string()], 0).await?;

    println!("2. Transaction...");
    let txn = client.begin().await?;
    txn.execute("SET counter 1", std::time::Duration::from_secs(5)).await?;
    txn.execute("SET counter 2", std::time::Duration::from_secs(5)).await?;
    txn.commit()?;

    let snapshot = metrics.snapshot();
    println!(
        "   commands={} queries={} mutations={} errors={} avg_ms={:.2}",
        snapshot.total_commands, snapshot.total_queries, snapshot.total_mutations, snapshot.total_errors,
        snapshot.avg_duration_ms
    );

    client.disconnect().await?;
    Ok(())
}
