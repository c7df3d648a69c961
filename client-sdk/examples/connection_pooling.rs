//! Pooled connections under concurrent load, with pool stats inspection.
//!
//! Run with: cargo run --example connection_pooling

use std::sync::Arc;
use std::time::Duration;

use syndradb_client::{Client, ConnectionOptions, PoolOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== SyndraDB connection pooling ===\n");

    let options = ConnectionOptions::default()
        .with_pool(PoolOptions::default().with_size(2, 8).with_idle_timeout(Duration::from_secs(60)))
        .with_health_check_interval(Duration::from_secs(10));

    let client = Arc::new(Client::builder().options(options).build());
    client.connect("syndra://localhost:7000:mydb:admin:password;").await?;

    println!("Launching 20 concurrent queries against a pool of up to 8 connections...");
    let mut handles = Vec::new();
    for i in 0..20 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move { client.query(&format!("GET key-{i}"), 0).await }));
    }
    for handle in handles {
        handle.await??;
    }

    let stats = client.get_debug_info().await.pool_stats.expect("pooled mode");
    println!(
        "pool stats: active={} idle={} total={} hits={} misses={} waits={}",
        stats.active, stats.idle, stats.total, stats.hits, stats.misses, stats.waits
    );

    client.disconnect().await?;
    Ok(())
}
