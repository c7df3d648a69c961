//! Basic connect/query/mutate/disconnect usage.
//!
//! Run with: cargo run --example basic_usage

use syndradb_client::{Client, ConnectionOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== SyndraDB basic usage ===\n");

    let client = Client::builder()
        .options(ConnectionOptions::default().with_default_timeout(std::time::Duration::from_secs(5)))
        .build();

    println!("1. Connecting...");
    client.connect("syndra://localhost:7000:mydb:admin:password;").await?;
    println!("   state: {:?}\n", client.get_state().await);

    println!("2. Mutating...");
    let written = client.mutate("SET greeting hello-world", 0).await?;
    println!("   server replied: {written}\n");

    println!("3. Querying...");
    let value = client.query("GET greeting", 0).await?;
    println!("   value: {value}\n");

    println!("4. Pinging...");
    client.ping().await?;
    println!("   alive\n");

    println!("5. Disconnecting...");
    client.disconnect().await?;
    println!("   state: {:?}", client.get_state().await);

    Ok(())
}
