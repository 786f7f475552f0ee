//! Example: Compensation Replay
//!
//! Writes while the secondary store is down, then lets the background
//! worker and reconciler bring it back in line.

use duplex::prelude::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let primary = Arc::new(MemoryPrimaryStore::new());
    let secondary = Arc::new(MemorySecondaryStore::new());
    let config = DuplexConfig::default()
        .with_collection("users")
        .with_backoff(10, 2.0, 200)
        .with_compensation_poll_interval_ms(20)
        .with_reconcile_interval_seconds(1);
    let store = DuplexStore::new(primary.clone(), secondary.clone(), config)?;

    tracing::info!("=== Step 1: Write with the secondary offline ===");
    secondary.set_available(false);
    for (id, name) in [("u1", "Alice"), ("u2", "Bob")] {
        let receipt = store
            .upsert(Record::new("users", id).with("name", name))
            .await?;
        tracing::info!(
            "{} -> {:?} (task: {:?})",
            id,
            receipt.state,
            receipt.compensation
        );
    }
    tracing::info!(
        "Pending compensations: {}",
        store.coordinator().queue().len()
    );

    tracing::info!("=== Step 2: Bring the secondary back ===");
    secondary.set_available(true);
    let background = store.spawn_background();

    while !store.coordinator().queue().is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let metrics = store.worker().metrics().snapshot();
    tracing::info!(
        "Replayed: {} succeeded, {} failed, {} dead-lettered",
        metrics.successes,
        metrics.failures,
        metrics.dead_letters
    );

    tracing::info!("=== Step 3: Routed read from the secondary ===");
    let request = ReadRequest::new("users", StructuralFeatureSet::read().with(Feature::Join))
        .with_predicate(Predicate::All);
    for record in store.read(&request).await? {
        tracing::info!("{}: {:?}", record.id, record.attributes);
    }

    background.shutdown().await?;
    tracing::info!("Done");
    Ok(())
}
