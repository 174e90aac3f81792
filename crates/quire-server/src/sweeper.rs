//! Periodic retention sweep.

use std::sync::Arc;
use std::time::Duration;

use quire_kernel::BlockEngine;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Purge expired soft-deleted blocks every `every` until `shutdown` flips to
/// true or its sender is dropped. The first sweep runs immediately.
pub async fn run(engine: Arc<BlockEngine>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval_secs = every.as_secs(), "retention sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.purge_expired().await {
                    Ok(purged) => tracing::debug!(purged = purged.len(), "sweep done"),
                    Err(e) => tracing::error!(error = %e, "retention sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("retention sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_kernel::{ManualClock, MemoryBookDirectory, MemoryRepository, Position};
    use quire_types::{BlockContent, BlockType, BookId};

    #[tokio::test]
    async fn test_sweeper_purges_and_stops() {
        let books = Arc::new(MemoryBookDirectory::new());
        let book = books.add(BookId::new());
        let clock = Arc::new(ManualClock::new(0));
        let engine = Arc::new(
            BlockEngine::builder(Arc::new(MemoryRepository::new()), books)
                .clock(clock.clone())
                .build()
                .unwrap(),
        );
        let block = engine
            .create(book, BlockType::Text, BlockContent::text("old"), Position::Append)
            .await
            .unwrap();
        engine.soft_delete(block.id, 1).await.unwrap();
        clock.advance(Duration::from_secs(31 * 24 * 60 * 60));

        let mut purged = engine.subscribe("block.purged");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(engine.clone(), Duration::from_secs(3600), rx));

        let msg = tokio::time::timeout(Duration::from_secs(5), purged.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload.block_id, block.id);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
