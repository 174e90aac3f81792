//! Concurrent mutation of one book.
//!
//! Many tasks on a multi-threaded runtime race reorders, inserts and edits
//! against the same book. Afterwards the visible sequence must hold every
//! block exactly once, keys must be unique, and every block's history must
//! be contiguous and agree with its version.

use std::collections::HashSet;
use std::sync::Arc;

use quire_kernel::history::is_contiguous;
use quire_kernel::{
    BlockEngine, EngineConfig, Error, MemoryBookDirectory, MemoryRepository, Position,
    SqliteRepository,
};
use quire_types::{Block, BlockContent, BlockId, BlockType, BookId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BLOCKS: usize = 12;
const TASKS: u64 = 16;
const MOVES_PER_TASK: usize = 20;

async fn populated(engine: &BlockEngine, book: BookId) -> Vec<BlockId> {
    let mut ids = Vec::with_capacity(BLOCKS);
    for i in 0..BLOCKS {
        let b = engine
            .create(book, BlockType::Text, BlockContent::text(format!("b{i}")), Position::Append)
            .await
            .unwrap();
        ids.push(b.id);
    }
    ids
}

/// Move a random block before another random block (or to the tail),
/// retrying on version conflicts like a well-behaved client.
async fn shuffle(engine: Arc<BlockEngine>, ids: Arc<Vec<BlockId>>, seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut conflicts = 0;
    for _ in 0..MOVES_PER_TASK {
        let id = ids[rng.gen_range(0..ids.len())];
        let before = match rng.gen_range(0..=ids.len()) {
            n if n == ids.len() => None,
            n if ids[n] == id => None,
            n => Some(ids[n]),
        };
        loop {
            let current = engine.get(id).await.unwrap();
            match engine.reorder(id, before, current.version).await {
                Ok(_) => break,
                Err(e) if e.is_retryable() => conflicts += 1,
                Err(e) => panic!("reorder failed: {e}"),
            }
        }
    }
    conflicts
}

fn assert_consistent(active: &[Block], expected: usize) {
    assert_eq!(active.len(), expected);
    let keys: HashSet<&str> = active.iter().map(|b| b.order_key.as_str()).collect();
    assert_eq!(keys.len(), expected, "duplicate order keys");
    assert!(active.windows(2).all(|w| w[0].order_key < w[1].order_key));
}

async fn assert_histories(engine: &BlockEngine, active: &[Block]) {
    for b in active {
        let history = engine.history(b.id).await.unwrap();
        assert!(is_contiguous(&history), "gap in history of {}", b.id);
        assert_eq!(history.len() as u64, b.version);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reorders_never_duplicate_keys() {
    let books = Arc::new(MemoryBookDirectory::new());
    let book = books.add(BookId::new());
    let engine = Arc::new(
        BlockEngine::builder(Arc::new(MemoryRepository::new()), books)
            .build()
            .unwrap(),
    );
    let ids = Arc::new(populated(&engine, book).await);

    let tasks: Vec<_> = (0..TASKS)
        .map(|seed| tokio::spawn(shuffle(engine.clone(), ids.clone(), seed)))
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let active = engine.list_active(book).await.unwrap();
    assert_consistent(&active, BLOCKS);
    let seen: HashSet<BlockId> = active.iter().map(|b| b.id).collect();
    assert_eq!(seen, ids.iter().copied().collect());
    assert_histories(&engine, &active).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reorders_with_rebalancing() {
    let books = Arc::new(MemoryBookDirectory::new());
    let book = books.add(BookId::new());
    let engine = Arc::new(
        BlockEngine::builder(Arc::new(MemoryRepository::new()), books)
            .config(EngineConfig::default().with_rebalance_threshold(2))
            .build()
            .unwrap(),
    );
    let ids = Arc::new(populated(&engine, book).await);

    let tasks: Vec<_> = (0..TASKS)
        .map(|seed| tokio::spawn(shuffle(engine.clone(), ids.clone(), 1_000 + seed)))
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    let active = engine.list_active(book).await.unwrap();
    assert_consistent(&active, BLOCKS);
    assert_histories(&engine, &active).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_and_edits_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(SqliteRepository::open(dir.path().join("race.db")).unwrap());
    let books = Arc::new(MemoryBookDirectory::new());
    let book = books.add(BookId::new());
    let engine = Arc::new(BlockEngine::builder(repo, books).build().unwrap());
    let first = engine
        .create(book, BlockType::Text, BlockContent::text("first"), Position::Append)
        .await
        .unwrap();

    let inserters: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let position = if i % 2 == 0 {
                    Position::Before(first.id)
                } else {
                    Position::Append
                };
                engine
                    .create(book, BlockType::Text, BlockContent::text(format!("i{i}")), position)
                    .await
                    .map(|_| ())
            })
        })
        .collect();

    // Edits to one block race each other; exactly one wins per version.
    let editors: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .update_content(first.id, BlockContent::text(format!("edit {i}")), 1)
                    .await
                    .map(|_| ())
            })
        })
        .collect();

    for result in futures::future::join_all(inserters).await {
        result.unwrap().unwrap();
    }
    let outcomes: Vec<Result<(), Error>> = futures::future::join_all(editors)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, Error::VersionConflict { expected: 1, actual: 2 })));

    let active = engine.list_active(book).await.unwrap();
    assert_consistent(&active, 9);
    assert_histories(&engine, &active).await;
}
