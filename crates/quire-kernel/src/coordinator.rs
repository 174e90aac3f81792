//! Ordering Coordinator: per-book serialization of structural mutations.
//!
//! Each book gets a lazily created fair read/write lock:
//! - structural operations (create, duplicate, reorder, soft-delete,
//!   restore, purge, rebalance) take it exclusively
//! - content updates and conversions take it shared, so they run alongside
//!   each other but queue behind a waiting structural operation
//!
//! A book's lock is dropped from the table when the last token for it is
//! released and nobody is waiting, so idle books cost nothing.
//!
//! Reads never touch it.

use std::sync::Arc;

use dashmap::DashMap;
use quire_types::BookId;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockTable = DashMap<BookId, Arc<RwLock<()>>>;

/// A held per-book token. Releasing it evicts the book's lock when unused.
pub struct BookToken<G> {
    guard: Option<G>,
    book_id: BookId,
    books: Arc<LockTable>,
}

impl<G> Drop for BookToken<G> {
    fn drop(&mut self) {
        // Release first so the guard's reference no longer counts.
        drop(self.guard.take());
        // The table's own Arc is the only one left iff nobody holds or waits.
        self.books
            .remove_if(&self.book_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl<G> std::fmt::Debug for BookToken<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookToken")
            .field("book_id", &self.book_id)
            .finish_non_exhaustive()
    }
}

/// Exclusive per-book token.
pub type StructuralGuard = BookToken<OwnedRwLockWriteGuard<()>>;

/// Shared per-book token.
pub type ContentGuard = BookToken<OwnedRwLockReadGuard<()>>;

#[derive(Debug, Default)]
pub struct Coordinator {
    books: Arc<LockTable>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, book_id: BookId) -> Arc<RwLock<()>> {
        self.books.entry(book_id).or_default().clone()
    }

    fn token<G>(&self, book_id: BookId, guard: G) -> BookToken<G> {
        BookToken {
            guard: Some(guard),
            book_id,
            books: self.books.clone(),
        }
    }

    /// Wait for exclusive access to the book's structure.
    pub async fn structural(&self, book_id: BookId) -> StructuralGuard {
        let guard = self.lock_for(book_id).write_owned().await;
        tracing::trace!(book_id = %book_id, "structural token acquired");
        self.token(book_id, guard)
    }

    /// Wait for shared access (content-only changes).
    pub async fn content(&self, book_id: BookId) -> ContentGuard {
        let guard = self.lock_for(book_id).read_owned().await;
        self.token(book_id, guard)
    }

    /// Books with a lock allocated.
    pub fn tracked_books(&self) -> usize {
        self.books.len()
    }
}
