//! # quire-kernel
//!
//! Ordered block collection engine.
//!
//! A Book is a sequence of blocks ordered by fractional keys. This crate
//! stores them, keeps them ordered under concurrent edits, lets them be
//! soft-deleted and restored within a retention window, converts them
//! between types and records an immutable history of every change.
//!
//! ```text
//!   BlockEngine ──► Coordinator (per-book token)
//!        │
//!        ├──► Lifecycle ──► BlockRepository (memory | sqlite) + history
//!        │        └──► quire-keys
//!        │
//!        └──► ChronicleEmitter ──► FlowBus + ChronicleSink (best-effort)
//! ```

pub mod books;
pub mod chronicle;
pub mod clock;
pub mod config;
pub mod convert;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod flows;
pub mod history;
pub mod lifecycle;
pub mod repository;
pub mod schema;

pub use books::{BookDirectory, BookRecord, MemoryBookDirectory, SqliteBookDirectory};
pub use chronicle::{ChronicleEmitter, ChronicleError, ChronicleSink, DeadLetter, TracingSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ChronicleConfig, ConfigError, EngineConfig};
pub use convert::ConversionRegistry;
pub use engine::{BlockEngine, EngineBuilder};
pub use error::{Error, Result};
pub use flows::{FlowBus, FlowMessage, HasSubject, Subscription, matches_pattern};
pub use lifecycle::Position;
pub use repository::{BlockRepository, MemoryRepository, SqliteRepository};
