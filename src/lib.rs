//! # `olckv`
//!
//! An in-memory key-value engine: a concurrent B+tree using Optimistic Lock
//! Coupling (OLC) with epoch-based reclamation, under a multi-version record
//! layer with first-writer-wins transactions.
//!
//! ## Layers
//!
//! | Layer | Module | Concurrency |
//! |-------|--------|-------------|
//! | Index | [`tree`] | optimistic reads, version-locked writes, restart on conflict |
//! | Reclamation | [`epoch`] | guards pin epochs, a ticker frees retired memory |
//! | Records | [`storage`] | try-only latches, version chains newest first |
//! | Transactions | [`transaction`] | snapshot reads, serialized commit |
//! | Facade | [`db`] | auto-wrapped single operations |
//!
//! ## Thread Safety
//!
//! [`Database`] and [`BPlusTree`] are `Send + Sync`. A [`Txn`] belongs to
//! the thread that started it and borrows its database.
//!
//! ```rust
//! use olckv::{Database, Error};
//!
//! let db = Database::open("example");
//!
//! let mut first = db.begin_write();
//! let mut second = db.begin_write();
//! first.put(b"key", b"1").unwrap();
//! assert_eq!(second.put(b"key", b"2"), Err(Error::FailByActiveTxn));
//!
//! first.commit();
//! assert_eq!(second.get(b"key").unwrap(), "1");
//! second.put(b"key", b"2").unwrap();
//! second.commit();
//!
//! assert_eq!(db.get(b"key").unwrap(), "2");
//! ```
//!
//! ## Key Constraints
//!
//! - Keys are byte slices of at most [`MAX_KEY_SIZE`] bytes. Longer keys are
//!   rejected with [`Error::KeyTooLarge`].
//! - There are no range scans: the index answers point lookups only.
//!
//! ## Non-goals
//!
//! No durability or recovery, no secondary indexes, no on-disk format.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

mod tracing_helpers;

pub mod config;
pub mod db;
pub mod epoch;
pub mod error;
pub mod internode;
pub mod keymap;
pub mod latch;
pub mod leaf;
pub mod node;
pub mod nodeversion;
pub mod ordering;
pub mod storage;
pub mod transaction;
pub mod tree;

// Re-export main types for convenience
pub use config::{MAX_KEY_SIZE, Options, Timestamp, TxnId};
pub use db::{Database, DatabaseStats, Txn};
pub use epoch::{EpochManager, Reclaimer};
pub use error::{Error, Status};
pub use latch::{DataLatch, NoWaitRWLatch, RecordLatch};
pub use storage::DataHeader;
pub use transaction::{Transaction, TransactionManager, TxnKind};
pub use tree::{BPlusTree, InsertError};
