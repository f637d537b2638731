//! Filepath: src/storage.rs
//!
//! Multi-version record storage.
//!
//! Each key in the database owns one [`DataHeader`]: a try-only latch and
//! a chain of [`UndoRecord`] versions, newest first.
//!
//! ```text
//! DataHeader ──chain──► [ts=MAX  PUT "c"] ──► [ts=7  PUT "b"] ──► [ts=3  DELETE]
//!                        uncommitted           committed           committed
//! ```

mod header;
mod undo;

pub use header::DataHeader;
pub use undo::{UndoKind, UndoRecord};
