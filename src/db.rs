//! Filepath: src/db.rs
//!
//! The database facade.
//!
//! [`Database`] ties the pieces together: a [`BPlusTree`] maps each key to
//! its [`DataHeader`], the [`TransactionManager`] runs transactions over
//! those headers, and an [`EpochManager`] ticker frees rolled back and
//! pruned versions in the background.
//!
//! ```rust
//! use olckv::{Database, Error};
//!
//! let db = Database::open("demo");
//! db.put(b"abc", b"123").unwrap();
//! assert_eq!(db.get(b"abc").unwrap(), "123");
//! assert_eq!(db.get(b"not_key"), Err(Error::KeyNotExist));
//!
//! let mut txn = db.begin_write();
//! txn.put(b"abc", b"234").unwrap();
//! txn.commit();
//! assert_eq!(db.get(b"abc").unwrap(), "234");
//! ```
//!
//! Headers are never removed from the tree: a delete writes a tombstone
//! version. They are freed when the database drops. Every [`Txn`] borrows
//! the database, so that happens only after all transactions end.

use std::fmt as StdFmt;

use bytes::Bytes;

use crate::config::{MAX_KEY_SIZE, Options, Timestamp, TxnId};
use crate::epoch::{EpochManager, EpochStats};
use crate::error::Error;
use crate::keymap::SlotValue;
use crate::storage::DataHeader;
use crate::tracing_helpers::info_log;
use crate::transaction::{Transaction, TransactionManager, TxnStats};
use crate::tree::{BPlusTree, InsertError, TreeStats};

// ============================================================================
//  HeaderRef
// ============================================================================

/// Tree value: a leaked `Box<DataHeader>` owned by the database.
#[derive(Clone, Copy)]
#[repr(transparent)]
struct HeaderRef(*mut DataHeader);

// SAFETY: a plain pointer. Copies torn by an optimistic read are discarded
// by version validation before they are dereferenced.
unsafe impl SlotValue for HeaderRef {}
// SAFETY: headers are `Sync` and outlive the tree's readers.
unsafe impl Send for HeaderRef {}
// SAFETY: see above.
unsafe impl Sync for HeaderRef {}

impl HeaderRef {
    /// # Safety
    /// The header must not be freed during `'a`. Headers live until the
    /// database drops.
    unsafe fn get<'a>(self) -> &'a DataHeader {
        // SAFETY: forwarded to the caller.
        unsafe { &*self.0 }
    }
}

// ============================================================================
//  Database
// ============================================================================

/// Counters across the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Distinct keys ever written, deleted ones included.
    pub keys: usize,

    /// Index counters.
    pub tree: TreeStats,

    /// Reclamation counters.
    pub epochs: EpochStats,

    /// Transaction counters.
    pub txns: TxnStats,
}

/// An in-memory multi-version key-value store.
pub struct Database {
    name: String,
    options: Options,
    tree: BPlusTree<HeaderRef>,
    txns: TransactionManager,

    // Dropped last: stops the ticker and frees what is still pending.
    epochs: EpochManager,
}

impl Database {
    /// Open an empty database with default [`Options`].
    #[must_use]
    pub fn open(name: impl Into<String>) -> Self {
        Self::open_with(name, Options::default())
    }

    /// Open an empty database.
    #[must_use]
    pub fn open_with(name: impl Into<String>, options: Options) -> Self {
        let name: String = name.into();
        let epochs = EpochManager::start(options.epoch_interval);
        let tree: BPlusTree<HeaderRef> = BPlusTree::new(epochs.reclaimer());
        let txns = TransactionManager::new(epochs.reclaimer(), &options);

        info_log!(name = %name, epoch_interval = ?options.epoch_interval, "database opened");

        Self {
            name,
            options,
            tree,
            txns,
            epochs,
        }
    }

    /// Shut down: stop the reclaimer and free every record.
    pub fn close(self) {
        info_log!(name = %self.name, keys = self.len(), "database closing");
        drop(self);
    }

    /// Name given at open.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options given at open.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Distinct keys ever written, deleted ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True if no key was ever written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            keys: self.tree.len(),
            tree: self.tree.stats(),
            epochs: self.epochs.stats(),
            txns: self.txns.stats(),
        }
    }

    // ========================================================================
    //  Single-operation transactions
    // ========================================================================

    /// Write `key -> value` in its own transaction.
    ///
    /// # Errors
    /// [`Error::FailByActiveTxn`] if another transaction latches the key,
    /// [`Error::KeyTooLarge`] for oversized keys.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut txn: Txn<'_> = self.begin_write();
        txn.put(key, value)?;
        txn.commit();
        Ok(())
    }

    /// Read the latest committed value of `key`.
    ///
    /// Runs as a READ transaction, so it never fails on latches.
    ///
    /// # Errors
    /// [`Error::KeyNotExist`] if the key is absent or deleted,
    /// [`Error::KeyTooLarge`] for oversized keys.
    pub fn get(&self, key: &[u8]) -> Result<Bytes, Error> {
        let mut txn: Txn<'_> = self.begin_read();
        let value: Result<Bytes, Error> = txn.get(key);
        txn.commit();
        value
    }

    /// Delete `key` in its own transaction.
    ///
    /// # Errors
    /// [`Error::KeyNotExist`] if the key is absent or already deleted,
    /// [`Error::FailByActiveTxn`] on latch conflict,
    /// [`Error::KeyTooLarge`] for oversized keys.
    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        let mut txn: Txn<'_> = self.begin_write();
        txn.delete(key)?;
        txn.commit();
        Ok(())
    }

    /// Start a WRITE transaction.
    #[must_use]
    pub fn begin_write(&self) -> Txn<'_> {
        Txn {
            db: self,
            inner: self.txns.begin_write(),
        }
    }

    /// Start a READ transaction on a snapshot of the current state.
    #[must_use]
    pub fn begin_read(&self) -> Txn<'_> {
        Txn {
            db: self,
            inner: self.txns.begin_read(),
        }
    }

    // ========================================================================
    //  Header lookup
    // ========================================================================

    fn header(&self, key: &[u8]) -> Result<Option<&DataHeader>, Error> {
        check_key(key)?;
        // SAFETY: headers live until the database drops.
        Ok(self.tree.lookup(key).map(|header| unsafe { header.get() }))
    }

    /// Header of `key`, creating it write-latched by `txn` if absent.
    fn header_or_insert<'db>(
        &'db self,
        key: &[u8],
        txn: &mut Transaction<'db>,
    ) -> Result<&'db DataHeader, Error> {
        if let Some(header) = self.header(key)? {
            return Ok(header);
        }

        let fresh: *mut DataHeader = Box::into_raw(Box::new(DataHeader::new_write_locked(txn.id())));
        match self.tree.insert_unique(key, HeaderRef(fresh)) {
            Ok(()) => {
                txn.add_write_lock(fresh);
                // SAFETY: now owned by the tree, freed when the database drops.
                Ok(unsafe { &*fresh })
            }
            Err(InsertError::Duplicate(existing)) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: headers live until the database drops.
                Ok(unsafe { existing.get() })
            }
            Err(InsertError::KeyTooLarge { len, .. }) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
                Err(Error::key_too_large(len))
            }
        }
    }
}

const fn check_key(key: &[u8]) -> Result<(), Error> {
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::key_too_large(key.len()));
    }
    Ok(())
}

impl Drop for Database {
    fn drop(&mut self) {
        for header in self.tree.drain_values() {
            // SAFETY: no transaction outlives the database, so nothing else
            // references the header. Each was leaked once in
            // `header_or_insert`.
            drop(unsafe { Box::from_raw(header.0) });
        }
    }
}

impl StdFmt::Debug for Database {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Txn
// ============================================================================

/// A transaction on a [`Database`].
///
/// Dropping it without [`commit`](Self::commit) rolls it back.
pub struct Txn<'db> {
    db: &'db Database,
    inner: Transaction<'db>,
}

impl<'db> Txn<'db> {
    /// Latch owner id.
    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.inner.id()
    }

    /// Start time.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.inner.timestamp()
    }

    /// True for READ transactions.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    /// Write `key -> value`.
    ///
    /// # Errors
    /// [`Error::ReadOnlyTransaction`], [`Error::FailByActiveTxn`],
    /// [`Error::KeyTooLarge`].
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if self.inner.is_read_only() {
            return Err(Error::ReadOnlyTransaction);
        }

        let db: &'db Database = self.db;
        let header: &'db DataHeader = db.header_or_insert(key, &mut self.inner)?;
        header.put(&mut self.inner, Bytes::copy_from_slice(value))
    }

    /// Read `key` as this transaction sees it.
    ///
    /// # Errors
    /// [`Error::KeyNotExist`], [`Error::FailByActiveTxn`] (WRITE only),
    /// [`Error::KeyTooLarge`].
    pub fn get(&mut self, key: &[u8]) -> Result<Bytes, Error> {
        let db: &'db Database = self.db;
        match db.header(key)? {
            Some(header) => header.select(&mut self.inner),
            None => Err(Error::KeyNotExist),
        }
    }

    /// Delete `key`.
    ///
    /// # Errors
    /// [`Error::ReadOnlyTransaction`], [`Error::KeyNotExist`],
    /// [`Error::FailByActiveTxn`], [`Error::KeyTooLarge`].
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        if self.inner.is_read_only() {
            return Err(Error::ReadOnlyTransaction);
        }

        let db: &'db Database = self.db;
        match db.header(key)? {
            Some(header) => header.delete(&mut self.inner),
            None => Err(Error::KeyNotExist),
        }
    }

    /// Make every write visible and release all latches.
    pub fn commit(self) {
        self.inner.commit();
    }

    /// Undo every write and release all latches.
    pub fn abort(self) {
        self.inner.abort();
    }
}

impl StdFmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Txn").field("inner", &self.inner).finish_non_exhaustive()
    }
}
