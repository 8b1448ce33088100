//! Transactions group writes across tables into one binlog frame.
//!
//! Writes are buffered in memory until [`Transaction::commit`], which logs
//! them as a single frame and then publishes them to the memtables. Reads
//! through the transaction see its own uncommitted writes first.
//!
//! # Example
//!
//! ```rust,no_run
//! use drhdb::{DB, Options};
//!
//! # fn main() -> Result<(), drhdb::Error> {
//! let db = DB::open("./data", Options::default())?;
//! let mut tx = db.begin();
//!
//! tx.set(b"key1", b"value1")?
//!     .set_to(b"alice", b"admin", "users")?
//!     .remove(b"key3")?;
//! assert_eq!(tx.get(b"key1")?, Some(b"value1".to_vec()));
//!
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```

use crate::binlog::WriteSet;
use crate::codec::{check_key, check_table_name, check_value};
use crate::error::Result;
use crate::{Core, DEFAULT_TABLE};
use std::collections::VecDeque;
use std::sync::Arc;

/// A buffered write of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Set operation
    Set {
        /// Table name
        table: String,
        /// Key to write
        key: Vec<u8>,
        /// New value
        value: Vec<u8>,
    },
    /// Remove operation
    Remove {
        /// Table name
        table: String,
        /// Key to remove
        key: Vec<u8>,
    },
}

/// An open transaction.
///
/// A handle can be reused: after `commit` or `rollback` it starts over as a
/// fresh, empty transaction with a new id.
pub struct Transaction {
    core: Arc<Core>,
    id: u64,
    operations: VecDeque<WriteOp>,
    /// Latest write per table and key, `None` meaning removed.
    writes: WriteSet,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("operations", &self.operations.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        let id = core.next_txid();
        Self { core, id, operations: VecDeque::new(), writes: WriteSet::new() }
    }

    /// Transaction id, also written to the binlog frame.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sets `key` in the default table.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<&mut Self> {
        self.set_to(key, value, DEFAULT_TABLE)
    }

    /// Sets `key` in `table`.
    ///
    /// An empty value is stored as a delete.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the table name, key or value is out of
    /// bounds. Nothing is buffered in that case.
    pub fn set_to(&mut self, key: &[u8], value: &[u8], table: &str) -> Result<&mut Self> {
        check_table_name(table)?;
        check_key(key)?;
        check_value(value)?;

        if value.is_empty() {
            return self.push_remove(table, key);
        }
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        self.operations.push_back(WriteOp::Set {
            table: table.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(self)
    }

    /// Removes `key` from the default table.
    pub fn remove(&mut self, key: &[u8]) -> Result<&mut Self> {
        self.remove_from(key, DEFAULT_TABLE)
    }

    /// Removes `key` from `table`.
    pub fn remove_from(&mut self, key: &[u8], table: &str) -> Result<&mut Self> {
        check_table_name(table)?;
        check_key(key)?;
        self.push_remove(table, key)
    }

    fn push_remove(&mut self, table: &str, key: &[u8]) -> Result<&mut Self> {
        self.writes.entry(table.to_string()).or_default().insert(key.to_vec(), None);
        self.operations.push_back(WriteOp::Remove { table: table.to_string(), key: key.to_vec() });
        Ok(self)
    }

    /// Reads `key` from the default table, seeing this transaction's writes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_from(key, DEFAULT_TABLE)
    }

    /// Reads `key` from `table`, seeing this transaction's writes.
    pub fn get_from(&self, key: &[u8], table: &str) -> Result<Option<Vec<u8>>> {
        check_table_name(table)?;
        check_key(key)?;
        if let Some(value) = self.writes.get(table).and_then(|writes| writes.get(key)) {
            return Ok(value.clone());
        }
        self.core.get(key, table)
    }

    /// Number of buffered operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Buffered operations in the order they were issued.
    pub fn operations(&self) -> impl Iterator<Item = &WriteOp> {
        self.operations.iter()
    }

    /// Logs the buffered writes and publishes them to the memtables.
    ///
    /// An empty transaction commits without touching the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or poisoned, or the frame
    /// cannot be written. The buffered writes are kept so the caller can
    /// retry or roll back.
    pub fn commit(&mut self) -> Result<()> {
        if !self.writes.is_empty() {
            self.core.commit(self.id, self.writes.clone())?;
        }
        self.reset();
        Ok(())
    }

    /// Discards the buffered writes.
    pub fn rollback(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.operations.clear();
        self.writes.clear();
        self.id = self.core.next_txid();
    }
}
