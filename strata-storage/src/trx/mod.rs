//! Concurrency control follows a timestamp-ordered MVCC protocol.
//!
//! 1. When a transaction begins, a snapshot timestamp (STS) is drawn
//!    from the shared sequence; the transaction id is the STS with
//!    the highest bit set, so any active transaction id compares
//!    greater than every snapshot or commit timestamp.
//! 2. Every insert, update or delete pushes an undo entry at the head
//!    of the row's version chain, stamped with the transaction id
//!    through a shared atomic.
//! 3. On commit, a commit timestamp (CTS) is drawn and stored into
//!    the shared atomic once, which publishes every change of the
//!    transaction at the same instant.
//! 4. A reader walks a row's chain from the head, undoing every entry
//!    whose stamp it cannot see (another active transaction, or a CTS
//!    newer than the reader's STS), and materializes what remains.

pub mod redo;
pub mod undo;

use crate::error::{Error, Result};
use crate::layout::LayoutVersion;
use crate::projection::ProjectedRow;
use crate::trx::redo::{
    build_redo_entries, DeleteRecord, RedoHandle, RedoLog, RedoLogger, StagedRecord, WriteOp,
    WriteRecord,
};
use crate::trx::undo::SharedUndoEntry;
use crate::block::TupleSlot;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use strata_catalog::TableOid;
use tracing::{debug, trace};

pub type TrxID = u64;
pub const INVALID_TRX_ID: TrxID = !0;
pub const MIN_SNAPSHOT_TS: TrxID = 1;
pub const MAX_COMMIT_TS: TrxID = 1 << 63;
// Active transaction ids are always greater than any snapshot
// timestamp, so a visibility check reduces to "stamp is not larger
// than my STS".
pub const MIN_ACTIVE_TRX_ID: TrxID = (1 << 63) + 1;

/// Per-transaction state: the redo staging buffer writes go through,
/// the undo list rollback walks, and the abort-mandatory flag the
/// storage layer raises on MVCC conflicts.
pub struct TransactionContext {
    trx_id: Arc<AtomicU64>,
    sts: TrxID,
    staged: Mutex<Vec<StagedRecord>>,
    undo: Mutex<Vec<SharedUndoEntry>>,
    must_abort: AtomicBool,
}

impl TransactionContext {
    #[inline]
    fn new(trx_id: TrxID, sts: TrxID) -> Self {
        TransactionContext {
            trx_id: Arc::new(AtomicU64::new(trx_id)),
            sts,
            staged: Mutex::new(vec![]),
            undo: Mutex::new(vec![]),
            must_abort: AtomicBool::new(false),
        }
    }

    /// Current id of this transaction: the transaction id while
    /// active, the commit timestamp once committed.
    #[inline]
    pub fn trx_id(&self) -> TrxID {
        self.trx_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sts(&self) -> TrxID {
        self.sts
    }

    /// Stage the after-image of an insert. The slot is filled in by
    /// the insert that consumes the record.
    pub fn stage_write(
        &self,
        table_id: TableOid,
        layout_version: LayoutVersion,
        delta: ProjectedRow,
    ) -> RedoHandle {
        let mut staged = self.staged.lock();
        staged.push(StagedRecord::Write(WriteRecord {
            table_id,
            layout_version,
            slot: None,
            delta,
            op: WriteOp::Pending,
        }));
        RedoHandle(staged.len() - 1)
    }

    /// Stage the after-image of an update against an existing slot.
    pub fn stage_write_to(
        &self,
        table_id: TableOid,
        layout_version: LayoutVersion,
        slot: TupleSlot,
        delta: ProjectedRow,
    ) -> RedoHandle {
        let mut staged = self.staged.lock();
        staged.push(StagedRecord::Write(WriteRecord {
            table_id,
            layout_version,
            slot: Some(slot),
            delta,
            op: WriteOp::Pending,
        }));
        RedoHandle(staged.len() - 1)
    }

    pub fn stage_delete(&self, table_id: TableOid, slot: TupleSlot) -> RedoHandle {
        let mut staged = self.staged.lock();
        staged.push(StagedRecord::Delete(DeleteRecord {
            table_id,
            slot,
            layout_version: LayoutVersion::ZERO,
        }));
        RedoHandle(staged.len() - 1)
    }

    /// Mark that this transaction can no longer commit. Raised on any
    /// MVCC write failure so the version chains the transaction has
    /// already touched are cleaned up by rollback.
    #[inline]
    pub fn set_must_abort(&self) {
        self.must_abort.store(true, Ordering::Release);
    }

    #[inline]
    pub fn must_abort(&self) -> bool {
        self.must_abort.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn staged(&self) -> MutexGuard<'_, Vec<StagedRecord>> {
        self.staged.lock()
    }

    #[inline]
    pub(crate) fn shared_trx_id(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.trx_id)
    }

    #[inline]
    pub(crate) fn record_undo(&self, entry: SharedUndoEntry) {
        self.undo.lock().push(entry);
    }

    /// Whether a version stamp is visible to this transaction: its
    /// own writes, or changes committed no later than its snapshot.
    #[inline]
    pub(crate) fn sees(&self, ts: TrxID) -> bool {
        ts == self.trx_id() || ts <= self.sts
    }
}

/// TransactionManager drives begin/commit/rollback over the shared
/// timestamp sequence and owns the optional redo log sink.
pub struct TransactionManager {
    /// One sequence generates snapshot and commit timestamps, both
    /// starting from 1. Transaction ids are derived from the STS by
    /// setting the highest bit.
    ts: CachePadded<AtomicU64>,
    redo_logger: Mutex<Option<Box<dyn RedoLogger>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            ts: CachePadded::new(AtomicU64::new(MIN_SNAPSHOT_TS)),
            redo_logger: Mutex::new(None),
        }
    }

    /// Set the redo logger. Can be set only once.
    pub fn set_redo_logger(&self, logger: Box<dyn RedoLogger>) {
        let mut g = self.redo_logger.lock();
        if g.is_some() {
            panic!("redo logger can be set only once");
        }
        *g = Some(logger);
    }

    /// Begin a new transaction.
    #[inline]
    pub fn begin(&self) -> TransactionContext {
        let sts = self.ts.fetch_add(1, Ordering::SeqCst);
        let trx_id = sts | (1 << 63);
        debug_assert!(sts < MAX_COMMIT_TS);
        debug_assert!(trx_id >= MIN_ACTIVE_TRX_ID);
        TransactionContext::new(trx_id, sts)
    }

    /// Commit a transaction: persist its redo log, then publish all
    /// its versions by backfilling the commit timestamp into the
    /// shared stamp.
    ///
    /// A transaction marked abort-mandatory is rolled back instead
    /// and the commit fails.
    pub fn commit(&self, txn: TransactionContext) -> Result<TrxID> {
        if txn.must_abort() {
            debug!(sts = txn.sts, "commit refused, transaction must abort");
            self.rollback(txn);
            return Err(Error::MustAbort);
        }
        let cts = self.ts.fetch_add(1, Ordering::SeqCst);
        debug_assert!(cts < MAX_COMMIT_TS);

        let staged = txn.staged.into_inner();
        if let Some(entries) = build_redo_entries(&staged) {
            let mut g = self.redo_logger.lock();
            if let Some(logger) = g.as_mut() {
                let log = RedoLog { cts, entries };
                const CONFIG: bincode::config::Configuration = bincode::config::standard();
                let redo_bin = bincode::serde::encode_to_vec(&log, CONFIG)
                    .expect("redo serialization should not fail");
                logger.write(cts, redo_bin);
                logger.sync();
            }
        }

        // single store publishes every undo stamp of this transaction
        txn.trx_id.store(cts, Ordering::SeqCst);
        trace!(sts = txn.sts, cts, "trx committed");
        Ok(cts)
    }

    /// Roll back a transaction by reverting its writes newest-first.
    pub fn rollback(&self, txn: TransactionContext) {
        let undo = txn.undo.into_inner();
        for entry in undo.iter().rev() {
            let block = Arc::clone(&entry.block);
            block.undo_apply(entry);
        }
        debug!(sts = txn.sts, writes = undo.len(), "trx rolled back");
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
