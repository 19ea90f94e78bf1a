use crate::error::{Error, Result};
use crate::layout::LayoutVersion;
use crate::trx::undo::{SharedUndoEntry, UndoKind};
use crate::value::Val;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type BlockId = u64;

/// Opaque tuple identity: the block it lives in plus the slot offset
/// inside that block. The block id resolves to the layout version the
/// tuple was physically written under via the BlockStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleSlot {
    block: BlockId,
    offset: u16,
}

impl TupleSlot {
    #[inline]
    pub fn new(block: BlockId, offset: u16) -> Self {
        TupleSlot { block, offset }
    }

    #[inline]
    pub fn block(&self) -> BlockId {
        self.block
    }

    #[inline]
    pub fn offset(&self) -> u16 {
        self.offset
    }
}

/// Source of storage blocks. Also the registry that resolves a block
/// id back to the layout version its owning DataTable was created
/// with, which is how a TupleSlot yields its tuple's physical
/// version.
pub struct BlockStore {
    max_blocks: usize,
    next_id: AtomicU64,
    versions: RwLock<HashMap<BlockId, LayoutVersion>>,
}

impl BlockStore {
    pub fn new(max_blocks: usize) -> Self {
        BlockStore {
            max_blocks,
            next_id: AtomicU64::new(0),
            versions: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn allocate(&self, layout_version: LayoutVersion) -> Result<BlockId> {
        {
            let versions = self.versions.read();
            if versions.len() >= self.max_blocks {
                return Err(Error::BlockStoreExhausted(self.max_blocks));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.versions.write().insert(id, layout_version);
        Ok(id)
    }

    /// Layout version of the DataTable `block` belongs to.
    /// A block id that was not allocated from this store is a caller
    /// bug.
    #[inline]
    pub fn layout_version(&self, block: BlockId) -> LayoutVersion {
        *self
            .versions
            .read()
            .get(&block)
            .expect("block was not allocated from this store")
    }
}

/// Newest version of one tuple, as physically stored. Values are
/// positioned by user-column index of the owning table's layout;
/// older versions hang off the block's undo map.
pub(crate) struct TupleData {
    pub(crate) deleted: bool,
    pub(crate) values: Box<[Option<Val>]>,
}

pub(crate) struct BlockData {
    pub(crate) tuples: Vec<TupleData>,
    /// Per-slot undo chain heads. An empty map means every tuple in
    /// the block is visible to all transactions.
    pub(crate) undo: HashMap<u16, SharedUndoEntry>,
}

/// One fixed-capacity storage block of a single DataTable. The block
/// is the latch granularity for tuple reads and writes.
pub struct Block {
    id: BlockId,
    layout_version: LayoutVersion,
    data: Mutex<BlockData>,
}

impl Block {
    pub(crate) fn new(id: BlockId, layout_version: LayoutVersion) -> Self {
        Block {
            id,
            layout_version,
            data: Mutex::new(BlockData {
                tuples: Vec::new(),
                undo: HashMap::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn layout_version(&self) -> LayoutVersion {
        self.layout_version
    }

    #[inline]
    pub(crate) fn data(&self) -> MutexGuard<'_, BlockData> {
        self.data.lock()
    }

    /// Revert the change recorded by `entry` and unlink it from the
    /// head of its slot's version chain. Called only while rolling
    /// back the transaction that owns the entry, whose writes are
    /// still chain heads.
    pub(crate) fn undo_apply(&self, entry: &SharedUndoEntry) {
        let mut data = self.data();
        let off = entry.slot.offset();
        let tuple = &mut data.tuples[off as usize];
        match &entry.kind {
            UndoKind::Insert => {
                // the slot itself is not reclaimed; the row just
                // stops existing
                tuple.deleted = true;
            }
            UndoKind::Update(cols) => {
                for u in cols {
                    tuple.values[u.col as usize] = u.old.clone();
                }
            }
            UndoKind::Delete => {
                tuple.deleted = false;
            }
        }
        let head = data.undo.get(&off).expect("rolled-back slot must have a chain");
        debug_assert!(Arc::ptr_eq(head, entry));
        let next = entry.next.lock().take();
        match next {
            Some(older) => {
                data.undo.insert(off, older);
            }
            None => {
                data.undo.remove(&off);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_store_allocates_unique_ids() {
        let store = BlockStore::new(10);
        let a = store.allocate(LayoutVersion(0)).unwrap();
        let b = store.allocate(LayoutVersion(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.layout_version(a), LayoutVersion(0));
        assert_eq!(store.layout_version(b), LayoutVersion(1));
    }

    #[test]
    fn test_block_store_exhaustion() {
        let store = BlockStore::new(1);
        store.allocate(LayoutVersion(0)).unwrap();
        assert!(matches!(
            store.allocate(LayoutVersion(0)),
            Err(Error::BlockStoreExhausted(1))
        ));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_unknown_block_is_fatal() {
        let store = BlockStore::new(1);
        store.layout_version(99);
    }
}
