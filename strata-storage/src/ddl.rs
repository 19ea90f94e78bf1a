use crate::error::{Error, Result};
use crate::layout::LayoutVersion;
use crate::table::SqlTable;
use crate::trx::TransactionContext;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use strata_catalog::alter::{apply_alter, AlterCmd};
use strata_catalog::Schema;
use tracing::debug;

struct CurrentSchema {
    schema: Arc<Schema>,
    version: LayoutVersion,
}

/// Thin alter-table executor over one SqlTable. Holds the
/// catalog-level version pointer: DDL against the table is
/// serialized here, so `SqlTable::update_schema` only ever sees one
/// caller win a given version.
pub struct AlterTableExec {
    table: Arc<SqlTable>,
    current: Mutex<CurrentSchema>,
}

impl AlterTableExec {
    pub fn new(table: Arc<SqlTable>) -> Self {
        let version = table.latest_version();
        let schema = table.get_schema(version).clone();
        AlterTableExec {
            table,
            current: Mutex::new(CurrentSchema { schema, version }),
        }
    }

    #[inline]
    pub fn current_version(&self) -> LayoutVersion {
        self.current.lock().version
    }

    /// Apply `cmds` against the current schema, whatever version that
    /// is by the time the latch is acquired.
    pub fn alter(
        &self,
        txn: &TransactionContext,
        cmds: &[AlterCmd],
    ) -> Result<LayoutVersion> {
        let guard = self.current.lock();
        self.alter_locked(txn, guard, cmds)
    }

    /// Apply `cmds` only if the table is still at `base`. A caller
    /// that planned its alter against a schema version another DDL
    /// has since superseded gets `SchemaVersionConflict` and must
    /// abort or replan.
    pub fn alter_from(
        &self,
        txn: &TransactionContext,
        base: LayoutVersion,
        cmds: &[AlterCmd],
    ) -> Result<LayoutVersion> {
        let guard = self.current.lock();
        if guard.version != base {
            return Err(Error::SchemaVersionConflict {
                base,
                current: guard.version,
            });
        }
        self.alter_locked(txn, guard, cmds)
    }

    fn alter_locked(
        &self,
        txn: &TransactionContext,
        mut guard: MutexGuard<'_, CurrentSchema>,
        cmds: &[AlterCmd],
    ) -> Result<LayoutVersion> {
        let new_schema = apply_alter(&guard.schema, cmds)?;
        let next = guard
            .version
            .0
            .checked_add(1)
            .ok_or(Error::VersionLimitExceeded)?;
        let new_version = LayoutVersion(next);
        self.table.update_schema(txn, new_schema, new_version)?;
        guard.schema = self.table.get_schema(new_version).clone();
        guard.version = new_version;
        debug!(table = %self.table.table_id(), version = %new_version, "alter table applied");
        Ok(new_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStore;
    use crate::trx::TransactionManager;
    use strata_catalog::{ColumnSpec, Datum, TableOid, TypeId};

    fn setup() -> (Arc<TransactionManager>, Arc<SqlTable>, Arc<AlterTableExec>) {
        let schema = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false),
            ColumnSpec::new("b", TypeId::Int, false),
        ])
        .unwrap();
        let table = Arc::new(
            SqlTable::new(TableOid::new(3), Arc::new(BlockStore::new(1000)), schema).unwrap(),
        );
        let exec = Arc::new(AlterTableExec::new(Arc::clone(&table)));
        (Arc::new(TransactionManager::new()), table, exec)
    }

    #[test]
    fn test_alter_bumps_versions_in_order() {
        let (mgr, table, exec) = setup();
        let txn = mgr.begin();
        let v1 = exec
            .alter(&txn, &[AlterCmd::add_column(ColumnSpec::new("c", TypeId::Int, true))])
            .unwrap();
        assert_eq!(v1, LayoutVersion(1));
        let v2 = exec.alter(&txn, &[AlterCmd::drop_column("c", false)]).unwrap();
        assert_eq!(v2, LayoutVersion(2));
        assert_eq!(exec.current_version(), LayoutVersion(2));
        assert_eq!(table.num_versions(), 3);
        assert!(table.get_schema(LayoutVersion(2)).find_column("c").is_none());
        mgr.commit(txn).unwrap();
    }

    #[test]
    fn test_alter_from_stale_base_is_rejected() {
        let (mgr, _table, exec) = setup();
        let txn = mgr.begin();
        exec.alter(&txn, &[AlterCmd::add_column(ColumnSpec::new("c", TypeId::Int, true))])
            .unwrap();
        let res = exec.alter_from(
            &txn,
            LayoutVersion(0),
            &[AlterCmd::add_column(ColumnSpec::new("d", TypeId::Int, true))],
        );
        assert!(matches!(res, Err(Error::SchemaVersionConflict { .. })));
        mgr.commit(txn).unwrap();
    }

    #[test]
    fn test_failed_alter_leaves_no_version_behind() {
        let (mgr, table, exec) = setup();
        let txn = mgr.begin();
        let res = exec.alter(&txn, &[AlterCmd::drop_column("nope", false)]);
        assert!(res.is_err());
        assert_eq!(table.num_versions(), 1);
        assert_eq!(exec.current_version(), LayoutVersion(0));
        mgr.commit(txn).unwrap();
    }

    /// Three transactions race to install their own V1. Exactly one
    /// wins; the others observe that their base version collided.
    #[test]
    fn test_concurrent_conflicting_alters() {
        let (mgr, table, exec) = setup();
        let mut handles = vec![];
        for i in 0..3 {
            let mgr = Arc::clone(&mgr);
            let exec = Arc::clone(&exec);
            handles.push(std::thread::spawn(move || {
                let txn = mgr.begin();
                let cmd = AlterCmd::add_column(
                    ColumnSpec::new(&format!("c{}", i), TypeId::Int, true)
                        .with_default(Datum::Int(i)),
                );
                match exec.alter_from(&txn, LayoutVersion(0), &[cmd]) {
                    Ok(version) => {
                        mgr.commit(txn).unwrap();
                        Some(version)
                    }
                    Err(Error::SchemaVersionConflict { .. }) => {
                        mgr.rollback(txn);
                        None
                    }
                    Err(e) => panic!("unexpected alter failure: {}", e),
                }
            }));
        }
        let results: Vec<Option<LayoutVersion>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(*winners[0], LayoutVersion(1));
        assert_eq!(table.num_versions(), 2);
        // exactly one of the proposed columns exists at V1
        let v1 = table.get_schema(LayoutVersion(1));
        let added = (0..3)
            .filter(|i| v1.find_column(&format!("c{}", i)).is_some())
            .count();
        assert_eq!(added, 1);
    }
}
