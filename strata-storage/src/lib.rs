pub mod block;
pub mod datatable;
pub mod ddl;
pub mod error;
pub mod layout;
pub mod projection;
pub mod table;
pub mod trx;
pub mod value;

pub mod prelude {
    pub use crate::block::{BlockStore, TupleSlot};
    pub use crate::datatable::{AttrSizeMap, SlotIterator};
    pub use crate::ddl::AlterTableExec;
    pub use crate::error::{Error, Result};
    pub use crate::layout::{ColId, LayoutVersion, IGNORE_COLUMN_ID, MAX_NUM_VERSIONS};
    pub use crate::projection::{
        ProjectedColumns, ProjectedColumnsInitializer, ProjectedRow, ProjectedRowInitializer,
        ProjectionMap,
    };
    pub use crate::table::SqlTable;
    pub use crate::trx::{TransactionContext, TransactionManager};
    pub use crate::value::Val;
}
