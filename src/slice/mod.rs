//! Work slices: the unit of assignment.

pub mod machine;
pub mod manager;
pub mod model;
pub mod table;

pub use machine::SliceAction;
pub use manager::{
    ActiveAttack, Assignment, FailureOutcome, NoWorkReason, SliceRequest, WorkSliceManager,
};
pub use model::{KeyRange, ResultSummary, SliceId, SliceState, WorkSlice};
pub use table::{Reslice, ResliceError, SliceTable, TableError};
