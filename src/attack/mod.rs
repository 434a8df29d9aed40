//! Attack lifecycle.

pub mod machine;
pub mod table;

pub use machine::{AttackAction, AttackState};
pub use table::{AttackRecord, AttackTable};
