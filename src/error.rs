use thiserror::Error;

use crate::lease::{FencingToken, LeaseError};
use crate::slice::{ResliceError, SliceId, TableError};
use crate::AttackId;

/// Structural problems with an attack's keyspace. Fatal to that attack: no
/// slices are created when planning fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Keyspace is empty, attack has nothing to do")]
    EmptyKeyspace,

    #[error("Keyspace exceeds the 128-bit range: {0}")]
    KeyspaceOverflow(String),

    #[error("Keyspace is not an unsigned integer: {0:?}")]
    InvalidKeyspace(String),

    #[error("Plan would need {slices} slices, limit is {limit}")]
    TooManySlices { slices: u128, limit: u64 },

    #[error("Attack {attack_id} cannot be planned while {state}")]
    NotPlannable { attack_id: AttackId, state: String },
}

/// Rejected state machine transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot {action} {entity} while {from}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub action: String,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("Lease conflict on {0}")]
    LeaseConflict(String),

    #[error("Stale lease token {token} for slice {slice}")]
    StaleLease { slice: SliceId, token: FencingToken },

    #[error("Slice {0} exhausted its retry budget")]
    SliceDead(SliceId),

    #[error("Attack not found: {0}")]
    AttackNotFound(AttackId),

    #[error("Slice not found: {0}")]
    SliceNotFound(SliceId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Cannot split slice {slice}: {reason}")]
    InvalidSplit { slice: SliceId, reason: String },

    #[error("Lease store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LeaseError> for DispatchError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Conflict { resource_id, .. } => DispatchError::LeaseConflict(resource_id),
            LeaseError::Store(msg) => DispatchError::Store(msg),
            other => DispatchError::Internal(other.to_string()),
        }
    }
}

impl From<TableError> for DispatchError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::NotFound(id) => DispatchError::SliceNotFound(id),
            TableError::Conflict { slice, .. } => DispatchError::LeaseConflict(slice.resource_id()),
            TableError::Transition(t) => DispatchError::InvalidTransition(t),
            TableError::Split { slice, reason } => DispatchError::InvalidSplit { slice, reason },
            other @ TableError::IndicesExhausted(_) => DispatchError::Internal(other.to_string()),
        }
    }
}

impl From<ResliceError> for DispatchError {
    fn from(err: ResliceError) -> Self {
        match err {
            ResliceError::Planning(e) => DispatchError::Planning(e),
            ResliceError::Table(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
