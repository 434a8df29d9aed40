use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvalidTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Abandoned,
}

impl fmt::Display for AttackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttackState::Pending => "pending",
            AttackState::Running => "running",
            AttackState::Paused => "paused",
            AttackState::Completed => "completed",
            AttackState::Failed => "failed",
            AttackState::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackAction {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Abort,
    Abandon,
    Retry,
    Reactivate,
}

impl fmt::Display for AttackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttackAction::Start => "start",
            AttackAction::Pause => "pause",
            AttackAction::Resume => "resume",
            AttackAction::Complete => "complete",
            AttackAction::Fail => "fail",
            AttackAction::Abort => "abort",
            AttackAction::Abandon => "abandon",
            AttackAction::Retry => "retry",
            AttackAction::Reactivate => "reactivate",
        };
        write!(f, "{}", s)
    }
}

pub fn valid_actions(state: AttackState) -> &'static [AttackAction] {
    use AttackAction::*;
    match state {
        AttackState::Pending => &[Start, Abandon],
        AttackState::Running => &[Pause, Complete, Fail, Abort],
        AttackState::Paused => &[Resume, Abort],
        AttackState::Failed => &[Retry],
        AttackState::Abandoned => &[Reactivate],
        AttackState::Completed => &[],
    }
}

pub fn apply(state: AttackState, action: AttackAction) -> Result<AttackState, InvalidTransition> {
    if !valid_actions(state).contains(&action) {
        return Err(InvalidTransition {
            entity: "attack",
            from: state.to_string(),
            action: action.to_string(),
        });
    }

    let next = match action {
        AttackAction::Start | AttackAction::Resume => AttackState::Running,
        AttackAction::Pause => AttackState::Paused,
        AttackAction::Complete => AttackState::Completed,
        AttackAction::Fail => AttackState::Failed,
        AttackAction::Abort | AttackAction::Abandon => AttackState::Abandoned,
        AttackAction::Retry | AttackAction::Reactivate => AttackState::Pending,
    };
    Ok(next)
}
