//! Work slice state machine.
//!
//! ```text
//! pending  --lease-->    leased  --start-->  running --complete--> completed
//!                        leased|running --fail--> failed --requeue--> pending
//!                                                 failed --bury-->    dead
//!                        leased|running --expire--> expired --reclaim--> pending
//! any non-terminal --pause--> paused --resume--> pending
//! dead --revive--> pending
//! ```

use std::fmt;

use crate::error::InvalidTransition;
use crate::slice::model::SliceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceAction {
    Lease,
    Start,
    Complete,
    Fail,
    Requeue,
    Bury,
    Expire,
    Reclaim,
    Pause,
    Resume,
    Revive,
}

impl fmt::Display for SliceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SliceAction::Lease => "lease",
            SliceAction::Start => "start",
            SliceAction::Complete => "complete",
            SliceAction::Fail => "fail",
            SliceAction::Requeue => "requeue",
            SliceAction::Bury => "bury",
            SliceAction::Expire => "expire",
            SliceAction::Reclaim => "reclaim",
            SliceAction::Pause => "pause",
            SliceAction::Resume => "resume",
            SliceAction::Revive => "revive",
        };
        write!(f, "{}", s)
    }
}

pub fn valid_actions(state: SliceState) -> &'static [SliceAction] {
    use SliceAction::*;
    match state {
        SliceState::Pending => &[Lease, Pause],
        SliceState::Leased => &[Start, Complete, Fail, Expire, Pause],
        SliceState::Running => &[Complete, Fail, Expire, Pause],
        SliceState::Failed => &[Requeue, Bury, Pause],
        SliceState::Expired => &[Reclaim, Pause],
        SliceState::Paused => &[Resume],
        SliceState::Dead => &[Revive],
        SliceState::Completed => &[],
    }
}

pub fn apply(state: SliceState, action: SliceAction) -> Result<SliceState, InvalidTransition> {
    if !valid_actions(state).contains(&action) {
        return Err(InvalidTransition {
            entity: "slice",
            from: state.to_string(),
            action: action.to_string(),
        });
    }

    let next = match action {
        SliceAction::Lease => SliceState::Leased,
        SliceAction::Start => SliceState::Running,
        SliceAction::Complete => SliceState::Completed,
        SliceAction::Fail => SliceState::Failed,
        SliceAction::Bury => SliceState::Dead,
        SliceAction::Expire => SliceState::Expired,
        SliceAction::Pause => SliceState::Paused,
        SliceAction::Requeue | SliceAction::Reclaim | SliceAction::Resume | SliceAction::Revive => {
            SliceState::Pending
        }
    };
    Ok(next)
}
