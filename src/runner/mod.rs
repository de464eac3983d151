// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runners, the registry that owns them, and the SIGCHLD reaper that updates them

mod reaper;
mod registry;

pub use reaper::{block_child_signals, ChildEvent, ChildSignalBlock, Reaper};
pub use registry::{Registry, Runner};

use std::fmt;

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Logical handle of a running application instance, stable for the life of the instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(u32);

impl RunId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a runner
///
/// ```text
/// Starting -> Running <-> Stopped -> Terminating -> Terminated
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Starting = 0,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

impl RunState {
    pub(crate) fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopped,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }

    /// Terminating and Terminated runners are hidden from `list` and `state`
    pub fn is_gone(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    /// The state as reported to clients, Starting is reported as running
    pub fn reported(self) -> ReportedState {
        match self {
            Self::Starting | Self::Running => ReportedState::Running,
            Self::Stopped => ReportedState::Stopped,
            Self::Terminating | Self::Terminated => ReportedState::Terminated,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedState {
    Running,
    Stopped,
    Terminated,
}

/// The processes of a launched application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Children {
    /// group leader, its pid is the process group id
    pub leader: Pid,
    /// the application itself, the same as the leader when nothing sits in between
    pub app: Pid,
}

/// A state record, as returned by `list` and `state`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerState {
    pub runid: RunId,
    pub state: ReportedState,
    pub id: String,
}
