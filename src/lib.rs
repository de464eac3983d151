// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Application runner library: the runner registry, the SIGCHLD reaper and the supervisor

pub mod config;
pub mod error;
pub mod launch;
pub mod manifest;
pub mod runner;
pub mod supervisor;

pub use config::Config;
pub use error::Error;
pub use launch::{Launch, ProcessLauncher};
pub use manifest::{LaunchDesc, Manifest};
pub use runner::{Children, RunId, RunState, RunnerState};
pub use supervisor::Supervisor;
