// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ErrorKind;
use crate::launch::{Launch, ProcessLauncher};
use crate::manifest::{LaunchDesc, Manifest};
use crate::runner::{ChildSignalBlock, Reaper, Registry, RunId, RunState, RunnerState};
use crate::Error;

/// Starts applications and relays control requests to them.
///
/// Rules:
///   - every request runs on one control thread, the SIGCHLD handler interrupts that thread
///   - control requests only signal, the reaper observes the outcome
///   - runners are destroyed here, and only once the reaper marked them terminated
pub struct Supervisor<L = ProcessLauncher> {
    registry: Arc<Registry>,
    launcher: L,
    home: PathBuf,
    reaper: Option<Reaper>,
}

impl Supervisor<ProcessLauncher> {
    /// A supervisor spawning processes with the configured launch templates
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::init(config, ProcessLauncher::from_config(config))
    }
}

impl<L: Launch> Supervisor<L> {
    /// Builds the registry and the application home, without taking over SIGCHLD.
    ///
    /// Child status changes must then be fed through [`Registry::notify`].
    pub fn new(config: &Config, launcher: L) -> Result<Self, Error> {
        config.validate()?;

        let home = config.app_home()?;
        fs::create_dir_all(&home).map_err(|err| {
            error!("creation of directory {} failed: {}", home.display(), err);
            err
        })?;

        let registry = Arc::new(Registry::from_config(config)?);
        debug!("registry ready: {:?}", registry);

        Ok(Self {
            registry,
            launcher,
            home,
            reaper: None,
        })
    }

    /// Builds the supervisor and installs the SIGCHLD reaper
    pub fn init(config: &Config, launcher: L) -> Result<Self, Error> {
        let mut supervisor = Self::new(config, launcher)?;
        supervisor.reaper = Some(Reaper::install(Arc::clone(&supervisor.registry))?);
        Ok(supervisor)
    }

    /// Removes the reaper, runners still alive are left running
    pub fn shutdown(mut self) {
        self.reaper.take();

        let live = self
            .registry
            .iter()
            .filter(|runner| !runner.state().is_gone())
            .count();
        if live > 0 {
            warn!("shutting down with {} applications still running", live);
        }
        info!("supervisor shut down");
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Launches a new instance of the application, returns its run id
    pub fn start(&self, manifest: Arc<Manifest>) -> Result<RunId, Error> {
        let desc = LaunchDesc::from_manifest(&manifest, &self.home)?;

        let reclaimed = self.registry.reclaim();
        if reclaimed > 0 {
            debug!("reclaimed {} terminated runners", reclaimed);
        }

        let runner = self.registry.allocate(manifest)?;
        let run_id = runner.run_id();

        // the reaper must not see the group before it is indexed
        let blocked = ChildSignalBlock::new().map_err(|err| {
            self.registry.free(runner);
            err
        })?;

        match self.launcher.launch(&desc) {
            Ok(children) => {
                self.registry.insert_by_pgid(runner, children);
                drop(blocked);

                info!(
                    "runner {} started {} with process group {}",
                    run_id, desc.tag, children.leader
                );
                Ok(run_id)
            }
            Err(err) => {
                drop(blocked);
                error!("can't start {}, launch failed: {}", desc.tag, err);
                self.registry.free(runner);

                Err(ErrorKind::LaunchFailed {
                    app: desc.tag,
                    source: Box::new(err),
                }
                .into())
            }
        }
    }

    /// Asks the application to terminate
    pub fn terminate(&self, run_id: RunId) -> Result<(), Error> {
        self.kill(run_id, Signal::SIGTERM, RunState::Terminating)
    }

    /// Stops every process of the application
    pub fn stop(&self, run_id: RunId) -> Result<(), Error> {
        self.kill(run_id, Signal::SIGSTOP, RunState::Stopped)
    }

    /// Continues a stopped application
    pub fn resume(&self, run_id: RunId) -> Result<(), Error> {
        self.kill(run_id, Signal::SIGCONT, RunState::Running)
    }

    fn kill(&self, run_id: RunId, signal: Signal, to: RunState) -> Result<(), Error> {
        let runner = self
            .registry
            .lookup_by_runid(run_id)
            .ok_or(ErrorKind::NotFound(run_id))?;

        let from = runner.state();
        match from {
            RunState::Running | RunState::Stopped => (),
            state => return Err(ErrorKind::PermissionDenied { run_id, state }.into()),
        }
        if from == to {
            return Ok(());
        }

        self.launcher.signal(runner.leader(), signal)?;
        let now = runner.transition(from, to);
        debug!("runner {} sent {}: {:?} -> {:?}", run_id, signal, from, now);

        if from == RunState::Stopped && signal == Signal::SIGTERM {
            // a stopped group only acts on SIGTERM once continued
            if let Err(err) = self.launcher.signal(runner.leader(), Signal::SIGCONT) {
                warn!("runner {} pending SIGTERM, continuing it failed: {}", run_id, err);
            }
        }
        Ok(())
    }

    /// Records of every runner that is neither terminating nor terminated
    pub fn list(&self) -> Vec<RunnerState> {
        self.registry
            .iter()
            .filter(|runner| !runner.state().is_gone())
            .map(|runner| runner.record())
            .collect()
    }

    /// The record of one runner, terminating and terminated runners are not found
    pub fn state(&self, run_id: RunId) -> Result<RunnerState, Error> {
        self.registry
            .lookup_by_runid(run_id)
            .filter(|runner| !runner.state().is_gone())
            .map(|runner| runner.record())
            .ok_or_else(|| ErrorKind::NotFound(run_id).into())
    }

    /// Destroys every terminated runner, returns how many were destroyed
    pub fn collect(&self) -> usize {
        self.registry.reclaim()
    }

    /// Destroys one terminated runner
    pub fn remove(&self, run_id: RunId) -> Result<(), Error> {
        let runner = self
            .registry
            .lookup_by_runid(run_id)
            .ok_or(ErrorKind::NotFound(run_id))?;

        match runner.state() {
            RunState::Terminated => {
                self.registry.free(runner);
                Ok(())
            }
            state => Err(ErrorKind::PermissionDenied { run_id, state }.into()),
        }
    }
}
