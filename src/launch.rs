// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::config::Config;
use crate::manifest::LaunchDesc;
use crate::runner::Children;
use crate::Error;

/// Spawns application processes and delivers signals to their groups
pub trait Launch {
    /// Starts the application described by `desc` in a new process group
    fn launch(&self, desc: &LaunchDesc) -> Result<Children, Error>;

    /// Sends `signal` to every process of the group
    fn signal(&self, pgid: Pid, signal: Signal) -> Result<(), Error> {
        killpg(pgid, signal)?;
        Ok(())
    }
}

pub struct StdIoConf {
    pub stdin: Stdio,
    pub stderr: Stdio,
    pub stdout: Stdio,
}

impl Default for StdIoConf {
    fn default() -> Self {
        StdIoConf {
            // applications never read the supervisor's input
            stdin: Stdio::null(),
            stderr: Stdio::inherit(),
            stdout: Stdio::inherit(),
        }
    }
}

/// Launches applications as direct children, each the leader of its own process group.
///
/// How a content type is started is an argv template, see [`Config::launch`].
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    templates: HashMap<String, Vec<String>>,
}

impl ProcessLauncher {
    pub fn new(templates: HashMap<String, Vec<String>>) -> Self {
        Self { templates }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.launch.clone())
    }

    /// Renders the argv for `desc`, an unknown content type is an invalid argument
    pub fn argv(&self, desc: &LaunchDesc) -> Result<Vec<String>, Error> {
        let template = self.templates.get(&desc.content_type).ok_or_else(|| {
            Error::invalid(format!("no launcher for type {}", desc.content_type))
        })?;

        Ok(template.iter().map(|arg| render(arg, desc)).collect())
    }
}

impl Launch for ProcessLauncher {
    fn launch(&self, desc: &LaunchDesc) -> Result<Children, Error> {
        let argv = self.argv(desc)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::invalid(format!("empty launcher for {}", desc.content_type)))?;
        let stdio = StdIoConf::default();

        debug!("launching {}: {:?}", desc.tag, argv);
        let child = Command::new(program)
            .args(args)
            .current_dir(&desc.path)
            .env("HOME", &desc.home)
            .env("AFM_APP_ID", &desc.tag)
            .env("AFM_APP_NAME", &desc.name)
            .env("AFM_WIDTH", desc.width.to_string())
            .env("AFM_HEIGHT", desc.height.to_string())
            .env("AFM_PLUGINS", desc.plugins.join(","))
            .process_group(0)
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr)
            .spawn()?;

        // the reaper collects the exit status, the handle is not needed
        let pid = Pid::from_raw(child.id() as i32);
        info!("started {} as process group {}", desc.tag, pid);

        Ok(Children {
            leader: pid,
            app: pid,
        })
    }
}

fn render(arg: &str, desc: &LaunchDesc) -> String {
    arg.replace("{path}", &desc.path.to_string_lossy())
        .replace("{content}", &desc.content)
        .replace("{id}", &desc.tag)
        .replace("{name}", &desc.name)
        .replace("{width}", &desc.width.to_string())
        .replace("{height}", &desc.height.to_string())
        .replace("{home}", &desc.home.to_string_lossy())
}
