// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{value_parser, Arg, ArgAction, Command};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime;
use tracing::{info, warn, Level};

use afrun::runner::block_child_signals;
use afrun::{Config, Error, Manifest, RunId, Supervisor};

const CONFIG: &str = "config";
const VERBOSE: &str = "verbose";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
}

impl SetupClapApp for Command {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }
}

/// One line of input on stdin
#[derive(Debug, PartialEq)]
enum Request {
    Start(PathBuf),
    Terminate(RunId),
    Stop(RunId),
    Continue(RunId),
    State(RunId),
    List,
    Collect,
    Quit,
}

impl FromStr for Request {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Error> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or("empty request")?;
        let arg = words.next();
        if words.next().is_some() {
            return Err(format!("too many arguments to {}", verb).into());
        }

        let run_id = || -> Result<RunId, Error> {
            let arg = arg.ok_or_else(|| format!("{} requires a runid", verb))?;
            u32::from_str(arg)
                .map(RunId::new)
                .map_err(|_| Error::from(format!("not a runid: {}", arg)))
        };

        let request = match verb {
            "start" => Self::Start(PathBuf::from(
                arg.ok_or("start requires a manifest file")?,
            )),
            "terminate" => Self::Terminate(run_id()?),
            "stop" => Self::Stop(run_id()?),
            "continue" => Self::Continue(run_id()?),
            "state" => Self::State(run_id()?),
            "list" => Self::List,
            "collect" => Self::Collect,
            "quit" => Self::Quit,
            verb => return Err(format!("unknown request: {}", verb).into()),
        };

        Ok(request)
    }
}

fn main() -> Result<(), Error> {
    let args = Command::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new(CONFIG)
                .short('c')
                .long(CONFIG)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new(VERBOSE)
                .short('v')
                .long(VERBOSE)
                .action(ArgAction::Count)
                .help("more logging, may be repeated"),
        )
        .get_matches();

    let level = match args.get_count(VERBOSE) {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match args.get_one::<PathBuf>(CONFIG) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // only the main thread may take SIGCHLD, helper threads start with it blocked
    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .on_thread_start(|| {
            if let Err(err) = block_child_signals() {
                warn!("failed to block SIGCHLD: {}", err);
            }
        })
        .build()?;

    let supervisor = Supervisor::from_config(&config)?;
    info!("applications home: {}", supervisor.home().display());

    let result = runtime.block_on(serve(&supervisor));
    supervisor.shutdown();
    result
}

async fn serve(supervisor: &Supervisor) -> Result<(), Error> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        };

        let line = match line {
            Some(line) => line,
            None => return Ok(()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match line.parse::<Request>() {
            Ok(Request::Quit) => return Ok(()),
            Ok(request) => handle(supervisor, request),
            Err(err) => Err(err),
        };

        match reply {
            Ok(value) => println!("{}", value),
            Err(err) => println!("{}", json!({ "error": describe(&err) })),
        }
    }
}

fn handle(supervisor: &Supervisor, request: Request) -> Result<Value, Error> {
    let value = match request {
        Request::Start(path) => {
            let manifest = Arc::new(Manifest::from_file(&path)?);
            json!({ "runid": supervisor.start(manifest)? })
        }
        Request::Terminate(run_id) => {
            supervisor.terminate(run_id)?;
            json!({ "runid": run_id })
        }
        Request::Stop(run_id) => {
            supervisor.stop(run_id)?;
            json!({ "runid": run_id })
        }
        Request::Continue(run_id) => {
            supervisor.resume(run_id)?;
            json!({ "runid": run_id })
        }
        Request::State(run_id) => serde_json::to_value(supervisor.state(run_id)?)?,
        Request::List => serde_json::to_value(supervisor.list())?,
        Request::Collect => json!({ "collected": supervisor.collect() }),
        Request::Quit => Value::Null,
    };

    Ok(value)
}

/// The error followed by its causes
fn describe(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
