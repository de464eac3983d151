// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Real process groups followed by the installed SIGCHLD handler.
//!
//! The harness owns its threads, so the handler may run on any of them rather than on the
//!  thread issuing requests. The requests here never race a reclaim against the handler, the
//!  runners are only collected once the handler has unlinked them from the group index.

#![cfg(target_os = "linux")]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use serde_json::json;
use serial_test::serial;
use tempfile::TempDir;

use afrun::runner::ReportedState;
use afrun::{Config, Manifest, ProcessLauncher, RunId, RunState, Supervisor};

const SLEEPER: &str = "test/x-sleeper";

fn supervisor() -> (Supervisor, TempDir) {
    let home = tempfile::tempdir().expect("create tempdir");

    let mut launch = HashMap::new();
    launch.insert(
        SLEEPER.to_string(),
        vec!["sleep".to_string(), "30".to_string()],
    );
    let config = Config {
        capacity: 4,
        max_run_id: 4,
        buckets: 4,
        home: Some(home.path().to_path_buf()),
        launch,
        ..Config::default()
    };

    let supervisor =
        Supervisor::init(&config, ProcessLauncher::from_config(&config)).expect("supervisor");
    (supervisor, home)
}

fn sleeper(home: &TempDir) -> Arc<Manifest> {
    let value = json!({
        "id": "sleeper",
        "path": home.path(),
        "content": "sleep",
        "type": SLEEPER,
        "public": {"id": "sleeper", "name": "Sleeper", "width": 1, "height": 1}
    });

    Arc::new(Manifest::from_value(value).expect("manifest"))
}

fn internal_state(supervisor: &Supervisor, run_id: RunId) -> Option<RunState> {
    supervisor
        .registry()
        .lookup_by_runid(run_id)
        .map(|runner| runner.state())
}

/// Polls until the runner reaches `state`, the reaper runs asynchronously
fn wait_for(supervisor: &Supervisor, run_id: RunId, state: RunState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while internal_state(supervisor, run_id) != Some(state) {
        assert!(
            Instant::now() < deadline,
            "runner {} stuck in {:?}, expected {:?}",
            run_id,
            internal_state(supervisor, run_id),
            state
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
#[serial]
fn test_reaper_follows_process_group() {
    let (supervisor, home) = supervisor();

    let run_id = supervisor.start(sleeper(&home)).unwrap();
    assert_eq!(supervisor.state(run_id).unwrap().state, ReportedState::Running);
    let leader = supervisor
        .registry()
        .lookup_by_runid(run_id)
        .unwrap()
        .leader();
    assert!(supervisor.registry().lookup_by_pgid(leader).is_some());

    // stopped and continued behind the supervisor's back
    killpg(leader, Signal::SIGSTOP).unwrap();
    wait_for(&supervisor, run_id, RunState::Stopped);
    assert_eq!(supervisor.state(run_id).unwrap().state, ReportedState::Stopped);

    killpg(leader, Signal::SIGCONT).unwrap();
    wait_for(&supervisor, run_id, RunState::Running);

    supervisor.terminate(run_id).unwrap();
    assert!(supervisor.state(run_id).unwrap_err().is_not_found());
    wait_for(&supervisor, run_id, RunState::Terminated);
    assert!(supervisor.registry().lookup_by_pgid(leader).is_none());

    assert_eq!(supervisor.collect(), 1);
    assert!(supervisor.registry().is_empty());
    supervisor.shutdown();
}

#[test]
#[serial]
fn test_reaper_sees_external_kill() {
    let (supervisor, home) = supervisor();

    let first = supervisor.start(sleeper(&home)).unwrap();
    let second = supervisor.start(sleeper(&home)).unwrap();
    assert_ne!(first, second);

    supervisor.stop(first).unwrap();
    let leader = supervisor
        .registry()
        .lookup_by_runid(first)
        .unwrap()
        .leader();
    killpg(leader, Signal::SIGKILL).unwrap();

    wait_for(&supervisor, first, RunState::Terminated);
    assert!(supervisor.state(first).unwrap_err().is_not_found());

    let list = supervisor.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].runid, second);

    supervisor.terminate(second).unwrap();
    wait_for(&supervisor, second, RunState::Terminated);
    assert!(supervisor.list().is_empty());
    supervisor.shutdown();
}

#[test]
#[serial]
fn test_single_reaper() {
    let (supervisor, _home) = supervisor();

    let config = Config {
        home: Some(supervisor.home().to_path_buf()),
        ..Config::default()
    };
    assert!(Supervisor::from_config(&config).is_err());

    supervisor.shutdown();
    let again = Supervisor::from_config(&config).unwrap();
    again.shutdown();
}
