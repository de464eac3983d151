// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::unistd::{getpgid, Pid};
use tracing::debug;

use crate::config::Config;
use crate::error::ErrorKind;
use crate::manifest::Manifest;
use crate::runner::{Children, RunId, RunState, RunnerState};
use crate::Error;

/// Links are slot index + 1, zero ends a chain
const NIL: u32 = 0;

struct Slot {
    run_id: AtomicU32,
    leader: AtomicI32,
    app: AtomicI32,
    state: AtomicU8,
    next_by_runid: AtomicU32,
    next_by_pgid: AtomicU32,
    // only ever touched from the control path, never from the signal handler
    manifest: Mutex<Option<Arc<Manifest>>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            run_id: AtomicU32::new(0),
            leader: AtomicI32::new(0),
            app: AtomicI32::new(0),
            state: AtomicU8::new(RunState::Terminated as u8),
            next_by_runid: AtomicU32::new(NIL),
            next_by_pgid: AtomicU32::new(NIL),
            manifest: Mutex::new(None),
        }
    }

    fn manifest(&self) -> MutexGuard<'_, Option<Arc<Manifest>>> {
        self.manifest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Allocator {
    last_run_id: u32,
    live: usize,
    free: Vec<u32>,
}

/// All runners of a supervisor, indexed both by run id and by process group id.
///
/// Storage is a fixed arena of slots allocated up front. Runners never move and slots are only
///  recycled by the control path, so the SIGCHLD handler can walk the process group index and
///  write runner state at any instant without allocating or locking. Bucket chains are intrusive
///  lists of slot indexes held in atomics.
pub struct Registry {
    slots: Box<[Slot]>,
    by_runid: Box<[AtomicU32]>,
    by_pgid: Box<[AtomicU32]>,
    max_run_id: u32,
    allocator: Mutex<Allocator>,
}

impl Registry {
    /// Reserves `capacity` runner slots, run ids cycle through `1..=max_run_id`
    pub fn new(capacity: usize, max_run_id: u32, buckets: usize) -> Result<Self, Error> {
        if capacity == 0 || capacity >= u32::MAX as usize {
            return Err(Error::invalid(format!("bad runner capacity: {}", capacity)));
        }
        if (max_run_id as usize) < capacity {
            return Err(Error::invalid(format!(
                "max run id {} is below the capacity {}",
                max_run_id, capacity
            )));
        }
        if !buckets.is_power_of_two() {
            return Err(Error::invalid(format!(
                "bucket count must be a power of two: {}",
                buckets
            )));
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        slots.extend((0..capacity).map(|_| Slot::new()));

        // popped from the back, so the lowest slots are used first
        let mut free = Vec::new();
        free.try_reserve_exact(capacity)?;
        free.extend((0..capacity as u32).rev());

        let mut by_runid = Vec::new();
        by_runid.try_reserve_exact(buckets)?;
        by_runid.extend((0..buckets).map(|_| AtomicU32::new(NIL)));

        let mut by_pgid = Vec::new();
        by_pgid.try_reserve_exact(buckets)?;
        by_pgid.extend((0..buckets).map(|_| AtomicU32::new(NIL)));

        Ok(Self {
            slots: slots.into_boxed_slice(),
            by_runid: by_runid.into_boxed_slice(),
            by_pgid: by_pgid.into_boxed_slice(),
            max_run_id,
            allocator: Mutex::new(Allocator {
                last_run_id: 0,
                live: 0,
                free,
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::new(config.capacity, config.max_run_id, config.buckets)
    }

    /// Maximum number of live runners
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live runners, terminated ones included until reclaimed
    pub fn len(&self) -> usize {
        self.allocator().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, link: u32) -> &Slot {
        &self.slots[(link - 1) as usize]
    }

    fn runner(&self, link: u32) -> Runner<'_> {
        Runner {
            registry: self,
            link,
        }
    }

    fn runid_bucket(&self, run_id: u32) -> &AtomicU32 {
        &self.by_runid[run_id as usize & (self.by_runid.len() - 1)]
    }

    fn pgid_bucket(&self, pgid: Pid) -> &AtomicU32 {
        &self.by_pgid[pgid.as_raw() as u32 as usize & (self.by_pgid.len() - 1)]
    }

    pub fn lookup_by_runid(&self, run_id: RunId) -> Option<Runner<'_>> {
        let mut link = self.runid_bucket(run_id.get()).load(Ordering::Acquire);
        while link != NIL {
            let slot = self.slot(link);
            if slot.run_id.load(Ordering::Acquire) == run_id.get() {
                return Some(self.runner(link));
            }
            link = slot.next_by_runid.load(Ordering::Acquire);
        }
        None
    }

    pub fn lookup_by_pgid(&self, pgid: Pid) -> Option<Runner<'_>> {
        let mut link = self.pgid_bucket(pgid).load(Ordering::Acquire);
        while link != NIL {
            let slot = self.slot(link);
            if slot.leader.load(Ordering::Acquire) == pgid.as_raw() {
                return Some(self.runner(link));
            }
            link = slot.next_by_pgid.load(Ordering::Acquire);
        }
        None
    }

    /// Finds the runner a process belongs to.
    ///
    /// A group leader's pid is its group id, so that is tried first. Otherwise the group is asked
    ///  of the system and the match only holds if the pid is the runner's application.
    pub fn lookup_by_pid(&self, pid: Pid) -> Option<Runner<'_>> {
        if let Some(runner) = self.lookup_by_pgid(pid) {
            return Some(runner);
        }

        let pgid = getpgid(Some(pid)).ok()?;
        self.lookup_by_pgid(pgid).filter(|runner| runner.app() == pid)
    }

    /// Allocates a runner in the Starting state and indexes it by its new run id
    pub(crate) fn allocate(&self, manifest: Arc<Manifest>) -> Result<Runner<'_>, Error> {
        let mut allocator = self.allocator();

        if allocator.live >= self.capacity() {
            return Err(ErrorKind::ResourceExhausted(self.capacity()).into());
        }

        // terminates, fewer runners are live than there are ids
        let run_id = loop {
            allocator.last_run_id = allocator.last_run_id % self.max_run_id + 1;
            let candidate = RunId::new(allocator.last_run_id);
            if self.lookup_by_runid(candidate).is_none() {
                break candidate;
            }
        };

        let index = allocator
            .free
            .pop()
            .ok_or(ErrorKind::ResourceExhausted(self.capacity()))?;
        let link = index + 1;

        let slot = self.slot(link);
        *slot.manifest() = Some(manifest);
        slot.leader.store(0, Ordering::Release);
        slot.app.store(0, Ordering::Release);
        slot.next_by_pgid.store(NIL, Ordering::Release);
        slot.state.store(RunState::Starting as u8, Ordering::Release);
        slot.run_id.store(run_id.get(), Ordering::Release);
        self.insert_by_runid(link);
        allocator.live += 1;

        debug!("allocated runner {} in slot {}", run_id, index);
        Ok(self.runner(link))
    }

    fn insert_by_runid(&self, link: u32) {
        let slot = self.slot(link);
        let head = self.runid_bucket(slot.run_id.load(Ordering::Acquire));
        slot.next_by_runid.store(head.load(Ordering::Acquire), Ordering::Release);
        head.store(link, Ordering::Release);
    }

    /// Records the launched processes, indexes the runner by its group and marks it Running.
    ///
    /// SIGCHLD must be blocked on the calling thread.
    pub(crate) fn insert_by_pgid(&self, runner: Runner<'_>, children: Children) {
        let slot = self.slot(runner.link);
        slot.leader.store(children.leader.as_raw(), Ordering::Release);
        slot.app.store(children.app.as_raw(), Ordering::Release);
        slot.state.store(RunState::Running as u8, Ordering::Release);

        let head = self.pgid_bucket(children.leader);
        slot.next_by_pgid.store(head.load(Ordering::Acquire), Ordering::Release);
        head.store(runner.link, Ordering::Release);
    }

    /// Unlinks the runner from the process group index, the unlinked slot keeps its own link so
    ///  a concurrent walk positioned on it still reaches the rest of the chain.
    pub(crate) fn remove_by_pgid(&self, runner: Runner<'_>) -> bool {
        let slot = self.slot(runner.link);
        let mut prev = self.pgid_bucket(Pid::from_raw(slot.leader.load(Ordering::Acquire)));
        loop {
            let link = prev.load(Ordering::Acquire);
            if link == NIL {
                return false;
            }
            if link == runner.link {
                prev.store(slot.next_by_pgid.load(Ordering::Acquire), Ordering::Release);
                return true;
            }
            prev = &self.slot(link).next_by_pgid;
        }
    }

    /// Destroys a runner, releasing its manifest and its run id.
    ///
    /// The runner must not be in the process group index: either it never launched or the reaper
    ///  already saw it terminate.
    pub(crate) fn free(&self, runner: Runner<'_>) {
        let mut allocator = self.allocator();
        self.free_locked(&mut allocator, runner.link);
    }

    fn free_locked(&self, allocator: &mut Allocator, link: u32) {
        let slot = self.slot(link);
        let mut prev = self.runid_bucket(slot.run_id.load(Ordering::Acquire));
        loop {
            let current = prev.load(Ordering::Acquire);
            if current == NIL {
                break;
            }
            if current == link {
                prev.store(slot.next_by_runid.load(Ordering::Acquire), Ordering::Release);
                break;
            }
            prev = &self.slot(current).next_by_runid;
        }

        let run_id = slot.run_id.swap(0, Ordering::AcqRel);
        slot.next_by_runid.store(NIL, Ordering::Release);
        slot.state.store(RunState::Terminated as u8, Ordering::Release);
        slot.manifest().take();

        allocator.free.push(link - 1);
        allocator.live -= 1;
        debug!("freed runner {}", run_id);
    }

    /// Frees every runner the reaper has marked Terminated, returns how many were freed
    pub fn reclaim(&self) -> usize {
        let mut allocator = self.allocator();
        let mut reclaimed = 0;

        for bucket in self.by_runid.iter() {
            let mut link = bucket.load(Ordering::Acquire);
            while link != NIL {
                let next = self.slot(link).next_by_runid.load(Ordering::Acquire);
                if self.runner(link).state() == RunState::Terminated {
                    self.free_locked(&mut allocator, link);
                    reclaimed += 1;
                }
                link = next;
            }
        }

        reclaimed
    }

    /// Every allocated runner in bucket order, newest first within a bucket
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            registry: self,
            table: Table::RunId,
            bucket: 0,
            link: NIL,
        }
    }

    /// Runners with a known process group, yields the next link before handing out a runner so
    ///  the runner may be removed from the index meanwhile
    pub(crate) fn iter_by_pgid(&self) -> Iter<'_> {
        Iter {
            registry: self,
            table: Table::Pgid,
            bucket: 0,
            link: NIL,
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("capacity", &self.capacity())
            .field("buckets", &self.by_runid.len())
            .field("max_run_id", &self.max_run_id)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Table {
    RunId,
    Pgid,
}

pub struct Iter<'r> {
    registry: &'r Registry,
    table: Table,
    bucket: usize,
    link: u32,
}

impl<'r> Iterator for Iter<'r> {
    type Item = Runner<'r>;

    fn next(&mut self) -> Option<Runner<'r>> {
        let heads = match self.table {
            Table::RunId => &self.registry.by_runid,
            Table::Pgid => &self.registry.by_pgid,
        };

        while self.link == NIL {
            if self.bucket >= heads.len() {
                return None;
            }
            self.link = heads[self.bucket].load(Ordering::Acquire);
            self.bucket += 1;
        }

        let link = self.link;
        let slot = self.registry.slot(link);
        self.link = match self.table {
            Table::RunId => slot.next_by_runid.load(Ordering::Acquire),
            Table::Pgid => slot.next_by_pgid.load(Ordering::Acquire),
        };
        Some(self.registry.runner(link))
    }
}

/// A borrowed view of one runner.
///
/// Only valid for the call that looked it up, the slot may be reclaimed by a later call.
#[derive(Clone, Copy)]
pub struct Runner<'r> {
    registry: &'r Registry,
    link: u32,
}

impl<'r> Runner<'r> {
    fn slot(&self) -> &'r Slot {
        self.registry.slot(self.link)
    }

    pub fn run_id(&self) -> RunId {
        RunId::new(self.slot().run_id.load(Ordering::Acquire))
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.slot().state.load(Ordering::Acquire))
    }

    /// Group leader, also the process group id; zero until launched
    pub fn leader(&self) -> Pid {
        Pid::from_raw(self.slot().leader.load(Ordering::Acquire))
    }

    pub fn app(&self) -> Pid {
        Pid::from_raw(self.slot().app.load(Ordering::Acquire))
    }

    pub fn manifest(&self) -> Option<Arc<Manifest>> {
        self.slot().manifest().clone()
    }

    /// The record reported to clients
    pub fn record(&self) -> RunnerState {
        RunnerState {
            runid: self.run_id(),
            state: self.state().reported(),
            id: self
                .manifest()
                .map(|m| m.app_id().to_string())
                .unwrap_or_default(),
        }
    }

    /// Moves from `from` to `to` unless the state changed in between, returns the state now held
    pub(crate) fn transition(&self, from: RunState, to: RunState) -> RunState {
        match self.slot().state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => to,
            Err(current) => RunState::from_u8(current),
        }
    }

    /// Applies `update` to the state with a lock free retry loop, returns the new state
    pub(crate) fn update_state<F>(&self, update: F) -> RunState
    where
        F: Fn(RunState) -> RunState,
    {
        let previous = self
            .slot()
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                Some(update(RunState::from_u8(state)) as u8)
            })
            .unwrap_or_else(|state| state);
        update(RunState::from_u8(previous))
    }
}

impl<'r> fmt::Debug for Runner<'r> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("run_id", &self.run_id())
            .field("state", &self.state())
            .field("leader", &self.leader())
            .field("app", &self.app())
            .finish()
    }
}
