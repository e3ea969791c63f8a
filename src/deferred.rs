//! Resumable operations driven by the supervisor loop.
//!
//! A deferred call is stepped until it returns `Step::Done`; between steps it
//! asks to be left alone for `delay()`. Nothing runs in the background: the
//! loop (or a test) decides when to step.
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::control::Response;
use crate::error::{Fault, FaultKind};
use crate::registry::ProcessKey;
use crate::states::{Mood, ProcessState};
use crate::supervisor::Supervisor;

/// Status code of a successful item in a multi-process result.
pub const SUCCESS: u32 = 80;

const START_DELAY: Duration = Duration::from_millis(50);
const STOP_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Pending,
    Done(T),
}

pub trait DeferredCall {
    type Output;

    fn step(&mut self, sup: &mut Supervisor, now: Instant) -> Step<Self::Output>;

    /// How long to wait before stepping again after `Step::Pending`.
    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    fn map<F, U>(self, f: F) -> Map<Self, F>
    where
        Self: Sized,
        F: FnOnce(Self::Output) -> U,
    {
        Map { call: self, f: Some(f) }
    }
}

impl<C: DeferredCall + ?Sized> DeferredCall for Box<C> {
    type Output = C::Output;

    fn step(&mut self, sup: &mut Supervisor, now: Instant) -> Step<Self::Output> {
        (**self).step(sup, now)
    }

    fn delay(&self) -> Duration {
        (**self).delay()
    }
}

pub struct Map<C, F> {
    call: C,
    f: Option<F>,
}

impl<C, F, U> DeferredCall for Map<C, F>
where
    C: DeferredCall,
    F: FnOnce(C::Output) -> U,
{
    type Output = U;

    fn step(&mut self, sup: &mut Supervisor, now: Instant) -> Step<U> {
        match self.call.step(sup, now) {
            Step::Pending => Step::Pending,
            Step::Done(out) => match self.f.take() {
                Some(f) => Step::Done(f(out)),
                // stepped again after completion
                None => Step::Pending,
            },
        }
    }

    fn delay(&self) -> Duration {
        self.call.delay()
    }
}

pub type ProcessCall = Box<dyn DeferredCall<Output = Result<(), Fault>>>;

/// Spawn a process and, with `wait`, follow it until it is RUNNING.
#[derive(Debug)]
pub struct StartProcess {
    key: ProcessKey,
    wait: bool,
    spawned: bool,
}

impl StartProcess {
    pub fn new(key: ProcessKey, wait: bool) -> Self {
        Self {
            key,
            wait,
            spawned: false,
        }
    }
}

impl DeferredCall for StartProcess {
    type Output = Result<(), Fault>;

    fn step(&mut self, sup: &mut Supervisor, now: Instant) -> Step<Self::Output> {
        let name = self.key.to_string();
        if !self.spawned {
            if sup.mood() != Mood::Active {
                return Step::Done(Err(Fault::new(FaultKind::ShutdownState, name)));
            }
            let Some(process) = sup.registry().get(&self.key) else {
                return Step::Done(Err(Fault::new(FaultKind::BadName, name)));
            };
            if process.pid.is_some() {
                return Step::Done(Err(Fault::new(FaultKind::AlreadyStarted, name)));
            }
            if let Err(e) = sup.spawn_process(&self.key, now) {
                return Step::Done(Err(Fault::new(FaultKind::SpawnError, e.to_string())));
            }
            self.spawned = true;
            if !self.wait {
                return Step::Done(Ok(()));
            }
        }

        let Some(process) = sup.registry().get(&self.key) else {
            return Step::Done(Err(Fault::new(FaultKind::BadName, name)));
        };
        match process.state_at(now) {
            ProcessState::Running => Step::Done(Ok(())),
            ProcessState::Starting => Step::Pending,
            _ => Step::Done(Err(Fault::new(FaultKind::AbnormalTermination, name))),
        }
    }

    fn delay(&self) -> Duration {
        START_DELAY
    }
}

/// Stop a process administratively and, with `wait`, follow it until it no
/// longer has a child.
#[derive(Debug)]
pub struct StopProcess {
    key: ProcessKey,
    wait: bool,
    signaled: bool,
}

impl StopProcess {
    pub fn new(key: ProcessKey, wait: bool) -> Self {
        Self {
            key,
            wait,
            signaled: false,
        }
    }
}

impl DeferredCall for StopProcess {
    type Output = Result<(), Fault>;

    fn step(&mut self, sup: &mut Supervisor, now: Instant) -> Step<Self::Output> {
        let name = self.key.to_string();
        let Some(process) = sup.registry().get(&self.key) else {
            return Step::Done(Err(Fault::new(FaultKind::BadName, name)));
        };

        if !self.signaled {
            if !process.state_at(now).is_running() {
                return Step::Done(Err(Fault::new(FaultKind::NotRunning, name)));
            }
            if let Err(e) = sup.stop_process(&self.key, now) {
                return Step::Done(Err(Fault::new(FaultKind::Failed, e.to_string())));
            }
            self.signaled = true;
            if !self.wait {
                return Step::Done(Ok(()));
            }
            return Step::Pending;
        }

        if process.state_at(now).is_stopped() {
            Step::Done(Ok(()))
        } else {
            Step::Pending
        }
    }

    fn delay(&self) -> Duration {
        STOP_DELAY
    }
}

/// Per-process outcome of a multi-process operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub name: String,
    pub group: String,
    pub status: u32,
    pub description: String,
}

impl ProcessResult {
    fn new(key: &ProcessKey, outcome: Result<(), Fault>) -> Self {
        let (status, description) = match outcome {
            Ok(()) => (SUCCESS, "OK".to_string()),
            Err(fault) => (fault.code(), fault.text),
        };
        Self {
            name: key.name.clone(),
            group: key.group.clone(),
            status,
            description,
        }
    }
}

/// FIFO of per-process calls. The head is stepped until it finishes before
/// the next one gets a turn; results come back in submission order.
pub struct Sequence {
    queue: VecDeque<(ProcessKey, ProcessCall)>,
    results: Vec<ProcessResult>,
}

impl Sequence {
    pub fn new(items: impl IntoIterator<Item = (ProcessKey, ProcessCall)>) -> Self {
        Self {
            queue: items.into_iter().collect(),
            results: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn starts(keys: Vec<ProcessKey>, wait: bool) -> Self {
        Self::new(keys.into_iter().map(|key| {
            let call: ProcessCall = Box::new(StartProcess::new(key.clone(), wait));
            (key, call)
        }))
    }

    fn stops(keys: Vec<ProcessKey>, wait: bool) -> Self {
        Self::new(keys.into_iter().map(|key| {
            let call: ProcessCall = Box::new(StopProcess::new(key.clone(), wait));
            (key, call)
        }))
    }

    /// Every process not already started, in ascending priority order.
    pub fn start_all(sup: &Supervisor, wait: bool) -> Self {
        Self::starts(select(sup, None, false), wait)
    }

    /// Every started process, in descending priority order.
    pub fn stop_all(sup: &Supervisor, wait: bool) -> Self {
        let mut keys = select(sup, None, true);
        keys.reverse();
        Self::stops(keys, wait)
    }

    pub fn start_group(sup: &Supervisor, group: &str, wait: bool) -> Result<Self, Fault> {
        if sup.registry().group(group).is_none() {
            return Err(Fault::new(FaultKind::BadName, group));
        }
        Ok(Self::starts(select(sup, Some(group), false), wait))
    }

    pub fn stop_group(sup: &Supervisor, group: &str, wait: bool) -> Result<Self, Fault> {
        if sup.registry().group(group).is_none() {
            return Err(Fault::new(FaultKind::BadName, group));
        }
        let mut keys = select(sup, Some(group), true);
        keys.reverse();
        Ok(Self::stops(keys, wait))
    }
}

fn select(sup: &Supervisor, group: Option<&str>, running: bool) -> Vec<ProcessKey> {
    let registry = sup.registry();
    let now = Instant::now();
    registry
        .ordered()
        .into_iter()
        .filter(|at| group.map_or(true, |g| registry.groups()[at.0].name == g))
        .filter(|at| registry.at(*at).state_at(now).is_running() == running)
        .map(|at| registry.key_at(at))
        .collect()
}

impl DeferredCall for Sequence {
    type Output = Vec<ProcessResult>;

    fn step(&mut self, sup: &mut Supervisor, now: Instant) -> Step<Self::Output> {
        let Some((key, mut call)) = self.queue.pop_front() else {
            return Step::Done(std::mem::take(&mut self.results));
        };
        match call.step(sup, now) {
            Step::Pending => {
                self.queue.push_front((key, call));
                Step::Pending
            }
            Step::Done(outcome) => {
                self.results.push(ProcessResult::new(&key, outcome));
                if self.queue.is_empty() {
                    Step::Done(std::mem::take(&mut self.results))
                } else {
                    Step::Pending
                }
            }
        }
    }

    fn delay(&self) -> Duration {
        self.queue
            .front()
            .map_or(Duration::ZERO, |(_, call)| call.delay())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallId(u64);

struct Slot {
    id: CallId,
    due: Instant,
    call: Box<dyn DeferredCall<Output = Response>>,
}

/// Calls submitted by control clients, stepped by the loop when due.
#[derive(Default)]
pub struct DeferredQueue {
    next_id: u64,
    calls: Vec<Slot>,
    results: HashMap<CallId, Response>,
}

impl DeferredQueue {
    pub fn submit(&mut self, call: Box<dyn DeferredCall<Output = Response>>, now: Instant) -> CallId {
        self.next_id += 1;
        let id = CallId(self.next_id);
        self.calls.push(Slot { id, due: now, call });
        id
    }

    /// Remove and return every call whose wake time has come.
    pub fn take_due(&mut self, now: Instant) -> Vec<(CallId, Box<dyn DeferredCall<Output = Response>>)> {
        let (due, waiting) = std::mem::take(&mut self.calls)
            .into_iter()
            .partition::<Vec<_>, _>(|slot| slot.due <= now);
        self.calls = waiting;
        due.into_iter().map(|slot| (slot.id, slot.call)).collect()
    }

    pub fn put_back(&mut self, id: CallId, call: Box<dyn DeferredCall<Output = Response>>, now: Instant) {
        let due = now + call.delay();
        self.calls.push(Slot { id, due, call });
    }

    pub fn complete(&mut self, id: CallId, response: Response) {
        self.results.insert(id, response);
    }

    pub fn take_result(&mut self, id: CallId) -> Option<Response> {
        self.results.remove(&id)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.calls.iter().map(|slot| slot.due).min()
    }
}

/// Step every due call once.
pub fn run_due(sup: &mut Supervisor, now: Instant) {
    for (id, mut call) in sup.deferred_mut().take_due(now) {
        match call.step(sup, now) {
            Step::Pending => sup.deferred_mut().put_back(id, call, now),
            Step::Done(response) => {
                log::debug!("deferred call {id:?} finished");
                sup.deferred_mut().complete(id, response);
            }
        }
    }
}
