//! The orchestrator: owns the process table and runs the supervision loop.
//!
//! Everything happens on one thread. `poll()` is the only call that blocks,
//! and only up to a bounded timeout; reaping, policy, event dispatch and
//! deferred calls all run to completion between polls. Signals arrive as
//! readable bytes on a descriptor the poller watches, so the table is only
//! ever mutated from the loop itself.
use nix::sys::signal::Signal;
use nix::unistd::{getpid, Pid};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::conf::{GroupConf, SupervisorConf};
use crate::control::Response;
use crate::deferred::{self, CallId, DeferredCall, DeferredQueue};
use crate::error::{Fault, FaultKind, KillError, SpawnError, SupervisorError, WriteError};
use crate::events::{EventQueue, EventRef, EventType, TICKS};
use crate::listener::{Delivery, Outcome};
use crate::poller::{AsPoller, Poller};
use crate::registry::{ProcessGroup, ProcessKey, Registry};
use crate::signals::{SignalReceiver, HANDLED};
use crate::states::{ListenerState, Mood, ProcessState};
use crate::subprocess::{Channel, ExitStatus, Subprocess, Transition};

/// Keeps policy from restarting anything once shutdown has begun.
const SHUTDOWN_SENTINEL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Options {
    pub identifier: String,
    pub pidfile: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self::from_conf(&SupervisorConf::default())
    }
}

impl Options {
    pub fn from_conf(conf: &SupervisorConf) -> Self {
        Self {
            identifier: conf.identifier.clone(),
            pidfile: conf.pidfile.clone(),
            poll_interval: Duration::from_millis(conf.poll_interval_ms.max(1)),
        }
    }
}

/// Why `run()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    Restart,
}

/// Snapshot of one process, as served to control clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub description: String,
    pub start: u64,
    pub stop: u64,
    pub now: u64,
    pub state: u32,
    pub statename: String,
    pub spawnerr: String,
    pub exitstatus: i32,
    pub stdout_logfile: String,
    pub stderr_logfile: String,
    pub stdout_offset: u64,
    pub stderr_offset: u64,
    pub pid: i32,
}

pub struct Supervisor {
    options: Options,
    mood: Mood,
    registry: Registry,
    configs: Vec<GroupConf>,
    poller: Poller,
    readable: HashSet<RawFd>,
    writable: HashSet<RawFd>,
    signals: Option<SignalReceiver>,
    received: Vec<Signal>,
    events: EventQueue,
    deferred: DeferredQueue,
    last_tick: [Option<u64>; TICKS.len()],
    stopping_announced: bool,
    clock: (Instant, SystemTime),
}

impl Supervisor {
    pub fn new(options: Options, groups: Vec<GroupConf>) -> Result<Self, SupervisorError> {
        Ok(Self {
            options,
            mood: Mood::Active,
            registry: Registry::new(groups.clone()),
            configs: groups,
            poller: Poller::new()?,
            readable: HashSet::new(),
            writable: HashSet::new(),
            signals: None,
            received: Vec::new(),
            events: EventQueue::new(),
            deferred: DeferredQueue::default(),
            last_tick: [None; TICKS.len()],
            stopping_announced: false,
            clock: (Instant::now(), SystemTime::now()),
        })
    }

    pub fn mood(&self) -> Mood {
        self.mood
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn events_mut(&mut self) -> &mut EventQueue {
        &mut self.events
    }

    pub fn request_shutdown(&mut self) {
        self.mood = Mood::ShuttingDown;
    }

    pub fn request_restart(&mut self) {
        if self.mood == Mood::Active {
            self.mood = Mood::Restarting;
        }
    }

    pub fn run(&mut self) -> Result<Exit, SupervisorError> {
        self.signals = Some(SignalReceiver::new(&HANDLED).map_err(SupervisorError::Signals)?);
        self.write_pidfile()?;
        log::info!("dynein started with pid {}", getpid());
        self.events.notify(EventType::SupervisorStateChangeRunning, "");

        let interval = self.options.poll_interval;
        let result = loop {
            match self.run_once(interval) {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.remove_pidfile();
        result?;

        Ok(match self.mood {
            Mood::Restarting => Exit::Restart,
            Mood::Active | Mood::ShuttingDown => Exit::Shutdown,
        })
    }

    /// One pass of the loop, polling for at most `max_wait`. Returns false
    /// once shutdown has completed.
    pub fn run_once(&mut self, max_wait: Duration) -> Result<bool, SupervisorError> {
        let now = Instant::now();
        if self.mood == Mood::Active {
            self.give_up(now);
            self.start_necessary(now);
        } else {
            self.begin_shutdown(now);
            self.kill_undead(now);
            if self.registry.live_pids() == 0 {
                log::info!("all processes stopped");
                return Ok(false);
            }
        }

        self.observe(now);
        self.tick(now);
        self.dispatch_events(now);
        self.sync_poller()?;

        let timeout = match self.deferred.next_due() {
            Some(due) => max_wait.min(due.saturating_duration_since(now)),
            None => max_wait,
        };
        let ready = self.poller.poll(timeout)?;
        for fd in ready.readable {
            self.handle_readable(fd);
        }
        for fd in ready.writable {
            self.handle_writable(fd);
        }
        self.flush_logs();

        let now = Instant::now();
        for signal in std::mem::take(&mut self.received) {
            self.handle_signal(signal, now);
        }
        self.reap(false);
        deferred::run_due(self, Instant::now());
        Ok(true)
    }

    pub(crate) fn spawn_at(&mut self, at: (usize, usize), now: Instant) -> Result<Pid, SpawnError> {
        let key = self.registry.key_at(at);
        let pid = self.registry.at_mut(at).spawn(now)?;
        self.registry.record_pid(pid, key);
        Ok(pid)
    }

    pub fn spawn_process(&mut self, key: &ProcessKey, now: Instant) -> Result<Pid, SpawnError> {
        match self.registry.position(key) {
            Some(at) => self.spawn_at(at, now),
            None => Err(SpawnError::NotFound(key.to_string())),
        }
    }

    pub fn stop_process(&mut self, key: &ProcessKey, now: Instant) -> Result<(), KillError> {
        match self.registry.get_mut(key) {
            Some(process) => process.stop(now),
            None => Ok(()),
        }
    }

    /// Start whatever policy says should be running, in ascending priority
    /// order. Returns the processes it spawned (or tried to).
    pub fn start_necessary(&mut self, now: Instant) -> Vec<ProcessKey> {
        let mut started = Vec::new();
        for at in self.registry.ordered() {
            let process = self.registry.at(at);
            let due = process.delay.map_or(true, |delay| now >= delay);
            let wanted = match process.state_at(now) {
                ProcessState::Stopped => process.laststart.is_none() && process.config.autostart,
                ProcessState::Exited => process.restart_wanted(),
                ProcessState::Backoff => due && process.backoff <= process.config.startretries,
                _ => false,
            };
            if wanted {
                started.push(self.registry.key_at(at));
                // Failures are recorded on the process and retried later.
                let _ = self.spawn_at(at, now);
            }
        }
        started
    }

    /// Stop every live child in descending priority order. Processes without
    /// a child get a far-future delay so nothing restarts them.
    pub fn stop_all(&mut self, now: Instant) -> Vec<ProcessKey> {
        let mut stopped = Vec::new();
        let mut order = self.registry.ordered();
        order.reverse();
        for at in order {
            let key = self.registry.key_at(at);
            let process = self.registry.at_mut(at);
            match process.state_at(now) {
                ProcessState::Running | ProcessState::Starting => {
                    if let Err(e) = process.stop(now) {
                        log::warn!("{e}");
                    }
                    stopped.push(key);
                }
                ProcessState::Stopping => {}
                _ => process.delay = Some(now.checked_add(SHUTDOWN_SENTINEL).unwrap_or(now)),
            }
        }
        stopped
    }

    pub fn begin_shutdown(&mut self, now: Instant) {
        if !self.stopping_announced {
            self.stopping_announced = true;
            log::info!("stopping all processes ({})", self.mood);
            self.events.notify(EventType::SupervisorStateChangeStopping, "");
        }
        self.stop_all(now);
    }

    /// Move BACKOFF processes that used up their retries to FATAL.
    pub fn give_up(&mut self, now: Instant) -> Vec<ProcessKey> {
        let mut given_up = Vec::new();
        for at in self.registry.ordered() {
            let process = self.registry.at_mut(at);
            if process.state_at(now) == ProcessState::Backoff
                && process.backoff > process.config.startretries
            {
                process.give_up();
                given_up.push(self.registry.key_at(at));
            }
        }
        given_up
    }

    /// STOPPING processes whose stop grace period ran out.
    pub fn get_undead(&self, now: Instant) -> Vec<ProcessKey> {
        self.registry
            .ordered()
            .into_iter()
            .filter(|at| {
                let process = self.registry.at(*at);
                process.state_at(now) == ProcessState::Stopping
                    && process.delay.is_some_and(|deadline| now >= deadline)
            })
            .map(|at| self.registry.key_at(at))
            .collect()
    }

    pub fn kill_undead(&mut self, now: Instant) {
        for key in self.get_undead(now) {
            if let Some(process) = self.registry.get_mut(&key) {
                log::warn!(
                    "killing {key} ({}) with SIGKILL",
                    process.pid.map(|p| p.as_raw()).unwrap_or(0)
                );
                if let Err(e) = process.kill(Signal::SIGKILL, now) {
                    log::warn!("{e}");
                }
            }
        }
    }

    /// Collect exited children and feed them to their processes. Returns how
    /// many were collected.
    pub fn reap(&mut self, blocking: bool) -> usize {
        let reaped = Registry::reap_children(blocking);
        let now = Instant::now();
        let count = reaped.len();
        for (pid, status) in reaped {
            self.handle_reaped(pid, status, now);
        }
        count
    }

    pub fn handle_reaped(&mut self, pid: Pid, status: ExitStatus, now: Instant) {
        let Some(key) = self.registry.forget_pid(pid) else {
            log::debug!("reaped unknown pid {pid} ({})", status.description);
            return;
        };
        let Some(at) = self.registry.position(&key) else {
            return;
        };
        if self.registry.at(at).pid != Some(pid) {
            log::debug!("reaped stale pid {pid} of {key}");
            return;
        }

        for channel in [Channel::Stdout, Channel::Stderr] {
            self.drain_fully(at, channel);
        }
        self.close_pipes(at);
        self.registry.at_mut(at).flush_logs();
        if let Some(rejected) = self.registry.at_mut(at).finish(pid, status, now) {
            self.requeue(at.0, rejected);
        }
    }

    pub fn handle_signal(&mut self, signal: Signal, now: Instant) {
        match signal {
            Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT => {
                log::warn!("received {signal} indicating exit request");
                self.mood = Mood::ShuttingDown;
                self.begin_shutdown(now);
            }
            Signal::SIGHUP => {
                if self.mood == Mood::ShuttingDown {
                    log::warn!("ignored SIGHUP indicating restart request (shutdown in progress)");
                } else {
                    log::warn!("received SIGHUP indicating restart request");
                    self.mood = Mood::Restarting;
                    self.begin_shutdown(now);
                }
            }
            Signal::SIGCHLD => {
                log::debug!("received SIGCHLD indicating a child quit");
                self.reap(false);
            }
            Signal::SIGUSR2 => {
                log::info!("received SIGUSR2 indicating log reopen request");
                self.reopen_logs();
            }
            other => log::debug!("received {other} indicating nothing"),
        }
    }

    pub fn reopen_logs(&mut self) {
        for process in self.registry.iter_mut() {
            process.reopen_logs();
        }
    }

    fn flush_logs(&mut self) {
        for process in self.registry.iter_mut() {
            process.flush_logs();
        }
    }

    /// Announce every state change recorded since the last pass.
    pub fn observe(&mut self, now: Instant) {
        for at in self.registry.ordered() {
            let process = self.registry.at_mut(at);
            let transitions = process.take_transitions(now);
            // Listeners would otherwise be notified about themselves.
            if process.is_listener() {
                continue;
            }
            for Transition { to, payload, .. } in transitions {
                self.events.notify(EventType::for_state(to), payload);
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        let wall = self.wall_secs(now);
        for (slot, (period, kind)) in self.last_tick.iter_mut().zip(TICKS) {
            let bucket = wall / period;
            match *slot {
                Some(last) if last == bucket => {}
                Some(_) => {
                    self.events.notify(kind, format!("when:{}", bucket * period));
                    *slot = Some(bucket);
                }
                None => *slot = Some(bucket),
            }
        }
    }

    /// Route queued events into subscribed pools, expire unacknowledged
    /// deliveries and hand one event to every READY listener.
    pub fn dispatch_events(&mut self, now: Instant) {
        loop {
            let batch: Vec<EventRef> = self.events.drain().collect();
            if batch.is_empty() {
                break;
            }
            let mut overflows = Vec::new();
            for event in batch {
                for group in self.registry.groups_mut() {
                    let Some(pool) = group.pool.as_mut() else {
                        continue;
                    };
                    if !pool.accepts(event.kind) {
                        continue;
                    }
                    if let Some(dropped) = pool.push(event.clone()) {
                        if dropped.kind != EventType::EventBufferOverflow {
                            overflows.push(format!(
                                "groupname:{} event_type:{}",
                                pool.name(),
                                dropped.kind
                            ));
                        }
                    }
                }
            }
            for payload in overflows {
                self.events.notify(EventType::EventBufferOverflow, payload);
            }
        }

        let identifier = &self.options.identifier;
        for group in self.registry.groups_mut() {
            let ProcessGroup {
                pool, processes, ..
            } = group;
            let Some(pool) = pool.as_mut() else {
                continue;
            };

            if let Some(timeout) = pool.ack_timeout() {
                for process in processes.iter_mut() {
                    let expired = process
                        .listener
                        .as_mut()
                        .and_then(|channel| channel.check_timeout(now, timeout));
                    if let Some(delivery) = expired {
                        pool.requeue(delivery);
                    }
                }
            }

            for process in processes.iter_mut() {
                let ready = process.pid.is_some()
                    && process
                        .listener
                        .as_ref()
                        .is_some_and(|channel| channel.state() == ListenerState::Ready);
                if !ready {
                    continue;
                }
                let Some(delivery) = pool.pop() else {
                    break;
                };
                let envelope = pool.envelope(&delivery, identifier);
                match process.write(&envelope) {
                    Ok(()) => {
                        if let Some(channel) = process.listener.as_mut() {
                            channel.deliver(delivery, now);
                        }
                    }
                    Err(e) => {
                        log::warn!("{e}");
                        pool.requeue(delivery);
                    }
                }
            }
        }
    }

    fn requeue(&mut self, group: usize, delivery: Delivery) {
        if let Some(pool) = self.registry.groups_mut()[group].pool.as_mut() {
            pool.requeue(delivery);
        }
    }

    fn settle(&mut self, at: (usize, usize), outcomes: Vec<Outcome>) {
        for outcome in outcomes {
            match outcome {
                Outcome::Accepted(delivery) => log::debug!(
                    "event {} processed by {}",
                    delivery.event.serial,
                    self.registry.at(at).name()
                ),
                Outcome::Rejected(delivery) => self.requeue(at.0, delivery),
            }
        }
    }

    fn sync_poller(&mut self) -> Result<(), SupervisorError> {
        let mut want_read: HashSet<RawFd> =
            self.registry.iter().flat_map(|p| p.read_fds()).collect();
        if let Some(signals) = &self.signals {
            want_read.insert(signals.as_raw_fd());
        }
        let want_write: HashSet<RawFd> = self
            .registry
            .iter()
            .filter_map(Subprocess::pending_stdin_fd)
            .collect();

        for fd in self.readable.difference(&want_read) {
            self.poller.unregister_readable(*fd)?;
        }
        for fd in want_read.difference(&self.readable) {
            self.poller.register_readable(*fd)?;
        }
        for fd in self.writable.difference(&want_write) {
            self.poller.unregister_writable(*fd)?;
        }
        for fd in want_write.difference(&self.writable) {
            self.poller.register_writable(*fd)?;
        }
        self.readable = want_read;
        self.writable = want_write;
        Ok(())
    }

    fn forget_fd(&mut self, fd: RawFd) {
        if let Err(e) = self.poller.unregister(fd) {
            log::error!("failed to unregister fd {fd}: {e}");
        }
        self.readable.remove(&fd);
        self.writable.remove(&fd);
    }

    fn close_channel(&mut self, at: (usize, usize), channel: Channel) {
        if let Some(fd) = self.registry.at(at).fd_of(channel) {
            self.forget_fd(fd);
        }
        self.registry.at_mut(at).close_channel(channel);
    }

    fn close_pipes(&mut self, at: (usize, usize)) {
        for fd in self.registry.at(at).pipe_fds() {
            self.forget_fd(fd);
        }
        self.registry.at_mut(at).close_pipes();
    }

    /// Read once from a ready descriptor.
    fn drain_channel(&mut self, at: (usize, usize), channel: Channel) -> usize {
        match self.registry.at_mut(at).drain(channel) {
            Ok(drained) => {
                if drained.eof {
                    self.close_channel(at, channel);
                }
                for (kind, payload) in drained.events {
                    self.events.notify(kind, payload);
                }
                self.settle(at, drained.outcomes);
                drained.bytes
            }
            Err(e) => {
                log::error!("{}: failed to read {channel}: {e}", self.registry.at(at).name());
                self.close_channel(at, channel);
                0
            }
        }
    }

    fn drain_fully(&mut self, at: (usize, usize), channel: Channel) {
        while self.registry.at(at).fd_of(channel).is_some() {
            if self.drain_channel(at, channel) == 0 {
                break;
            }
        }
    }

    fn handle_readable(&mut self, fd: RawFd) {
        if let Some(signals) = self.signals.as_mut() {
            if signals.as_raw_fd() == fd {
                self.received.extend(signals.drain());
                return;
            }
        }
        match self.registry.by_fd(fd) {
            Some((at, channel)) => {
                self.drain_channel(at, channel);
            }
            None => self.forget_fd(fd),
        }
    }

    fn handle_writable(&mut self, fd: RawFd) {
        let Some((at, Channel::Stdin)) = self.registry.by_fd(fd) else {
            return;
        };
        if let Err(e) = self.registry.at_mut(at).flush_stdin() {
            log::warn!("{}: stdin closed: {e}", self.registry.at(at).name());
            self.close_channel(at, Channel::Stdin);
        }
    }

    pub fn add_group(&mut self, conf: GroupConf) -> Result<(), Fault> {
        if self.registry.group(&conf.name).is_some() {
            return Err(Fault::new(FaultKind::AlreadyAdded, conf.name));
        }
        let name = conf.name.clone();
        self.registry.insert_group(ProcessGroup::new(conf));
        log::info!("added process group {name}");
        self.events
            .notify(EventType::ProcessGroupAdded, format!("groupname:{name}\n"));
        Ok(())
    }

    /// Add a group that the loaded configuration defines but the table lacks.
    pub fn add_configured_group(&mut self, name: &str) -> Result<(), Fault> {
        let conf = self
            .configs
            .iter()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| Fault::new(FaultKind::BadName, name))?;
        self.add_group(conf)
    }

    pub fn remove_group(&mut self, name: &str) -> Result<(), Fault> {
        let group = self
            .registry
            .group(name)
            .ok_or_else(|| Fault::new(FaultKind::BadName, name))?;
        let now = Instant::now();
        if group.processes.iter().any(|p| !p.state_at(now).is_stopped()) {
            return Err(Fault::new(FaultKind::StillRunning, name));
        }
        let fds: Vec<RawFd> = group.processes.iter().flat_map(|p| p.pipe_fds()).collect();
        for fd in fds {
            self.forget_fd(fd);
        }
        self.registry.remove_group(name);
        log::info!("removed process group {name}");
        self.events
            .notify(EventType::ProcessGroupRemoved, format!("groupname:{name}\n"));
        Ok(())
    }

    pub fn send_remote_comm_event(&mut self, kind: &str, data: &str) {
        self.events
            .notify(EventType::RemoteCommunication, format!("type:{kind}\n{data}"));
    }

    pub fn write_stdin(&mut self, namespec: &str, data: &[u8]) -> Result<(), Fault> {
        let key = self.lookup_one(namespec)?;
        let Some(process) = self.registry.get_mut(&key) else {
            return Err(Fault::new(FaultKind::BadName, namespec));
        };
        process.write(data).map_err(|e| match e {
            WriteError::NotRunning(name) => Fault::new(FaultKind::NotRunning, name),
            WriteError::NoStdin(name) => Fault::new(FaultKind::NoFile, name),
        })
    }

    pub fn lookup_one(&self, namespec: &str) -> Result<ProcessKey, Fault> {
        match self.registry.lookup(namespec).as_deref() {
            Some([key]) => Ok(key.clone()),
            _ => Err(Fault::new(FaultKind::BadName, namespec)),
        }
    }

    pub fn process_info(&self, namespec: &str) -> Result<ProcessInfo, Fault> {
        let key = self.lookup_one(namespec)?;
        self.registry
            .get(&key)
            .map(|p| self.info(p, Instant::now()))
            .ok_or_else(|| Fault::new(FaultKind::BadName, namespec))
    }

    pub fn all_process_info(&self) -> Vec<ProcessInfo> {
        let now = Instant::now();
        self.registry
            .ordered()
            .into_iter()
            .map(|at| self.info(self.registry.at(at), now))
            .collect()
    }

    fn info(&self, process: &Subprocess, now: Instant) -> ProcessInfo {
        let state = process.state_at(now);
        let logfile = |channel| {
            process
                .logfile(channel)
                .map(|(path, offset)| (path.display().to_string(), offset))
                .unwrap_or_default()
        };
        let (stdout_logfile, stdout_offset) = logfile(Channel::Stdout);
        let (stderr_logfile, stderr_offset) = logfile(Channel::Stderr);
        ProcessInfo {
            name: process.config.name.clone(),
            group: process.group.clone(),
            description: process.describe(now),
            start: process.laststart.map_or(0, |t| self.wall_secs(t)),
            stop: process.laststop.map_or(0, |t| self.wall_secs(t)),
            now: self.wall_secs(now),
            state: state.code(),
            statename: state.name().to_string(),
            spawnerr: process
                .spawnerr
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            exitstatus: process.last_exit.as_ref().map_or(0, |e| e.code),
            stdout_logfile,
            stderr_logfile,
            stdout_offset,
            stderr_offset,
            pid: process.pid.map_or(0, |p| p.as_raw()),
        }
    }

    fn wall_secs(&self, at: Instant) -> u64 {
        let (base, wall) = self.clock;
        let when = if at >= base {
            wall.checked_add(at - base)
        } else {
            wall.checked_sub(base - at)
        };
        when.unwrap_or(wall)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn submit(&mut self, call: Box<dyn DeferredCall<Output = Response>>) -> CallId {
        self.deferred.submit(call, Instant::now())
    }

    pub fn take_result(&mut self, id: CallId) -> Option<Response> {
        self.deferred.take_result(id)
    }

    pub(crate) fn deferred_mut(&mut self) -> &mut DeferredQueue {
        &mut self.deferred
    }

    fn write_pidfile(&self) -> Result<(), SupervisorError> {
        let Some(path) = &self.options.pidfile else {
            return Ok(());
        };
        fs::write(path, format!("{}\n", getpid())).map_err(|source| SupervisorError::Pidfile {
            path: path.clone(),
            source,
        })
    }

    fn remove_pidfile(&self) {
        if let Some(path) = &self.options.pidfile {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("failed to remove pidfile {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{AutoRestart, OverflowPolicy, PoolConf, ProcessConf};
    use crate::fork_lock;

    fn group(name: &str, priority: i32, command: &str, args: &[&str]) -> GroupConf {
        let mut conf = ProcessConf::new(name, command);
        conf.args = args.iter().map(|a| a.to_string()).collect();
        conf.priority = priority;
        conf.startsecs = 0;
        GroupConf {
            name: name.into(),
            priority,
            processes: vec![conf],
            pool: None,
        }
    }

    fn supervisor(groups: Vec<GroupConf>) -> Supervisor {
        Supervisor::new(Options::default(), groups).unwrap()
    }

    fn key(name: &str) -> ProcessKey {
        ProcessKey::new(name, name)
    }

    #[test]
    fn unknown_pid_is_ignored() {
        let mut sup = supervisor(vec![group("a", 1, "true", &[])]);
        let before = sup.all_process_info();
        sup.handle_reaped(
            Pid::from_raw(999_999),
            ExitStatus {
                code: 0,
                description: "exit status 0".into(),
            },
            Instant::now(),
        );
        assert_eq!(sup.all_process_info()[0].state, before[0].state);
        assert_eq!(sup.registry().at((0, 0)).exitstatus, None);
    }

    #[test]
    fn spawn_failures_end_in_fatal() {
        let mut sup = supervisor(vec![group("ghost", 1, "/nonexistent/ghost", &[])]);
        let retries = sup.registry().at((0, 0)).config.startretries;
        let mut now = Instant::now();

        for _ in 0..=retries {
            assert!(sup.give_up(now).is_empty());
            assert_eq!(sup.start_necessary(now), vec![key("ghost")]);
            assert!(sup.start_necessary(now).is_empty(), "still backing off");
            now += Duration::from_secs(61);
        }
        assert_eq!(sup.give_up(now), vec![key("ghost")]);
        let process = sup.registry().at((0, 0));
        assert_eq!(process.state_at(now), ProcessState::Fatal);
        assert_eq!(process.backoff, 0);
        assert!(matches!(process.spawnerr, Some(SpawnError::NotFound(_))));
        assert!(sup.start_necessary(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn give_up_only_touches_exhausted_backoff() {
        let mut sup = supervisor(vec![
            group("spent", 1, "true", &[]),
            group("fresh", 2, "true", &[]),
            group("idle", 3, "true", &[]),
        ]);
        let now = Instant::now();
        for (at, backoff) in [((0, 0), 4), ((1, 0), 1)] {
            let process = sup.registry_mut().at_mut(at);
            process.administrative_stop = false;
            process.backoff = backoff;
        }

        assert_eq!(sup.give_up(now), vec![key("spent")]);
        assert_eq!(sup.registry().at((0, 0)).state_at(now), ProcessState::Fatal);
        assert_eq!(sup.registry().at((1, 0)).state_at(now), ProcessState::Backoff);
        assert_eq!(sup.registry().at((2, 0)).state_at(now), ProcessState::Stopped);
    }

    #[test]
    fn start_and_stop_follow_priority() {
        let _guard = fork_lock();
        let mut sup = supervisor(vec![
            group("b", 2, "sleep", &["30"]),
            group("a", 1, "sleep", &["30"]),
        ]);
        let now = Instant::now();

        assert_eq!(sup.start_necessary(now), vec![key("a"), key("b")]);
        assert!(sup.start_necessary(now).is_empty(), "already running");
        sup.observe(now);
        for process in sup.registry().iter() {
            assert_eq!(process.state_at(now), ProcessState::Running);
        }

        assert_eq!(sup.stop_all(now), vec![key("b"), key("a")]);
        assert!(sup.stop_all(now).is_empty(), "already stopping");
        while sup.registry().live_pids() > 0 {
            sup.reap(true);
        }
        for process in sup.registry().iter() {
            assert_eq!(process.state(), ProcessState::Stopped);
            assert!(process.pipe_fds().is_empty());
        }
    }

    #[test]
    fn undead_processes_are_killed() {
        let _guard = fork_lock();
        let mut sup = supervisor(vec![group(
            "stubborn",
            1,
            "/bin/sh",
            &["-c", "trap '' TERM; while :; do sleep 1; done"],
        )]);
        let now = Instant::now();
        sup.start_necessary(now);
        // give the shell a moment to install its trap
        std::thread::sleep(Duration::from_millis(200));
        sup.stop_all(now);

        assert!(sup.get_undead(now).is_empty());
        let late = now + Duration::from_secs(11);
        assert_eq!(sup.get_undead(late), vec![key("stubborn")]);
        sup.kill_undead(late);
        while sup.registry().live_pids() > 0 {
            sup.reap(true);
        }
        let process = sup.registry().at((0, 0));
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(
            process.last_exit.as_ref().map(|e| e.description.as_str()),
            Some("terminated by SIGKILL")
        );
    }

    #[test]
    fn state_changes_become_events() {
        let _guard = fork_lock();
        let mut sup = supervisor(vec![group("once", 1, "true", &[])]);
        let now = Instant::now();
        sup.start_necessary(now);
        sup.observe(now);
        sup.reap(true);
        sup.observe(Instant::now());

        let events: Vec<_> = sup.events_mut().drain().collect();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                EventType::ProcessStateStarting,
                EventType::ProcessStateRunning,
                EventType::ProcessStateExited
            ]
        );
        let payload = String::from_utf8(events[2].payload.clone()).unwrap();
        assert!(payload.starts_with("processname:once groupname:once from_state:RUNNING expected:1 pid:"));
    }

    #[test]
    fn exits_before_a_respawn_are_still_announced() {
        let _guard = fork_lock();
        let mut sup = supervisor(vec![group("loop", 1, "true", &[])]);
        sup.registry_mut().at_mut((0, 0)).config.autorestart = AutoRestart::Always;
        let now = Instant::now();
        sup.start_necessary(now);
        sup.reap(true);
        // respawned before anything was observed
        assert_eq!(sup.start_necessary(Instant::now()), vec![key("loop")]);
        sup.observe(Instant::now());

        let kinds: Vec<_> = sup.events_mut().drain().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                EventType::ProcessStateStarting,
                EventType::ProcessStateRunning,
                EventType::ProcessStateExited,
                EventType::ProcessStateStarting,
                EventType::ProcessStateRunning,
            ]
        );
        sup.stop_all(Instant::now());
        while sup.registry().live_pids() > 0 {
            sup.reap(true);
        }
    }

    #[test]
    fn groups_can_be_added_and_removed() {
        let mut sup = supervisor(vec![group("web", 1, "true", &[])]);
        assert_eq!(
            sup.add_configured_group("web").unwrap_err().kind,
            FaultKind::AlreadyAdded
        );
        sup.add_group(group("extra", 5, "true", &[])).unwrap();
        assert!(sup.process_info("extra").is_ok());

        sup.remove_group("extra").unwrap();
        assert_eq!(sup.process_info("extra").unwrap_err().kind, FaultKind::BadName);
        assert_eq!(sup.remove_group("extra").unwrap_err().kind, FaultKind::BadName);

        let kinds: Vec<_> = sup.events_mut().drain().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [EventType::ProcessGroupAdded, EventType::ProcessGroupRemoved]
        );
    }

    #[test]
    fn running_group_cannot_be_removed() {
        let mut sup = supervisor(vec![group("web", 1, "true", &[])]);
        let process = sup.registry_mut().at_mut((0, 0));
        process.administrative_stop = false;
        process.backoff = 1;
        assert_eq!(sup.remove_group("web").unwrap_err().kind, FaultKind::StillRunning);
    }

    #[test]
    fn pool_overflow_is_announced() {
        let mut listener = group("alerts", 1, "true", &[]);
        listener.pool = Some(PoolConf {
            events: vec![EventType::Tick5, EventType::EventBufferOverflow],
            buffer_size: 1,
            ack_timeout_secs: None,
            max_attempts: 1,
            overflow: OverflowPolicy::DropOldest,
        });
        let mut sup = supervisor(vec![listener]);
        sup.events_mut().notify(EventType::Tick5, "when:5");
        sup.events_mut().notify(EventType::Tick5, "when:10");
        sup.dispatch_events(Instant::now());

        let pool = sup.registry().group("alerts").unwrap().pool.as_ref().unwrap();
        // the overflow event itself displaced the second tick
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn signals_change_mood() {
        let mut sup = supervisor(vec![group("web", 1, "true", &[])]);
        let now = Instant::now();
        sup.handle_signal(Signal::SIGUSR1, now);
        assert_eq!(sup.mood(), Mood::Active);

        sup.handle_signal(Signal::SIGHUP, now);
        assert_eq!(sup.mood(), Mood::Restarting);
        sup.handle_signal(Signal::SIGTERM, now);
        assert_eq!(sup.mood(), Mood::ShuttingDown);
        sup.handle_signal(Signal::SIGHUP, now);
        assert_eq!(sup.mood(), Mood::ShuttingDown);

        let kinds: Vec<_> = sup.events_mut().drain().map(|e| e.kind).collect();
        assert_eq!(kinds, [EventType::SupervisorStateChangeStopping]);
    }

    #[test]
    fn info_snapshot_serializes() {
        let sup = supervisor(vec![group("web", 1, "true", &[])]);
        let info = sup.process_info("web:web").unwrap();
        assert_eq!(info.statename, "STOPPED");
        assert_eq!(info.description, "Not started");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], 0);
        assert_eq!(json["group"], "web");
    }
}
