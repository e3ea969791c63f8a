//! One managed process: its derived state, its child pipes and the
//! transitions driven by spawn, kill and reap.
//!
//! A `Subprocess` outlives any number of children. Its state is never stored;
//! `state_at` derives it from a handful of flags and timestamps in a fixed
//! precedence order, so every overlap between flags resolves the same way.
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::buffd::{BufFd, ReadOutcome};
use crate::bus::Bus;
use crate::conf::{AutoRestart, ProcessConf};
use crate::error::{KillError, SpawnError, WriteError};
use crate::events::{process_output_payload, process_state_payload, EventType};
use crate::exec::{exec_child, ChildStdio, ExecArgs};
use crate::listener::{Delivery, ListenerChannel, Outcome};
use crate::logging::{FileLogHandler, LogHandler};
use crate::output::{Emitted, Output};
use crate::states::ProcessState;
use crate::utils::child_pipe;

pub const MAX_RETRY_DELAY_SECS: u64 = 60;
const LOG_BUFSIZE: usize = 4096;

/// Seconds to wait before retry number `attempt` (1-based).
pub fn retry_delay(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX)
        .min(MAX_RETRY_DELAY_SECS);
    Duration::from_secs(secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// How a child ended, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub description: String,
}

pub fn decode_wait_status(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus {
            code,
            description: format!("exit status {code}"),
        }),
        WaitStatus::Signaled(_, sig, core) => Some(ExitStatus {
            code: -1,
            description: format!(
                "terminated by {sig}{}",
                if core { " (core dumped)" } else { "" }
            ),
        }),
        _ => None,
    }
}

/// What one read from a child pipe produced.
#[derive(Debug, Default)]
pub struct Drain {
    pub bytes: usize,
    pub eof: bool,
    pub outcomes: Vec<Outcome>,
    /// Log and communication events, payload included.
    pub events: Vec<(EventType, Vec<u8>)>,
}

/// A change of state, with its event payload taken when it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ProcessState,
    pub to: ProcessState,
    pub payload: String,
}

#[derive(Debug, Default)]
struct Pipes {
    stdin: Option<BufFd>,
    stdout: Option<BufFd>,
    stderr: Option<BufFd>,
}

impl Pipes {
    fn get(&self, channel: Channel) -> Option<&BufFd> {
        match channel {
            Channel::Stdin => self.stdin.as_ref(),
            Channel::Stdout => self.stdout.as_ref(),
            Channel::Stderr => self.stderr.as_ref(),
        }
    }

    fn slot(&mut self, channel: Channel) -> &mut Option<BufFd> {
        match channel {
            Channel::Stdin => &mut self.stdin,
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
        }
    }
}

fn open_log(path: Option<&Path>, name: &str) -> Bus {
    let mut bus = Bus::new(LOG_BUFSIZE);
    if let Some(path) = path {
        match FileLogHandler::new(path) {
            Ok(handler) => bus.add_handler(LogHandler::File(handler)),
            Err(e) => log::error!("{name}: output will be discarded: {e}"),
        }
    }
    bus
}

fn output_event(
    name: &str,
    group: &str,
    pid: i32,
    channel: Channel,
    emitted: Emitted,
) -> (EventType, Vec<u8>) {
    let stderr = channel == Channel::Stderr;
    match emitted {
        Emitted::Log(data) => {
            let kind = if stderr {
                EventType::ProcessLogStderr
            } else {
                EventType::ProcessLogStdout
            };
            let channel = channel.to_string();
            (kind, process_output_payload(name, group, pid, Some(&channel), &data))
        }
        Emitted::Communication(data) => {
            let kind = if stderr {
                EventType::ProcessCommunicationStderr
            } else {
                EventType::ProcessCommunicationStdout
            };
            (kind, process_output_payload(name, group, pid, None, &data))
        }
    }
}

fn pipe_error(name: &str, errno: Errno) -> SpawnError {
    match errno {
        Errno::EMFILE | Errno::ENFILE => SpawnError::TooManyOpenFiles(name.to_string()),
        errno => SpawnError::Os(errno),
    }
}

#[derive(Debug)]
pub struct Subprocess {
    pub config: ProcessConf,
    pub group: String,
    pub pid: Option<Pid>,
    pub last_pid: Option<Pid>,
    pub laststart: Option<Instant>,
    pub laststop: Option<Instant>,
    /// Overloaded wake time: end of the startup grace period while starting,
    /// retry time while backing off, stop deadline while stopping.
    pub delay: Option<Instant>,
    pub backoff: u32,
    pub killing: bool,
    pub administrative_stop: bool,
    pub system_stop: bool,
    /// Set when an exit settled the process (as opposed to a retry).
    pub exitstatus: Option<i32>,
    pub last_exit: Option<ExitStatus>,
    pub expected_exit: bool,
    pub spawnerr: Option<SpawnError>,
    /// Last state recorded as a transition.
    pub reported_state: ProcessState,
    pub listener: Option<ListenerChannel>,
    transitions: Vec<Transition>,
    pipes: Pipes,
    stdout_log: Output,
    stderr_log: Output,
}

impl Subprocess {
    pub fn new(config: ProcessConf, group: impl Into<String>, is_listener: bool) -> Self {
        let stdout_log = Output::new(
            format!("{} stdout", config.name),
            open_log(config.stdout_logfile.as_deref(), &config.name),
            config.stdout_capture_maxbytes,
            config.stdout_events_enabled,
        );
        let stderr_bus = if config.redirect_stderr {
            Bus::new(0)
        } else {
            open_log(config.stderr_logfile.as_deref(), &config.name)
        };
        let stderr_log = Output::new(
            format!("{} stderr", config.name),
            stderr_bus,
            config.stderr_capture_maxbytes,
            config.stderr_events_enabled,
        );
        Self {
            group: group.into(),
            pid: None,
            last_pid: None,
            laststart: None,
            laststop: None,
            delay: None,
            backoff: 0,
            killing: false,
            administrative_stop: true,
            system_stop: false,
            exitstatus: None,
            last_exit: None,
            expected_exit: false,
            spawnerr: None,
            reported_state: ProcessState::Stopped,
            listener: is_listener.then(ListenerChannel::new),
            transitions: Vec::new(),
            pipes: Pipes::default(),
            stdout_log,
            stderr_log,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_listener(&self) -> bool {
        self.listener.is_some()
    }

    pub fn state_at(&self, now: Instant) -> ProcessState {
        if self.killing {
            return ProcessState::Stopping;
        }
        if self.laststart.is_some()
            && self.pid.is_some()
            && self.delay.is_some_and(|delay| now < delay)
        {
            return ProcessState::Starting;
        }
        if self.pid.is_some() {
            return ProcessState::Running;
        }
        if self.system_stop {
            return ProcessState::Fatal;
        }
        if self.administrative_stop {
            return ProcessState::Stopped;
        }
        if self.exitstatus.is_some() {
            return ProcessState::Exited;
        }
        if self.backoff > 0 {
            return ProcessState::Backoff;
        }
        ProcessState::Unknown
    }

    pub fn state(&self) -> ProcessState {
        self.state_at(Instant::now())
    }

    /// Fork and exec a new child. Failures are recorded on the process and
    /// count as a backoff attempt.
    pub fn spawn(&mut self, now: Instant) -> Result<Pid, SpawnError> {
        if let Some(pid) = self.pid {
            log::warn!("process {:?} already running with pid {pid}", self.config.name);
            return Err(SpawnError::AlreadyRunning(self.config.name.clone()));
        }

        self.laststart = Some(now);
        self.killing = false;
        self.administrative_stop = false;
        self.system_stop = false;
        self.exitstatus = None;
        self.spawnerr = None;
        self.note(ProcessState::Starting);

        match self.fork_exec() {
            Ok(pid) => {
                self.pid = Some(pid);
                self.last_pid = Some(pid);
                self.delay = Some(now + Duration::from_secs(self.config.startsecs));
                if self.listener.is_some() {
                    self.listener = Some(ListenerChannel::new());
                }
                log::info!("spawned: {:?} with pid {pid}", self.config.name);
                self.record(now);
                Ok(pid)
            }
            Err(err) => {
                self.record_spawn_failure(err.clone(), now);
                self.record(now);
                Err(err)
            }
        }
    }

    fn record_spawn_failure(&mut self, err: SpawnError, now: Instant) {
        log::error!("spawnerr: {err}");
        self.backoff += 1;
        self.delay = Some(now + retry_delay(self.backoff));
        self.spawnerr = Some(err);
    }

    fn fork_exec(&mut self) -> Result<Pid, SpawnError> {
        let name = self.config.name.clone();
        let exec = ExecArgs::new(&self.config, &self.group)?;

        let (stdin_parent, stdin_child) = child_pipe(false).map_err(|e| pipe_error(&name, e))?;
        let (stdout_parent, stdout_child) = child_pipe(true).map_err(|e| pipe_error(&name, e))?;
        let stderr = if self.config.redirect_stderr {
            None
        } else {
            Some(child_pipe(true).map_err(|e| pipe_error(&name, e))?)
        };

        let argv = exec.to_argv();
        let envp = exec.to_envp();
        let stdio = ChildStdio {
            stdin: stdin_child.as_raw_fd(),
            stdout: stdout_child.as_raw_fd(),
            stderr: stderr
                .as_ref()
                .map_or(stdout_child.as_raw_fd(), |(_, child)| child.as_raw_fd()),
        };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe { exec_child(&exec, &argv, &envp, stdio) },
            Ok(ForkResult::Parent { child }) => {
                // The child does the same; this covers signals sent before it runs.
                let _ = setpgid(child, child);
                self.pipes = Pipes {
                    stdin: Some(BufFd::with_capacity(stdin_parent, 0)),
                    stdout: Some(BufFd::new(stdout_parent)),
                    stderr: stderr.map(|(parent, _)| BufFd::new(parent)),
                };
                Ok(child)
            }
            Err(Errno::EAGAIN) => Err(SpawnError::TooManyProcesses(name)),
            Err(errno) => Err(SpawnError::Os(errno)),
        }
    }

    /// Send `signal` as part of stopping the child: marks the process as
    /// killing and arms the stop deadline. The first signal goes to the whole
    /// process group under `stopasgroup`, later ones under `killasgroup`.
    pub fn kill(&mut self, signal: Signal, now: Instant) -> Result<(), KillError> {
        let Some(pid) = self.pid else {
            log::debug!(
                "attempted to kill {} with {signal}, but it wasn't running",
                self.config.name
            );
            return Err(KillError::NotRunning {
                name: self.config.name.clone(),
                signal,
            });
        };

        let as_group = if self.killing {
            self.config.killasgroup
        } else {
            self.config.stopasgroup
        };
        log::debug!(
            "killing {} (pid {pid}) {}with signal {signal}",
            self.config.name,
            if as_group { "process group " } else { "" }
        );
        self.killing = true;
        self.delay = Some(now + Duration::from_secs(self.config.stopwaitsecs));

        let target = if as_group {
            Pid::from_raw(-pid.as_raw())
        } else {
            pid
        };
        match signal::kill(target, signal) {
            // Already gone: the reaper will see it.
            Ok(()) | Err(Errno::ESRCH) => {
                self.record(now);
                Ok(())
            }
            Err(errno) => {
                log::error!("unknown problem killing {} ({pid}): {errno}", self.config.name);
                self.killing = false;
                Err(KillError::Os {
                    name: self.config.name.clone(),
                    pid: pid.as_raw(),
                    errno,
                })
            }
        }
    }

    /// Deliver an arbitrary signal without changing the state machine.
    pub fn signal(&self, signal: Signal) -> Result<(), KillError> {
        let Some(pid) = self.pid else {
            return Err(KillError::NotRunning {
                name: self.config.name.clone(),
                signal,
            });
        };
        match signal::kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(KillError::Os {
                name: self.config.name.clone(),
                pid: pid.as_raw(),
                errno,
            }),
        }
    }

    /// Administrative stop: policy will not restart the process afterwards.
    pub fn stop(&mut self, now: Instant) -> Result<(), KillError> {
        self.administrative_stop = true;
        if self.pid.is_none() {
            self.backoff = 0;
            self.delay = None;
            self.record(now);
            return Ok(());
        }
        self.kill(self.config.stopsignal, now)
    }

    /// Retry budget exhausted.
    pub fn give_up(&mut self) {
        self.backoff = 0;
        self.delay = None;
        self.system_stop = true;
        log::info!(
            "gave up: {} entered FATAL state, too many start retries too quickly",
            self.config.name
        );
        self.note(ProcessState::Fatal);
    }

    /// The OS reported that child `pid` exited. Returns the event a listener
    /// had in flight, which now needs to go back to its pool.
    pub fn finish(&mut self, pid: Pid, status: ExitStatus, now: Instant) -> Option<Delivery> {
        if self.pid != Some(pid) {
            return None;
        }
        self.pid = None;
        self.killing = false;
        self.laststop = Some(now);

        let too_quick = self.laststart.map_or(true, |start| {
            now.saturating_duration_since(start) < Duration::from_secs(self.config.startsecs)
        });
        self.expected_exit = self.config.exitcodes.contains(&status.code);
        let rejected = self.listener.as_mut().and_then(ListenerChannel::reset);
        let name = self.config.name.clone();

        if self.administrative_stop {
            log::info!("stopped: {name} ({})", status.description);
            self.exitstatus = Some(status.code);
            self.backoff = 0;
            self.delay = None;
        } else if too_quick {
            log::warn!("exited: {name} ({}; not expected)", status.description);
            self.exitstatus = None;
            self.backoff += 1;
            self.delay = Some(now + retry_delay(self.backoff));
            self.note(ProcessState::Backoff);
            if self.backoff > self.config.startretries {
                self.give_up();
            }
        } else {
            let expected = if self.expected_exit {
                "expected"
            } else {
                "not expected"
            };
            log::info!("exited: {name} ({}; {expected})", status.description);
            self.exitstatus = Some(status.code);
            self.backoff = 0;
            self.delay = None;
        }

        self.last_exit = Some(status);
        self.record(now);
        rejected
    }

    /// Whether an EXITED process should be started again by policy.
    pub fn restart_wanted(&self) -> bool {
        match self.config.autorestart {
            AutoRestart::Always => true,
            AutoRestart::Unexpected => !self.expected_exit,
            AutoRestart::Never => false,
        }
    }

    /// Observe the derived state and hand over every transition recorded
    /// since the last call, oldest first. Changes that only the clock causes
    /// (STARTING to RUNNING) are picked up here.
    pub fn take_transitions(&mut self, now: Instant) -> Vec<Transition> {
        let state = self.state_at(now);
        if state == ProcessState::Running && (self.delay.is_some() || self.backoff > 0) {
            self.delay = None;
            self.backoff = 0;
            log::info!(
                "success: {} entered RUNNING state, process has stayed up for > than {} seconds (startsecs)",
                self.config.name,
                self.config.startsecs
            );
        }
        self.note(state);
        std::mem::take(&mut self.transitions)
    }

    fn record(&mut self, now: Instant) {
        self.note(self.state_at(now));
    }

    fn note(&mut self, state: ProcessState) {
        if state == self.reported_state {
            return;
        }
        let from = std::mem::replace(&mut self.reported_state, state);
        let payload = self.state_payload(from, state);
        self.transitions.push(Transition {
            from,
            to: state,
            payload,
        });
    }

    fn state_payload(&self, from: ProcessState, to: ProcessState) -> String {
        let pid = || {
            self.pid
                .or(self.last_pid)
                .map_or(0, |p| p.as_raw())
                .to_string()
        };
        let extra: Vec<(&str, String)> = match to {
            ProcessState::Starting | ProcessState::Backoff => {
                vec![("tries", self.backoff.to_string())]
            }
            ProcessState::Running | ProcessState::Stopping | ProcessState::Stopped => {
                vec![("pid", pid())]
            }
            ProcessState::Exited => vec![
                ("expected", u8::from(self.expected_exit).to_string()),
                ("pid", pid()),
            ],
            ProcessState::Fatal | ProcessState::Unknown => Vec::new(),
        };
        process_state_payload(&self.config.name, &self.group, from, &extra)
    }

    pub fn read_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        [Channel::Stdout, Channel::Stderr]
            .into_iter()
            .filter_map(|ch| self.pipes.get(ch).map(BufFd::as_raw_fd))
    }

    /// Stdin descriptor, only while bytes are waiting to be written.
    pub fn pending_stdin_fd(&self) -> Option<RawFd> {
        self.pipes
            .stdin
            .as_ref()
            .filter(|stdin| !stdin.is_empty())
            .map(BufFd::as_raw_fd)
    }

    pub fn pipe_fds(&self) -> Vec<RawFd> {
        [Channel::Stdin, Channel::Stdout, Channel::Stderr]
            .into_iter()
            .filter_map(|ch| self.pipes.get(ch).map(BufFd::as_raw_fd))
            .collect()
    }

    pub fn fd_of(&self, channel: Channel) -> Option<RawFd> {
        self.pipes.get(channel).map(BufFd::as_raw_fd)
    }

    pub fn channel_of(&self, fd: RawFd) -> Option<Channel> {
        [Channel::Stdin, Channel::Stdout, Channel::Stderr]
            .into_iter()
            .find(|ch| self.pipes.get(*ch).is_some_and(|p| p.as_raw_fd() == fd))
    }

    /// Close one pipe. The caller must already have dropped poller interest.
    pub fn close_channel(&mut self, channel: Channel) {
        self.pipes.slot(channel).take();
    }

    pub fn close_pipes(&mut self) {
        self.pipes = Pipes::default();
    }

    /// Read once from an output pipe and route the bytes: listener stdout
    /// feeds the notification protocol, everything else goes to the channel's
    /// output.
    pub fn drain(&mut self, channel: Channel) -> Result<Drain, Errno> {
        let Self {
            config,
            group,
            pid,
            last_pid,
            pipes,
            listener,
            stdout_log,
            stderr_log,
            ..
        } = self;
        let output = if channel == Channel::Stderr {
            stderr_log
        } else {
            stdout_log
        };
        let events = |emitted: Vec<Emitted>| -> Vec<(EventType, Vec<u8>)> {
            let pid = pid.or(*last_pid).map_or(0, |p| p.as_raw());
            emitted
                .into_iter()
                .map(|e| output_event(config.name.as_str(), group.as_str(), pid, channel, e))
                .collect()
        };
        let pipe = match channel {
            Channel::Stdout => pipes.stdout.as_mut(),
            Channel::Stderr => pipes.stderr.as_mut(),
            Channel::Stdin => None,
        };
        let Some(pipe) = pipe else {
            return Ok(Drain::default());
        };

        match pipe.read()? {
            ReadOutcome::Eof => Ok(Drain {
                eof: true,
                events: events(output.finish()),
                ..Drain::default()
            }),
            ReadOutcome::WouldBlock => Ok(Drain::default()),
            ReadOutcome::Data(bytes) => {
                let data = pipe.data();
                log::trace!(
                    "{} {channel} output:\n{}",
                    config.name,
                    String::from_utf8_lossy(data)
                );
                let mut drained = Drain {
                    bytes,
                    ..Drain::default()
                };
                match (channel, listener.as_mut()) {
                    (Channel::Stdout, Some(listener)) => drained.outcomes = listener.feed(data),
                    _ => drained.events = events(output.record(data)),
                }
                Ok(drained)
            }
        }
    }

    /// Queue bytes for the child's stdin.
    pub fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
        if self.pid.is_none() {
            return Err(WriteError::NotRunning(self.config.name.clone()));
        }
        let Some(stdin) = self.pipes.stdin.as_mut() else {
            return Err(WriteError::NoStdin(self.config.name.clone()));
        };
        stdin.queue(data);
        Ok(())
    }

    /// Push queued stdin bytes to the child. Returns how many are left.
    pub fn flush_stdin(&mut self) -> Result<usize, Errno> {
        match self.pipes.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(0),
        }
    }

    pub fn flush_logs(&mut self) {
        for (bus, channel) in [
            (&mut self.stdout_log, Channel::Stdout),
            (&mut self.stderr_log, Channel::Stderr),
        ] {
            if let Err(e) = bus.flush() {
                log::error!("{}: failed to flush {channel} log: {e}", self.config.name);
            }
        }
    }

    pub fn reopen_logs(&mut self) {
        for (bus, channel) in [
            (&mut self.stdout_log, Channel::Stdout),
            (&mut self.stderr_log, Channel::Stderr),
        ] {
            if let Err(e) = bus.reopen() {
                log::error!("{}: failed to reopen {channel} log: {e}", self.config.name);
            }
        }
    }

    pub fn logfile(&self, channel: Channel) -> Option<(&Path, u64)> {
        match channel {
            Channel::Stdout => self.stdout_log.logfile(),
            Channel::Stderr => self.stderr_log.logfile(),
            Channel::Stdin => None,
        }
    }

    /// One line of human readable status, as shown by status listings.
    pub fn describe(&self, now: Instant) -> String {
        let state = self.state_at(now);
        match state {
            ProcessState::Running => {
                let uptime = self
                    .laststart
                    .map(|start| now.saturating_duration_since(start).as_secs())
                    .unwrap_or(0);
                let pid = self.pid.map(|p| p.as_raw()).unwrap_or(0);
                format!(
                    "pid {pid}, uptime {}:{:02}:{:02}",
                    uptime / 3600,
                    (uptime / 60) % 60,
                    uptime % 60
                )
            }
            ProcessState::Stopped if self.laststart.is_none() => "Not started".to_string(),
            ProcessState::Stopped | ProcessState::Exited => match &self.last_exit {
                Some(exit) if state == ProcessState::Exited && !self.expected_exit => {
                    format!("{}; not expected", exit.description)
                }
                Some(exit) => exit.description.clone(),
                None => String::new(),
            },
            ProcessState::Fatal | ProcessState::Backoff => match &self.spawnerr {
                Some(err) => err.to_string(),
                None => "Exited too quickly (process log may have details)".to_string(),
            },
            ProcessState::Starting | ProcessState::Stopping | ProcessState::Unknown => {
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork_lock;
    use nix::sys::wait::waitpid;

    fn sh_conf(name: &str, script: &str) -> ProcessConf {
        let mut conf = ProcessConf::new(name, "/bin/sh");
        conf.args = vec!["-c".into(), script.into()];
        conf.startsecs = 0;
        conf
    }

    fn sh(name: &str, script: &str) -> Subprocess {
        Subprocess::new(sh_conf(name, script), name, false)
    }

    fn wait(proc: &mut Subprocess, now: Instant) -> Option<Delivery> {
        let pid = proc.pid.unwrap();
        let status = decode_wait_status(waitpid(pid, None).unwrap()).unwrap();
        proc.finish(pid, status, now)
    }

    fn drain_until_eof(proc: &mut Subprocess, channel: Channel) -> Vec<(EventType, Vec<u8>)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        loop {
            let drained = proc.drain(channel).unwrap();
            events.extend(drained.events);
            if drained.eof {
                return events;
            }
            assert!(Instant::now() < deadline, "no eof on {channel}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn precedence_matrix() {
        let now = Instant::now();
        let later = now + Duration::from_secs(10);
        let earlier = now - Duration::from_millis(1);
        let pid = Some(Pid::from_raw(4242));

        // (killing, laststart, pid, delay, system, admin, exitstatus, backoff) -> state
        let cases = [
            ((true, true, pid, Some(later), true, true, Some(0), 3), ProcessState::Stopping),
            ((false, true, pid, Some(later), true, true, Some(0), 3), ProcessState::Starting),
            ((false, true, pid, Some(earlier), true, true, None, 0), ProcessState::Running),
            ((false, false, pid, Some(later), false, false, None, 0), ProcessState::Running),
            ((false, true, pid, None, false, false, None, 0), ProcessState::Running),
            ((false, true, None, Some(later), true, true, Some(1), 2), ProcessState::Fatal),
            ((false, true, None, None, false, true, Some(1), 2), ProcessState::Stopped),
            ((false, true, None, None, false, false, Some(1), 2), ProcessState::Exited),
            ((false, true, None, Some(later), false, false, None, 2), ProcessState::Backoff),
            ((false, false, None, None, false, false, None, 0), ProcessState::Unknown),
        ];

        for ((killing, started, pid, delay, system, admin, exit, backoff), expected) in cases {
            let mut proc = Subprocess::new(ProcessConf::new("p", "true"), "p", false);
            proc.killing = killing;
            proc.laststart = started.then_some(now);
            proc.pid = pid;
            proc.delay = delay;
            proc.system_stop = system;
            proc.administrative_stop = admin;
            proc.exitstatus = exit;
            proc.backoff = backoff;
            assert_eq!(proc.state_at(now), expected);
        }
    }

    #[test]
    fn new_process_is_stopped_and_not_started() {
        let proc = Subprocess::new(ProcessConf::new("web", "true"), "web", false);
        assert_eq!(proc.state(), ProcessState::Stopped);
        assert_eq!(proc.describe(Instant::now()), "Not started");
        assert!(proc.pid.is_none());
    }

    #[test]
    fn spawn_failures_back_off_exponentially() {
        let mut conf = ProcessConf::new("ghost", "/nonexistent/ghost");
        conf.startretries = 2;
        let mut proc = Subprocess::new(conf, "ghost", false);
        let now = Instant::now();

        let err = proc.spawn(now).unwrap_err();
        assert_eq!(err, SpawnError::NotFound("/nonexistent/ghost".into()));
        assert_eq!(proc.state_at(now), ProcessState::Backoff);
        assert_eq!(proc.delay, Some(now + Duration::from_secs(1)));

        proc.spawn(now).unwrap_err();
        assert_eq!(proc.backoff, 2);
        assert_eq!(proc.delay, Some(now + Duration::from_secs(2)));
        assert!(proc.describe(now).contains("can't find command"));

        proc.give_up();
        assert_eq!(proc.state_at(now), ProcessState::Fatal);
        assert_eq!(proc.backoff, 0);
    }

    #[test]
    fn spawn_failure_is_announced_through_starting() {
        let conf = ProcessConf::new("ghost", "/nonexistent/ghost");
        let mut proc = Subprocess::new(conf, "ghost", false);
        let now = Instant::now();
        proc.spawn(now).unwrap_err();

        let seen: Vec<_> = proc
            .take_transitions(now)
            .into_iter()
            .map(|t| (t.to, t.payload))
            .collect();
        assert_eq!(
            seen,
            [
                (
                    ProcessState::Starting,
                    "processname:ghost groupname:ghost from_state:STOPPED tries:0".to_string()
                ),
                (
                    ProcessState::Backoff,
                    "processname:ghost groupname:ghost from_state:STARTING tries:1".to_string()
                ),
            ]
        );
    }

    #[test]
    fn retry_delay_is_capped() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(4), Duration::from_secs(8));
        assert_eq!(retry_delay(7), Duration::from_secs(60));
        assert_eq!(retry_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn kill_without_child_is_reported() {
        let mut proc = Subprocess::new(ProcessConf::new("idle", "true"), "idle", false);
        let err = proc.kill(Signal::SIGTERM, Instant::now()).unwrap_err();
        assert!(matches!(err, KillError::NotRunning { .. }));
        assert!(!proc.killing);
    }

    #[test]
    fn captures_output_and_settles_exit() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut conf = sh_conf("echo", "echo hello; exit 3");
        conf.stdout_logfile = Some(dir.path().join("echo.log"));
        let mut proc = Subprocess::new(conf, "echo", false);

        let start = Instant::now();
        proc.spawn(start).unwrap();
        let seen: Vec<_> = proc
            .take_transitions(start)
            .into_iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            seen,
            [
                (ProcessState::Stopped, ProcessState::Starting),
                (ProcessState::Starting, ProcessState::Running),
            ]
        );
        assert!(proc.take_transitions(start).is_empty());

        let later = start + Duration::from_secs(1);
        wait(&mut proc, later);
        let drained = proc.drain(Channel::Stdout).unwrap();
        assert_eq!(drained.bytes, 6);
        proc.flush_logs();
        assert_eq!(std::fs::read(dir.path().join("echo.log")).unwrap(), b"hello\n");

        assert_eq!(proc.state_at(later), ProcessState::Exited);
        assert_eq!(proc.exitstatus, Some(3));
        assert!(!proc.expected_exit);
        assert!(proc.restart_wanted());
        assert_eq!(proc.describe(later), "exit status 3; not expected");
        assert!(proc.drain(Channel::Stdout).unwrap().eof);
        proc.close_pipes();
        assert!(proc.pipe_fds().is_empty());
    }

    #[test]
    fn quick_exit_backs_off_then_gives_up() {
        let _guard = fork_lock();
        let mut proc = sh("flappy", "exit 0");
        proc.config.startsecs = 10;
        proc.config.startretries = 1;

        let now = Instant::now();
        proc.spawn(now).unwrap();
        assert_eq!(proc.state_at(now), ProcessState::Starting);
        wait(&mut proc, now);
        assert_eq!(proc.state_at(now), ProcessState::Backoff);
        assert_eq!(proc.backoff, 1);

        proc.spawn(now).unwrap();
        wait(&mut proc, now);
        assert_eq!(proc.state_at(now), ProcessState::Fatal);
        assert_eq!(
            proc.describe(now),
            "Exited too quickly (process log may have details)"
        );
        proc.close_pipes();
    }

    #[test]
    fn administrative_stop_ends_in_stopped() {
        let _guard = fork_lock();
        let mut proc = sh("sleeper", "exec sleep 30");
        let now = Instant::now();
        proc.spawn(now).unwrap();
        assert_eq!(proc.spawn(now), Err(SpawnError::AlreadyRunning("sleeper".into())));

        proc.stop(now).unwrap();
        assert_eq!(proc.state_at(now), ProcessState::Stopping);
        assert_eq!(proc.delay, Some(now + Duration::from_secs(10)));

        wait(&mut proc, now);
        assert_eq!(proc.state_at(now), ProcessState::Stopped);
        assert_eq!(
            proc.last_exit.as_ref().map(|e| e.description.as_str()),
            Some("terminated by SIGTERM")
        );
        proc.close_pipes();
    }

    #[test]
    fn stop_as_group_reaches_grandchildren() {
        let _guard = fork_lock();
        let mut proc = sh("tree", "sleep 30 & wait");
        proc.config.stopasgroup = true;
        proc.config.killasgroup = true;
        let now = Instant::now();
        proc.spawn(now).unwrap();
        // let the shell fork its sleep
        std::thread::sleep(Duration::from_millis(200));

        proc.stop(now).unwrap();
        wait(&mut proc, now);
        assert_eq!(proc.state_at(now), ProcessState::Stopped);
        // an orphaned sleep would keep stdout open for 30 seconds
        drain_until_eof(&mut proc, Channel::Stdout);
        proc.close_pipes();
    }

    #[test]
    fn output_becomes_log_and_communication_events() {
        let _guard = fork_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut conf = sh_conf(
            "talk",
            "printf 'a<!--XSUPERVISOR:BEGIN-->hi<!--XSUPERVISOR:END-->b'; echo err >&2",
        );
        conf.stdout_logfile = Some(dir.path().join("talk.log"));
        conf.stdout_capture_maxbytes = 100;
        conf.stderr_events_enabled = true;
        let mut proc = Subprocess::new(conf, "talk", false);

        let pid = proc.spawn(Instant::now()).unwrap().as_raw();
        let stdout = drain_until_eof(&mut proc, Channel::Stdout);
        let stderr = drain_until_eof(&mut proc, Channel::Stderr);
        wait(&mut proc, Instant::now());
        proc.flush_logs();

        assert_eq!(
            stdout,
            [(
                EventType::ProcessCommunicationStdout,
                format!("processname:talk groupname:talk pid:{pid}\nhi").into_bytes()
            )]
        );
        assert_eq!(
            stderr,
            [(
                EventType::ProcessLogStderr,
                format!("processname:talk groupname:talk pid:{pid} channel:stderr\nerr\n")
                    .into_bytes()
            )]
        );
        assert_eq!(std::fs::read(dir.path().join("talk.log")).unwrap(), b"ab");
        proc.close_pipes();
    }

    #[test]
    fn stdin_round_trip() {
        let _guard = fork_lock();
        let mut proc = sh("cat", "exec head -c 5");
        proc.spawn(Instant::now()).unwrap();
        proc.write(b"ping\n").unwrap();
        assert_eq!(proc.flush_stdin().unwrap(), 0);
        assert!(proc.pending_stdin_fd().is_none());

        wait(&mut proc, Instant::now());
        proc.close_pipes();
        assert_eq!(
            proc.write(b"late"),
            Err(WriteError::NotRunning("cat".into()))
        );
    }
}
