//! Error taxonomy for the supervision engine.
//!
//! Spawn and kill failures never abort the orchestrator: they are recorded on
//! the affected subprocess and logged. Poller failures other than the two
//! handled cases (interrupted, bad descriptor) are fatal to the loop.
use nix::errno::Errno;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("process {0:?} already running")]
    AlreadyRunning(String),

    #[error("can't find command {0:?}")]
    NotFound(String),

    #[error("command at {0:?} is a directory")]
    IsDirectory(PathBuf),

    #[error("command at {0:?} is not executable")]
    NotExecutable(PathBuf),

    #[error("no permission to run command {0:?}")]
    NoPermission(PathBuf),

    #[error("too many open files to spawn {0:?}")]
    TooManyOpenFiles(String),

    #[error("too many processes in process table to spawn {0:?}")]
    TooManyProcesses(String),

    #[error("can't find user {0:?}")]
    UnknownUser(String),

    #[error("can't drop privilege to {0:?} as nonroot user")]
    NotRoot(String),

    #[error("invalid argument for {0:?}: embedded NUL byte")]
    BadArgument(String),

    #[error("unknown error: {0}")]
    Os(Errno),
}

/// Raised when a signal can't be delivered to a subprocess.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KillError {
    #[error("attempted to kill {name} with {signal} but it wasn't running")]
    NotRunning { name: String, signal: Signal },

    #[error("unknown problem killing {name} ({pid}): {errno}")]
    Os { name: String, pid: i32, errno: Errno },
}

/// Raised when writing to a subprocess' stdin is impossible.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("process {0} already closed")]
    NotRunning(String),

    #[error("process {0} has no stdin channel")]
    NoStdin(String),
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("poller setup failed: {0}")]
    Setup(Errno),

    #[error("poll failed: {0}")]
    Os(Errno),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unsupported config format for {0} (expected .toml, .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error("signal setup failed: {0}")]
    Signals(Errno),

    #[error("pidfile {path}: {source}")]
    Pidfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Error carried inside deferred call results and control replies.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("{kind}: {text}")]
pub struct Fault {
    pub kind: FaultKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    BadArguments,
    ShutdownState,
    BadName,
    BadSignal,
    Failed,
    AbnormalTermination,
    SpawnError,
    AlreadyStarted,
    NotRunning,
    AlreadyAdded,
    StillRunning,
    NoFile,
}

impl FaultKind {
    pub fn code(self) -> u32 {
        match self {
            Self::BadArguments => 3,
            Self::ShutdownState => 6,
            Self::BadName => 10,
            Self::BadSignal => 11,
            Self::NoFile => 20,
            Self::Failed => 30,
            Self::AbnormalTermination => 40,
            Self::SpawnError => 50,
            Self::AlreadyStarted => 60,
            Self::NotRunning => 70,
            Self::AlreadyAdded => 90,
            Self::StillRunning => 91,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BadArguments => "BAD_ARGUMENTS",
            Self::ShutdownState => "SHUTDOWN_STATE",
            Self::BadName => "BAD_NAME",
            Self::BadSignal => "BAD_SIGNAL",
            Self::NoFile => "NO_FILE",
            Self::Failed => "FAILED",
            Self::AbnormalTermination => "ABNORMAL_TERMINATION",
            Self::SpawnError => "SPAWN_ERROR",
            Self::AlreadyStarted => "ALREADY_STARTED",
            Self::NotRunning => "NOT_RUNNING",
            Self::AlreadyAdded => "ALREADY_ADDED",
            Self::StillRunning => "STILL_RUNNING",
        };
        f.write_str(name)
    }
}

impl Fault {
    pub fn new(kind: FaultKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_messages_are_human_readable() {
        let err = SpawnError::TooManyOpenFiles("web".into());
        assert_eq!(err.to_string(), "too many open files to spawn \"web\"");
        let err = SpawnError::NotExecutable(PathBuf::from("/etc/passwd"));
        assert_eq!(
            err.to_string(),
            "command at \"/etc/passwd\" is not executable"
        );
    }

    #[test]
    fn fault_display_carries_code_name() {
        let fault = Fault::new(FaultKind::NotRunning, "web");
        assert_eq!(fault.to_string(), "NOT_RUNNING: web");
        assert_eq!(fault.code(), 70);
    }
}
