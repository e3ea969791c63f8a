//! Lifecycle events and the queue that carries them to listener pools.
//!
//! Events are immutable once queued. Every event gets a global serial when it
//! is created; pools stamp their own serial the first time they buffer it.
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::states::ProcessState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Abstract types, only valid as subscriptions.
    Event,
    ProcessState,
    SupervisorStateChange,
    Tick,
    ProcessGroup,
    ProcessLog,
    ProcessCommunication,

    ProcessStateStopped,
    ProcessStateStarting,
    ProcessStateRunning,
    ProcessStateBackoff,
    ProcessStateStopping,
    ProcessStateExited,
    ProcessStateFatal,
    ProcessStateUnknown,
    SupervisorStateChangeRunning,
    SupervisorStateChangeStopping,
    Tick5,
    Tick60,
    Tick3600,
    ProcessGroupAdded,
    ProcessGroupRemoved,
    RemoteCommunication,
    EventBufferOverflow,
    ProcessLogStdout,
    ProcessLogStderr,
    ProcessCommunicationStdout,
    ProcessCommunicationStderr,
}

const NAMES: [(EventType, &str); 28] = [
    (EventType::Event, "EVENT"),
    (EventType::ProcessState, "PROCESS_STATE"),
    (EventType::SupervisorStateChange, "SUPERVISOR_STATE_CHANGE"),
    (EventType::Tick, "TICK"),
    (EventType::ProcessGroup, "PROCESS_GROUP"),
    (EventType::ProcessLog, "PROCESS_LOG"),
    (EventType::ProcessCommunication, "PROCESS_COMMUNICATION"),
    (EventType::ProcessStateStopped, "PROCESS_STATE_STOPPED"),
    (EventType::ProcessStateStarting, "PROCESS_STATE_STARTING"),
    (EventType::ProcessStateRunning, "PROCESS_STATE_RUNNING"),
    (EventType::ProcessStateBackoff, "PROCESS_STATE_BACKOFF"),
    (EventType::ProcessStateStopping, "PROCESS_STATE_STOPPING"),
    (EventType::ProcessStateExited, "PROCESS_STATE_EXITED"),
    (EventType::ProcessStateFatal, "PROCESS_STATE_FATAL"),
    (EventType::ProcessStateUnknown, "PROCESS_STATE_UNKNOWN"),
    (
        EventType::SupervisorStateChangeRunning,
        "SUPERVISOR_STATE_CHANGE_RUNNING",
    ),
    (
        EventType::SupervisorStateChangeStopping,
        "SUPERVISOR_STATE_CHANGE_STOPPING",
    ),
    (EventType::Tick5, "TICK_5"),
    (EventType::Tick60, "TICK_60"),
    (EventType::Tick3600, "TICK_3600"),
    (EventType::ProcessGroupAdded, "PROCESS_GROUP_ADDED"),
    (EventType::ProcessGroupRemoved, "PROCESS_GROUP_REMOVED"),
    (EventType::RemoteCommunication, "REMOTE_COMMUNICATION"),
    (EventType::EventBufferOverflow, "EVENT_BUFFER_OVERFLOW"),
    (EventType::ProcessLogStdout, "PROCESS_LOG_STDOUT"),
    (EventType::ProcessLogStderr, "PROCESS_LOG_STDERR"),
    (
        EventType::ProcessCommunicationStdout,
        "PROCESS_COMMUNICATION_STDOUT",
    ),
    (
        EventType::ProcessCommunicationStderr,
        "PROCESS_COMMUNICATION_STDERR",
    ),
];

/// Tick periods in seconds, with the event each one fires.
pub const TICKS: [(u64, EventType); 3] = [
    (5, EventType::Tick5),
    (60, EventType::Tick60),
    (3600, EventType::Tick3600),
];

impl EventType {
    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(ty, _)| *ty == self)
            .map(|(_, name)| *name)
            .unwrap_or("EVENT")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name.trim()))
            .map(|(ty, _)| *ty)
    }

    pub fn for_state(state: ProcessState) -> Self {
        match state {
            ProcessState::Stopped => Self::ProcessStateStopped,
            ProcessState::Starting => Self::ProcessStateStarting,
            ProcessState::Running => Self::ProcessStateRunning,
            ProcessState::Backoff => Self::ProcessStateBackoff,
            ProcessState::Stopping => Self::ProcessStateStopping,
            ProcessState::Exited => Self::ProcessStateExited,
            ProcessState::Fatal => Self::ProcessStateFatal,
            ProcessState::Unknown => Self::ProcessStateUnknown,
        }
    }

    fn parent(self) -> Option<Self> {
        match self {
            Self::Event => None,
            Self::ProcessState
            | Self::SupervisorStateChange
            | Self::Tick
            | Self::ProcessGroup
            | Self::ProcessLog
            | Self::ProcessCommunication
            | Self::RemoteCommunication
            | Self::EventBufferOverflow => Some(Self::Event),
            Self::ProcessStateStopped
            | Self::ProcessStateStarting
            | Self::ProcessStateRunning
            | Self::ProcessStateBackoff
            | Self::ProcessStateStopping
            | Self::ProcessStateExited
            | Self::ProcessStateFatal
            | Self::ProcessStateUnknown => Some(Self::ProcessState),
            Self::SupervisorStateChangeRunning | Self::SupervisorStateChangeStopping => {
                Some(Self::SupervisorStateChange)
            }
            Self::Tick5 | Self::Tick60 | Self::Tick3600 => Some(Self::Tick),
            Self::ProcessGroupAdded | Self::ProcessGroupRemoved => Some(Self::ProcessGroup),
            Self::ProcessLogStdout | Self::ProcessLogStderr => Some(Self::ProcessLog),
            Self::ProcessCommunicationStdout | Self::ProcessCommunicationStderr => {
                Some(Self::ProcessCommunication)
            }
        }
    }

    /// True when a pool subscribed to `subscription` should receive `self`.
    pub fn is_a(self, subscription: EventType) -> bool {
        let mut ty = Some(self);
        while let Some(t) = ty {
            if t == subscription {
                return true;
            }
            ty = t.parent();
        }
        false
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub serial: u64,
    pub payload: Vec<u8>,
}

/// Events are shared between every pool that buffers them.
pub type EventRef = Rc<Event>;

/// Pending notifications plus the global serial counter.
#[derive(Debug, Default)]
pub struct EventQueue {
    serial: u64,
    pending: VecDeque<EventRef>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&mut self, kind: EventType, payload: impl Into<Vec<u8>>) -> EventRef {
        self.serial = self.serial.wrapping_add(1);
        let event = Rc::new(Event {
            kind,
            serial: self.serial,
            payload: payload.into(),
        });
        self.pending.push_back(event.clone());
        event
    }

    pub fn drain(&mut self) -> impl Iterator<Item = EventRef> + '_ {
        self.pending.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

pub fn process_state_payload(
    name: &str,
    group: &str,
    from: ProcessState,
    extra: &[(&str, String)],
) -> String {
    let mut payload = format!("processname:{name} groupname:{group} from_state:{from}");
    for (key, value) in extra {
        payload.push_str(&format!(" {key}:{value}"));
    }
    payload
}

/// Header line plus raw output, for log and communication events. Log
/// events name their channel; communication events do not.
pub fn process_output_payload(
    name: &str,
    group: &str,
    pid: i32,
    channel: Option<&str>,
    data: &[u8],
) -> Vec<u8> {
    let mut header = format!("processname:{name} groupname:{group} pid:{pid}");
    if let Some(channel) = channel {
        header.push_str(&format!(" channel:{channel}"));
    }
    header.push('\n');
    let mut payload = header.into_bytes();
    payload.extend_from_slice(data);
    payload
}
