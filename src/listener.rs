//! Event listener pools and the per-listener notification protocol.
//!
//! A pool buffers the events its group subscribed to. Each listener process
//! in the group carries a `ListenerChannel` that tracks its notification
//! sub-state and the one event it may have in flight:
//!
//! ```text
//! ACKNOWLEDGED --READY\n--> READY --deliver--> BUSY --OK/FAIL/RESULT--> ACKNOWLEDGED
//! ```
//!
//! Anything the protocol does not allow moves the listener to UNKNOWN, where
//! it stays until its process is restarted.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::conf::{OverflowPolicy, PoolConf};
use crate::events::{EventRef, EventType};
use crate::states::ListenerState;

pub const PROTOCOL_VERSION: &str = "3.0";

/// Longest response line a listener may send before it is considered broken.
const MAX_LINE: usize = 1024;

/// An event on its way to one listener of a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event: EventRef,
    pub pool_serial: u64,
    pub attempts: u32,
}

#[derive(Debug, PartialEq)]
pub enum Outcome {
    Accepted(Delivery),
    Rejected(Delivery),
}

#[derive(Debug)]
pub struct ListenerChannel {
    state: ListenerState,
    in_flight: Option<Delivery>,
    busy_since: Option<Instant>,
    pending: Vec<u8>,
    result_len: Option<usize>,
}

impl Default for ListenerChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerChannel {
    pub fn new() -> Self {
        Self {
            state: ListenerState::Acknowledged,
            in_flight: None,
            busy_since: None,
            pending: Vec::new(),
            result_len: None,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Back to the initial sub-state, handing back any event left in flight.
    pub fn reset(&mut self) -> Option<Delivery> {
        self.state = ListenerState::Acknowledged;
        self.busy_since = None;
        self.pending.clear();
        self.result_len = None;
        self.in_flight.take()
    }

    pub fn deliver(&mut self, delivery: Delivery, now: Instant) {
        self.state = ListenerState::Busy;
        self.in_flight = Some(delivery);
        self.busy_since = Some(now);
    }

    fn settle(&mut self, accepted: bool) -> Option<Outcome> {
        self.state = ListenerState::Acknowledged;
        self.busy_since = None;
        self.result_len = None;
        self.in_flight.take().map(|d| {
            if accepted {
                Outcome::Accepted(d)
            } else {
                Outcome::Rejected(d)
            }
        })
    }

    fn broken(&mut self, why: &str) -> Option<Outcome> {
        log::warn!("event listener protocol error: {why}");
        let rejected = self.in_flight.take().map(Outcome::Rejected);
        self.state = ListenerState::Unknown;
        self.busy_since = None;
        self.result_len = None;
        self.pending.clear();
        rejected
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Consume bytes the listener wrote on its stdout.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        if self.state == ListenerState::Unknown {
            return outcomes;
        }
        self.pending.extend_from_slice(data);

        loop {
            match self.state {
                ListenerState::Unknown => break,
                ListenerState::Ready => {
                    if !self.pending.is_empty() {
                        outcomes.extend(self.broken("data received while READY"));
                    }
                    break;
                }
                ListenerState::Acknowledged => {
                    let Some(line) = self.take_line() else { break };
                    if line == b"READY" {
                        self.state = ListenerState::Ready;
                    } else {
                        let text = String::from_utf8_lossy(&line).into_owned();
                        outcomes.extend(self.broken(&format!("expected READY, got {text:?}")));
                    }
                }
                ListenerState::Busy => {
                    if let Some(len) = self.result_len {
                        if self.pending.len() < len {
                            break;
                        }
                        let body: Vec<u8> = self.pending.drain(..len).collect();
                        outcomes.extend(self.settle(body == b"OK"));
                        continue;
                    }
                    let Some(line) = self.take_line() else { break };
                    match line.as_slice() {
                        b"OK" => outcomes.extend(self.settle(true)),
                        b"FAIL" => outcomes.extend(self.settle(false)),
                        other => match parse_result_len(other) {
                            Some(len) => self.result_len = Some(len),
                            None => {
                                let text = String::from_utf8_lossy(other).into_owned();
                                outcomes.extend(self.broken(&format!("bad result line {text:?}")));
                            }
                        },
                    }
                }
            }
        }

        let waiting_for_line = matches!(
            self.state,
            ListenerState::Acknowledged | ListenerState::Busy
        ) && self.result_len.is_none();
        if waiting_for_line && self.pending.len() > MAX_LINE {
            outcomes.extend(self.broken("response line too long"));
        }
        outcomes
    }

    /// Give up on an event the listener has held longer than `timeout`.
    pub fn check_timeout(&mut self, now: Instant, timeout: Duration) -> Option<Delivery> {
        let since = self.busy_since?;
        if self.state != ListenerState::Busy || now.saturating_duration_since(since) < timeout {
            return None;
        }
        log::warn!("event listener did not acknowledge within {}s", timeout.as_secs());
        self.state = ListenerState::Unknown;
        self.busy_since = None;
        self.result_len = None;
        self.in_flight.take()
    }
}

fn parse_result_len(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    text.strip_prefix("RESULT ")?.trim().parse().ok()
}

/// The event buffer shared by every listener of one group.
#[derive(Debug)]
pub struct ListenerPool {
    name: String,
    conf: PoolConf,
    serial: u64,
    buffer: VecDeque<Delivery>,
}

impl ListenerPool {
    pub fn new(name: impl Into<String>, conf: PoolConf) -> Self {
        Self {
            name: name.into(),
            conf,
            serial: 0,
            buffer: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.conf.ack_timeout_secs.map(Duration::from_secs)
    }

    pub fn accepts(&self, kind: EventType) -> bool {
        self.conf.events.iter().any(|sub| kind.is_a(*sub))
    }

    /// Buffer an event. Returns the event discarded on overflow, if any.
    pub fn push(&mut self, event: EventRef) -> Option<EventRef> {
        self.serial = self.serial.wrapping_add(1);
        let delivery = Delivery {
            event,
            pool_serial: self.serial,
            attempts: 0,
        };

        if self.buffer.len() < self.conf.buffer_size.max(1) {
            self.buffer.push_back(delivery);
            return None;
        }

        let dropped = match self.conf.overflow {
            OverflowPolicy::DropOldest => {
                let oldest = self.buffer.pop_front();
                self.buffer.push_back(delivery);
                oldest.map(|d| d.event)
            }
            OverflowPolicy::DropNewest => Some(delivery.event),
        };
        if let Some(event) = &dropped {
            log::error!(
                "pool {} event buffer overflowed, discarding event {}",
                self.name,
                event.serial
            );
        }
        dropped
    }

    pub fn pop(&mut self) -> Option<Delivery> {
        self.buffer.pop_front()
    }

    /// Put a rejected event back at the head, unless it has used up its
    /// attempts.
    pub fn requeue(&mut self, mut delivery: Delivery) {
        delivery.attempts += 1;
        if delivery.attempts < self.conf.max_attempts {
            log::debug!(
                "pool {} requeueing event {} (attempt {})",
                self.name,
                delivery.event.serial,
                delivery.attempts
            );
            self.buffer.push_front(delivery);
        } else {
            log::error!(
                "pool {} dropping event {} after {} failed attempts",
                self.name,
                delivery.event.serial,
                delivery.attempts
            );
        }
    }

    pub fn envelope(&self, delivery: &Delivery, identifier: &str) -> Vec<u8> {
        let event = &delivery.event;
        let mut out = format!(
            "ver:{PROTOCOL_VERSION} server:{identifier} serial:{} pool:{} poolserial:{} eventname:{} len:{}\n",
            event.serial,
            self.name,
            delivery.pool_serial,
            event.kind,
            event.payload.len()
        )
        .into_bytes();
        out.extend_from_slice(&event.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQueue;

    fn pool(buffer_size: usize, overflow: OverflowPolicy) -> ListenerPool {
        ListenerPool::new(
            "alerts",
            PoolConf {
                events: vec![EventType::ProcessState],
                buffer_size,
                ack_timeout_secs: Some(5),
                max_attempts: 2,
                overflow,
            },
        )
    }

    fn busy_channel(queue: &mut EventQueue, pool: &mut ListenerPool) -> ListenerChannel {
        let mut channel = ListenerChannel::new();
        assert!(channel.feed(b"READY\n").is_empty());
        assert_eq!(channel.state(), ListenerState::Ready);
        pool.push(queue.notify(EventType::ProcessStateRunning, "processname:web"));
        channel.deliver(pool.pop().unwrap(), Instant::now());
        channel
    }

    #[test]
    fn handshake_and_plain_ok() {
        let mut queue = EventQueue::new();
        let mut pool = pool(10, OverflowPolicy::DropOldest);
        let mut channel = busy_channel(&mut queue, &mut pool);
        assert_eq!(channel.state(), ListenerState::Busy);

        let outcomes = channel.feed(b"OK\nREADY\n");
        assert!(matches!(outcomes.as_slice(), [Outcome::Accepted(_)]));
        assert_eq!(channel.state(), ListenerState::Ready);
    }

    #[test]
    fn result_with_body_split_across_reads() {
        let mut queue = EventQueue::new();
        let mut pool = pool(10, OverflowPolicy::DropOldest);
        let mut channel = busy_channel(&mut queue, &mut pool);

        assert!(channel.feed(b"RESULT 4\nFA").is_empty());
        let outcomes = channel.feed(b"IL");
        assert!(matches!(outcomes.as_slice(), [Outcome::Rejected(_)]));
        assert_eq!(channel.state(), ListenerState::Acknowledged);
    }

    #[test]
    fn garbage_marks_unknown_and_rejects() {
        let mut queue = EventQueue::new();
        let mut pool = pool(10, OverflowPolicy::DropOldest);
        let mut channel = busy_channel(&mut queue, &mut pool);

        let outcomes = channel.feed(b"what?\n");
        assert!(matches!(outcomes.as_slice(), [Outcome::Rejected(_)]));
        assert_eq!(channel.state(), ListenerState::Unknown);
        assert!(channel.feed(b"READY\n").is_empty());
        assert_eq!(channel.state(), ListenerState::Unknown);

        let mut idle = ListenerChannel::new();
        idle.feed(b"READY\n");
        idle.feed(b"unexpected");
        assert_eq!(idle.state(), ListenerState::Unknown);
    }

    #[test]
    fn ack_timeout_rejects_in_flight_event() {
        let mut queue = EventQueue::new();
        let mut pool = pool(10, OverflowPolicy::DropOldest);
        let mut channel = busy_channel(&mut queue, &mut pool);
        let start = Instant::now();

        assert!(channel.check_timeout(start, Duration::from_secs(60)).is_none());
        let late = start + Duration::from_secs(61);
        let rejected = channel.check_timeout(late, Duration::from_secs(60)).unwrap();
        assert_eq!(channel.state(), ListenerState::Unknown);

        pool.requeue(rejected);
        assert_eq!(pool.len(), 1);
        let again = pool.pop().unwrap();
        assert_eq!(again.attempts, 1);
        pool.requeue(again);
        assert!(pool.is_empty(), "max_attempts reached, event dropped");
    }

    #[test]
    fn overflow_policies() {
        let mut queue = EventQueue::new();
        let mut oldest = pool(2, OverflowPolicy::DropOldest);
        let mut newest = pool(2, OverflowPolicy::DropNewest);
        let events: Vec<_> = (0..3)
            .map(|n| queue.notify(EventType::ProcessStateExited, format!("n:{n}")))
            .collect();

        assert!(oldest.push(events[0].clone()).is_none());
        assert!(oldest.push(events[1].clone()).is_none());
        assert_eq!(oldest.push(events[2].clone()), Some(events[0].clone()));
        assert_eq!(oldest.pop().unwrap().event, events[1]);

        newest.push(events[0].clone());
        newest.push(events[1].clone());
        assert_eq!(newest.push(events[2].clone()), Some(events[2].clone()));
        assert_eq!(newest.pop().unwrap().event, events[0]);
    }

    #[test]
    fn envelope_header() {
        let mut queue = EventQueue::new();
        let mut pool = pool(10, OverflowPolicy::DropOldest);
        let event = queue.notify(EventType::ProcessStateRunning, "processname:web");
        pool.push(event.clone());
        let delivery = pool.pop().unwrap();
        let text = String::from_utf8(pool.envelope(&delivery, "supervisor")).unwrap();
        assert_eq!(
            text,
            format!(
                "ver:3.0 server:supervisor serial:{} pool:alerts poolserial:1 \
                 eventname:PROCESS_STATE_RUNNING len:15\nprocessname:web",
                event.serial
            )
        );
        assert!(pool.accepts(EventType::ProcessStateFatal));
        assert!(!pool.accepts(EventType::Tick5));
    }
}
