//! Typed dispatch table for control requests.
//!
//! Every operation is a variant of `Request`; the reply is either immediate
//! or a deferred call for the loop to step. The transport that carries
//! requests in and responses out lives outside this crate.
use nix::unistd::getpid;
use serde::{Deserialize, Serialize};

use crate::conf::parse_signal;
use crate::deferred::{DeferredCall, ProcessResult, Sequence, StartProcess, StopProcess};
use crate::error::{Fault, FaultKind, KillError};
use crate::states::Mood;
use crate::supervisor::{ProcessInfo, Supervisor};

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    GetState,
    GetPid,
    GetProcessInfo {
        name: String,
    },
    GetAllProcessInfo,
    StartProcess {
        name: String,
        #[serde(default = "yes")]
        wait: bool,
    },
    StopProcess {
        name: String,
        #[serde(default = "yes")]
        wait: bool,
    },
    StartAll {
        #[serde(default = "yes")]
        wait: bool,
    },
    StopAll {
        #[serde(default = "yes")]
        wait: bool,
    },
    StartGroup {
        name: String,
        #[serde(default = "yes")]
        wait: bool,
    },
    StopGroup {
        name: String,
        #[serde(default = "yes")]
        wait: bool,
    },
    SignalProcess {
        name: String,
        signal: String,
    },
    ReopenLogs,
    Shutdown,
    Restart,
    AddGroup {
        name: String,
    },
    RemoveGroup {
        name: String,
    },
    SendRemoteCommEvent {
        #[serde(rename = "type")]
        kind: String,
        data: String,
    },
    SendProcessStdin {
        name: String,
        chars: String,
    },
}

impl Request {
    /// Queries stay available while the supervisor shuts down.
    fn is_query(&self) -> bool {
        matches!(
            self,
            Self::GetState | Self::GetPid | Self::GetProcessInfo { .. } | Self::GetAllProcessInfo
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Response {
    Ok,
    State { statecode: i32, statename: String },
    Pid(i32),
    ProcessInfo(ProcessInfo),
    AllProcessInfo(Vec<ProcessInfo>),
    Results(Vec<ProcessResult>),
    Fault(Fault),
}

impl Response {
    pub fn fault(kind: FaultKind, text: impl Into<String>) -> Self {
        Self::Fault(Fault::new(kind, text))
    }
}

impl From<Result<(), Fault>> for Response {
    fn from(result: Result<(), Fault>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(fault) => Self::Fault(fault),
        }
    }
}

pub enum Reply {
    Now(Response),
    Later(Box<dyn DeferredCall<Output = Response>>),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Now(response) => f.debug_tuple("Now").field(response).finish(),
            Self::Later(_) => f.write_str("Later(..)"),
        }
    }
}

fn later<C>(call: C) -> Reply
where
    C: DeferredCall + 'static,
    Response: From<C::Output>,
{
    Reply::Later(Box::new(call.map(|out: C::Output| Response::from(out))))
}

impl From<Vec<ProcessResult>> for Response {
    fn from(results: Vec<ProcessResult>) -> Self {
        Self::Results(results)
    }
}

pub fn dispatch(sup: &mut Supervisor, request: Request) -> Reply {
    log::debug!("control request {request:?}");
    if !request.is_query() && sup.mood() != Mood::Active {
        return Reply::Now(Response::fault(FaultKind::ShutdownState, "supervisor is shutting down"));
    }

    match request {
        Request::GetState => {
            let mood = sup.mood();
            Reply::Now(Response::State {
                statecode: mood.code(),
                statename: mood.to_string(),
            })
        }
        Request::GetPid => Reply::Now(Response::Pid(getpid().as_raw())),
        Request::GetProcessInfo { name } => Reply::Now(match sup.process_info(&name) {
            Ok(info) => Response::ProcessInfo(info),
            Err(fault) => Response::Fault(fault),
        }),
        Request::GetAllProcessInfo => Reply::Now(Response::AllProcessInfo(sup.all_process_info())),
        Request::StartProcess { name, wait } => match name.strip_suffix(":*") {
            Some(group) => group_call(Sequence::start_group(sup, group, wait)),
            None => match sup.lookup_one(&name) {
                Ok(key) => later(StartProcess::new(key, wait)),
                Err(fault) => Reply::Now(Response::Fault(fault)),
            },
        },
        Request::StopProcess { name, wait } => match name.strip_suffix(":*") {
            Some(group) => group_call(Sequence::stop_group(sup, group, wait)),
            None => match sup.lookup_one(&name) {
                Ok(key) => later(StopProcess::new(key, wait)),
                Err(fault) => Reply::Now(Response::Fault(fault)),
            },
        },
        Request::StartAll { wait } => later(Sequence::start_all(sup, wait)),
        Request::StopAll { wait } => later(Sequence::stop_all(sup, wait)),
        Request::StartGroup { name, wait } => group_call(Sequence::start_group(sup, &name, wait)),
        Request::StopGroup { name, wait } => group_call(Sequence::stop_group(sup, &name, wait)),
        Request::SignalProcess { name, signal } => Reply::Now(signal_process(sup, &name, &signal).into()),
        Request::ReopenLogs => {
            sup.reopen_logs();
            Reply::Now(Response::Ok)
        }
        Request::Shutdown => {
            sup.request_shutdown();
            Reply::Now(Response::Ok)
        }
        Request::Restart => {
            sup.request_restart();
            Reply::Now(Response::Ok)
        }
        Request::AddGroup { name } => Reply::Now(sup.add_configured_group(&name).into()),
        Request::RemoveGroup { name } => Reply::Now(sup.remove_group(&name).into()),
        Request::SendRemoteCommEvent { kind, data } => {
            sup.send_remote_comm_event(&kind, &data);
            Reply::Now(Response::Ok)
        }
        Request::SendProcessStdin { name, chars } => {
            Reply::Now(sup.write_stdin(&name, chars.as_bytes()).into())
        }
    }
}

/// Decode a JSON request and dispatch it. Malformed input is a fault, not
/// an error.
pub fn dispatch_json(sup: &mut Supervisor, text: &str) -> Reply {
    match serde_json::from_str::<Request>(text) {
        Ok(request) => dispatch(sup, request),
        Err(e) => Reply::Now(Response::fault(FaultKind::BadArguments, e.to_string())),
    }
}

fn group_call(sequence: Result<Sequence, Fault>) -> Reply {
    match sequence {
        Ok(sequence) => later(sequence),
        Err(fault) => Reply::Now(Response::Fault(fault)),
    }
}

fn signal_process(sup: &Supervisor, namespec: &str, signal: &str) -> Result<(), Fault> {
    let signal = parse_signal(signal).ok_or_else(|| Fault::new(FaultKind::BadSignal, signal))?;
    let keys = sup
        .registry()
        .lookup(namespec)
        .ok_or_else(|| Fault::new(FaultKind::BadName, namespec))?;
    for key in keys {
        let Some(process) = sup.registry().get(&key) else {
            continue;
        };
        process.signal(signal).map_err(|e| match e {
            KillError::NotRunning { name, .. } => Fault::new(FaultKind::NotRunning, name),
            err @ KillError::Os { .. } => Fault::new(FaultKind::Failed, err.to_string()),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{GroupConf, ProcessConf};
    use crate::deferred::Step;
    use crate::events::EventType;
    use crate::supervisor::Options;
    use std::time::Instant;

    fn supervisor() -> Supervisor {
        let mut conf = ProcessConf::new("web", "true");
        conf.autostart = false;
        let group = GroupConf {
            name: "web".into(),
            priority: 1,
            processes: vec![conf],
            pool: None,
        };
        Supervisor::new(Options::default(), vec![group]).unwrap()
    }

    fn now(reply: Reply) -> Response {
        match reply {
            Reply::Now(response) => response,
            Reply::Later(_) => panic!("expected an immediate reply"),
        }
    }

    fn fault_kind(response: Response) -> FaultKind {
        match response {
            Response::Fault(fault) => fault.kind,
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[test]
    fn requests_decode_from_json() {
        let request: Request =
            serde_json::from_str(r#"{"method":"start_process","params":{"name":"web"}}"#).unwrap();
        assert_eq!(
            request,
            Request::StartProcess {
                name: "web".into(),
                wait: true
            }
        );
        let request: Request = serde_json::from_str(r#"{"method":"get_state"}"#).unwrap();
        assert_eq!(request, Request::GetState);
        let request: Request = serde_json::from_str(
            r#"{"method":"send_remote_comm_event","params":{"type":"deploy","data":"v2"}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            Request::SendRemoteCommEvent {
                kind: "deploy".into(),
                data: "v2".into()
            }
        );
    }

    #[test]
    fn malformed_json_is_bad_arguments() {
        let mut sup = supervisor();
        let response = now(dispatch_json(&mut sup, r#"{"method":"launch_missiles"}"#));
        assert_eq!(fault_kind(response), FaultKind::BadArguments);
    }

    #[test]
    fn state_and_info_queries() {
        let mut sup = supervisor();
        let response = now(dispatch(&mut sup, Request::GetState));
        assert_eq!(
            response,
            Response::State {
                statecode: 1,
                statename: "RUNNING".into()
            }
        );
        let Response::AllProcessInfo(infos) = now(dispatch(&mut sup, Request::GetAllProcessInfo)) else {
            panic!("expected process info");
        };
        assert_eq!(infos.len(), 1);
        let response = now(dispatch(
            &mut sup,
            Request::GetProcessInfo {
                name: "nope".into(),
            },
        ));
        assert_eq!(fault_kind(response), FaultKind::BadName);
    }

    #[test]
    fn signal_and_stdin_need_a_running_process() {
        let mut sup = supervisor();
        let response = now(dispatch(
            &mut sup,
            Request::SignalProcess {
                name: "web".into(),
                signal: "HUP".into(),
            },
        ));
        assert_eq!(fault_kind(response), FaultKind::NotRunning);

        let response = now(dispatch(
            &mut sup,
            Request::SignalProcess {
                name: "web".into(),
                signal: "BOGUS".into(),
            },
        ));
        assert_eq!(fault_kind(response), FaultKind::BadSignal);

        let response = now(dispatch(
            &mut sup,
            Request::SendProcessStdin {
                name: "web".into(),
                chars: "hello".into(),
            },
        ));
        assert_eq!(fault_kind(response), FaultKind::NotRunning);
    }

    #[test]
    fn process_calls_are_deferred() {
        let mut sup = supervisor();
        let reply = dispatch(
            &mut sup,
            Request::StopProcess {
                name: "web".into(),
                wait: true,
            },
        );
        let Reply::Later(mut call) = reply else {
            panic!("expected a deferred reply");
        };
        let Step::Done(response) = call.step(&mut sup, Instant::now()) else {
            panic!("idle process should fail at once");
        };
        assert_eq!(fault_kind(response), FaultKind::NotRunning);

        let reply = dispatch(
            &mut sup,
            Request::StartGroup {
                name: "missing".into(),
                wait: true,
            },
        );
        assert_eq!(fault_kind(now(reply)), FaultKind::BadName);
    }

    #[test]
    fn remote_comm_event_is_queued() {
        let mut sup = supervisor();
        let reply = dispatch(
            &mut sup,
            Request::SendRemoteCommEvent {
                kind: "deploy".into(),
                data: "v2".into(),
            },
        );
        assert_eq!(now(reply), Response::Ok);
        let events: Vec<_> = sup.events_mut().drain().collect();
        assert_eq!(events[0].kind, EventType::RemoteCommunication);
        assert_eq!(events[0].payload, b"type:deploy\nv2");
    }

    #[test]
    fn shutdown_rejects_mutations() {
        let mut sup = supervisor();
        assert_eq!(now(dispatch(&mut sup, Request::Shutdown)), Response::Ok);
        let response = now(dispatch(&mut sup, Request::StartAll { wait: true }));
        assert_eq!(fault_kind(response), FaultKind::ShutdownState);
        let response = now(dispatch(&mut sup, Request::GetState));
        assert_eq!(
            response,
            Response::State {
                statecode: -1,
                statename: "SHUTDOWN".into()
            }
        );
    }

    #[test]
    fn responses_serialize_tagged() {
        let json = serde_json::to_value(Response::Pid(42)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "pid", "value": 42}));
        let json = serde_json::to_value(Response::fault(FaultKind::BadName, "x")).unwrap();
        assert_eq!(json["value"]["kind"], "BAD_NAME");
    }
}
