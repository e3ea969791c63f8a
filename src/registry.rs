//! The process table: groups, their processes and the pid history.
//!
//! Groups own their processes for the lifetime of the table entry; a process
//! is only ever destroyed by removing its whole group. Ordering is total and
//! stable: group priority, then process priority, then group and process
//! names break ties.
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;

use crate::conf::GroupConf;
use crate::listener::ListenerPool;
use crate::subprocess::{decode_wait_status, Channel, ExitStatus, Subprocess};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessKey {
    pub group: String,
    pub name: String,
}

impl ProcessKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)
    }
}

#[derive(Debug)]
pub struct ProcessGroup {
    pub name: String,
    pub priority: i32,
    pub processes: Vec<Subprocess>,
    pub pool: Option<ListenerPool>,
}

impl ProcessGroup {
    pub fn new(conf: GroupConf) -> Self {
        let is_listener = conf.pool.is_some();
        let processes = conf
            .processes
            .into_iter()
            .map(|p| Subprocess::new(p, conf.name.clone(), is_listener))
            .collect();
        Self {
            pool: conf.pool.map(|pool| ListenerPool::new(conf.name.clone(), pool)),
            name: conf.name,
            priority: conf.priority,
            processes,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    groups: Vec<ProcessGroup>,
    pid_history: HashMap<Pid, ProcessKey>,
}

impl Registry {
    pub fn new(confs: Vec<GroupConf>) -> Self {
        Self {
            groups: confs.into_iter().map(ProcessGroup::new).collect(),
            pid_history: HashMap::new(),
        }
    }

    pub fn groups(&self) -> &[ProcessGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [ProcessGroup] {
        &mut self.groups
    }

    pub fn group(&self, name: &str) -> Option<&ProcessGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn insert_group(&mut self, group: ProcessGroup) {
        self.groups.push(group);
    }

    pub fn remove_group(&mut self, name: &str) -> Option<ProcessGroup> {
        let loc = self.groups.iter().position(|g| g.name == name)?;
        self.pid_history.retain(|_, key| key.group != name);
        Some(self.groups.remove(loc))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subprocess> {
        self.groups.iter().flat_map(|g| g.processes.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subprocess> {
        self.groups.iter_mut().flat_map(|g| g.processes.iter_mut())
    }

    /// Index pairs in ascending start order.
    pub fn ordered(&self) -> Vec<(usize, usize)> {
        let mut order: Vec<(usize, usize)> = self
            .groups
            .iter()
            .enumerate()
            .flat_map(|(gi, g)| (0..g.processes.len()).map(move |pi| (gi, pi)))
            .collect();
        order.sort_by(|a, b| self.sort_key(*a).cmp(&self.sort_key(*b)));
        order
    }

    fn sort_key(&self, (gi, pi): (usize, usize)) -> (i32, i32, &str, &str) {
        let group = &self.groups[gi];
        let process = &group.processes[pi];
        (
            group.priority,
            process.config.priority,
            &group.name,
            &process.config.name,
        )
    }

    pub fn key_at(&self, (gi, pi): (usize, usize)) -> ProcessKey {
        ProcessKey::new(&self.groups[gi].name, &self.groups[gi].processes[pi].config.name)
    }

    pub fn at(&self, (gi, pi): (usize, usize)) -> &Subprocess {
        &self.groups[gi].processes[pi]
    }

    pub fn at_mut(&mut self, (gi, pi): (usize, usize)) -> &mut Subprocess {
        &mut self.groups[gi].processes[pi]
    }

    pub fn position(&self, key: &ProcessKey) -> Option<(usize, usize)> {
        let gi = self.groups.iter().position(|g| g.name == key.group)?;
        let pi = self.groups[gi]
            .processes
            .iter()
            .position(|p| p.config.name == key.name)?;
        Some((gi, pi))
    }

    pub fn get(&self, key: &ProcessKey) -> Option<&Subprocess> {
        self.position(key).map(|at| self.at(at))
    }

    pub fn get_mut(&mut self, key: &ProcessKey) -> Option<&mut Subprocess> {
        self.position(key).map(|at| self.at_mut(at))
    }

    /// Resolve `group:name`, `group:*` or a bare process name.
    pub fn lookup(&self, namespec: &str) -> Option<Vec<ProcessKey>> {
        let keys: Vec<ProcessKey> = match namespec.split_once(':') {
            Some((group, "*")) => {
                let group = self.group(group)?;
                group
                    .processes
                    .iter()
                    .map(|p| ProcessKey::new(&group.name, &p.config.name))
                    .collect()
            }
            Some((group, name)) => {
                let key = ProcessKey::new(group, name);
                self.position(&key)?;
                vec![key]
            }
            None => self
                .groups
                .iter()
                .flat_map(|g| {
                    g.processes
                        .iter()
                        .filter(|p| p.config.name == namespec)
                        .map(|p| ProcessKey::new(&g.name, &p.config.name))
                })
                .collect(),
        };
        (!keys.is_empty()).then_some(keys)
    }

    pub fn by_fd(&self, fd: RawFd) -> Option<((usize, usize), Channel)> {
        self.groups.iter().enumerate().find_map(|(gi, g)| {
            g.processes
                .iter()
                .enumerate()
                .find_map(|(pi, p)| p.channel_of(fd).map(|ch| ((gi, pi), ch)))
        })
    }

    pub fn record_pid(&mut self, pid: Pid, key: ProcessKey) {
        self.pid_history.insert(pid, key);
    }

    pub fn forget_pid(&mut self, pid: Pid) -> Option<ProcessKey> {
        self.pid_history.remove(&pid)
    }

    pub fn live_pids(&self) -> usize {
        self.iter().filter(|p| p.pid.is_some()).count()
    }

    /// Collect exited children. With `blocking` the first wait blocks and
    /// only one child is collected.
    pub fn reap_children(blocking: bool) -> Vec<(Pid, ExitStatus)> {
        let flags = (!blocking).then_some(WaitPidFlag::WNOHANG);
        let mut reaped_children = Vec::new();
        loop {
            match waitpid(None, flags) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let (Some(pid), Some(exit)) = (status.pid(), decode_wait_status(status)) {
                        reaped_children.push((pid, exit));
                    }
                    if blocking {
                        break;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    log::error!("error in waitpid: {e}");
                    break;
                }
            }
        }
        reaped_children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{ProcessConf, PoolConf, OverflowPolicy};
    use crate::events::EventType;

    fn group(name: &str, priority: i32, procs: &[(&str, i32)]) -> GroupConf {
        GroupConf {
            name: name.into(),
            priority,
            processes: procs
                .iter()
                .map(|(n, prio)| {
                    let mut conf = ProcessConf::new(*n, "true");
                    conf.priority = *prio;
                    conf
                })
                .collect(),
            pool: None,
        }
    }

    #[test]
    fn ordering_is_total_and_stable() {
        let registry = Registry::new(vec![
            group("b", 10, &[("b2", 5), ("b1", 5)]),
            group("a", 10, &[("a1", 7)]),
            group("z", 1, &[("z1", 999)]),
        ]);
        let names: Vec<String> = registry
            .ordered()
            .into_iter()
            .map(|at| registry.key_at(at).to_string())
            .collect();
        assert_eq!(names, ["z:z1", "b:b1", "b:b2", "a:a1"]);
    }

    #[test]
    fn namespec_lookup() {
        let registry = Registry::new(vec![
            group("web", 1, &[("web_00", 1), ("web_01", 1)]),
            group("db", 2, &[("db", 1)]),
        ]);
        assert_eq!(registry.lookup("web:*").map(|k| k.len()), Some(2));
        assert_eq!(
            registry.lookup("db"),
            Some(vec![ProcessKey::new("db", "db")])
        );
        assert_eq!(
            registry.lookup("web:web_01"),
            Some(vec![ProcessKey::new("web", "web_01")])
        );
        assert!(registry.lookup("web:nope").is_none());
        assert!(registry.lookup("nope").is_none());
    }

    #[test]
    fn pools_mark_listener_processes() {
        let mut conf = group("alerts", 1, &[("alerts", 1)]);
        conf.pool = Some(PoolConf {
            events: vec![EventType::Event],
            buffer_size: 1,
            ack_timeout_secs: None,
            max_attempts: 1,
            overflow: OverflowPolicy::DropNewest,
        });
        let registry = Registry::new(vec![conf]);
        let group = registry.group("alerts").unwrap();
        assert!(group.pool.is_some());
        assert!(group.processes[0].is_listener());
    }

    #[test]
    fn pid_history_is_forgotten_with_group() {
        let mut registry = Registry::new(vec![group("web", 1, &[("web", 1)])]);
        registry.record_pid(Pid::from_raw(77), ProcessKey::new("web", "web"));
        assert!(registry.remove_group("web").is_some());
        assert!(registry.forget_pid(Pid::from_raw(77)).is_none());
    }
}
