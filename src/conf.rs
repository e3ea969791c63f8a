//! The Serializable configuration data structures used for setup.
//!
//! Parsing is only the front door: everything past `Config::load` deals in
//! validated, immutable `ProcessConf` records. A config file may be TOML, YAML
//! or JSON, chosen by its extension.
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use nix::sys::signal::Signal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;
use crate::events::EventType;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    Always,
    Unexpected,
    Never,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SupervisorConf {
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    #[serde(default = "default_identifier")]
    pub identifier: String,

    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SupervisorConf {
    fn default() -> Self {
        Self {
            pidfile: None,
            identifier: default_identifier(),
            loglevel: default_loglevel(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgramConf {
    pub name: String,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_numprocs")]
    pub numprocs: usize,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub autostart: bool,

    #[serde(default = "default_autorestart")]
    pub autorestart: AutoRestart,

    #[serde(default = "default_startsecs")]
    pub startsecs: u64,

    #[serde(default = "default_startretries")]
    pub startretries: u32,

    #[serde(
        default = "default_stopsignal",
        deserialize_with = "de_signal",
        serialize_with = "ser_signal"
    )]
    pub stopsignal: Signal,

    #[serde(default = "default_stopwaitsecs")]
    pub stopwaitsecs: u64,

    #[serde(default)]
    pub stopasgroup: bool,

    /// Implied by `stopasgroup`.
    #[serde(default)]
    pub killasgroup: bool,

    #[serde(default = "default_exitcodes")]
    pub exitcodes: Vec<i32>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub redirect_stderr: bool,

    #[serde(default)]
    pub stdout_logfile: Option<PathBuf>,

    #[serde(default)]
    pub stderr_logfile: Option<PathBuf>,

    #[serde(default)]
    pub stdout_events_enabled: bool,

    #[serde(default)]
    pub stderr_events_enabled: bool,

    #[serde(default)]
    pub stdout_capture_maxbytes: usize,

    #[serde(default)]
    pub stderr_capture_maxbytes: usize,

    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenerConf {
    #[serde(flatten)]
    pub program: ProgramConf,

    pub events: Vec<String>,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub ack_timeout_secs: Option<u64>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GroupDef {
    pub name: String,

    #[serde(default = "default_priority")]
    pub priority: i32,

    pub programs: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_cfg_ver")]
    pub version: u32,

    #[serde(default)]
    pub supervisor: SupervisorConf,

    #[serde(default)]
    pub program: Vec<ProgramConf>,

    #[serde(default)]
    pub group: Vec<GroupDef>,

    #[serde(default)]
    pub eventlistener: Vec<ListenerConf>,
}

/// Immutable definition of one managed process, after `numprocs` expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConf {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub priority: i32,
    pub autostart: bool,
    pub autorestart: AutoRestart,
    pub startsecs: u64,
    pub startretries: u32,
    pub stopsignal: Signal,
    pub stopwaitsecs: u64,
    pub stopasgroup: bool,
    pub killasgroup: bool,
    pub exitcodes: Vec<i32>,
    pub user: Option<String>,
    pub directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub redirect_stderr: bool,
    pub stdout_logfile: Option<PathBuf>,
    pub stderr_logfile: Option<PathBuf>,
    pub stdout_events_enabled: bool,
    pub stderr_events_enabled: bool,
    /// Zero disables capture mode on the channel.
    pub stdout_capture_maxbytes: usize,
    pub stderr_capture_maxbytes: usize,
}

/// Settings that only event listener pools carry.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConf {
    pub events: Vec<EventType>,
    pub buffer_size: usize,
    pub ack_timeout_secs: Option<u64>,
    pub max_attempts: u32,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupConf {
    pub name: String,
    pub priority: i32,
    pub processes: Vec<ProcessConf>,
    pub pool: Option<PoolConf>,
}

impl ProcessConf {
    /// A process definition with every policy knob at its default.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            priority: default_priority(),
            autostart: true,
            autorestart: default_autorestart(),
            startsecs: default_startsecs(),
            startretries: default_startretries(),
            stopsignal: default_stopsignal(),
            stopwaitsecs: default_stopwaitsecs(),
            stopasgroup: false,
            killasgroup: false,
            exitcodes: default_exitcodes(),
            user: None,
            directory: None,
            environment: HashMap::new(),
            redirect_stderr: false,
            stdout_logfile: None,
            stderr_logfile: None,
            stdout_events_enabled: false,
            stderr_events_enabled: false,
            stdout_capture_maxbytes: 0,
            stderr_capture_maxbytes: 0,
        }
    }
}

impl ProgramConf {
    fn expand(&self) -> Vec<ProcessConf> {
        (0..self.numprocs)
            .map(|n| {
                let name = if self.numprocs > 1 {
                    format!("{}_{:02}", self.name, n)
                } else {
                    self.name.clone()
                };
                ProcessConf {
                    name,
                    command: self.command.clone(),
                    args: self.args.clone(),
                    priority: self.priority,
                    autostart: self.autostart,
                    autorestart: self.autorestart,
                    startsecs: self.startsecs,
                    startretries: self.startretries,
                    stopsignal: self.stopsignal,
                    stopwaitsecs: self.stopwaitsecs,
                    stopasgroup: self.stopasgroup,
                    killasgroup: self.killasgroup || self.stopasgroup,
                    exitcodes: self.exitcodes.clone(),
                    user: self.user.clone(),
                    directory: self.directory.clone(),
                    environment: self.environment.clone(),
                    redirect_stderr: self.redirect_stderr,
                    stdout_logfile: self.stdout_logfile.clone(),
                    stderr_logfile: self.stderr_logfile.clone(),
                    stdout_events_enabled: self.stdout_events_enabled,
                    stderr_events_enabled: self.stderr_events_enabled,
                    stdout_capture_maxbytes: self.stdout_capture_maxbytes,
                    stderr_capture_maxbytes: self.stderr_capture_maxbytes,
                }
            })
            .collect()
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(invalid(format!("program {:?} has an empty command", self.name)));
        }
        if self.numprocs == 0 {
            return Err(invalid(format!("program {:?} has numprocs = 0", self.name)));
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&text),
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&text)?),
            Some("json") => Ok(serde_json::from_str(&text)?),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Resolve programs, explicit groups and listener pools into the process
    /// table layout, validating names along the way.
    pub fn groups(&self) -> Result<Vec<GroupConf>, ConfigError> {
        let mut groups: Vec<GroupConf> = Vec::new();
        let mut seen_procs = HashSet::new();
        let mut claimed = HashSet::new();

        let programs: HashMap<&str, &ProgramConf> =
            self.program.iter().map(|p| (p.name.as_str(), p)).collect();
        if programs.len() != self.program.len() {
            return Err(invalid("duplicate program name"));
        }

        for def in &self.group {
            let mut processes = Vec::new();
            for member in &def.programs {
                let program = programs.get(member.as_str()).ok_or_else(|| {
                    invalid(format!("group {:?} names unknown program {member:?}", def.name))
                })?;
                program.check()?;
                claimed.insert(member.as_str());
                processes.extend(program.expand());
            }
            groups.push(GroupConf {
                name: def.name.clone(),
                priority: def.priority,
                processes,
                pool: None,
            });
        }

        for program in &self.program {
            if claimed.contains(program.name.as_str()) {
                continue;
            }
            program.check()?;
            let name = program.group.clone().unwrap_or_else(|| program.name.clone());
            match groups.iter_mut().find(|g| g.name == name && g.pool.is_none()) {
                Some(group) => group.processes.extend(program.expand()),
                None => groups.push(GroupConf {
                    name,
                    priority: program.priority,
                    processes: program.expand(),
                    pool: None,
                }),
            }
        }

        for listener in &self.eventlistener {
            groups.push(listener.to_group()?);
        }

        let mut seen_groups = HashSet::new();
        for group in &groups {
            if !seen_groups.insert(group.name.as_str()) {
                return Err(invalid(format!("duplicate group name {:?}", group.name)));
            }
            for process in &group.processes {
                if !seen_procs.insert(process.name.clone()) {
                    return Err(invalid(format!(
                        "duplicate process name {:?}",
                        process.name
                    )));
                }
            }
        }

        Ok(groups)
    }
}

impl ListenerConf {
    pub fn to_group(&self) -> Result<GroupConf, ConfigError> {
        self.program.check()?;
        if self.program.redirect_stderr {
            return Err(invalid(format!(
                "event listener {:?} can't use redirect_stderr",
                self.program.name
            )));
        }
        if self.program.stdout_capture_maxbytes > 0 {
            return Err(invalid(format!(
                "event listener {:?} can't capture stdout",
                self.program.name
            )));
        }
        let events = self
            .events
            .iter()
            .map(|name| {
                EventType::from_name(name)
                    .ok_or_else(|| invalid(format!("unknown event type {name:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupConf {
            name: self.program.name.clone(),
            priority: self.program.priority,
            processes: self.program.expand(),
            pool: Some(PoolConf {
                events,
                buffer_size: self.buffer_size,
                ack_timeout_secs: self.ack_timeout_secs,
                max_attempts: self.max_attempts.max(1),
                overflow: self.overflow,
            }),
        })
    }
}

/// Accepts both `TERM` and `SIGTERM`.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse().ok()
}

fn de_signal<'de, D>(deserializer: D) -> Result<Signal, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    parse_signal(&name)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown signal {name:?}")))
}

fn ser_signal<S>(signal: &Signal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(signal.as_str())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn default_cfg_ver() -> u32 {
    1
}

fn default_identifier() -> String {
    "supervisor".to_string()
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_numprocs() -> usize {
    1
}

fn default_priority() -> i32 {
    999
}

fn default_autorestart() -> AutoRestart {
    AutoRestart::Unexpected
}

fn default_startsecs() -> u64 {
    1
}

fn default_startretries() -> u32 {
    3
}

fn default_stopsignal() -> Signal {
    Signal::SIGTERM
}

fn default_stopwaitsecs() -> u64 {
    10
}

fn default_exitcodes() -> Vec<i32> {
    vec![0, 2]
}

fn default_buffer_size() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::DropOldest
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[supervisor]
pidfile = "/tmp/dynein.pid"

[[program]]
name = "web"
command = "/bin/sleep"
args = ["60"]
priority = 10
stopsignal = "INT"

[[program]]
name = "worker"
command = "/bin/sleep"
numprocs = 2
autorestart = "always"
stopasgroup = true
stderr_events_enabled = true
stdout_capture_maxbytes = 1024

[[eventlistener]]
name = "alerts"
command = "/usr/bin/listener"
events = ["PROCESS_STATE", "TICK_60"]
overflow = "drop_newest"
"#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.supervisor.identifier, "supervisor");
        assert_eq!(config.program[0].stopsignal, Signal::SIGINT);
        assert_eq!(config.program[1].startretries, 3);
        assert_eq!(config.program[1].exitcodes, vec![0, 2]);
        assert_eq!(config.eventlistener[0].buffer_size, 10);
    }

    #[test]
    fn groups_expand_numprocs_and_pools() {
        let groups = Config::from_toml(SAMPLE).unwrap().groups().unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["web", "worker", "alerts"]);

        let workers: Vec<_> = groups[1].processes.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(workers, ["worker_00", "worker_01"]);
        let worker = &groups[1].processes[0];
        assert!(worker.stopasgroup && worker.killasgroup);
        assert!(worker.stderr_events_enabled && !worker.stdout_events_enabled);
        assert_eq!(worker.stdout_capture_maxbytes, 1024);
        assert!(!groups[0].processes[0].killasgroup);

        let pool = groups[2].pool.as_ref().unwrap();
        assert_eq!(pool.events, vec![EventType::ProcessState, EventType::Tick60]);
        assert_eq!(pool.overflow, OverflowPolicy::DropNewest);
    }

    #[test]
    fn explicit_group_claims_programs() {
        let text = r#"
[[program]]
name = "a"
command = "true"
[[program]]
name = "b"
command = "true"
[[group]]
name = "both"
priority = 5
programs = ["a", "b"]
"#;
        let groups = Config::from_toml(text).unwrap().groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].priority, 5);
        assert_eq!(groups[0].processes.len(), 2);
    }

    #[test]
    fn rejects_duplicates_and_bad_listeners() {
        let dup = "[[program]]\nname = \"a\"\ncommand = \"x\"\n[[program]]\nname = \"a\"\ncommand = \"y\"\n";
        assert!(matches!(
            Config::from_toml(dup).unwrap().groups(),
            Err(ConfigError::Invalid(_))
        ));

        let listener = r#"
[[eventlistener]]
name = "l"
command = "x"
redirect_stderr = true
events = ["TICK_5"]
"#;
        assert!(Config::from_toml(listener).unwrap().groups().is_err());

        let capturing = r#"
[[eventlistener]]
name = "l"
command = "x"
stdout_capture_maxbytes = 10
events = ["TICK_5"]
"#;
        assert!(Config::from_toml(capturing).unwrap().groups().is_err());

        let unknown = r#"
[[eventlistener]]
name = "l"
command = "x"
events = ["NOPE"]
"#;
        assert!(Config::from_toml(unknown).unwrap().groups().is_err());
    }

    #[test]
    fn loads_yaml_and_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("d.yaml");
        fs::write(&yaml, "program:\n  - name: a\n    command: /bin/true\n").unwrap();
        assert_eq!(Config::load(&yaml).unwrap().program[0].name, "a");

        let json = dir.path().join("d.json");
        fs::write(&json, r#"{"program": [{"name": "b", "command": "/bin/true"}]}"#).unwrap();
        assert_eq!(Config::load(&json).unwrap().program[0].name, "b");

        let ini = dir.path().join("d.ini");
        fs::write(&ini, "").unwrap();
        assert!(matches!(
            Config::load(&ini),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn signal_names_with_and_without_prefix() {
        assert_eq!(parse_signal("TERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("sighup"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal("BOGUS"), None);
    }
}
