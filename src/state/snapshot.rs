use super::log_ring::LogRing;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    NotStarted,
    Starting,
    Running,
    /// A graceful restart handshake or a backoff delay is pending.
    Restarting,
    Exited,
    AwaitingManualRestart,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::NotStarted => "not_started",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Restarting => "restarting",
            ProcessState::Exited => "exited",
            ProcessState::AwaitingManualRestart => "awaiting_manual_restart",
        };
        write!(f, "{name}")
    }
}

/// Everything observers can see about the supervised program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub changed_at: DateTime<Local>,
    pub manual: bool,
    pub program: Vec<String>,
    pub log: LogRing,
    pub files: BTreeMap<String, String>,
}

impl StateSnapshot {
    pub fn new(log_max_size: usize) -> Self {
        Self {
            version: 0,
            state: ProcessState::default(),
            pid: None,
            exit_code: None,
            changed_at: Local::now(),
            manual: false,
            program: Vec::new(),
            log: LogRing::new(log_max_size),
            files: BTreeMap::new(),
        }
    }

    pub fn with_program(self, program: Vec<String>) -> Self {
        Self { program, ..self }
    }

    pub fn with_manual(self, manual: bool) -> Self {
        Self { manual, ..self }
    }

    pub fn transition(&mut self, state: ProcessState) {
        self.state = state;
        self.changed_at = Local::now();
    }

    pub fn set_running(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.transition(ProcessState::Running);
    }

    pub fn set_exited(&mut self, exit_code: i32) {
        self.pid = None;
        self.exit_code = Some(exit_code);
        self.transition(ProcessState::Exited);
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::log_ring::LogStream;

    #[test]
    fn lifecycle_updates_pid_and_code() {
        let mut snapshot = StateSnapshot::new(8).with_program(vec!["sleep".into(), "1".into()]);
        assert_eq!(snapshot.state, ProcessState::NotStarted);

        let before = snapshot.changed_at;
        snapshot.set_running(42);
        assert_eq!(snapshot.state, ProcessState::Running);
        assert_eq!(snapshot.pid, Some(42));
        assert!(snapshot.changed_at >= before);

        snapshot.set_exited(3);
        assert_eq!(snapshot.state, ProcessState::Exited);
        assert_eq!(snapshot.pid, None);
        assert_eq!(snapshot.exit_code, Some(3));
    }

    #[test]
    fn json_uses_snake_case_states() {
        let mut snapshot = StateSnapshot::new(8).with_manual(true);
        snapshot.transition(ProcessState::AwaitingManualRestart);
        snapshot.log.append(LogStream::Stdout, b"hi\n");
        snapshot.files.insert("/etc/app.conf".into(), "a=1".into());

        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();

        assert_eq!(value["state"], "awaiting_manual_restart");
        assert_eq!(value["manual"], true);
        assert_eq!(value["pid"], serde_json::Value::Null);
        assert_eq!(value["log"]["entries"][0]["text"], "hi\n");
        assert_eq!(value["files"]["/etc/app.conf"], "a=1");
    }
}
