//! Supervisor settings, read from an optional YAML file and overridden from the command line.
pub mod error;

use crate::cli::Cli;
use crate::logging::config::LoggingConfig;
use crate::state::log_ring::DEFAULT_LOG_MAX_SIZE;
use crate::state::DEFAULT_PUSH_INTERVAL;
use crate::supervisor::command::LogOutput;
use crate::supervisor::policy::{
    OnExit, RestartPolicy, DEFAULT_RESTART_SIGNAL, DEFAULT_RESTART_TIMEOUT,
};
use duration_str::deserialize_duration;
use error::ConfigError;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Executable followed by its arguments.
    #[serde(default)]
    pub program: Vec<String>,
    #[serde(default)]
    pub on_exit: OnExit,
    #[serde(default)]
    pub restart_signal: RestartSignal,
    #[serde(default)]
    pub restart_timeout: RestartTimeout,
    /// Files whose contents are exposed in the state snapshot.
    #[serde(default)]
    pub configuration_files: Vec<PathBuf>,
    #[serde(default)]
    pub files_refresh_interval: Option<RefreshInterval>,
    #[serde(default)]
    pub log_output: LogOutput,
    #[serde(default = "default_log_max_size")]
    pub log_max_size: usize,
    #[serde(default)]
    pub push_interval: PushInterval,
    #[serde(default)]
    pub log: LoggingConfig,
}

fn default_log_max_size() -> usize {
    DEFAULT_LOG_MAX_SIZE
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: Vec::new(),
            on_exit: OnExit::default(),
            restart_signal: RestartSignal::default(),
            restart_timeout: RestartTimeout::default(),
            configuration_files: Vec::new(),
            files_refresh_interval: None,
            log_output: LogOutput::default(),
            log_max_size: DEFAULT_LOG_MAX_SIZE,
            push_interval: PushInterval::default(),
            log: LoggingConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Read(path.to_path_buf(), err))?;
        Self::from_str(&content)
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.program.first().map_or(true, |program| program.is_empty()) {
            return Err(ConfigError::MissingProgram);
        }
        if self.log_max_size == 0 {
            return Err(ConfigError::InvalidLogMaxSize);
        }
        Ok(self)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::new(self.on_exit)
            .with_restart_signal(self.restart_signal.into())
            .with_restart_timeout(self.restart_timeout.into())
    }
}

impl FromStr for SupervisorConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // An empty document means every default.
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }
}

/// The file is loaded first, anything set on the command line wins over it.
impl TryFrom<&Cli> for SupervisorConfig {
    type Error = ConfigError;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        let mut config = match cli.config() {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if !cli.program().is_empty() {
            config.program = cli.program().to_vec();
        }
        if let Some(on_exit) = cli.on_exit() {
            config.on_exit = on_exit;
        }
        if let Some(files) = cli.files() {
            config.configuration_files = files.to_vec();
        }
        if let Some(signal) = cli.restart_signal() {
            config.restart_signal = signal;
        }
        if let Some(timeout) = cli.restart_timeout() {
            config.restart_timeout = RestartTimeout(timeout);
        }
        config.validate()
    }
}

/// Accepts `SIGINT`, `INT` and lowercase spellings of any signal nix knows.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct RestartSignal(Signal);

impl Default for RestartSignal {
    fn default() -> Self {
        Self(DEFAULT_RESTART_SIGNAL)
    }
}

impl From<RestartSignal> for Signal {
    fn from(value: RestartSignal) -> Self {
        value.0
    }
}

impl FromStr for RestartSignal {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&name)
            .map(RestartSignal)
            .map_err(|_| ConfigError::InvalidSignal(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for RestartSignal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value_str = String::deserialize(deserializer)?;
        RestartSignal::from_str(&value_str).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
pub struct RestartTimeout(#[serde(deserialize_with = "deserialize_duration")] Duration);

impl Default for RestartTimeout {
    fn default() -> Self {
        Self(DEFAULT_RESTART_TIMEOUT)
    }
}

impl From<RestartTimeout> for Duration {
    fn from(value: RestartTimeout) -> Self {
        value.0
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
pub struct PushInterval(#[serde(deserialize_with = "deserialize_duration")] Duration);

impl Default for PushInterval {
    fn default() -> Self {
        Self(DEFAULT_PUSH_INTERVAL)
    }
}

impl From<PushInterval> for Duration {
    fn from(value: PushInterval) -> Self {
        value.0
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
pub struct RefreshInterval(#[serde(deserialize_with = "deserialize_duration")] Duration);

impl From<RefreshInterval> for Duration {
    fn from(value: RefreshInterval) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use clap::Parser;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL_CONFIG: &str = r#"
program: ["my-server", "--port", "9000"]
on_exit: restart
restart_signal: SIGTERM
restart_timeout: 5s
configuration_files: [/etc/app.conf]
files_refresh_interval: 10s
log_output: capture
log_max_size: 500
push_interval: 100ms
log:
  level: debug
"#;

    #[test]
    fn full_config_is_parsed() {
        let config = SupervisorConfig::from_str(FULL_CONFIG).unwrap();

        assert_eq!(config.program, vec!["my-server", "--port", "9000"]);
        assert_eq!(config.on_exit, OnExit::Restart);
        assert_eq!(Signal::from(config.restart_signal), Signal::SIGTERM);
        assert_eq!(Duration::from(config.restart_timeout), Duration::from_secs(5));
        assert_eq!(config.configuration_files, vec![PathBuf::from("/etc/app.conf")]);
        assert_eq!(
            config.files_refresh_interval.map(Duration::from),
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.log_output, LogOutput::Capture);
        assert_eq!(config.log_max_size, 500);
        assert_eq!(Duration::from(config.push_interval), Duration::from_millis(100));

        let policy = config.restart_policy();
        assert_eq!(policy.on_exit, OnExit::Restart);
        assert_eq!(policy.restart_signal, Signal::SIGTERM);
        assert_eq!(policy.restart_timeout, Duration::from_secs(5));
    }

    #[rstest]
    #[case::empty("")]
    #[case::only_program("program: [sleep, '1']")]
    fn defaults(#[case] input: &str) {
        let config = SupervisorConfig::from_str(input).unwrap();

        assert_eq!(config.on_exit, OnExit::Proxy);
        assert_eq!(Signal::from(config.restart_signal), Signal::SIGINT);
        assert_eq!(Duration::from(config.restart_timeout), Duration::from_secs(30));
        assert_eq!(config.log_output, LogOutput::Both);
        assert_eq!(config.log_max_size, 10_000);
        assert_eq!(Duration::from(config.push_interval), Duration::from_millis(250));
        assert!(config.files_refresh_interval.is_none());
    }

    #[rstest]
    #[case::unknown_policy("on_exit: respawn")]
    #[case::unknown_output("log_output: syslog")]
    #[case::unknown_signal("restart_signal: SIGNOPE")]
    #[case::bad_duration("restart_timeout: soon")]
    #[case::unknown_field("restart_delay: 1s")]
    fn invalid_values_are_rejected(#[case] input: &str) {
        assert_matches!(SupervisorConfig::from_str(input), Err(ConfigError::Parse(_)));
    }

    #[rstest]
    #[case("SIGHUP", Signal::SIGHUP)]
    #[case("HUP", Signal::SIGHUP)]
    #[case("usr1", Signal::SIGUSR1)]
    #[case("sigterm", Signal::SIGTERM)]
    fn signal_spellings(#[case] input: &str, #[case] expected: Signal) {
        assert_eq!(Signal::from(RestartSignal::from_str(input).unwrap()), expected);
    }

    #[test]
    fn validation() {
        assert_matches!(
            SupervisorConfig::default().validate(),
            Err(ConfigError::MissingProgram)
        );
        assert_matches!(
            SupervisorConfig::from_str("program: ['']").unwrap().validate(),
            Err(ConfigError::MissingProgram)
        );
        assert_matches!(
            SupervisorConfig::from_str("program: [ls]\nlog_max_size: 0")
                .unwrap()
                .validate(),
            Err(ConfigError::InvalidLogMaxSize)
        );
    }

    #[test]
    fn cli_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{FULL_CONFIG}").unwrap();
        let path = file.path().display().to_string();

        let cli = Cli::parse_from([
            "newrelic-proc-supervisor",
            "--config",
            path.as_str(),
            "--on-exit",
            "ignore",
            "--restart-timeout",
            "2s",
            "--files",
            "/a.conf,/b.conf",
            "--",
            "sleep",
            "10",
        ]);
        let config = SupervisorConfig::try_from(&cli).unwrap();

        assert_eq!(config.program, vec!["sleep", "10"]);
        assert_eq!(config.on_exit, OnExit::Ignore);
        assert_eq!(Duration::from(config.restart_timeout), Duration::from_secs(2));
        assert_eq!(
            config.configuration_files,
            vec![PathBuf::from("/a.conf"), PathBuf::from("/b.conf")]
        );
        // Untouched by the command line.
        assert_eq!(Signal::from(config.restart_signal), Signal::SIGTERM);
        assert_eq!(config.log_max_size, 500);
    }

    #[test]
    fn missing_file_is_reported() {
        let cli = Cli::parse_from(["newrelic-proc-supervisor", "--config", "/no/such/file.yaml"]);
        assert_matches!(SupervisorConfig::try_from(&cli), Err(ConfigError::Read(_, _)));
    }
}
