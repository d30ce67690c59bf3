use super::error::CommandError;
use super::pipe::spawn_pipe_relay;
use crate::state::{log_ring::LogStream, StateStore};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use serde::Deserialize;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{sleep, JoinHandle};
use std::time::Duration;

const RELAY_DRAIN_RETRY: u16 = 10;
const RELAY_DRAIN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Where the program's stdout and stderr go.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Into the log record and through to the supervisor's own stdout/stderr.
    #[default]
    Both,
    /// Into the log record only.
    Capture,
    /// Straight to the supervisor's stdout/stderr, the log record only holds internal lines.
    Passthrough,
}

impl LogOutput {
    fn is_captured(&self) -> bool {
        *self != LogOutput::Passthrough
    }

    fn is_forwarded(&self) -> bool {
        *self != LogOutput::Capture
    }
}

////////////////////////////////////////////////////////////////////////////////////
// States for Started/Not Started Command
////////////////////////////////////////////////////////////////////////////////////
#[derive(Debug)]
pub struct CommandOSNotStarted {
    cmd: Command,
    log_output: LogOutput,
}

#[derive(Debug)]
pub struct CommandOSStarted {
    process: Child,
    log_output: LogOutput,
    relays: Vec<JoinHandle<()>>,
}

/// Blocks until a started process has exited, leaving it unreaped so its pid stays reserved
/// until the owner of [CommandOSStarted] collects the status.
#[derive(Debug)]
pub struct ExitWatcher {
    pid: u32,
    relays: Vec<JoinHandle<()>>,
}

impl CommandOSNotStarted {
    /// Environment, working directory and stdin are inherited from the supervisor.
    pub fn new<S: AsRef<str>>(executable: &Path, args: &[S], log_output: LogOutput) -> Self {
        let mut cmd = Command::new(executable);
        cmd.args(args.iter().map(AsRef::as_ref)).stdin(Stdio::inherit());
        if log_output.is_captured() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        Self { cmd, log_output }
    }

    pub fn start(mut self) -> Result<CommandOSStarted, CommandError> {
        Ok(CommandOSStarted {
            process: self.cmd.spawn()?,
            log_output: self.log_output,
            relays: Vec::new(),
        })
    }
}

impl CommandOSStarted {
    pub fn get_pid(&self) -> u32 {
        self.process.id()
    }

    /// Relays captured output into `store`, tagged with the stream it came from.
    pub fn stream(mut self, store: &StateStore) -> Result<Self, CommandError> {
        if !self.log_output.is_captured() {
            return Ok(self);
        }
        let stdout = self
            .process
            .stdout
            .take()
            .ok_or(CommandError::StreamPipeError("stdout".to_string()))?;
        let stderr = self
            .process
            .stderr
            .take()
            .ok_or(CommandError::StreamPipeError("stderr".to_string()))?;

        let pid = self.get_pid();
        let forward = self.log_output.is_forwarded();
        self.relays = vec![
            spawn_pipe_relay(
                format!("stdout-relay-{pid}"),
                stdout,
                LogStream::Stdout,
                store.clone(),
                forward.then(io::stdout),
            ),
            spawn_pipe_relay(
                format!("stderr-relay-{pid}"),
                stderr,
                LogStream::Stderr,
                store.clone(),
                forward.then(io::stderr),
            ),
        ];

        Ok(self)
    }

    /// Hands the output relays over to an [ExitWatcher] for this process.
    pub fn exit_watcher(&mut self) -> ExitWatcher {
        ExitWatcher {
            pid: self.get_pid(),
            relays: std::mem::take(&mut self.relays),
        }
    }

    /// Reaps the process. Relays not handed to an [ExitWatcher] are given a moment to drain.
    pub fn wait(mut self) -> Result<ExitStatus, CommandError> {
        let status = self.process.wait()?;
        drain_relays(&self.relays);
        Ok(status)
    }
}

impl ExitWatcher {
    /// Returns once the process has exited and its output relays had a moment to drain, so the
    /// last lines are recorded before the exit is. The process is not reaped.
    pub fn wait(self) -> Result<(), CommandError> {
        let pid = Pid::from_raw(self.pid as i32);
        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(CommandError::Wait(err)),
            }
        }
        drain_relays(&self.relays);
        Ok(())
    }
}

/// Relays kept alive by descendants holding the pipes are left running.
fn drain_relays(relays: &[JoinHandle<()>]) {
    for _ in 0..RELAY_DRAIN_RETRY {
        if relays.iter().all(JoinHandle::is_finished) {
            break;
        }
        sleep(RELAY_DRAIN_RETRY_INTERVAL);
    }
}

/// Non-negative exit code for any status: the code itself, `128 + signal` for signaled
/// processes, and 1 when neither is known.
pub fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

pub fn send_signal(pid: u32, sig: Signal) -> Result<(), CommandError> {
    signal::kill(Pid::from_raw(pid as i32), sig).map_err(CommandError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{snapshot::StateSnapshot, DEFAULT_PUSH_INTERVAL};
    use assert_matches::assert_matches;
    use rstest::rstest;
    use std::path::PathBuf;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    fn sh(script: &str, log_output: LogOutput) -> CommandOSNotStarted {
        CommandOSNotStarted::new(&PathBuf::from("sh"), &["-c", script], log_output)
    }

    fn wait_for_lines(store: &StateStore, count: usize) -> Vec<(LogStream, String)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let lines: Vec<(LogStream, String)> = store
                .snapshot()
                .log
                .iter()
                .map(|e| (e.stream, e.text.clone()))
                .collect();
            if lines.len() >= count || Instant::now() > deadline {
                return lines;
            }
            sleep(Duration::from_millis(10));
        }
    }

    #[rstest]
    #[case::clean("exit 0", 0)]
    #[case::failure("exit 3", 3)]
    #[case::killed("kill -9 $$", 128 + 9)]
    #[case::terminated("kill -15 $$", 128 + 15)]
    fn exit_codes(#[case] script: &str, #[case] expected: i32) {
        let status = sh(script, LogOutput::Passthrough).start().unwrap().wait().unwrap();
        assert_eq!(exit_code(&status), expected);
    }

    #[test]
    fn captured_streams_are_tagged() {
        let store = StateStore::new(StateSnapshot::new(16), DEFAULT_PUSH_INTERVAL);
        let started = sh("echo out; echo err >&2", LogOutput::Capture)
            .start()
            .unwrap()
            .stream(&store)
            .unwrap();
        started.wait().unwrap();

        let mut lines = wait_for_lines(&store, 2);
        lines.sort_by_key(|(stream, _)| *stream == LogStream::Stderr);
        assert_eq!(
            lines,
            vec![
                (LogStream::Stdout, "out\n".to_string()),
                (LogStream::Stderr, "err\n".to_string()),
            ]
        );
    }

    #[test]
    fn passthrough_is_not_recorded() {
        let store = StateStore::new(StateSnapshot::new(16), DEFAULT_PUSH_INTERVAL);
        let started = sh("echo hidden", LogOutput::Passthrough)
            .start()
            .unwrap()
            .stream(&store)
            .unwrap();
        started.wait().unwrap();

        sleep(Duration::from_millis(50));
        assert!(store.snapshot().log.is_empty());
    }

    #[test]
    fn missing_executable_fails_to_start() {
        let result = CommandOSNotStarted::new(
            &PathBuf::from("/definitely/not/here"),
            &[] as &[&str],
            LogOutput::Both,
        )
        .start();
        assert_matches!(result, Err(CommandError::IOError(_)));
    }

    #[test]
    fn exit_watcher_leaves_pid_reserved_until_reaped() {
        let store = StateStore::new(StateSnapshot::new(16), DEFAULT_PUSH_INTERVAL);
        let mut started = sh("echo done", LogOutput::Capture)
            .start()
            .unwrap()
            .stream(&store)
            .unwrap();
        let pid = started.get_pid();

        started.exit_watcher().wait().unwrap();
        assert_eq!(wait_for_lines(&store, 1), vec![(LogStream::Stdout, "done\n".to_string())]);
        // Exited but not reaped: signals still reach the same process entry.
        assert_matches!(send_signal(pid, Signal::SIGCONT), Ok(()));

        assert_eq!(exit_code(&started.wait().unwrap()), 0);
        assert_matches!(
            send_signal(pid, Signal::SIGCONT),
            Err(CommandError::Signal(nix::Error::ESRCH))
        );
    }

    #[test]
    fn signal_to_gone_process_fails() {
        let started = sh("exit 0", LogOutput::Passthrough).start().unwrap();
        let pid = started.get_pid();
        started.wait().unwrap();

        assert_matches!(
            send_signal(pid, Signal::SIGTERM),
            Err(CommandError::Signal(nix::Error::ESRCH))
        );
    }
}
