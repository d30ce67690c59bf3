use super::backoff::Backoff;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_RESTART_SIGNAL: Signal = Signal::SIGINT;
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// What happens to the supervisor once the program exits on its own.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnExit {
    /// Relaunch after a backoff delay.
    Restart,
    /// Wait for an operator to start the program again.
    Ignore,
    /// Exit with the program's exit code.
    #[default]
    Proxy,
}

impl fmt::Display for OnExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnExit::Restart => write!(f, "restart"),
            OnExit::Ignore => write!(f, "ignore"),
            OnExit::Proxy => write!(f, "proxy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub on_exit: OnExit,
    /// Sent to the program to ask it to exit during a restart.
    pub restart_signal: Signal,
    /// How long the program gets to exit after `restart_signal` before being killed.
    pub restart_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(OnExit::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    Relaunch(Duration),
    AwaitManualStart,
    Terminate(i32),
}

impl RestartPolicy {
    pub fn new(on_exit: OnExit) -> Self {
        Self {
            on_exit,
            restart_signal: DEFAULT_RESTART_SIGNAL,
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
        }
    }

    pub fn with_restart_signal(self, restart_signal: Signal) -> Self {
        Self {
            restart_signal,
            ..self
        }
    }

    pub fn with_restart_timeout(self, restart_timeout: Duration) -> Self {
        Self {
            restart_timeout,
            ..self
        }
    }

    /// The program is waited for manually only under [OnExit::Ignore].
    pub fn is_manual(&self) -> bool {
        self.on_exit == OnExit::Ignore
    }

    /// Decides what follows an exit. An exit provoked by an operator restart always relaunches
    /// right away and starts the backoff sequence over.
    pub fn decide(&self, exit_code: i32, requested_restart: bool, backoff: &mut Backoff) -> ExitAction {
        if requested_restart {
            backoff.reset();
            return ExitAction::Relaunch(Duration::ZERO);
        }
        match self.on_exit {
            OnExit::Restart if exit_code == 0 => {
                backoff.reset();
                ExitAction::Relaunch(Duration::ZERO)
            }
            OnExit::Restart => ExitAction::Relaunch(backoff.next_delay()),
            OnExit::Ignore => ExitAction::AwaitManualStart,
            OnExit::Proxy => ExitAction::Terminate(exit_code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::restart_clean(OnExit::Restart, 0, false, ExitAction::Relaunch(Duration::ZERO))]
    #[case::restart_failed(OnExit::Restart, 1, false, ExitAction::Relaunch(Duration::from_millis(100)))]
    #[case::ignore(OnExit::Ignore, 3, false, ExitAction::AwaitManualStart)]
    #[case::proxy(OnExit::Proxy, 7, false, ExitAction::Terminate(7))]
    #[case::proxy_requested(OnExit::Proxy, 130, true, ExitAction::Relaunch(Duration::ZERO))]
    #[case::ignore_requested(OnExit::Ignore, 2, true, ExitAction::Relaunch(Duration::ZERO))]
    #[case::restart_requested(OnExit::Restart, 1, true, ExitAction::Relaunch(Duration::ZERO))]
    fn decide(
        #[case] on_exit: OnExit,
        #[case] exit_code: i32,
        #[case] requested: bool,
        #[case] expected: ExitAction,
    ) {
        let mut backoff = Backoff::default();
        assert_eq!(
            RestartPolicy::new(on_exit).decide(exit_code, requested, &mut backoff),
            expected
        );
    }

    #[test]
    fn clean_exits_never_wait() {
        let policy = RestartPolicy::new(OnExit::Restart);
        let mut backoff = Backoff::default();
        for _ in 0..20 {
            assert_eq!(
                policy.decide(0, false, &mut backoff),
                ExitAction::Relaunch(Duration::ZERO)
            );
        }
    }

    #[test]
    fn failures_grow_until_clean_exit() {
        let policy = RestartPolicy::new(OnExit::Restart);
        let mut backoff = Backoff::default();

        let delays: Vec<ExitAction> = (0..3).map(|_| policy.decide(1, false, &mut backoff)).collect();
        assert_eq!(
            delays,
            vec![
                ExitAction::Relaunch(Duration::from_millis(100)),
                ExitAction::Relaunch(Duration::from_millis(200)),
                ExitAction::Relaunch(Duration::from_millis(400)),
            ]
        );

        assert_eq!(policy.decide(0, false, &mut backoff), ExitAction::Relaunch(Duration::ZERO));
        assert_eq!(
            policy.decide(1, false, &mut backoff),
            ExitAction::Relaunch(Duration::from_millis(100))
        );
    }

    #[test]
    fn requested_restart_resets_backoff() {
        let policy = RestartPolicy::new(OnExit::Restart);
        let mut backoff = Backoff::default();
        policy.decide(1, false, &mut backoff);
        policy.decide(1, false, &mut backoff);

        policy.decide(143, true, &mut backoff);
        assert_eq!(backoff.tries(), 0);
    }

    #[test]
    fn defaults() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.on_exit, OnExit::Proxy);
        assert_eq!(policy.restart_signal, Signal::SIGINT);
        assert_eq!(policy.restart_timeout, Duration::from_secs(30));
        assert!(!policy.is_manual());
        assert!(RestartPolicy::new(OnExit::Ignore).is_manual());
    }

    #[rstest]
    #[case("restart", OnExit::Restart)]
    #[case("ignore", OnExit::Ignore)]
    #[case("proxy", OnExit::Proxy)]
    fn on_exit_from_yaml(#[case] input: &str, #[case] expected: OnExit) {
        assert_eq!(serde_yaml::from_str::<OnExit>(input).unwrap(), expected);
    }

    #[test]
    fn unknown_on_exit_is_rejected() {
        assert!(serde_yaml::from_str::<OnExit>("respawn").is_err());
    }
}
