//! Entry point of the process supervisor.
//!
//! Parses the command line and configuration, sets up logging and the signal relay, then runs
//! the supervision loop until the supervised program's fate says the supervisor must exit.
use newrelic_proc_supervisor::cli::Cli;
use newrelic_proc_supervisor::config::SupervisorConfig;
use newrelic_proc_supervisor::dispatcher::{spawn_files_refresher, ControlHandle, SignalRelay};
use newrelic_proc_supervisor::state::snapshot::StateSnapshot;
use newrelic_proc_supervisor::state::StateStore;
use newrelic_proc_supervisor::supervisor::Supervisor;
use std::error::Error;
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = Cli::init();

    if cli.print_debug_info() {
        println!("Printing debug info");
        println!("CLI: {:#?}", cli);
        return ExitCode::SUCCESS;
    }

    match _main(cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            // Logging may not be up yet, so the error also goes to stderr.
            error!("{err}");
            eprintln!("newrelic-proc-supervisor: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Actual main, errors are reported once by [main].
fn _main(cli: Cli) -> Result<i32, Box<dyn Error>> {
    let config = SupervisorConfig::try_from(&cli)?;

    let snapshot = StateSnapshot::new(config.log_max_size);
    let store = StateStore::new(snapshot, config.push_interval.into());
    let _guard = config.log.try_init(Some(store.clone()))?;

    let (supervisor, dispatcher) =
        Supervisor::new(config.program.clone(), config.restart_policy(), store.clone())?;
    let supervisor = supervisor.with_log_output(config.log_output);

    let handle = ControlHandle::new(
        dispatcher.clone(),
        store,
        config.configuration_files.clone(),
    );
    if !config.configuration_files.is_empty() && !handle.refresh_files() {
        info!("some configuration files could not be read");
    }
    let refresher = config
        .files_refresh_interval
        .map(|interval| spawn_files_refresher(handle.clone(), interval.into()));

    let relay = SignalRelay::start(dispatcher)?;
    let result = supervisor.run();

    relay.stop();
    if let Some(refresher) = refresher {
        refresher.stop_blocking()?;
    }
    Ok(result?)
}
