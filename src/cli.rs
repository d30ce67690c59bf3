use crate::config::RestartSignal;
use crate::supervisor::policy::OnExit;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command line arguments, as parsed by [`clap`].
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    /// YAML configuration file. Command line values take precedence over it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// What to do when the program exits on its own.
    #[arg(long, value_enum)]
    on_exit: Option<OnExit>,

    /// Comma separated files exposed in the supervisor state.
    #[arg(long, value_delimiter = ',')]
    files: Option<Vec<PathBuf>>,

    /// Signal asking the program to exit during a restart (e.g. SIGINT, TERM).
    #[arg(long)]
    restart_signal: Option<RestartSignal>,

    /// Time the program gets to exit after the restart signal before it is killed.
    #[arg(long, value_parser = parse_duration_arg)]
    restart_timeout: Option<Duration>,

    #[arg(long)]
    print_debug_info: bool,

    /// Program to supervise, followed by its arguments.
    #[arg(last = true)]
    program: Vec<String>,
}

impl Cli {
    /// Parses command line arguments
    pub fn init() -> Self {
        Self::parse()
    }

    pub fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    pub fn on_exit(&self) -> Option<OnExit> {
        self.on_exit
    }

    pub fn files(&self) -> Option<&[PathBuf]> {
        self.files.as_deref()
    }

    pub fn restart_signal(&self) -> Option<RestartSignal> {
        self.restart_signal
    }

    pub fn restart_timeout(&self) -> Option<Duration> {
        self.restart_timeout
    }

    pub fn program(&self) -> &[String] {
        &self.program
    }

    pub fn print_debug_info(&self) -> bool {
        self.print_debug_info
    }
}

fn parse_duration_arg(arg: &str) -> Result<Duration, String> {
    duration_str::parse(arg)
}
