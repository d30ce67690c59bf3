use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0} not piped")]
    StreamPipeError(String),

    #[error("{0}")]
    IOError(#[from] std::io::Error),

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    #[error("could not observe process exit: {0}")]
    Wait(nix::Error),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no program to supervise")]
    EmptyProgram,

    #[error("executable `{0}` not found: {1}")]
    ExecutableNotFound(String, which::Error),

    #[error("could not launch `{0}`: {1}")]
    Spawn(String, CommandError),

    #[error("supervisor event queue closed")]
    EventQueueClosed,
}
