use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file `{0}`: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("invalid config: `{0}`")]
    Parse(#[from] serde_yaml::Error),

    #[error("no program to supervise, set `program` or pass it after `--`")]
    MissingProgram,

    #[error("`log_max_size` must be greater than zero")]
    InvalidLogMaxSize,

    #[error("unknown signal `{0}`")]
    InvalidSignal(String),
}
