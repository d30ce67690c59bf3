pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod logging;
pub mod state;
pub mod supervisor;
pub mod utils;
