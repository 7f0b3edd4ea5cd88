pub mod commands;
pub mod output;

pub use commands::{BuildArgs, CliArgs, Commands, HealthArgs, RunArgs};
pub use output::{OutputFormat, OutputFormatter};
