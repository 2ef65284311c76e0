//! CLI domain: parse, route and output only.
//! No workflow logic; a single route table dispatches to the stage executor.

mod output;
mod parse;
mod route;

pub use output::map_error;
pub use parse::{CaseCommands, Cli, Commands, MessageCommands};
pub use route::RunContext;
