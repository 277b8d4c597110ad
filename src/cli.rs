//! CLI domain: parse, route, output, and presentation only.
//! No orchestration logic; the route table dispatches to the orchestrator.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{format_entry, format_event_line, format_history, format_purge_report};
pub use route::RunContext;
