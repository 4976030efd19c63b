//! Operator commands and their one-line answers.

use crate::poller::{Phase, Poller, StartOutcome};
use crate::utils::format_duration;
use itertools::Itertools;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Sources,
    Help,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown command {0:?}; try `help`")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = s.trim().trim_start_matches('/').to_ascii_lowercase();
        match word.as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "status" => Ok(Command::Status),
            "sources" | "list-sources" => Ok(Command::Sources),
            "help" => Ok(Command::Help),
            _ => Err(UnknownCommand(s.trim().to_string())),
        }
    }
}

pub const HELP: &str = "commands: start, stop, status, sources, help";

/// Execute `cmd` against the poller and describe the outcome.
pub fn respond(cmd: Command, poller: &Poller) -> String {
    match cmd {
        Command::Start => match poller.start() {
            StartOutcome::AlreadyRunning => "polling already running".to_string(),
            StartOutcome::Started { delay } if delay.is_zero() => "polling started".to_string(),
            StartOutcome::Started { delay } => format!("polling starts in {}", format_duration(delay)),
        },
        Command::Stop => {
            if poller.request_stop() {
                "polling stopped".to_string()
            } else {
                "polling not running".to_string()
            }
        }
        Command::Status => {
            let status = poller.status();
            match (status.phase, status.starts_in, status.running_for) {
                (Phase::Idle, _, _) => "polling not running".to_string(),
                (_, Some(left), _) => format!("polling starts in {}", format_duration(left)),
                (_, _, Some(up)) => format!("polling running for {}", format_duration(up)),
                _ => "polling running for 0s".to_string(),
            }
        }
        Command::Sources => poller
            .sources()
            .iter()
            .map(|s| format!("{}: {}", s.name, s.url))
            .join("\n"),
        Command::Help => HELP.to_string(),
    }
}
