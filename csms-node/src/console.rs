//! Operator console: one command per stdin line, plus the snapshot table

use std::fmt::Write as _;

use csms_adapter_ocpp::ChargePointErrorCode;
use csms_core::{Command, SnapshotEntry};
use thiserror::Error;

pub const HELP: &str = "\
Commands:
  list                      show all charge points
  set <id> <amps>           change the current setpoint
  start <id> <amps>         remote start with a setpoint
  stop <id>                 remote stop the running transaction
  clear <id>                clear a latched fault (soft reset)
  fault <id> [code]         inject a fault into a simulated charge point
  drop <id>                 disconnect a simulated charge point
  remove <id>               forget a disconnected charge point
  help                      show this help
  quit                      shut down";

/// Parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    List,
    Submit { identity: String, command: Command },
    Fault { identity: String, code: ChargePointErrorCode },
    Drop { identity: String },
    Remove { identity: String },
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConsoleError {
    #[error("unknown command {0:?} (try 'help')")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid amps {0:?}")]
    InvalidAmps(String),

    #[error("unknown fault code {0:?}")]
    InvalidFaultCode(String),
}

/// Parse one line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&verb, rest)) = words.split_first() else {
        return Ok(None);
    };

    let command = match (verb.to_ascii_lowercase().as_str(), rest) {
        ("list" | "ls", []) => ConsoleCommand::List,
        ("help" | "?", _) => ConsoleCommand::Help,
        ("quit" | "exit", []) => ConsoleCommand::Quit,

        ("set", [identity, amps]) => ConsoleCommand::Submit {
            identity: identity.to_string(),
            command: Command::SetCurrent { amps: parse_amps(amps)? },
        },
        ("set", _) => return Err(ConsoleError::Usage("set <id> <amps>")),

        ("start", [identity, amps]) => ConsoleCommand::Submit {
            identity: identity.to_string(),
            command: Command::RemoteStart {
                setpoint_amps: parse_amps(amps)?,
            },
        },
        ("start", _) => return Err(ConsoleError::Usage("start <id> <amps>")),

        ("stop", [identity]) => ConsoleCommand::Submit {
            identity: identity.to_string(),
            command: Command::RemoteStop,
        },
        ("stop", _) => return Err(ConsoleError::Usage("stop <id>")),

        ("clear", [identity]) => ConsoleCommand::Submit {
            identity: identity.to_string(),
            command: Command::ClearFault,
        },
        ("clear", _) => return Err(ConsoleError::Usage("clear <id>")),

        ("fault", [identity]) => ConsoleCommand::Fault {
            identity: identity.to_string(),
            code: ChargePointErrorCode::OtherError,
        },
        ("fault", [identity, code]) => ConsoleCommand::Fault {
            identity: identity.to_string(),
            code: code
                .parse()
                .map_err(|_| ConsoleError::InvalidFaultCode(code.to_string()))?,
        },
        ("fault", _) => return Err(ConsoleError::Usage("fault <id> [code]")),

        ("drop", [identity]) => ConsoleCommand::Drop {
            identity: identity.to_string(),
        },
        ("drop", _) => return Err(ConsoleError::Usage("drop <id>")),

        ("remove", [identity]) => ConsoleCommand::Remove {
            identity: identity.to_string(),
        },
        ("remove", _) => return Err(ConsoleError::Usage("remove <id>")),

        _ => return Err(ConsoleError::UnknownCommand(verb.to_string())),
    };
    Ok(Some(command))
}

fn parse_amps(raw: &str) -> Result<f64, ConsoleError> {
    match raw.parse::<f64>() {
        Ok(amps) if amps.is_finite() => Ok(amps),
        _ => Err(ConsoleError::InvalidAmps(raw.to_string())),
    }
}

/// Render the snapshot as a fixed-width table
pub fn render_snapshot(entries: &[SnapshotEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<12} {:>4} {:>8} {:>8} {:>9} {:<5} {:<16} {}",
        "IDENTITY", "STATE", "CODE", "AMPS", "SETPOINT", "POWER kW", "CONN", "FAULT", "LAST SEEN"
    );

    if entries.is_empty() {
        out.push_str("(no charge points)");
        return out;
    }

    for entry in entries {
        let _ = writeln!(
            out,
            "{:<20} {:<12} {:>4} {:>8.1} {:>8.1} {:>9.2} {:<5} {:<16} {}",
            truncate(&entry.identity, 20),
            entry.state.to_string(),
            entry.status_code,
            entry.current_amps,
            entry.setpoint_amps,
            entry.active_power_w / 1000.0,
            if entry.connected { "yes" } else { "no" },
            entry.fault_code.as_deref().unwrap_or("-"),
            entry
                .last_seen
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    out.truncate(out.trim_end().len());
    out
}

/// Truncate string with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
