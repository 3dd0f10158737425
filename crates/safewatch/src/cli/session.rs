//! Commands accepted on stdin while an alert session is running.

use std::fmt;
use std::str::FromStr;

use crate::alert::ResponseKind;

/// One line typed during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Cancel the alert, with the password if one was typed.
    Cancel(Option<String>),
    /// Resolve the alert.
    Resolve,
    /// Show the alert and relay status.
    Status,
    /// Show the relay's location history.
    History,
    /// Record a response on behalf of a contact.
    Respond {
        /// Responder id (also used as display name).
        responder: String,
        /// What the responder is doing.
        kind: ResponseKind,
        /// Optional note.
        message: Option<String>,
    },
    /// List responses.
    Responses,
    /// Show the available commands.
    Help,
    /// Leave the session. The alert keeps its status.
    Quit,
}

/// A line that is not a session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParseError(String);

impl fmt::Display for SessionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SessionParseError {}

/// Shown for `help` and after an unknown command.
pub const SESSION_HELP: &str = "\
commands:
  cancel <password>            cancel the alert
  resolve                      mark the alert resolved
  status                       alert and relay status
  history                      relayed locations
  respond <id> <kind> [note]   record a response (acknowledged, enroute, arrived, assisted, safe)
  responses                    list responses
  quit                         leave the session (the alert stays active)";

impl FromStr for SessionCommand {
    type Err = SessionParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(w, r)| (w, r.trim()));

        match word.to_ascii_lowercase().as_str() {
            "cancel" => Ok(Self::Cancel((!rest.is_empty()).then(|| rest.to_string()))),
            "resolve" => Ok(Self::Resolve),
            "status" => Ok(Self::Status),
            "history" => Ok(Self::History),
            "responses" => Ok(Self::Responses),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            "respond" => {
                let mut parts = rest.splitn(3, char::is_whitespace);
                let responder = parts
                    .next()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| SessionParseError("usage: respond <id> <kind> [note]".into()))?;
                let kind = parts
                    .next()
                    .ok_or_else(|| SessionParseError("usage: respond <id> <kind> [note]".into()))?
                    .parse::<ResponseKind>()
                    .map_err(|e| SessionParseError(e.to_string()))?;
                let message = parts
                    .next()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                Ok(Self::Respond {
                    responder: responder.to_string(),
                    kind,
                    message,
                })
            }
            "" => Err(SessionParseError("empty command".into())),
            other => Err(SessionParseError(format!("unknown command '{other}'"))),
        }
    }
}
