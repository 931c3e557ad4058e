use std::fmt;
use std::str::FromStr;

/// First line of every client connection, without its terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Build a definition sent by the client and reply with the image.
    BuildRequest,
    /// Reply with the pool status document.
    DiagnosticRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized command {0:?}")]
pub struct UnknownCommand(pub String);

impl Command {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Command::BuildRequest => "build_request",
            Command::DiagnosticRequest => "diagnostic_request",
        }
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build_request" => Ok(Command::BuildRequest),
            "diagnostic_request" => Ok(Command::DiagnosticRequest),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
