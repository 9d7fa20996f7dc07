//! Command grammar, response texts, and newline framing.
//!
//! Every command is a single line of the form `/verb arg1 arg2 ...`. Parsing
//! is positional: arguments are whitespace-separated tokens and message
//! bodies are rebuilt by joining the trailing tokens with single spaces, so
//! runs of whitespace inside a message collapse.

use std::{io, str::FromStr};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Grammar lines returned by `/?` and `/help`.
pub const HELP_LINES: &[&str] = &[
    "/join <server_ip> <port>",
    "/leave",
    "/register <handle>",
    "/store <filename>",
    "/dir",
    "/get <filename>",
    "/broadcast <message>",
    "/unicast <handle> <message>",
    "/?",
];

pub const JOIN_OK: &str = "Connection to the File Exchange Server is successful!";
pub const FAREWELL: &str = "Connection closed. Thank you!";
pub const DIRECTORY_HEADER: &str = "Server Directory";
pub const MESSAGE_SENT: &str = "Message sent.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Join,
    Leave,
    Register,
    Store,
    Dir,
    Get,
    Broadcast,
    Unicast,
    Help,
}

impl FromStr for Verb {
    type Err = CommandError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "/join" => Ok(Verb::Join),
            "/leave" => Ok(Verb::Leave),
            "/register" => Ok(Verb::Register),
            "/store" => Ok(Verb::Store),
            "/dir" => Ok(Verb::Dir),
            "/get" => Ok(Verb::Get),
            "/broadcast" => Ok(Verb::Broadcast),
            "/unicast" => Ok(Verb::Unicast),
            "/?" | "/help" => Ok(Verb::Help),
            _ => Err(CommandError::NotFound),
        }
    }
}

/// A parsed command line: the verb plus its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub args: Vec<String>,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().ok_or(CommandError::NotFound)?.parse()?;
        Ok(Self {
            verb,
            args: tokens.map(str::to_string).collect(),
        })
    }

    /// Returns the arguments when there are exactly `count` of them.
    pub fn exact_args(&self, count: usize) -> Result<&[String], CommandError> {
        if self.args.len() == count {
            Ok(&self.args)
        } else {
            Err(CommandError::BadArguments)
        }
    }

    /// Returns the arguments when there are at least `count` of them.
    pub fn min_args(&self, count: usize) -> Result<&[String], CommandError> {
        if self.args.len() >= count {
            Ok(&self.args)
        } else {
            Err(CommandError::BadArguments)
        }
    }

    /// Rejoins the arguments from `start` onwards into a message body.
    pub fn message_from(&self, start: usize) -> String {
        self.args.get(start..).unwrap_or_default().join(" ")
    }
}

/// Every failure a command can report. The `Display` text is the exact line
/// written back to the peer.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Error: Command not found.")]
    NotFound,
    #[error("Error: Command parameters do not match or is not allowed.")]
    BadArguments,
    #[error("Error: You must register before using this command.")]
    NotRegistered,
    #[error("Error: Connection to the Server has failed! Please check IP Address and Port Number.")]
    JoinFailed,
    #[error("Error: Registration failed. Handle or alias already exists.")]
    HandleTaken,
    #[error("Error: Registration failed. Invalid handle.")]
    InvalidHandle,
    #[error("Error: You are already registered as {0}.")]
    AlreadyRegistered(String),
    #[error("Error: Invalid filename.")]
    InvalidFilename,
    #[error("Error: Source file does not exist.")]
    SourceMissing,
    #[error("Error: File already exists on the server.")]
    AlreadyStored,
    #[error("Error: Unable to copy file. {0}")]
    UploadFailed(#[source] io::Error),
    #[error("Error: No files found.")]
    NoFiles,
    #[error("Error: File not found in the server.")]
    FileNotFound,
    #[error("Error: Unable to receive file. {0}")]
    DownloadFailed(#[source] io::Error),
    #[error("Error: Target handle not found.")]
    TargetNotFound,
}

pub fn broadcast_line(sender: &str, message: &str) -> String {
    format!("Broadcast from {sender}: {message}")
}

pub fn unicast_line(sender: &str, message: &str) -> String {
    format!("Message from {sender}: {message}")
}

/// Reads one newline-delimited line, stripping the line ending.
///
/// Returns `Ok(None)` at end of stream. Blank lines are returned as empty
/// strings rather than skipped. Invalid UTF-8 is replaced with U+FFFD so a
/// stray byte never ends the connection.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let bytes = reader.read_until(b'\n', &mut raw).await?;
    if bytes == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&raw);
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Frames `lines` into one newline-terminated buffer.
pub fn encode_lines<I, S>(lines: I) -> Vec<u8>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut encoded = Vec::new();
    for line in lines {
        encoded.extend_from_slice(line.as_ref().as_bytes());
        encoded.push(b'\n');
    }
    encoded
}
