//! Pin control text protocol parser and response generator.
//!
//! Requests are single lines:
//! - `close`
//! - `<command> <pin>` where `<pin>` is a base-10 unsigned integer
//!
//! Every non-`close` request gets exactly one response line:
//! `ok`, `0`, `1`, `unknown`, `Unknown command: "<name>"`, `Error: <msg>`.
//! `close` is answered with `bye`.
//!
//! Names are echoed as the line reader decoded them, so invalid UTF-8 in a
//! command name comes back as U+FFFD.

use crate::gpio::Level;
use bytes::BytesMut;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// End the session
    Close,

    /// Named operation on a pin. The name is resolved later so unknown
    /// names can still be reported back verbatim.
    Pin { name: String, pin: u8 },
}

/// Operation a command name resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Input,
    Output,
    PullUp,
    PullDown,
    PullOff,
    High,
    Low,
    Toggle,
    Read,
}

impl Operation {
    /// Resolve a command name or its short alias. Case-sensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "input" | "in" => Operation::Input,
            "output" | "out" => Operation::Output,
            "pullup" | "pu" => Operation::PullUp,
            "pulldown" | "pd" => Operation::PullDown,
            "pulloff" | "po" => Operation::PullOff,
            "high" | "h" => Operation::High,
            "low" | "l" => Operation::Low,
            "toggle" | "t" => Operation::Toggle,
            "read" | "r" => Operation::Read,
            _ => return None,
        };
        Some(op)
    }
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Line is not `close` and not exactly two space-separated tokens
    #[error("parse error \"{0}\"")]
    Malformed(String),

    /// Pin token is not a usable unsigned integer
    #[error("bad pin number \"{0}\"")]
    BadPin(String),
}

/// Handling of pin numbers above 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PinOverflow {
    /// Narrow modulo 256 (`256` addresses pin 0)
    #[default]
    Wrap,
    /// Answer with a bad pin number error
    Reject,
}

/// Parser for the pin control protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct Parser {
    overflow: PinOverflow,
}

impl Parser {
    pub fn new(overflow: PinOverflow) -> Self {
        Self { overflow }
    }

    /// Parse one non-empty line.
    pub fn parse(&self, line: &str) -> Result<Command, ParseError> {
        if line == "close" {
            return Ok(Command::Close);
        }

        // Single-space split: repeated spaces yield empty tokens and fail here.
        let parts: Vec<&str> = line.split(' ').collect();
        let &[name, token] = parts.as_slice() else {
            return Err(ParseError::Malformed(line.to_string()));
        };

        let value: u64 = token
            .parse()
            .map_err(|_| ParseError::BadPin(token.to_string()))?;

        let pin = match self.overflow {
            PinOverflow::Wrap => value as u8,
            PinOverflow::Reject => {
                u8::try_from(value).map_err(|_| ParseError::BadPin(token.to_string()))?
            }
        };

        Ok(Command::Pin {
            name: name.to_string(),
            pin,
        })
    }
}

/// Response line sent back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    /// Result of a read; `None` is reported as `unknown`
    Level(Option<Level>),
    UnknownCommand(String),
    Error(String),
    Bye,
}

impl Response {
    /// Append the response and its line terminator to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(self.to_string().as_bytes());
        buf.extend_from_slice(b"\n");
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("ok"),
            Response::Level(Some(Level::Low)) => f.write_str("0"),
            Response::Level(Some(Level::High)) => f.write_str("1"),
            Response::Level(None) => f.write_str("unknown"),
            Response::UnknownCommand(name) => write!(f, "Unknown command: \"{}\"", name),
            Response::Error(msg) => write!(f, "Error: {}", msg),
            Response::Bye => f.write_str("bye"),
        }
    }
}
