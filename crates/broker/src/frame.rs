// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! STOMP 1.2 frame codec: `COMMAND\n(header:value\n)*\nBODY\0`.

use std::fmt;

/// A single newline is the STOMP heart-beat, both directions.
pub const HEARTBEAT: &str = "\n";

/// STOMP 1.2 commands, client- and server-originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Disconnect,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Message,
    Receipt,
    Error,
}

impl Command {
    const ALL: [Command; 15] = [
        Self::Connect,
        Self::Stomp,
        Self::Connected,
        Self::Disconnect,
        Self::Send,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Ack,
        Self::Nack,
        Self::Begin,
        Self::Commit,
        Self::Abort,
        Self::Message,
        Self::Receipt,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Disconnect => "DISCONNECT",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded STOMP frame.
///
/// Headers are kept in wire order; duplicate names are preserved and
/// [`Frame::header`] returns the first occurrence, per the STOMP spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    /// Builder-style header append.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    /// Replace the first occurrence of `name`, or append if absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        match self.headers.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.into(),
            None => self.headers.push((name.to_owned(), value.into())),
        }
    }

    /// Remove every occurrence of `name`.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| n != name);
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Encode to the STOMP wire form, NUL-terminated.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            escape(name, &mut out);
            out.push(':');
            escape(value, &mut out);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// One inbound transport message: either a heart-beat or a full frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(Frame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    UnknownCommand(String),
    MalformedHeader(String),
    BadEscape(String),
    BodyOutOfBounds,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand(cmd) => write!(f, "unknown STOMP command: {cmd}"),
            Self::MalformedHeader(line) => write!(f, "malformed header line: {line}"),
            Self::BadEscape(seq) => write!(f, "invalid header escape: {seq}"),
            Self::BodyOutOfBounds => f.write_str("content-length exceeds frame body"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Decode one inbound transport message.
///
/// An empty message (or one consisting only of EOLs) is a client
/// heart-beat. `content-length`, when present, bounds the body; otherwise
/// the body runs to the first NUL.
pub fn parse(input: &str) -> Result<Inbound, ParseError> {
    if input.bytes().all(|b| b == b'\n' || b == b'\r') {
        return Ok(Inbound::Heartbeat);
    }

    let (line, mut rest) = input.split_once('\n').unwrap_or((input, ""));
    let name = line.strip_suffix('\r').unwrap_or(line);
    let command =
        Command::parse(name).ok_or_else(|| ParseError::UnknownCommand(name.to_owned()))?;

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let (line, tail) = rest.split_once('\n').unwrap_or((rest, ""));
        let line = line.strip_suffix('\r').unwrap_or(line);
        rest = tail;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(line.to_owned()))?;
        headers.push((unescape(name)?, unescape(value)?));
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());

    let body = match content_length {
        Some(len) => rest.get(..len).ok_or(ParseError::BodyOutOfBounds)?,
        None => match rest.find('\0') {
            Some(idx) => &rest[..idx],
            None => rest,
        },
    };

    Ok(Inbound::Frame(Frame { command, headers, body: body.to_owned() }))
}

fn escape(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            _ => out.push(c),
        }
    }
}

fn unescape(s: &str) -> Result<String, ParseError> {
    if !s.contains('\\') {
        return Ok(s.to_owned());
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            other => {
                let seq = other.map(|c| c.to_string()).unwrap_or_default();
                return Err(ParseError::BadEscape(format!("\\{seq}")));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
