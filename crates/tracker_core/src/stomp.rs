//! Minimal STOMP 1.2 frame codec for the client side of a broker session.
//!
//! A frame is `COMMAND EOL *(header EOL) EOL body NUL`. Brokers may pack
//! several frames into one WebSocket message and send bare EOLs as
//! heart-beats, so decoding works over a buffer of zero or more frames.

use std::fmt;

use crate::error::StompError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are exempt from escaping.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn connect(host: &str) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", "0,0")
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// First occurrence wins when a header is repeated.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            push_header_part(&mut out, name, escape);
            out.push(b':');
            push_header_part(&mut out, value, escape);
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Encoded frame as WebSocket text. Fails only for non-UTF-8 bodies.
    pub fn to_text(&self) -> Result<String, StompError> {
        String::from_utf8(self.encode()).map_err(|_| StompError::InvalidUtf8)
    }
}

fn push_header_part(out: &mut Vec<u8>, raw: &str, escape: bool) {
    if !escape {
        out.extend_from_slice(raw.as_bytes());
        return;
    }
    for ch in raw.chars() {
        match ch {
            '\\' => out.extend_from_slice(b"\\\\"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\n' => out.extend_from_slice(b"\\n"),
            ':' => out.extend_from_slice(b"\\c"),
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// Decodes every frame in `input`, skipping heart-beat EOLs between frames.
/// Fails on the first malformed frame.
pub fn decode_all(input: &[u8]) -> Result<Vec<Frame>, StompError> {
    decode_each(input).into_iter().collect()
}

/// Decodes frame by frame. A malformed frame yields one error and decoding
/// resumes after its NUL terminator.
pub fn decode_each(input: &[u8]) -> Vec<Result<Frame, StompError>> {
    let mut results = Vec::new();
    let mut rest = input;
    loop {
        rest = skip_eols(rest);
        if rest.is_empty() {
            return results;
        }
        match decode_one(rest) {
            Ok((frame, remaining)) => {
                results.push(Ok(frame));
                rest = remaining;
            }
            Err(err) => {
                results.push(Err(err));
                match rest.iter().position(|byte| *byte == 0) {
                    Some(nul) => rest = &rest[nul + 1..],
                    None => return results,
                }
            }
        }
    }
}

fn skip_eols(mut input: &[u8]) -> &[u8] {
    while let Some((first, tail)) = input.split_first() {
        if *first == b'\n' || *first == b'\r' {
            input = tail;
        } else {
            break;
        }
    }
    input
}

fn take_line(input: &[u8]) -> Result<(&str, &[u8]), StompError> {
    let end = input
        .iter()
        .position(|byte| *byte == b'\n')
        .ok_or(StompError::Incomplete)?;
    let line = input[..end].strip_suffix(b"\r").unwrap_or(&input[..end]);
    let line = std::str::from_utf8(line).map_err(|_| StompError::InvalidUtf8)?;
    Ok((line, &input[end + 1..]))
}

fn decode_one(input: &[u8]) -> Result<(Frame, &[u8]), StompError> {
    let (command_line, mut rest) = take_line(input)?;
    let command = Command::parse(command_line)
        .ok_or_else(|| StompError::UnknownCommand(command_line.to_string()))?;

    let mut headers = Vec::new();
    loop {
        let (line, remaining) = take_line(rest)?;
        rest = remaining;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let mut frame = Frame {
        command,
        headers,
        body: Vec::new(),
    };

    let body_len = match frame.header("content-length") {
        Some(raw) => {
            let len = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| StompError::InvalidContentLength(raw.to_string()))?;
            if rest.len() <= len || rest[len] != 0 {
                return Err(StompError::Incomplete);
            }
            len
        }
        None => rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(StompError::Incomplete)?,
    };

    frame.body = rest[..body_len].to_vec();
    Ok((frame, &rest[body_len + 1..]))
}

#[cfg(test)]
#[path = "tests/stomp_tests.rs"]
mod tests;
