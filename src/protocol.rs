//! Memcached text protocol framing for the proxy.
//!
//! The proxy never interprets values; it only needs enough of the text
//! protocol to know where a request ends and when a response is complete:
//! - command detection from the first line of a request
//! - request item counting (keys of a `get`, lines of a `set`)
//! - `VALUE` line counting in a multi-key `get` response

use bytes::BytesMut;

/// Commands the proxy distinguishes. `NotDetected` means the first token
/// has not fully arrived yet; a completed `Unknown` command closes the
/// session instead of being forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    NotDetected,
    Get,
    Set,
    Delete,
    Quit,
    Unknown,
}

/// Detect the command from the start of a request buffer.
///
/// Called after every client read, so the buffer may hold only a prefix of
/// the first token; in that case detection stays `NotDetected` until the
/// token is terminated by a space or CRLF.
pub fn detect_command(buf: &[u8]) -> Command {
    let token_end = buf
        .iter()
        .position(|&b| b == b' ' || b == b'\r')
        .unwrap_or(buf.len());
    let token = &buf[..token_end];

    let complete = token_end < buf.len();
    match token {
        b"get" | b"gets" if complete => Command::Get,
        b"set" if complete => Command::Set,
        b"delete" if complete => Command::Delete,
        b"quit" if complete => Command::Quit,
        _ => {
            if complete {
                Command::Unknown
            } else if is_command_prefix(token) {
                Command::NotDetected
            } else {
                Command::Unknown
            }
        }
    }
}

fn is_command_prefix(token: &[u8]) -> bool {
    const NAMES: [&[u8]; 5] = [b"get", b"gets", b"set", b"delete", b"quit"];
    NAMES.iter().any(|name| name.starts_with(token))
}

/// Count the logical items of a request.
///
/// For `get`/`gets` this is the number of keys on the (possibly partial)
/// first line; the session later waits for that many `VALUE` lines. For
/// `set` it is the number of complete CRLF-terminated lines, so the session
/// can tell whether the payload line has arrived (`>= 2`).
pub fn count_request_items(cmd: Command, buf: &[u8]) -> usize {
    match cmd {
        Command::Get => {
            let line_end = buf.iter().position(|&b| b == b'\r').unwrap_or(buf.len());
            let line = &buf[..line_end];
            line.split(|&b| b == b' ')
                .filter(|tok| !tok.is_empty())
                .count()
                .saturating_sub(1) // drop the command token
        }
        Command::Set => count_crlf(buf),
        _ => 0,
    }
}

/// Count `VALUE` lines in a `get` response buffer.
pub fn count_value_lines(buf: &[u8]) -> usize {
    let mut count = 0;
    let mut at_line_start = true;
    let mut i = 0;
    while i < buf.len() {
        if at_line_start && buf[i..].starts_with(b"VALUE ") {
            count += 1;
        }
        at_line_start = buf[i] == b'\n';
        i += 1;
    }
    count
}

/// Whether the buffer ends with the protocol terminator.
pub fn ends_with_crlf(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[buf.len() - 2] == b'\r' && buf[buf.len() - 1] == b'\n'
}

fn count_crlf(buf: &[u8]) -> usize {
    let mut count = 0;
    for i in 1..buf.len() {
        if buf[i - 1] == b'\r' && buf[i] == b'\n' {
            count += 1;
        }
    }
    count
}

/// Response fragments the proxy itself produces (health probe expectations
/// and the stats surface).
pub struct Response;

impl Response {
    /// Generate a VALUE response line
    pub fn value(key: &str, flags: u32, data: &[u8]) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("VALUE {} {} {}\r\n", key, flags, data.len()).as_bytes());
        response.extend_from_slice(data);
        response.extend_from_slice(b"\r\n");
        response
    }

    /// Generate END response
    pub fn end() -> &'static [u8] {
        b"END\r\n"
    }

    /// Generate STORED response
    pub fn stored() -> &'static [u8] {
        b"STORED\r\n"
    }

    /// Generate DELETED response
    pub fn deleted() -> &'static [u8] {
        b"DELETED\r\n"
    }

    /// Generate OK response
    pub fn ok() -> &'static [u8] {
        b"OK\r\n"
    }

    /// Generate ERROR response
    pub fn error() -> &'static [u8] {
        b"ERROR\r\n"
    }

    /// Generate a STAT line
    pub fn stat(name: &str, value: &str) -> BytesMut {
        let mut response = BytesMut::new();
        response.extend_from_slice(format!("STAT {} {}\r\n", name, value).as_bytes());
        response
    }
}
