//! FTP control-channel line codec.
//!
//! Requests travel client → server as `METHOD [argument]\r\n`; replies travel
//! server → client as `CODE reason [text]\r\n`.  Only the commands a load
//! generator needs are modelled.  Anything else parses as [`Method::Unknown`]
//! so a server can still answer it with 502.

use std::fmt;
use thiserror::Error;

/// Line terminator used by every control-channel message.
pub const CRLF: &str = "\r\n";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("method has no wire representation")]
    UnknownMethod,
    #[error("unknown status code {0}")]
    UnknownStatus(u16),
    #[error("line is not CRLF terminated")]
    NotTerminated,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("malformed response: {0}")]
    BadResponse(String),
    #[error("malformed PORT string: {0}")]
    BadPortString(String),
    #[error("malformed PASV reply: {0}")]
    BadPasvReply(String),
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    User,
    Pass,
    Type,
    Port,
    Pasv,
    Mode,
    Stor,
    Retr,
    Quit,
    /// Anything not in the table above.
    Unknown,
}

impl Method {
    /// Every method with a wire representation.
    pub const KNOWN: [Method; 9] = [
        Method::User,
        Method::Pass,
        Method::Type,
        Method::Port,
        Method::Pasv,
        Method::Mode,
        Method::Stor,
        Method::Retr,
        Method::Quit,
    ];

    pub fn as_str(self) -> Option<&'static str> {
        Some(match self {
            Method::User => "USER",
            Method::Pass => "PASS",
            Method::Type => "TYPE",
            Method::Port => "PORT",
            Method::Pasv => "PASV",
            Method::Mode => "MODE",
            Method::Stor => "STOR",
            Method::Retr => "RETR",
            Method::Quit => "QUIT",
            Method::Unknown => return None,
        })
    }

    /// Case-insensitive lookup of a command token.
    pub fn from_token(token: &str) -> Self {
        Self::KNOWN
            .iter()
            .copied()
            .find(|m| m.as_str().is_some_and(|s| s.eq_ignore_ascii_case(token)))
            .unwrap_or(Method::Unknown)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("UNKNOWN"))
    }
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Reply codes understood by both sides.
///
/// `Invalid` is the sentinel produced when a reply carries a well-formed but
/// unrecognised number.  Clients must treat it as a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    DataConnAlreadyOpen,
    FileStatusOk,
    Ok,
    ServiceReady,
    ClosingDataConn,
    EnteringPassiveMode,
    UserLoggedIn,
    FileActionComplete,
    NeedPassword,
    DataConnFailed,
    TransferAborted,
    ActionNotTaken,
    SyntaxError,
    NotImplemented,
    NotLoggedIn,
    Invalid,
}

impl StatusCode {
    pub const KNOWN: [StatusCode; 15] = [
        StatusCode::DataConnAlreadyOpen,
        StatusCode::FileStatusOk,
        StatusCode::Ok,
        StatusCode::ServiceReady,
        StatusCode::ClosingDataConn,
        StatusCode::EnteringPassiveMode,
        StatusCode::UserLoggedIn,
        StatusCode::FileActionComplete,
        StatusCode::NeedPassword,
        StatusCode::DataConnFailed,
        StatusCode::TransferAborted,
        StatusCode::ActionNotTaken,
        StatusCode::SyntaxError,
        StatusCode::NotImplemented,
        StatusCode::NotLoggedIn,
    ];

    pub fn from_u16(value: u16) -> Self {
        match value {
            125 => StatusCode::DataConnAlreadyOpen,
            150 => StatusCode::FileStatusOk,
            200 => StatusCode::Ok,
            220 => StatusCode::ServiceReady,
            226 => StatusCode::ClosingDataConn,
            227 => StatusCode::EnteringPassiveMode,
            230 => StatusCode::UserLoggedIn,
            250 => StatusCode::FileActionComplete,
            331 => StatusCode::NeedPassword,
            425 => StatusCode::DataConnFailed,
            426 => StatusCode::TransferAborted,
            452 => StatusCode::ActionNotTaken,
            500 => StatusCode::SyntaxError,
            502 => StatusCode::NotImplemented,
            530 => StatusCode::NotLoggedIn,
            _ => StatusCode::Invalid,
        }
    }

    /// Numeric value on the wire; 0 for the invalid sentinel.
    pub fn to_u16(self) -> u16 {
        match self {
            StatusCode::DataConnAlreadyOpen => 125,
            StatusCode::FileStatusOk => 150,
            StatusCode::Ok => 200,
            StatusCode::ServiceReady => 220,
            StatusCode::ClosingDataConn => 226,
            StatusCode::EnteringPassiveMode => 227,
            StatusCode::UserLoggedIn => 230,
            StatusCode::FileActionComplete => 250,
            StatusCode::NeedPassword => 331,
            StatusCode::DataConnFailed => 425,
            StatusCode::TransferAborted => 426,
            StatusCode::ActionNotTaken => 452,
            StatusCode::SyntaxError => 500,
            StatusCode::NotImplemented => 502,
            StatusCode::NotLoggedIn => 530,
            StatusCode::Invalid => 0,
        }
    }

    /// Fixed reason phrase sent after the number.
    pub fn reason(self) -> Option<&'static str> {
        Some(match self {
            StatusCode::DataConnAlreadyOpen => "Data connection already open; transfer starting.",
            StatusCode::FileStatusOk => "File status okay; about to open data connection.",
            StatusCode::Ok => "Command okay.",
            StatusCode::ServiceReady => "Service ready, proceed.",
            StatusCode::ClosingDataConn => "File transfer complete, closing data connection.",
            StatusCode::EnteringPassiveMode => "Entering passive mode",
            StatusCode::UserLoggedIn => "User Logged in, proceed.",
            StatusCode::FileActionComplete => "Requested file action okay, completed.",
            StatusCode::NeedPassword => "User name okay, need password.",
            StatusCode::DataConnFailed => "Can't open data connection.",
            StatusCode::TransferAborted => "Connection closed; transfer aborted.",
            StatusCode::ActionNotTaken => "Requested action not taken.",
            StatusCode::SyntaxError => "Syntax Error, command unrecognized.",
            StatusCode::NotImplemented => "Command not implemented.",
            StatusCode::NotLoggedIn => "Not logged in.",
            StatusCode::Invalid => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Invalid => f.write_str("INVALID"),
            code => write!(f, "{}", code.to_u16()),
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// `METHOD [token]\r\n`.  The token is omitted when empty.
pub fn build_request_line(method: Method, token: &str) -> Result<String, ProtocolError> {
    let name = method.as_str().ok_or(ProtocolError::UnknownMethod)?;
    let mut line = String::with_capacity(name.len() + token.len() + 3);
    line.push_str(name);
    if !token.is_empty() {
        line.push(' ');
        line.push_str(token);
    }
    line.push_str(CRLF);
    Ok(line)
}

/// `CODE reason [text]\r\n`.  The text is omitted when empty.
pub fn build_status_line(code: StatusCode, text: &str) -> Result<String, ProtocolError> {
    let reason = code
        .reason()
        .ok_or(ProtocolError::UnknownStatus(code.to_u16()))?;
    let mut line = format!("{} {}", code.to_u16(), reason);
    if !text.is_empty() {
        line.push(' ');
        line.push_str(text);
    }
    line.push_str(CRLF);
    Ok(line)
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Index one past the first `\r\n` in `buf`, if any.
pub fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|i| i + 2)
}

/// Split off the text of the first complete line (without its CRLF).
fn first_line(bytes: &[u8]) -> Result<&[u8], ProtocolError> {
    let end = find_line_end(bytes).ok_or(ProtocolError::NotTerminated)?;
    Ok(&bytes[..end - 2])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The command token exactly as received.
    pub token: String,
    pub method: Method,
    pub argument: String,
}

/// Parse one request line.
///
/// Grammar: a run of ASCII letters, an optional single space, then free text
/// up to the first CRLF.
pub fn parse_request_line(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let line = first_line(bytes)?;
    let line = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::BadRequest("not valid UTF-8".into()))?;

    let split = line
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(line.len());
    if split == 0 {
        return Err(ProtocolError::BadRequest(line.to_string()));
    }

    let (token, rest) = line.split_at(split);
    let argument = rest.strip_prefix(' ').unwrap_or(rest);
    Ok(Request {
        token: token.to_string(),
        method: Method::from_token(token),
        argument: argument.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: StatusCode,
    /// The number as sent, kept for logging when `code` is `Invalid`.
    pub raw_code: u16,
    /// Everything after the separating space (reason phrase and extra text).
    pub text: String,
}

impl Response {
    /// Text that follows the fixed reason phrase, if the reply carries any.
    pub fn optional_text(&self) -> Option<&str> {
        let reason = self.code.reason()?;
        self.text
            .strip_prefix(reason)
            .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
            .filter(|rest| !rest.is_empty())
    }
}

/// Parse one reply line.
///
/// Grammar: decimal code, exactly one space, at least one character of text,
/// CRLF.  An unrecognised code yields [`StatusCode::Invalid`] rather than an
/// error.
pub fn parse_response_line(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let line = first_line(bytes)?;
    let line = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::BadResponse("not valid UTF-8".into()))?;

    let digits = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(line.len());
    if digits == 0 {
        return Err(ProtocolError::BadResponse(line.to_string()));
    }
    let raw_code: u16 = line[..digits]
        .parse()
        .map_err(|_| ProtocolError::BadResponse(line.to_string()))?;

    let text = line[digits..]
        .strip_prefix(' ')
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProtocolError::BadResponse(line.to_string()))?;

    Ok(Response {
        code: StatusCode::from_u16(raw_code),
        raw_code,
        text: text.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
