//! Minimal registration handshake
//!
//! The handshake is deliberately not a conforming HTTP exchange. The agent
//! writes a single request line followed by a blank line:
//!
//! ```text
//! CONNECT /tunnel?name=svc HTTP/1.0\n\n
//! ```
//!
//! The broker answers only when a consumer dials that name, with a status
//! line, a blank line and [`CANNED_BODY`]. Everything after the canned body
//! belongs to the opaque tunnel stream.
//!
//! The agent reads the response through a buffered reader holding at most
//! [`HANDSHAKE_LOOKAHEAD`] bytes. Because the canned body is at least that
//! long, whatever the reader pulled in beyond the head is a prefix of the
//! body and never tunnel data. The agent then discards exactly
//! `CANNED_BODY.len() - buffered` more bytes from the raw stream. Changing
//! either constant without the other corrupts the start of every session.

use crate::TunnelError;

/// Request method used to register a parked connection
pub const REGISTER_METHOD: &str = "CONNECT";

/// Version token written on request and status lines
pub const HANDSHAKE_VERSION: &str = "HTTP/1.0";

/// Reason phrase of the success status line
pub const SUCCESS_MARKER: &str = "Connected to dialback";

/// Capacity of the agent's buffered reader while parsing the response head
pub const HANDSHAKE_LOOKAHEAD: usize = 16;

/// Padding sent after the success head
pub const CANNED_BODY: &[u8] = b"---- dialback tunnel ready ----\n";

/// Upper bound on a request or response head
pub const MAX_HEAD_SIZE: usize = 4096;

const _: () = assert!(CANNED_BODY.len() >= HANDSHAKE_LOOKAHEAD);

const MAX_HEADERS: usize = 16;

/// Parsed request line of a registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
}

/// Parsed status line of a broker response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusHead {
    pub code: u16,
    pub reason: String,
}

impl StatusHead {
    /// Whether this is the broker's tunnel-established line
    pub fn is_success(&self) -> bool {
        self.code == 200 && self.reason == SUCCESS_MARKER
    }
}

impl std::fmt::Display for StatusHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// Request line written by the agent
pub fn registration_request(path: &str) -> String {
    format!("{} {} {}\n\n", REGISTER_METHOD, path, HANDSHAKE_VERSION)
}

/// Full success response written by the broker when a dial claims a connection
pub fn success_response() -> Vec<u8> {
    let mut response = status_response(200).into_bytes();
    response.extend_from_slice(CANNED_BODY);
    response
}

/// Status line plus blank line for `code`
pub fn status_response(code: u16) -> String {
    format!("{} {} {}\n\n", HANDSHAKE_VERSION, code, reason_phrase(code))
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => SUCCESS_MARKER,
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Whether `buf` ends with the blank line terminating a head
pub fn is_head_complete(buf: &[u8]) -> bool {
    buf.ends_with(b"\n\n") || buf.ends_with(b"\n\r\n")
}

/// Parse a complete request head
pub fn parse_request_head(buf: &[u8]) -> Result<RequestHead, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf) {
        Ok(httparse::Status::Complete(_)) => Ok(RequestHead {
            method: request.method.unwrap_or_default().to_string(),
            target: request.path.unwrap_or_default().to_string(),
        }),
        Ok(httparse::Status::Partial) => {
            Err(TunnelError::Malformed("incomplete request head".to_string()))
        }
        Err(e) => Err(TunnelError::Malformed(format!("request head: {}", e))),
    }
}

/// Parse a complete status head
pub fn parse_status_head(buf: &[u8]) -> Result<StatusHead, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf) {
        Ok(httparse::Status::Complete(_)) => Ok(StatusHead {
            code: response.code.unwrap_or_default(),
            reason: response.reason.unwrap_or_default().to_string(),
        }),
        Ok(httparse::Status::Partial) => {
            Err(TunnelError::Malformed("incomplete status head".to_string()))
        }
        Err(e) => Err(TunnelError::Malformed(format!("status head: {}", e))),
    }
}

/// Path and query parameters of a registration request target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationQuery {
    pub path: String,
    pub name: Option<String>,
    pub timeout: Option<String>,
}

impl RegistrationQuery {
    pub fn parse(target: &str) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let mut parsed = Self {
            path: path.to_string(),
            ..Default::default()
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "name" if parsed.name.is_none() => parsed.name = Some(value.into_owned()),
                "timeout" if parsed.timeout.is_none() => {
                    parsed.timeout = Some(value.into_owned())
                }
                _ => {}
            }
        }

        parsed
    }
}
