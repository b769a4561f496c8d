//! Dialback Protocol Definitions
//!
//! This crate defines the addressing, the minimal registration handshake and the
//! error taxonomy shared by the broker and the agent.

pub mod address;
pub mod duration;
pub mod error;
pub mod handshake;

pub use address::Address;
pub use duration::{parse_duration, DurationError};
pub use error::TunnelError;
pub use handshake::{
    is_head_complete, parse_request_head, parse_status_head, registration_request, status_response,
    success_response, RegistrationQuery, RequestHead, StatusHead, CANNED_BODY,
    HANDSHAKE_LOOKAHEAD, HANDSHAKE_VERSION, MAX_HEAD_SIZE, REGISTER_METHOD, SUCCESS_MARKER,
};

/// Default path the broker accepts registrations on
pub const DEFAULT_REGISTRATION_PATH: &str = "/tunnel";

/// The only transport network currently supported
pub const TRANSPORT_TCP: &str = "tcp";
