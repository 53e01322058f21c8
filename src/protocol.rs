//! Wire-level framing for the camera-controller text protocol.
//!
//! Commands are single lines terminated by `\n`. A reply is accepted only
//! when its final whitespace-separated token is the literal sentinel `DONE`;
//! an `ERROR` token anywhere, or any other terminator, fails the command.

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 256;
pub const MAX_REPLY_SIZE: usize = 4096;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;

pub const DONE_REPLY: &str = "DONE";
pub const ERROR_REPLY: &str = "ERROR";

pub const EXPOSE_COMMAND: &str = "expose";
pub const CLEAR_COMMAND: &str = "clear";
pub const STATUS_COMMAND: &str = "status";

pub const SHUTTER_OPEN: &str = "open";
pub const SHUTTER_CLOSED: &str = "closed";

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("command exceeds {MAX_COMMAND_SIZE} bytes")]
    CommandTooLarge,
    #[error("reply exceeds {MAX_REPLY_SIZE} bytes")]
    ReplyTooLarge,
    #[error("reply not terminated by {DONE_REPLY}: {0}")]
    BadTerminator(String),
    #[error("controller reported an error: {0}")]
    ErrorReply(String),
    #[error("malformed exposure reply: {0}")]
    MalformedExposureReply(String),
    #[error("unable to parse status payload: {0}")]
    StatusParse(String),
}

/// Controller state snapshot from the status channel.
///
/// Parsing is strict: a payload missing any field is rejected rather than
/// defaulted, so a half-written reply can never read as idle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerStatus {
    pub ready: bool,
    pub exposing: bool,
    pub error_code: i32,
    pub state: String,
}

impl ControllerStatus {
    pub fn is_idle(&self) -> bool {
        self.ready && !self.exposing && self.error_code == 0
    }
}

/// Build an exposure command line (without the trailing newline).
pub fn expose_command(
    shutter_open: bool,
    exposure_s: f64,
    name: &str,
) -> Result<CommandBuffer, ProtocolError> {
    let shutter = if shutter_open {
        SHUTTER_OPEN
    } else {
        SHUTTER_CLOSED
    };
    let mut buffer = CommandBuffer::new();
    write!(buffer, "{EXPOSE_COMMAND} {shutter} {exposure_s:9.3} {name}")
        .map_err(|_| ProtocolError::CommandTooLarge)?;
    Ok(buffer)
}

/// Build a controller clear command line.
pub fn clear_command(clear_time_s: u64) -> Result<CommandBuffer, ProtocolError> {
    let mut buffer = CommandBuffer::new();
    write!(buffer, "{CLEAR_COMMAND} {clear_time_s}").map_err(|_| ProtocolError::CommandTooLarge)?;
    Ok(buffer)
}

/// Validate the `DONE` sentinel and strip it, returning the payload.
///
/// Failure modes are distinct so callers can log them apart: an explicit
/// `ERROR` token means the controller rejected the command, anything else
/// ending the line means the reply is untrustworthy.
pub fn accept_reply(reply: &str) -> Result<&str, ProtocolError> {
    if reply.len() > MAX_REPLY_SIZE {
        return Err(ProtocolError::ReplyTooLarge);
    }
    let trimmed = reply.trim();
    if trimmed.split_whitespace().any(|token| token == ERROR_REPLY) {
        return Err(ProtocolError::ErrorReply(trimmed.to_string()));
    }
    match trimmed.rsplit_once(char::is_whitespace) {
        Some((payload, sentinel)) if sentinel == DONE_REPLY => Ok(payload.trim_end()),
        None if trimmed == DONE_REPLY => Ok(""),
        _ => Err(ProtocolError::BadTerminator(trimmed.to_string())),
    }
}

/// Extract the actual shutter-open seconds from an accepted exposure payload.
pub fn parse_exposure_payload(payload: &str) -> Result<f64, ProtocolError> {
    payload
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .ok_or_else(|| ProtocolError::MalformedExposureReply(payload.to_string()))
}

/// Parse an accepted status payload (a JSON object) into [`ControllerStatus`].
pub fn parse_status_payload(payload: &str) -> Result<ControllerStatus, ProtocolError> {
    serde_json::from_str(payload).map_err(|e| ProtocolError::StatusParse(format!("{payload}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_command_carries_shutter_seconds_and_name() {
        let cmd = expose_command(true, 30.0, "20260823041500s").unwrap();
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        assert_eq!(tokens[0], EXPOSE_COMMAND);
        assert_eq!(tokens[1], SHUTTER_OPEN);
        assert_eq!(tokens[2].parse::<f64>().unwrap(), 30.0);
        assert_eq!(tokens[3], "20260823041500s");
    }

    #[test]
    fn dark_exposures_keep_the_shutter_closed() {
        let cmd = expose_command(false, 10.0, "20260823041500d").unwrap();
        assert!(cmd.contains(SHUTTER_CLOSED));
    }

    #[test]
    fn reply_with_done_sentinel_is_accepted() {
        assert_eq!(accept_reply("   30.000 DONE\n").unwrap(), "30.000");
        assert_eq!(accept_reply("DONE").unwrap(), "");
    }

    #[test]
    fn reply_with_error_token_is_rejected() {
        assert!(matches!(
            accept_reply("ERROR shutter stuck DONE"),
            Err(ProtocolError::ErrorReply(_))
        ));
    }

    #[test]
    fn reply_with_any_other_terminator_is_rejected() {
        assert!(matches!(
            accept_reply("30.000 OK"),
            Err(ProtocolError::BadTerminator(_))
        ));
        assert!(matches!(
            accept_reply("30.000 DONEX"),
            Err(ProtocolError::BadTerminator(_))
        ));
        assert!(matches!(
            accept_reply(""),
            Err(ProtocolError::BadTerminator(_))
        ));
    }

    #[test]
    fn exposure_payload_yields_actual_seconds() {
        assert_eq!(parse_exposure_payload("30.125").unwrap(), 30.125);
        assert!(parse_exposure_payload("shutter").is_err());
        assert!(parse_exposure_payload("-1.0").is_err());
    }

    #[test]
    fn status_payload_parses_strictly() {
        let payload = r#"{"ready":true,"exposing":false,"error_code":0,"state":"IDLE"}"#;
        let status = parse_status_payload(payload).unwrap();
        assert!(status.is_idle());

        // Missing fields must fail closed, never default to idle.
        assert!(matches!(
            parse_status_payload(r#"{"ready":true}"#),
            Err(ProtocolError::StatusParse(_))
        ));
        assert!(parse_status_payload("garbage").is_err());
    }

    #[test]
    fn busy_status_is_not_idle() {
        let payload = r#"{"ready":true,"exposing":true,"error_code":0,"state":"EXPOSING"}"#;
        assert!(!parse_status_payload(payload).unwrap().is_idle());
    }
}
