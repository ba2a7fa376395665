// Copyright 2020 Joyent, Inc.

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the session layer.
///
/// Callers of the RPC surface see `Unreachable` (safe to retry against a
/// fresh session), `Closed` (the session must be re-established), or an
/// error the remote dispatcher produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("session closed")]
    Closed,
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("unknown message type {0}")]
    UnknownMessage(u8),
    #[error("retry: {0}")]
    Retry(String),
    #[error("{0}")]
    Remote(String),
}

/// Wire form of an error kind, carried in `Rerror` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrKind {
    Unreachable,
    Closed,
    BadFrame,
    UnknownMessage,
    Retry,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerrorPayload {
    pub kind: ErrKind,
    pub msg: String,
}

impl SessionError {
    pub fn kind(&self) -> ErrKind {
        match self {
            SessionError::Unreachable(_) => ErrKind::Unreachable,
            SessionError::Closed => ErrKind::Closed,
            SessionError::BadFrame(_) => ErrKind::BadFrame,
            SessionError::UnknownMessage(_) => ErrKind::UnknownMessage,
            SessionError::Retry(_) => ErrKind::Retry,
            SessionError::Remote(_) => ErrKind::Other,
        }
    }

    /// Rebuilds an error from its wire form. `msg` is the sender's rendering
    /// of the error, so known prefixes are stripped to avoid doubling them.
    pub fn from_wire(kind: ErrKind, msg: String) -> SessionError {
        fn strip(msg: String, prefix: &str) -> String {
            match msg.strip_prefix(prefix) {
                Some(rest) => rest.to_string(),
                None => msg,
            }
        }

        match kind {
            ErrKind::Unreachable => {
                SessionError::Unreachable(strip(msg, "unreachable: "))
            }
            ErrKind::Closed => SessionError::Closed,
            ErrKind::BadFrame => {
                SessionError::BadFrame(strip(msg, "bad frame: "))
            }
            ErrKind::UnknownMessage => {
                let code = msg
                    .rsplit(' ')
                    .next()
                    .and_then(|c| c.parse::<u8>().ok())
                    .unwrap_or(0);
                SessionError::UnknownMessage(code)
            }
            ErrKind::Retry => SessionError::Retry(strip(msg, "retry: ")),
            ErrKind::Other => SessionError::Remote(msg),
        }
    }

    /// True for errors after which a caller may retry on a fresh session.
    pub fn is_unreachable(&self) -> bool {
        match self {
            SessionError::Unreachable(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_form_preserves_error() {
        let errs = vec![
            SessionError::Unreachable(String::from("no route")),
            SessionError::Closed,
            SessionError::BadFrame(String::from("short")),
            SessionError::UnknownMessage(77),
            SessionError::Retry(String::from("stale proposer")),
            SessionError::Remote(String::from("file not found")),
        ];
        for err in errs {
            let back = SessionError::from_wire(err.kind(), err.to_string());
            assert_eq!(back, err);
        }
    }
}
