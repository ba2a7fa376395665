// Copyright 2020 Joyent, Inc.

//! The per-session protocol state machine the session layer drives.

use bytes::Bytes;
use serde_json::Value;
use slog::Logger;

use crate::error::SessionError;
use crate::protocol::{ClientId, Fcall, SessionId};

/// Result of one dispatched request. The session layer picks the reply
/// type and copies the correlation fields from the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub payload: Value,
    pub data: Bytes,
}

impl Reply {
    pub fn new(payload: Value) -> Self {
        Reply {
            payload,
            data: Bytes::new(),
        }
    }

    pub fn with_data<B: Into<Bytes>>(mut self, data: B) -> Self {
        self.data = data.into();
        self
    }
}

/// One instance exists per server session and only ever sees that
/// session's requests, one at a time, in order.
///
/// `dispatch` runs on the session's worker task and should not block for
/// long.
pub trait Protocol: Send + 'static {
    /// Executes one request. Heartbeats and detaches are handled by the
    /// session layer and never reach this.
    fn dispatch(
        &mut self,
        req: &Fcall,
        log: &Logger,
    ) -> Result<Reply, SessionError>;

    /// The session is being torn down.
    fn detach(&mut self, sid: SessionId, log: &Logger);
}

/// Creates the `Protocol` instance for a new session.
pub trait NewProtocol: Send + Sync + 'static {
    fn new_protocol(
        &self,
        sid: SessionId,
        client: ClientId,
    ) -> Box<dyn Protocol>;
}

impl<F> NewProtocol for F
where
    F: Fn(SessionId, ClientId) -> Box<dyn Protocol> + Send + Sync + 'static,
{
    fn new_protocol(
        &self,
        sid: SessionId,
        client: ClientId,
    ) -> Box<dyn Protocol> {
        self(sid, client)
    }
}
